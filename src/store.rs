use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::models::{
    CompletionEvent, Course, CourseRow, CustomLessonRequest, CustomLessonRequestRow, Lesson, LessonKey, LessonRow,
    Subtopic, SubtopicRow,
};

/// All course columns in SELECT order (must match CourseRow field order).
const COURSE_COLUMNS: &str = "id, topic, language, num_subtopics, status, index_regeneration_quota, created_at, completed_at";

/// All lesson columns in SELECT order (must match LessonRow field order).
const LESSON_COLUMNS: &str = "id, subtopic_id, course_id, position, title, original_title, is_custom,
    content, content_html, video_history, video_change_count, is_completed, revision";

pub async fn insert_course(
    pool: &SqlitePool,
    topic: &str,
    language: &str,
    num_subtopics: u32,
    regeneration_quota: u32,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO courses (id, topic, language, num_subtopics, index_regeneration_quota)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(topic)
    .bind(language)
    .bind(i64::from(num_subtopics))
    .bind(i64::from(regeneration_quota))
    .execute(pool)
    .await
    .context("inserting course")?;

    debug!(course = %id, topic = %topic, "created course");
    Ok(id)
}

pub async fn get_course_row(pool: &SqlitePool, course_id: &str) -> Result<Option<CourseRow>> {
    let sql = format!("SELECT {COURSE_COLUMNS} FROM courses WHERE id = ?");
    sqlx::query_as::<_, CourseRow>(&sql)
        .bind(course_id)
        .fetch_optional(pool)
        .await
        .context("fetching course")
}

/// Load the full course document: header, ordered subtopics and lessons, pending custom lessons.
pub async fn load_course(pool: &SqlitePool, course_id: &str) -> Result<Option<Course>> {
    let Some(row) = get_course_row(pool, course_id).await? else {
        return Ok(None);
    };

    let subtopic_rows: Vec<SubtopicRow> = sqlx::query_as(
        "SELECT id, position, title, original_title FROM subtopics WHERE course_id = ? ORDER BY position",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await
    .context("fetching subtopics")?;

    let sql = format!("SELECT {LESSON_COLUMNS} FROM lessons WHERE course_id = ? ORDER BY position");
    let lesson_rows: Vec<LessonRow> = sqlx::query_as(&sql)
        .bind(course_id)
        .fetch_all(pool)
        .await
        .context("fetching lessons")?;

    let mut subtopics: Vec<Subtopic> = subtopic_rows
        .into_iter()
        .map(|s| {
            Ok(Subtopic {
                id: s.id,
                position: u32::try_from(s.position).context("subtopic position out of range")?,
                title: s.title,
                original_title: s.original_title,
                lessons: Vec::new(),
            })
        })
        .collect::<Result<_>>()?;

    for row in lesson_rows {
        let lesson = Lesson::try_from(row)?;
        if let Some(subtopic) = subtopics.iter_mut().find(|s| s.id == lesson.subtopic_id) {
            subtopic.lessons.push(lesson);
        }
    }

    let pending = get_custom_requests(pool, course_id).await?;

    Ok(Some(row.into_course(subtopics, pending)?))
}

/// Fetch one lesson, checking that it belongs to the given course and subtopic.
pub async fn get_lesson(pool: &SqlitePool, key: &LessonKey) -> Result<Option<Lesson>> {
    let sql = format!("SELECT {LESSON_COLUMNS} FROM lessons WHERE id = ? AND subtopic_id = ? AND course_id = ?");
    let row: Option<LessonRow> = sqlx::query_as(&sql)
        .bind(&key.lesson_id)
        .bind(&key.subtopic_id)
        .bind(&key.course_id)
        .fetch_optional(pool)
        .await
        .context("fetching lesson")?;
    row.map(Lesson::try_from).transpose()
}

/// Persist a lesson's generated state in one write.
///
/// Only succeeds if nobody wrote the lesson since `lesson.revision` was read.
/// Returns false when the row was changed or removed in the meantime.
pub async fn save_lesson(pool: &SqlitePool, lesson: &Lesson) -> Result<bool> {
    let video_history = serde_json::to_string(&lesson.video_history).context("encoding video history")?;
    let result = sqlx::query(
        "UPDATE lessons SET content = ?, content_html = ?, video_history = ?, video_change_count = ?,
         is_completed = ?, revision = revision + 1, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ? AND revision = ?",
    )
    .bind(&lesson.content)
    .bind(&lesson.content_html)
    .bind(&video_history)
    .bind(i64::from(lesson.video_change_count))
    .bind(lesson.is_completed)
    .bind(&lesson.id)
    .bind(lesson.revision)
    .execute(pool)
    .await
    .context("updating lesson")?;

    let saved = result.rows_affected() == 1;
    debug!(lesson = %lesson.id, saved, "saved lesson");
    Ok(saved)
}

async fn insert_subtopic(tx: &mut Transaction<'_, Sqlite>, course_id: &str, subtopic: &Subtopic) -> Result<()> {
    sqlx::query("INSERT INTO subtopics (id, course_id, position, title, original_title) VALUES (?, ?, ?, ?, ?)")
        .bind(&subtopic.id)
        .bind(course_id)
        .bind(i64::from(subtopic.position))
        .bind(&subtopic.title)
        .bind(&subtopic.original_title)
        .execute(&mut **tx)
        .await
        .context("inserting subtopic")?;
    Ok(())
}

async fn insert_lesson(tx: &mut Transaction<'_, Sqlite>, lesson: &Lesson) -> Result<()> {
    let video_history = serde_json::to_string(&lesson.video_history).context("encoding video history")?;
    sqlx::query(
        "INSERT INTO lessons (id, subtopic_id, course_id, position, title, original_title, is_custom,
         content, content_html, video_history, video_change_count, is_completed)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&lesson.id)
    .bind(&lesson.subtopic_id)
    .bind(&lesson.course_id)
    .bind(i64::from(lesson.position))
    .bind(&lesson.title)
    .bind(&lesson.original_title)
    .bind(lesson.is_custom)
    .bind(&lesson.content)
    .bind(&lesson.content_html)
    .bind(&video_history)
    .bind(i64::from(lesson.video_change_count))
    .bind(lesson.is_completed)
    .execute(&mut **tx)
    .await
    .context("inserting lesson")?;
    Ok(())
}

/// Replace the course's index in one transaction.
///
/// With `consume_quota`, the regeneration quota is decremented first and the
/// whole replacement is abandoned (returning false) if it is already zero.
/// Pending custom-lesson requests are folded into the new index, so they are cleared.
pub async fn replace_index(
    pool: &SqlitePool,
    course_id: &str,
    num_subtopics: u32,
    subtopics: &[Subtopic],
    consume_quota: bool,
) -> Result<bool> {
    let mut tx = pool.begin().await.context("starting index transaction")?;

    let sql = if consume_quota {
        "UPDATE courses SET index_regeneration_quota = index_regeneration_quota - 1, num_subtopics = ?,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ? AND status = 'active' AND index_regeneration_quota > 0"
    } else {
        "UPDATE courses SET num_subtopics = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ? AND status = 'active'"
    };
    let updated = sqlx::query(sql)
        .bind(i64::from(num_subtopics))
        .bind(course_id)
        .execute(&mut *tx)
        .await
        .context("updating course for index")?;

    if updated.rows_affected() != 1 {
        tx.rollback().await.context("rolling back index transaction")?;
        return Ok(false);
    }

    sqlx::query("DELETE FROM subtopics WHERE course_id = ?")
        .bind(course_id)
        .execute(&mut *tx)
        .await
        .context("deleting previous index")?;

    for subtopic in subtopics {
        insert_subtopic(&mut tx, course_id, subtopic).await?;
        for lesson in &subtopic.lessons {
            insert_lesson(&mut tx, lesson).await?;
        }
    }

    sqlx::query("DELETE FROM custom_lesson_requests WHERE course_id = ?")
        .bind(course_id)
        .execute(&mut *tx)
        .await
        .context("clearing folded custom lesson requests")?;

    tx.commit().await.context("committing index")?;

    debug!(course = %course_id, subtopics = subtopics.len(), consume_quota, "replaced index");
    Ok(true)
}

/// Ceilings a new custom lesson is checked against while the course row is locked.
#[derive(Debug, Clone, Copy)]
pub struct CustomLessonCaps {
    pub per_course: u32,
    pub per_subtopic: u32,
}

/// Outcome of adding a custom lesson under the course write lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomLessonInsert {
    Added,
    CourseNotActive,
    CourseFull { current: u32 },
    SubtopicFull { current: u32 },
}

/// Take the write lock on an active course. False when the course is missing or completed.
async fn lock_active_course(tx: &mut Transaction<'_, Sqlite>, course_id: &str) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE courses SET updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ? AND status = 'active'",
    )
    .bind(course_id)
    .execute(&mut **tx)
    .await
    .context("locking course")?;
    Ok(updated.rows_affected() == 1)
}

fn check_caps(caps: CustomLessonCaps, in_course: i64, in_subtopic: i64) -> Result<Option<CustomLessonInsert>> {
    let in_course = u32::try_from(in_course).context("custom lesson count out of range")?;
    let in_subtopic = u32::try_from(in_subtopic).context("custom lesson count out of range")?;
    Ok(if in_course >= caps.per_course {
        Some(CustomLessonInsert::CourseFull { current: in_course })
    } else if in_subtopic >= caps.per_subtopic {
        Some(CustomLessonInsert::SubtopicFull { current: in_subtopic })
    } else {
        None
    })
}

/// Append a custom lesson to the end of an existing subtopic.
///
/// The course status and both caps are re-checked inside the transaction, so
/// a course that completed or filled up since the caller looked is left untouched.
pub async fn append_custom_lesson(pool: &SqlitePool, lesson: &Lesson, caps: CustomLessonCaps) -> Result<CustomLessonInsert> {
    let mut tx = pool.begin().await.context("starting lesson transaction")?;

    if !lock_active_course(&mut tx, &lesson.course_id).await? {
        tx.rollback().await.context("rolling back lesson transaction")?;
        return Ok(CustomLessonInsert::CourseNotActive);
    }

    let (in_course, in_subtopic): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(subtopic_id = ?), 0) FROM lessons WHERE course_id = ? AND is_custom = 1",
    )
    .bind(&lesson.subtopic_id)
    .bind(&lesson.course_id)
    .fetch_one(&mut *tx)
    .await
    .context("counting custom lessons")?;
    if let Some(refused) = check_caps(caps, in_course, in_subtopic)? {
        tx.rollback().await.context("rolling back lesson transaction")?;
        return Ok(refused);
    }

    let (next_position,): (i64,) =
        sqlx::query_as("SELECT COALESCE(MAX(position) + 1, 0) FROM lessons WHERE subtopic_id = ?")
            .bind(&lesson.subtopic_id)
            .fetch_one(&mut *tx)
            .await
            .context("computing lesson position")?;

    let mut lesson = lesson.clone();
    lesson.position = u32::try_from(next_position).context("lesson position out of range")?;
    insert_lesson(&mut tx, &lesson).await?;

    tx.commit().await.context("committing lesson")?;
    Ok(CustomLessonInsert::Added)
}

/// Queue a custom lesson for a course without an index, under the same checks
/// as [`append_custom_lesson`].
pub async fn queue_custom_request(
    pool: &SqlitePool,
    course_id: &str,
    request: &CustomLessonRequest,
    caps: CustomLessonCaps,
) -> Result<CustomLessonInsert> {
    let subtopic_index = i64::try_from(request.subtopic_index).context("subtopic index out of range")?;
    let mut tx = pool.begin().await.context("starting custom request transaction")?;

    if !lock_active_course(&mut tx, course_id).await? {
        tx.rollback().await.context("rolling back custom request transaction")?;
        return Ok(CustomLessonInsert::CourseNotActive);
    }

    let (in_course, in_subtopic): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(subtopic_index = ?), 0) FROM custom_lesson_requests WHERE course_id = ?",
    )
    .bind(subtopic_index)
    .bind(course_id)
    .fetch_one(&mut *tx)
    .await
    .context("counting custom lesson requests")?;
    if let Some(refused) = check_caps(caps, in_course, in_subtopic)? {
        tx.rollback().await.context("rolling back custom request transaction")?;
        return Ok(refused);
    }

    sqlx::query(
        "INSERT INTO custom_lesson_requests (id, course_id, subtopic_index, title, original_title)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(course_id)
    .bind(subtopic_index)
    .bind(&request.title)
    .bind(&request.original_title)
    .execute(&mut *tx)
    .await
    .context("inserting custom lesson request")?;

    tx.commit().await.context("committing custom request")?;
    Ok(CustomLessonInsert::Added)
}

pub async fn get_custom_requests(pool: &SqlitePool, course_id: &str) -> Result<Vec<CustomLessonRequest>> {
    let rows: Vec<CustomLessonRequestRow> = sqlx::query_as(
        "SELECT subtopic_index, title, original_title FROM custom_lesson_requests
         WHERE course_id = ? ORDER BY created_at, rowid",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await
    .context("fetching custom lesson requests")?;
    Ok(rows.into_iter().map(CustomLessonRequest::from).collect())
}

/// (total lessons, completed lessons) across the whole course.
pub async fn lesson_completion_counts(pool: &SqlitePool, course_id: &str) -> Result<(i64, i64)> {
    sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(is_completed), 0) FROM lessons WHERE course_id = ?")
        .bind(course_id)
        .fetch_one(pool)
        .await
        .context("counting completed lessons")
}

/// Flip an active course to completed and record its completion event.
///
/// Returns the event only for the caller whose update flipped the status;
/// everyone else gets None.
pub async fn complete_course(pool: &SqlitePool, course_id: &str, last_lesson_id: &str) -> Result<Option<CompletionEvent>> {
    let mut tx = pool.begin().await.context("starting completion transaction")?;
    let now = Utc::now();

    // A lesson added since the caller counted keeps the course active.
    let updated = sqlx::query(
        "UPDATE courses SET status = 'completed', completed_at = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ? AND status = 'active'
           AND NOT EXISTS (SELECT 1 FROM lessons WHERE course_id = ? AND is_completed = 0)",
    )
    .bind(now)
    .bind(course_id)
    .bind(course_id)
    .execute(&mut *tx)
    .await
    .context("marking course completed")?;

    if updated.rows_affected() != 1 {
        tx.rollback().await.context("rolling back completion")?;
        return Ok(None);
    }

    let event_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO course_completions (course_id, event_id, last_lesson_id, completed_at) VALUES (?, ?, ?, ?)",
    )
    .bind(course_id)
    .bind(&event_id)
    .bind(last_lesson_id)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("recording completion event")?;

    let (topic,): (String,) = sqlx::query_as("SELECT topic FROM courses WHERE id = ?")
        .bind(course_id)
        .fetch_one(&mut *tx)
        .await
        .context("fetching course topic")?;

    tx.commit().await.context("committing completion")?;

    Ok(Some(CompletionEvent {
        event_id,
        course_id: course_id.to_string(),
        topic,
        last_lesson_id: last_lesson_id.to_string(),
        completed_at: now,
    }))
}

/// Undelivered events that nobody is currently delivering.
pub async fn get_undelivered_completions(pool: &SqlitePool, limit: i64) -> Result<Vec<CompletionEvent>> {
    sqlx::query_as(
        "SELECT cc.event_id, cc.course_id, c.topic, cc.last_lesson_id, cc.completed_at
         FROM course_completions cc JOIN courses c ON c.id = cc.course_id
         WHERE cc.delivered_at IS NULL AND (cc.claimed_until IS NULL OR cc.claimed_until < ?)
         ORDER BY cc.completed_at LIMIT ?",
    )
    .bind(Utc::now().timestamp_millis())
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("fetching undelivered completions")
}

/// Claim an undelivered event for `lease`.
///
/// Only the caller that gets true may hand the event to a notifier. An expired
/// lease can be claimed again, so a crashed delivery is eventually retried.
pub async fn claim_completion(pool: &SqlitePool, course_id: &str, lease: Duration) -> Result<bool> {
    let now = Utc::now().timestamp_millis();
    let lease_ms = i64::try_from(lease.as_millis()).context("delivery lease out of range")?;
    let updated = sqlx::query(
        "UPDATE course_completions SET claimed_until = ?
         WHERE course_id = ? AND delivered_at IS NULL AND (claimed_until IS NULL OR claimed_until < ?)",
    )
    .bind(now.saturating_add(lease_ms))
    .bind(course_id)
    .bind(now)
    .execute(pool)
    .await
    .context("claiming completion")?;
    Ok(updated.rows_affected() == 1)
}

pub async fn mark_completion_delivered(pool: &SqlitePool, course_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE course_completions SET delivered_at = ?, attempts = attempts + 1, last_error = NULL, claimed_until = NULL
         WHERE course_id = ?",
    )
    .bind(Utc::now())
    .bind(course_id)
    .execute(pool)
    .await
    .context("marking completion delivered")?;
    Ok(())
}

/// Record a failed attempt and release the claim so the next retry pass picks it up.
pub async fn record_completion_failure(pool: &SqlitePool, course_id: &str, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE course_completions SET attempts = attempts + 1, last_error = ?, claimed_until = NULL
         WHERE course_id = ?",
    )
    .bind(error)
    .bind(course_id)
    .execute(pool)
    .await
    .context("recording completion failure")?;
    Ok(())
}

// --- Settings ---

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("fetching setting")?;
    Ok(row.map(|(v,)| v))
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query("INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
        .bind(key)
        .bind(value)
        .execute(pool)
        .await
        .context("storing setting")?;
    Ok(())
}
