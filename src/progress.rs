use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::models::{CompletionEvent, Subtopic};
use crate::notifier::{self, CompletionNotifier};
use crate::store;

/// True when the index has at least one lesson and every lesson is completed.
pub fn all_lessons_completed(subtopics: &[Subtopic]) -> bool {
    let mut lessons = subtopics.iter().flat_map(|s| s.lessons.iter()).peekable();
    lessons.peek().is_some() && lessons.all(|l| l.is_completed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSummary {
    pub total_lessons: usize,
    pub completed_lessons: usize,
}

pub fn summarize(subtopics: &[Subtopic]) -> ProgressSummary {
    let lessons = subtopics.iter().flat_map(|s| s.lessons.iter());
    let (total_lessons, completed_lessons) =
        lessons.fold((0, 0), |(total, done), l| (total + 1, done + usize::from(l.is_completed)));
    ProgressSummary {
        total_lessons,
        completed_lessons,
    }
}

/// Flips a course to completed when its last lesson completes, exactly once.
#[derive(Clone)]
pub struct CourseProgressAggregator {
    pool: SqlitePool,
    notifier: Arc<dyn CompletionNotifier>,
}

impl CourseProgressAggregator {
    pub fn new(pool: SqlitePool, notifier: Arc<dyn CompletionNotifier>) -> Self {
        Self { pool, notifier }
    }

    /// Re-evaluate a course after one of its lessons completed.
    ///
    /// Returns the completion event only to the caller that flipped the course.
    /// Concurrent or repeated calls for the same course get None.
    pub async fn on_lesson_completed(&self, course_id: &str, lesson_id: &str) -> Result<Option<CompletionEvent>> {
        let (total, completed) = store::lesson_completion_counts(&self.pool, course_id).await?;
        if total == 0 || completed < total {
            return Ok(None);
        }

        let Some(event) = store::complete_course(&self.pool, course_id, lesson_id).await? else {
            return Ok(None);
        };
        info!(course = %course_id, lessons = total, last_lesson = %lesson_id, "course completed");

        notifier::deliver(&self.pool, self.notifier.as_ref(), &event).await?;
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::models::{CourseStatus, Lesson, TitleCandidate};
    use crate::notifier::recording::RecordingNotifier;

    fn subtopic(course_id: &str, position: u32, lessons: usize) -> Subtopic {
        let id = uuid::Uuid::new_v4().to_string();
        Subtopic {
            lessons: (0..lessons)
                .map(|i| {
                    Lesson::new(
                        course_id,
                        &id,
                        i as u32,
                        TitleCandidate {
                            title: format!("Lesson {position}.{i}"),
                            original_title: None,
                        },
                        false,
                    )
                })
                .collect(),
            id,
            position,
            title: format!("Part {position}"),
            original_title: None,
        }
    }

    async fn complete_lesson(pool: &SqlitePool, lesson: &Lesson) {
        let mut stored = store::get_lesson(pool, &lesson.key()).await.unwrap().unwrap();
        stored.content = Some("body".to_string());
        stored.video_history.push(crate::provider::stub::stub_video("v"));
        stored.is_completed = true;
        assert!(store::save_lesson(pool, &stored).await.unwrap());
    }

    #[test]
    fn empty_index_is_never_complete() {
        assert!(!all_lessons_completed(&[]));
        assert!(!all_lessons_completed(&[subtopic("c", 0, 0)]));
    }

    #[test]
    fn summary_counts_completed_lessons() {
        let mut index = vec![subtopic("c", 0, 2), subtopic("c", 1, 1)];
        index[1].lessons[0].is_completed = true;
        assert_eq!(
            summarize(&index),
            ProgressSummary {
                total_lessons: 3,
                completed_lessons: 1
            }
        );
        assert!(!all_lessons_completed(&index));
        index[0].lessons.iter_mut().for_each(|l| l.is_completed = true);
        assert!(all_lessons_completed(&index));
    }

    #[tokio::test]
    async fn last_lesson_completes_course_once() {
        let pool = create_test_pool().await;
        let course_id = store::insert_course(&pool, "Rust", "en", 2, 1).await.unwrap();
        let index = vec![subtopic(&course_id, 0, 2), subtopic(&course_id, 1, 1)];
        store::replace_index(&pool, &course_id, 2, &index, false).await.unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let aggregator = CourseProgressAggregator::new(pool.clone(), notifier.clone());

        let lessons: Vec<&Lesson> = index.iter().flat_map(|s| s.lessons.iter()).collect();
        for lesson in &lessons[..2] {
            complete_lesson(&pool, lesson).await;
            assert!(aggregator.on_lesson_completed(&course_id, &lesson.id).await.unwrap().is_none());
        }

        complete_lesson(&pool, lessons[2]).await;
        let event = aggregator
            .on_lesson_completed(&course_id, &lessons[2].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.last_lesson_id, lessons[2].id);

        // Re-triggering does not emit a second event.
        assert!(aggregator.on_lesson_completed(&course_id, &lessons[2].id).await.unwrap().is_none());
        assert_eq!(notifier.events().len(), 1);

        let course = store::load_course(&pool, &course_id).await.unwrap().unwrap();
        assert_eq!(course.status, CourseStatus::Completed);
        assert!(course.completed_at.is_some());
        assert!(store::get_undelivered_completions(&pool, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_triggers_emit_one_event() {
        let pool = create_test_pool().await;
        let course_id = store::insert_course(&pool, "Rust", "en", 1, 1).await.unwrap();
        let index = vec![subtopic(&course_id, 0, 2)];
        store::replace_index(&pool, &course_id, 1, &index, false).await.unwrap();
        for lesson in &index[0].lessons {
            complete_lesson(&pool, lesson).await;
        }

        let notifier = Arc::new(RecordingNotifier::default());
        let aggregator = CourseProgressAggregator::new(pool.clone(), notifier.clone());
        let a = aggregator.clone();
        let b = aggregator.clone();
        let (id_a, id_b) = (index[0].lessons[0].id.clone(), index[0].lessons[1].id.clone());
        let cid_a = course_id.clone();
        let cid_b = course_id.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.on_lesson_completed(&cid_a, &id_a).await }),
            tokio::spawn(async move { b.on_lesson_completed(&cid_b, &id_b).await }),
        );
        let emitted = [ra.unwrap().unwrap(), rb.unwrap().unwrap()]
            .into_iter()
            .flatten()
            .count();
        assert_eq!(emitted, 1);
        assert_eq!(notifier.events().len(), 1);
    }
}
