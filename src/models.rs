use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseStatus {
    Active,
    Completed,
}

impl CourseStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(CourseStatus::Active),
            "completed" => Ok(CourseStatus::Completed),
            other => anyhow::bail!("unknown course status '{other}'"),
        }
    }
}

/// One assigned instructional video and its attribution. Never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRef {
    pub external_video_id: String,
    pub channel_id: String,
    pub channel_title: String,
}

/// Identifies a lesson within a course's current index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LessonKey {
    pub course_id: String,
    pub subtopic_id: String,
    pub lesson_id: String,
}

impl LessonKey {
    pub fn new(course_id: impl Into<String>, subtopic_id: impl Into<String>, lesson_id: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            subtopic_id: subtopic_id.into(),
            lesson_id: lesson_id.into(),
        }
    }
}

impl fmt::Display for LessonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.course_id, self.subtopic_id, self.lesson_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Course {
    pub id: String,
    pub topic: String,
    pub language: String,
    pub num_subtopics: u32,
    pub status: CourseStatus,
    pub index_regeneration_quota: u32,
    pub subtopics: Vec<Subtopic>,
    pub pending_custom_lessons: Vec<CustomLessonRequest>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Course {
    pub fn has_index(&self) -> bool {
        !self.subtopics.is_empty()
    }

    pub fn lessons(&self) -> impl Iterator<Item = &Lesson> {
        self.subtopics.iter().flat_map(|s| s.lessons.iter())
    }

    pub fn subtopic(&self, subtopic_id: &str) -> Option<&Subtopic> {
        self.subtopics.iter().find(|s| s.id == subtopic_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Subtopic {
    pub id: String,
    pub position: u32,
    pub title: String,
    /// Title in the course language when it isn't English.
    pub original_title: Option<String>,
    pub lessons: Vec<Lesson>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lesson {
    pub id: String,
    pub subtopic_id: String,
    pub course_id: String,
    pub position: u32,
    pub title: String,
    pub original_title: Option<String>,
    pub is_custom: bool,
    pub content: Option<String>,
    pub content_html: Option<String>,
    pub video_history: Vec<VideoRef>,
    pub video_change_count: u32,
    pub is_completed: bool,
    /// Optimistic concurrency token; bumped on every write.
    #[serde(skip)]
    pub revision: i64,
}

impl Lesson {
    pub fn new(course_id: &str, subtopic_id: &str, position: u32, title: TitleCandidate, is_custom: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subtopic_id: subtopic_id.to_string(),
            course_id: course_id.to_string(),
            position,
            title: title.title,
            original_title: title.original_title,
            is_custom,
            content: None,
            content_html: None,
            video_history: Vec::new(),
            video_change_count: 0,
            is_completed: false,
            revision: 0,
        }
    }

    pub fn key(&self) -> LessonKey {
        LessonKey::new(&self.course_id, &self.subtopic_id, &self.id)
    }
}

/// A lesson title, paired with its original-language form when the course isn't in English.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleCandidate {
    pub title: String,
    #[serde(default)]
    pub original_title: Option<String>,
}

/// A learner/admin requested lesson to fold into the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomLessonRequest {
    /// Zero-based position of the target subtopic.
    pub subtopic_index: usize,
    pub title: String,
    #[serde(default)]
    pub original_title: Option<String>,
}

impl CustomLessonRequest {
    pub fn candidate(&self) -> TitleCandidate {
        TitleCandidate {
            title: self.title.clone(),
            original_title: self.original_title.clone(),
        }
    }
}

/// Emitted once per course when its last lesson completes.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct CompletionEvent {
    pub event_id: String,
    pub course_id: String,
    pub topic: String,
    pub last_lesson_id: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CourseRow {
    pub id: String,
    pub topic: String,
    pub language: String,
    pub num_subtopics: i64,
    pub status: String,
    pub index_regeneration_quota: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CourseRow {
    pub fn status(&self) -> Result<CourseStatus> {
        CourseStatus::parse(&self.status)
    }

    pub fn into_course(self, subtopics: Vec<Subtopic>, pending_custom_lessons: Vec<CustomLessonRequest>) -> Result<Course> {
        Ok(Course {
            status: self.status()?,
            id: self.id,
            topic: self.topic,
            language: self.language,
            num_subtopics: u32::try_from(self.num_subtopics).context("num_subtopics out of range")?,
            index_regeneration_quota: u32::try_from(self.index_regeneration_quota)
                .context("index_regeneration_quota out of range")?,
            subtopics,
            pending_custom_lessons,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SubtopicRow {
    pub id: String,
    pub position: i64,
    pub title: String,
    pub original_title: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct LessonRow {
    pub id: String,
    pub subtopic_id: String,
    pub course_id: String,
    pub position: i64,
    pub title: String,
    pub original_title: Option<String>,
    pub is_custom: bool,
    pub content: Option<String>,
    pub content_html: Option<String>,
    pub video_history: String,
    pub video_change_count: i64,
    pub is_completed: bool,
    pub revision: i64,
}

impl TryFrom<LessonRow> for Lesson {
    type Error = anyhow::Error;

    fn try_from(row: LessonRow) -> Result<Self> {
        let video_history: Vec<VideoRef> = serde_json::from_str(&row.video_history)
            .with_context(|| format!("decoding video history of lesson {}", row.id))?;
        Ok(Lesson {
            position: u32::try_from(row.position).context("lesson position out of range")?,
            video_change_count: u32::try_from(row.video_change_count).context("video_change_count out of range")?,
            id: row.id,
            subtopic_id: row.subtopic_id,
            course_id: row.course_id,
            title: row.title,
            original_title: row.original_title,
            is_custom: row.is_custom,
            content: row.content,
            content_html: row.content_html,
            video_history,
            is_completed: row.is_completed,
            revision: row.revision,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CustomLessonRequestRow {
    pub subtopic_index: i64,
    pub title: String,
    pub original_title: Option<String>,
}

impl From<CustomLessonRequestRow> for CustomLessonRequest {
    fn from(row: CustomLessonRequestRow) -> Self {
        CustomLessonRequest {
            subtopic_index: usize::try_from(row.subtopic_index).unwrap_or_default(),
            title: row.title,
            original_title: row.original_title,
        }
    }
}
