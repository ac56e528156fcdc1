//! Lesson state machine: `Empty → ContentReady → VideoAssigned → Completed`.
//!
//! Everything here is pure. The orchestrator loads a lesson, calls into this
//! module to compute the next state, and persists the result in one write, so
//! a failed provider call never leaves a half-updated lesson behind.

use serde::Serialize;

use crate::error::{ProviderError, WorkflowError};
use crate::models::{CourseStatus, Lesson, VideoRef};
use crate::provider::GeneratedLesson;

/// Hard ceiling on replacement videos per lesson (the first, automatic video doesn't count).
pub const MAX_VIDEO_CHANGES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonState {
    Empty,
    ContentReady,
    VideoAssigned,
    Completed,
}

impl LessonState {
    pub fn of(lesson: &Lesson) -> Self {
        match (has_content(lesson), !lesson.video_history.is_empty()) {
            (true, true) if lesson.is_completed => LessonState::Completed,
            (_, true) => LessonState::VideoAssigned,
            (true, false) => LessonState::ContentReady,
            (false, false) => LessonState::Empty,
        }
    }
}

pub fn has_content(lesson: &Lesson) -> bool {
    lesson.content.as_deref().is_some_and(|c| !c.trim().is_empty())
}

/// A lesson is ready (and must be served from cache) once it has a body and a video.
pub fn is_ready(lesson: &Lesson) -> bool {
    has_content(lesson) && !lesson.video_history.is_empty()
}

/// Apply a provider result to a lesson. Returns the lesson to persist.
///
/// Content already on the lesson is kept; the provider's video only becomes the
/// initial entry when the history is empty. Empty content from the provider is
/// rejected so the completion invariant can't be violated.
pub fn apply_generation(lesson: &Lesson, generated: GeneratedLesson) -> Result<Lesson, ProviderError> {
    if generated.content.trim().is_empty() && !has_content(lesson) {
        return Err(ProviderError::Malformed("lesson content is empty".to_string()));
    }
    if generated.video.external_video_id.trim().is_empty() && lesson.video_history.is_empty() {
        return Err(ProviderError::Malformed("video id is empty".to_string()));
    }

    let mut next = lesson.clone();
    if !has_content(&next) {
        next.content_html = Some(markdown_to_html(&generated.content));
        next.content = Some(generated.content);
    }
    if next.video_history.is_empty() {
        next.video_history.push(generated.video);
    }
    next.is_completed = is_ready(&next);
    Ok(next)
}

/// Check whether a replacement video may be requested. Runs before any provider call.
pub fn check_video_change(lesson: &Lesson, course_status: CourseStatus, max_changes: u32) -> Result<(), WorkflowError> {
    let key = lesson.key();
    if course_status == CourseStatus::Completed {
        return Err(WorkflowError::CourseLocked {
            course_id: key.course_id,
        });
    }
    if lesson.video_change_count >= max_changes {
        return Err(WorkflowError::VideoChangeQuotaExceeded {
            key,
            current: lesson.video_change_count,
            ceiling: max_changes,
        });
    }
    if lesson.video_history.is_empty() {
        return Err(WorkflowError::LessonNotGenerated { key });
    }
    Ok(())
}

/// Append a replacement video and spend one change.
pub fn apply_replacement_video(lesson: &Lesson, video: VideoRef) -> Lesson {
    let mut next = lesson.clone();
    next.video_history.push(video);
    next.video_change_count += 1;
    next.is_completed = is_ready(&next);
    next
}

/// Remaining replacement videos for a lesson.
pub fn video_changes_remaining(lesson: &Lesson, max_changes: u32) -> u32 {
    max_changes.saturating_sub(lesson.video_change_count)
}

/// Cursor over a lesson's video history. Moving it never touches the history or the quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoCursor {
    position: usize,
    len: usize,
}

impl VideoCursor {
    /// Start at the most recently assigned video.
    pub fn latest(history: &[VideoRef]) -> Self {
        Self {
            position: history.len().saturating_sub(1),
            len: history.len(),
        }
    }

    /// Jump to `position`, clamped to the last video.
    pub fn seek(&mut self, position: usize) {
        self.position = position.min(self.len.saturating_sub(1));
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn current<'a>(&self, history: &'a [VideoRef]) -> Option<&'a VideoRef> {
        history.get(self.position)
    }

    pub fn has_previous(&self) -> bool {
        self.position > 0
    }

    pub fn has_next(&self) -> bool {
        self.position + 1 < self.len
    }

    pub fn previous(&mut self) -> bool {
        if self.has_previous() {
            self.position -= 1;
            true
        } else {
            false
        }
    }

    pub fn next(&mut self) -> bool {
        if self.has_next() {
            self.position += 1;
            true
        } else {
            false
        }
    }
}

fn markdown_to_html(markdown: &str) -> String {
    let parser = pulldown_cmark::Parser::new(markdown);
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TitleCandidate;

    fn video(id: &str) -> VideoRef {
        VideoRef {
            external_video_id: id.to_string(),
            channel_id: "chan".to_string(),
            channel_title: "Channel".to_string(),
        }
    }

    fn empty_lesson() -> Lesson {
        Lesson::new(
            "course",
            "sub",
            0,
            TitleCandidate {
                title: "Ownership".to_string(),
                original_title: None,
            },
            false,
        )
    }

    fn generated(content: &str, id: &str) -> GeneratedLesson {
        GeneratedLesson {
            content: content.to_string(),
            video: video(id),
        }
    }

    #[test]
    fn generation_completes_an_empty_lesson() {
        let lesson = empty_lesson();
        assert_eq!(LessonState::of(&lesson), LessonState::Empty);

        let next = apply_generation(&lesson, generated("# Ownership\n\nMoves and borrows.", "v1")).unwrap();
        assert!(next.is_completed);
        assert_eq!(next.video_history, vec![video("v1")]);
        assert_eq!(next.video_change_count, 0);
        assert_eq!(LessonState::of(&next), LessonState::Completed);
        assert!(next.content_html.as_deref().unwrap().contains("<h1>Ownership</h1>"));
    }

    #[test]
    fn generation_keeps_existing_content() {
        let mut lesson = empty_lesson();
        lesson.content = Some("original body".to_string());
        assert_eq!(LessonState::of(&lesson), LessonState::ContentReady);

        let next = apply_generation(&lesson, generated("other body", "v1")).unwrap();
        assert_eq!(next.content.as_deref(), Some("original body"));
        assert!(next.is_completed);
    }

    #[test]
    fn empty_content_is_rejected() {
        let lesson = empty_lesson();
        let err = apply_generation(&lesson, generated("   ", "v1")).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[test]
    fn video_without_content_is_not_completed() {
        let mut lesson = empty_lesson();
        lesson.video_history.push(video("v1"));
        assert_eq!(LessonState::of(&lesson), LessonState::VideoAssigned);
        assert!(!is_ready(&lesson));
    }

    #[test]
    fn fourth_change_is_refused() {
        let mut lesson = apply_generation(&empty_lesson(), generated("body", "v0")).unwrap();
        for i in 1..=MAX_VIDEO_CHANGES {
            check_video_change(&lesson, CourseStatus::Active, MAX_VIDEO_CHANGES).unwrap();
            lesson = apply_replacement_video(&lesson, video(&format!("v{i}")));
        }
        assert_eq!(lesson.video_change_count, 3);
        assert_eq!(lesson.video_history.len(), 4);

        let err = check_video_change(&lesson, CourseStatus::Active, MAX_VIDEO_CHANGES).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::VideoChangeQuotaExceeded {
                current: 3,
                ceiling: 3,
                ..
            }
        ));
        assert_eq!(video_changes_remaining(&lesson, MAX_VIDEO_CHANGES), 0);
    }

    #[test]
    fn completed_course_blocks_video_changes() {
        let lesson = apply_generation(&empty_lesson(), generated("body", "v0")).unwrap();
        let err = check_video_change(&lesson, CourseStatus::Completed, MAX_VIDEO_CHANGES).unwrap_err();
        assert!(matches!(err, WorkflowError::CourseLocked { .. }));
    }

    #[test]
    fn change_requires_an_initial_video() {
        let err = check_video_change(&empty_lesson(), CourseStatus::Active, MAX_VIDEO_CHANGES).unwrap_err();
        assert!(matches!(err, WorkflowError::LessonNotGenerated { .. }));
    }

    #[test]
    fn cursor_moves_without_touching_history() {
        let history = vec![video("a"), video("b"), video("c")];
        let mut cursor = VideoCursor::latest(&history);
        assert_eq!(cursor.current(&history), Some(&video("c")));
        assert!(!cursor.next());

        assert!(cursor.previous());
        assert!(cursor.previous());
        assert!(!cursor.previous());
        assert_eq!(cursor.current(&history), Some(&video("a")));

        assert!(cursor.next());
        assert_eq!(cursor.position(), 1);
        assert_eq!(history.len(), 3);

        cursor.seek(10);
        assert_eq!(cursor.current(&history), Some(&video("c")));
    }

    #[test]
    fn cursor_over_empty_history() {
        let cursor = VideoCursor::latest(&[]);
        assert_eq!(cursor.current(&[]), None);
        assert!(!cursor.has_previous());
        assert!(!cursor.has_next());
    }
}
