use std::fmt;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::models::LessonKey;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request to {endpoint} failed: {source}")]
    Http { endpoint: String, source: reqwest::Error },
    #[error("provider returned status {status} for {endpoint}")]
    Status { endpoint: String, status: u16 },
    #[error("provider timed out after {0}")]
    Timeout(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
    /// The in-flight call this request waited on ended without storing a result.
    #[error("concurrent generation did not complete")]
    Abandoned,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(u16),
}

/// Which bounded counter a [`WorkflowError::QuotaExceeded`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    CustomLessons,
    IndexRegeneration,
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaKind::CustomLessons => f.write_str("custom lesson"),
            QuotaKind::IndexRegeneration => f.write_str("index regeneration"),
        }
    }
}

/// Errors surfaced to callers of the generation workflow.
///
/// Quota and limit variants are deterministic and terminal for the call.
/// `ProviderUnavailable` is safe to retry because nothing was committed.
/// `GenerationInProgress` means poll, not resubmit.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{kind} quota exceeded for course {course_id}: {current} of {ceiling} used")]
    QuotaExceeded {
        course_id: String,
        kind: QuotaKind,
        current: u32,
        ceiling: u32,
    },
    #[error(
        "subtopic #{subtopic_index} of course {course_id} already has {current} custom lessons (limit {ceiling})"
    )]
    PerSubtopicLimit {
        course_id: String,
        subtopic_index: usize,
        current: u32,
        ceiling: u32,
    },
    #[error("lesson {key} has used {current} of {ceiling} video changes")]
    VideoChangeQuotaExceeded { key: LessonKey, current: u32, ceiling: u32 },
    #[error("generation already in progress for lesson {key}")]
    GenerationInProgress { key: LessonKey },
    #[error("generation provider unavailable for {target}: {source}")]
    ProviderUnavailable {
        target: String,
        #[source]
        source: ProviderError,
    },
    #[error("not found in course {course_id} (subtopic {subtopic_id:?}, lesson {lesson_id:?})")]
    ContentNotFound {
        course_id: String,
        subtopic_id: Option<String>,
        lesson_id: Option<String>,
    },
    #[error("course {course_id} is completed and can no longer be edited")]
    CourseLocked { course_id: String },
    #[error("lesson {key} has no video to replace yet")]
    LessonNotGenerated { key: LessonKey },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl WorkflowError {
    pub fn course_not_found(course_id: &str) -> Self {
        WorkflowError::ContentNotFound {
            course_id: course_id.to_string(),
            subtopic_id: None,
            lesson_id: None,
        }
    }

    pub fn lesson_not_found(key: &LessonKey) -> Self {
        WorkflowError::ContentNotFound {
            course_id: key.course_id.clone(),
            subtopic_id: Some(key.subtopic_id.clone()),
            lesson_id: Some(key.lesson_id.clone()),
        }
    }

    pub fn provider(target: impl Into<String>, source: ProviderError) -> Self {
        WorkflowError::ProviderUnavailable {
            target: target.into(),
            source,
        }
    }

    /// Stable machine-readable name, used in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::QuotaExceeded { .. } => "quota_exceeded",
            WorkflowError::PerSubtopicLimit { .. } => "per_subtopic_limit",
            WorkflowError::VideoChangeQuotaExceeded { .. } => "video_change_quota_exceeded",
            WorkflowError::GenerationInProgress { .. } => "generation_in_progress",
            WorkflowError::ProviderUnavailable { .. } => "provider_unavailable",
            WorkflowError::ContentNotFound { .. } => "content_not_found",
            WorkflowError::CourseLocked { .. } => "course_locked",
            WorkflowError::LessonNotGenerated { .. } => "lesson_not_generated",
            WorkflowError::InvalidRequest(_) => "invalid_request",
            WorkflowError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            WorkflowError::QuotaExceeded { .. }
            | WorkflowError::PerSubtopicLimit { .. }
            | WorkflowError::VideoChangeQuotaExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            WorkflowError::GenerationInProgress { .. }
            | WorkflowError::CourseLocked { .. }
            | WorkflowError::LessonNotGenerated { .. } => StatusCode::CONFLICT,
            WorkflowError::ProviderUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            WorkflowError::ContentNotFound { .. } => StatusCode::NOT_FOUND,
            WorkflowError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            WorkflowError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        let mut body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
            ..Default::default()
        };
        match self {
            WorkflowError::QuotaExceeded {
                course_id,
                current,
                ceiling,
                ..
            } => {
                body.course_id = Some(course_id.clone());
                body.current = Some(*current);
                body.ceiling = Some(*ceiling);
            }
            WorkflowError::PerSubtopicLimit {
                course_id,
                subtopic_index,
                current,
                ceiling,
            } => {
                body.course_id = Some(course_id.clone());
                body.subtopic_index = Some(*subtopic_index);
                body.current = Some(*current);
                body.ceiling = Some(*ceiling);
            }
            WorkflowError::VideoChangeQuotaExceeded { key, current, ceiling } => {
                body.set_key(key);
                body.current = Some(*current);
                body.ceiling = Some(*ceiling);
            }
            WorkflowError::GenerationInProgress { key } | WorkflowError::LessonNotGenerated { key } => {
                body.set_key(key);
            }
            WorkflowError::ContentNotFound {
                course_id,
                subtopic_id,
                lesson_id,
            } => {
                body.course_id = Some(course_id.clone());
                body.subtopic_id = subtopic_id.clone();
                body.lesson_id = lesson_id.clone();
            }
            WorkflowError::CourseLocked { course_id } => {
                body.course_id = Some(course_id.clone());
            }
            // Internal details stay in the logs.
            WorkflowError::Internal(_) => {
                body.error = "internal error".to_string();
            }
            WorkflowError::ProviderUnavailable { .. } | WorkflowError::InvalidRequest(_) => {}
        }
        body
    }
}

#[derive(Debug, Default, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    course_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subtopic_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subtopic_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lesson_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ceiling: Option<u32>,
}

impl ErrorBody {
    fn set_key(&mut self, key: &LessonKey) {
        self.course_id = Some(key.course_id.clone());
        self.subtopic_id = Some(key.subtopic_id.clone());
        self.lesson_id = Some(key.lesson_id.clone());
    }
}

impl IntoResponse for WorkflowError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %format!("{:#}", self), "request failed");
        } else {
            tracing::debug!(kind = self.kind(), error = %self, "request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}
