//! Generation orchestrator: the entry point used by the API and the CLI.
//!
//! Every operation loads what it needs, runs the quota and state checks
//! before any provider call, and persists the outcome in a single write.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use crate::config::{InFlightPolicy, WorkflowConfig};
use crate::error::{ProviderError, QuotaKind, WorkflowError};
use crate::guard::{Acquire, GenerationGuard};
use crate::index;
use crate::lesson;
use crate::models::{Course, CourseStatus, CustomLessonRequest, Lesson, LessonKey, TitleCandidate};
use crate::notifier::CompletionNotifier;
use crate::progress::{self, CourseProgressAggregator};
use crate::provider::{GenerationProvider, IndexContext, LessonContext, RefinementContext, VideoContext};
use crate::store::{self, CustomLessonCaps, CustomLessonInsert};

type Result<T> = std::result::Result<T, WorkflowError>;

/// Parsed `[workflow]` settings.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub default_language: String,
    pub max_video_changes: u32,
    pub index_regeneration_quota: u32,
    pub lessons_per_subtopic: u32,
    pub max_custom_per_subtopic: u32,
    pub in_flight_policy: InFlightPolicy,
    pub in_flight_wait: Duration,
}

impl WorkflowSettings {
    pub fn from_config(workflow: &WorkflowConfig, default_language: &str) -> anyhow::Result<Self> {
        Ok(Self {
            default_language: default_language.to_string(),
            max_video_changes: workflow.max_video_changes,
            index_regeneration_quota: workflow.index_regeneration_quota,
            lessons_per_subtopic: workflow.lessons_per_subtopic,
            max_custom_per_subtopic: workflow.max_custom_per_subtopic,
            in_flight_policy: workflow.in_flight_policy,
            in_flight_wait: humantime::parse_duration(&workflow.in_flight_wait)
                .context("parsing workflow in_flight_wait")?,
        })
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    pool: SqlitePool,
    provider: Arc<dyn GenerationProvider>,
    guard: GenerationGuard,
    aggregator: CourseProgressAggregator,
    settings: WorkflowSettings,
}

impl Orchestrator {
    pub fn new(
        pool: SqlitePool,
        provider: Arc<dyn GenerationProvider>,
        notifier: Arc<dyn CompletionNotifier>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            aggregator: CourseProgressAggregator::new(pool.clone(), notifier),
            pool,
            provider,
            guard: GenerationGuard::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub async fn create_course(&self, topic: &str, language: Option<&str>, num_subtopics: u32) -> Result<Course> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(WorkflowError::InvalidRequest("topic must not be empty".to_string()));
        }
        index::validate_subtopic_count(num_subtopics)?;
        let language = language
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(&self.settings.default_language);

        let id = store::insert_course(
            &self.pool,
            topic,
            language,
            num_subtopics,
            self.settings.index_regeneration_quota,
        )
        .await?;
        info!(course = %id, topic = %topic, language = %language, num_subtopics, "course created");
        self.course(&id).await
    }

    pub async fn course(&self, course_id: &str) -> Result<Course> {
        store::load_course(&self.pool, course_id)
            .await?
            .ok_or_else(|| WorkflowError::course_not_found(course_id))
    }

    /// Build the course index, or rebuild it when one exists.
    ///
    /// A rebuild spends one regeneration from the course quota. Pending custom
    /// lessons (or the custom lessons of the previous index) are folded in
    /// together with `requests`.
    pub async fn build_index(
        &self,
        course_id: &str,
        num_subtopics: Option<u32>,
        requests: Vec<CustomLessonRequest>,
    ) -> Result<Course> {
        let course = self.course(course_id).await?;
        if course.status == CourseStatus::Completed {
            return Err(WorkflowError::CourseLocked {
                course_id: course.id,
            });
        }

        let n = num_subtopics.unwrap_or(course.num_subtopics);
        index::validate_subtopic_count(n)?;

        let regenerating = course.has_index();
        if regenerating && course.index_regeneration_quota == 0 {
            return Err(self.regeneration_quota_exceeded(&course));
        }

        let mut custom = if regenerating {
            index::carry_over_custom_lessons(&course.subtopics, n, self.settings.max_custom_per_subtopic)
        } else {
            course.pending_custom_lessons.clone()
        };
        let last = n.saturating_sub(1) as usize;
        for request in &mut custom {
            request.subtopic_index = request.subtopic_index.min(last);
        }
        let existing: Vec<usize> = custom.iter().map(|r| r.subtopic_index).collect();
        index::check_custom_lessons(
            course_id,
            n,
            self.settings.max_custom_per_subtopic,
            &existing,
            &requests,
        )?;
        custom.extend(requests);

        let ctx = IndexContext {
            topic: course.topic.clone(),
            language: course.language.clone(),
            num_subtopics: n,
            lessons_per_subtopic: self.settings.lessons_per_subtopic,
        };
        let target = format!("index of course {course_id}");
        info!(course = %course_id, num_subtopics = n, regenerating, "building index");

        let suggestions = self
            .provider
            .suggest_index(&ctx)
            .await
            .map_err(|e| WorkflowError::provider(&target, e))?;
        let subtopics = index::assemble_index(
            course_id,
            suggestions,
            n,
            self.settings.lessons_per_subtopic,
            &custom,
            &course.subtopics,
        )
        .map_err(|e| WorkflowError::provider(&target, e))?;

        if !store::replace_index(&self.pool, course_id, n, &subtopics, regenerating).await? {
            // Lost a race with course completion or another regeneration.
            let current = self.course(course_id).await?;
            return Err(if current.status == CourseStatus::Completed {
                WorkflowError::CourseLocked {
                    course_id: current.id,
                }
            } else {
                self.regeneration_quota_exceeded(&current)
            });
        }

        let mut course = self.course(course_id).await?;
        info!(
            course = %course_id,
            subtopics = course.subtopics.len(),
            lessons = course.lessons().count(),
            regenerations_left = course.index_regeneration_quota,
            "index stored"
        );

        // Inherited lessons may already complete the new index.
        if regenerating
            && progress::all_lessons_completed(&course.subtopics)
            && let Some(last) = course.lessons().last().cloned()
        {
            self.after_completion(&last).await;
            course = self.course(course_id).await?;
        }
        Ok(course)
    }

    pub async fn regenerate_index(&self, course_id: &str) -> Result<Course> {
        let course = self.course(course_id).await?;
        if !course.has_index() {
            return Err(WorkflowError::InvalidRequest(format!(
                "course {course_id} has no index to regenerate"
            )));
        }
        self.build_index(course_id, None, Vec::new()).await
    }

    fn regeneration_quota_exceeded(&self, course: &Course) -> WorkflowError {
        let ceiling = self.settings.index_regeneration_quota;
        WorkflowError::QuotaExceeded {
            course_id: course.id.clone(),
            kind: QuotaKind::IndexRegeneration,
            current: ceiling.saturating_sub(course.index_regeneration_quota),
            ceiling,
        }
    }

    /// Ask the provider for lesson titles matching a free-text request.
    /// Nothing is stored; the caller accepts one candidate explicitly.
    pub async fn refine_lesson_title(
        &self,
        course_id: &str,
        subtopic_id: &str,
        request: &str,
    ) -> Result<Vec<TitleCandidate>> {
        let request = request.trim();
        if request.is_empty() {
            return Err(WorkflowError::InvalidRequest("refinement text must not be empty".to_string()));
        }
        let course = self.course(course_id).await?;
        let subtopic = course.subtopic(subtopic_id).ok_or_else(|| WorkflowError::ContentNotFound {
            course_id: course_id.to_string(),
            subtopic_id: Some(subtopic_id.to_string()),
            lesson_id: None,
        })?;
        if course.status == CourseStatus::Completed {
            return Err(WorkflowError::CourseLocked {
                course_id: course.id.clone(),
            });
        }

        let ctx = RefinementContext {
            topic: course.topic.clone(),
            language: course.language.clone(),
            subtopic_title: subtopic.title.clone(),
            request: request.to_string(),
        };
        let target = format!("lesson titles in subtopic {subtopic_id}");
        let candidates = self
            .provider
            .suggest_lesson_titles(&ctx)
            .await
            .map_err(|e| WorkflowError::provider(&target, e))?;

        let candidates = index::tidy_candidates(candidates);
        if candidates.is_empty() {
            return Err(WorkflowError::provider(
                target,
                ProviderError::Malformed("no title candidates".to_string()),
            ));
        }
        debug!(course = %course_id, subtopic = %subtopic_id, count = candidates.len(), "title candidates");
        Ok(candidates)
    }

    /// Add one custom lesson. It joins the index directly when one exists,
    /// otherwise it waits in the pending list for the next build.
    pub async fn accept_custom_lesson(&self, course_id: &str, request: CustomLessonRequest) -> Result<Course> {
        let course = self.course(course_id).await?;
        if course.status == CourseStatus::Completed {
            return Err(WorkflowError::CourseLocked {
                course_id: course.id,
            });
        }

        let mut existing = index::indexed_custom_positions(&course.subtopics);
        existing.extend(course.pending_custom_lessons.iter().map(|r| r.subtopic_index));
        index::check_custom_lessons(
            course_id,
            course.num_subtopics,
            self.settings.max_custom_per_subtopic,
            &existing,
            std::slice::from_ref(&request),
        )?;

        let caps = CustomLessonCaps {
            per_course: index::custom_lesson_limit(course.num_subtopics),
            per_subtopic: self.settings.max_custom_per_subtopic,
        };
        let outcome = if course.has_index() {
            let subtopic = course
                .subtopics
                .get(request.subtopic_index)
                .ok_or_else(|| WorkflowError::ContentNotFound {
                    course_id: course_id.to_string(),
                    subtopic_id: Some(format!("#{}", request.subtopic_index)),
                    lesson_id: None,
                })?;
            let lesson = Lesson::new(course_id, &subtopic.id, 0, request.candidate(), true);
            let outcome = store::append_custom_lesson(&self.pool, &lesson, caps).await?;
            if outcome == CustomLessonInsert::Added {
                info!(course = %course_id, subtopic = %subtopic.id, lesson = %lesson.id, "custom lesson added");
            }
            outcome
        } else {
            let outcome = store::queue_custom_request(&self.pool, course_id, &request, caps).await?;
            if outcome == CustomLessonInsert::Added {
                info!(course = %course_id, subtopic_index = request.subtopic_index, "custom lesson queued");
            }
            outcome
        };

        // The snapshot checks above can be overtaken by a concurrent accept or completion.
        match outcome {
            CustomLessonInsert::Added => {}
            CustomLessonInsert::CourseNotActive => {
                return Err(WorkflowError::CourseLocked {
                    course_id: course_id.to_string(),
                });
            }
            CustomLessonInsert::CourseFull { current } => {
                return Err(WorkflowError::QuotaExceeded {
                    course_id: course_id.to_string(),
                    kind: QuotaKind::CustomLessons,
                    current,
                    ceiling: caps.per_course,
                });
            }
            CustomLessonInsert::SubtopicFull { current } => {
                return Err(WorkflowError::PerSubtopicLimit {
                    course_id: course_id.to_string(),
                    subtopic_index: request.subtopic_index,
                    current,
                    ceiling: caps.per_subtopic,
                });
            }
        }

        self.course(course_id).await
    }

    /// Generate a lesson's content and first video.
    ///
    /// A lesson that already has both is returned as stored, without a provider call.
    pub async fn generate_lesson(&self, key: &LessonKey) -> Result<Lesson> {
        let lesson = self.lesson(key).await?;
        if lesson::is_ready(&lesson) {
            debug!(lesson = %key, "lesson already generated");
            // Picks up a completion an earlier progress update failed to record.
            if lesson.is_completed && !self.course_is_completed(&key.course_id).await? {
                self.after_completion(&lesson).await;
            }
            return Ok(lesson);
        }

        match self.guard.try_acquire(key) {
            Acquire::Acquired(permit) => {
                debug!(lesson = %key, in_flight = self.guard.in_flight_count(), "generation slot acquired");
                let this = self.clone();
                let key = key.clone();
                // The task owns the permit, so a caller that goes away neither
                // cancels the provider call nor leaves the key held.
                tokio::spawn(async move {
                    let _permit = permit;
                    this.run_generation(&key).await
                })
                .await
                .map_err(|e| WorkflowError::Internal(anyhow!("lesson generation task failed: {e}")))?
            }
            Acquire::InFlight(waiter) => {
                if self.settings.in_flight_policy == InFlightPolicy::Reject {
                    return Err(WorkflowError::GenerationInProgress { key: key.clone() });
                }
                debug!(lesson = %key, "waiting for in-flight generation");
                if tokio::time::timeout(self.settings.in_flight_wait, waiter.finished())
                    .await
                    .is_err()
                {
                    return Err(WorkflowError::GenerationInProgress { key: key.clone() });
                }
                let lesson = self.lesson(key).await?;
                if lesson::is_ready(&lesson) {
                    Ok(lesson)
                } else {
                    Err(WorkflowError::provider(format!("lesson {key}"), ProviderError::Abandoned))
                }
            }
        }
    }

    async fn run_generation(&self, key: &LessonKey) -> Result<Lesson> {
        let (course, lesson) = self.load_lesson(key).await?;
        if lesson::is_ready(&lesson) {
            return Ok(lesson);
        }

        let ctx = LessonContext {
            topic: course.topic.clone(),
            language: course.language.clone(),
            subtopic_title: subtopic_title(&course, key),
            lesson_title: lesson.title.clone(),
        };
        let target = format!("lesson {key}");
        info!(course = %key.course_id, subtopic = %key.subtopic_id, lesson = %key.lesson_id, "generating lesson");

        let generated = self
            .provider
            .generate_lesson_content(&ctx)
            .await
            .map_err(|e| WorkflowError::provider(&target, e))?;
        let mut next = lesson::apply_generation(&lesson, generated).map_err(|e| WorkflowError::provider(&target, e))?;
        self.commit(key, &mut next).await?;

        info!(
            course = %key.course_id,
            lesson = %key.lesson_id,
            state = ?lesson::LessonState::of(&next),
            "lesson generated"
        );
        self.after_completion(&next).await;
        Ok(next)
    }

    /// Replace the lesson's video with a new one from the provider.
    ///
    /// Quota and state are checked first; an exhausted quota never reaches the provider.
    pub async fn change_video(&self, key: &LessonKey) -> Result<Lesson> {
        let (course, lesson) = self.load_lesson(key).await?;
        lesson::check_video_change(&lesson, course.status, self.settings.max_video_changes)?;

        let permit = match self.guard.try_acquire(key) {
            Acquire::Acquired(permit) => permit,
            Acquire::InFlight(_) => return Err(WorkflowError::GenerationInProgress { key: key.clone() }),
        };
        let this = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let _permit = permit;
            this.run_video_change(&key).await
        })
        .await
        .map_err(|e| WorkflowError::Internal(anyhow!("video change task failed: {e}")))?
    }

    async fn run_video_change(&self, key: &LessonKey) -> Result<Lesson> {
        // Re-check under the guard: a previous holder may have used the last change.
        let (course, lesson) = self.load_lesson(key).await?;
        lesson::check_video_change(&lesson, course.status, self.settings.max_video_changes)?;

        let ctx = VideoContext {
            topic: course.topic.clone(),
            language: course.language.clone(),
            subtopic_title: subtopic_title(&course, key),
            lesson_title: lesson.title.clone(),
            exclude_video_ids: lesson
                .video_history
                .iter()
                .map(|v| v.external_video_id.clone())
                .collect(),
        };
        let target = format!("replacement video for lesson {key}");
        let video = self
            .provider
            .select_replacement_video(&ctx)
            .await
            .map_err(|e| WorkflowError::provider(&target, e))?;
        if video.external_video_id.trim().is_empty() || ctx.exclude_video_ids.contains(&video.external_video_id) {
            return Err(WorkflowError::provider(
                target,
                ProviderError::Malformed(format!(
                    "replacement video '{}' is empty or already assigned",
                    video.external_video_id
                )),
            ));
        }

        let mut next = lesson::apply_replacement_video(&lesson, video);
        self.commit(key, &mut next).await?;
        info!(
            course = %key.course_id,
            lesson = %key.lesson_id,
            changes = next.video_change_count,
            remaining = lesson::video_changes_remaining(&next, self.settings.max_video_changes),
            "replacement video assigned"
        );
        Ok(next)
    }

    pub async fn lesson(&self, key: &LessonKey) -> Result<Lesson> {
        store::get_lesson(&self.pool, key)
            .await?
            .ok_or_else(|| WorkflowError::lesson_not_found(key))
    }

    async fn course_is_completed(&self, course_id: &str) -> Result<bool> {
        let row = store::get_course_row(&self.pool, course_id)
            .await?
            .ok_or_else(|| WorkflowError::course_not_found(course_id))?;
        Ok(row.status()? == CourseStatus::Completed)
    }

    async fn load_lesson(&self, key: &LessonKey) -> Result<(Course, Lesson)> {
        let course = self.course(&key.course_id).await?;
        let lesson = course
            .subtopic(&key.subtopic_id)
            .and_then(|s| s.lessons.iter().find(|l| l.id == key.lesson_id))
            .cloned()
            .ok_or_else(|| WorkflowError::lesson_not_found(key))?;
        Ok((course, lesson))
    }

    async fn commit(&self, key: &LessonKey, lesson: &mut Lesson) -> Result<()> {
        if store::save_lesson(&self.pool, lesson).await? {
            lesson.revision += 1;
            return Ok(());
        }
        // The row changed underneath us: removed by a regeneration or written by someone else.
        match store::get_lesson(&self.pool, key).await? {
            None => Err(WorkflowError::lesson_not_found(key)),
            Some(_) => Err(WorkflowError::GenerationInProgress { key: key.clone() }),
        }
    }

    /// Progress failures are logged; the lesson itself is already committed.
    async fn after_completion(&self, lesson: &Lesson) {
        if !lesson.is_completed {
            return;
        }
        if let Err(e) = self.aggregator.on_lesson_completed(&lesson.course_id, &lesson.id).await {
            error!(
                course = %lesson.course_id,
                lesson = %lesson.id,
                error = %format!("{e:#}"),
                "failed to update course progress"
            );
        }
    }
}

fn subtopic_title(course: &Course, key: &LessonKey) -> String {
    course
        .subtopic(&key.subtopic_id)
        .map(|s| s.title.clone())
        .unwrap_or_default()
}
