//! Index builder: turns provider suggestions plus custom lessons into the
//! ordered subtopic → lesson structure of a course.
//!
//! Limit checks run here before anything is sent to the provider, so a
//! rejected request never costs a generation call or touches stored state.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{ProviderError, QuotaKind, WorkflowError};
use crate::models::{CustomLessonRequest, Lesson, Subtopic, TitleCandidate};
use crate::provider::SubtopicSuggestion;

/// Upper bound on requested subtopics per course.
pub const MAX_SUBTOPICS: u32 = 20;

/// Hard ceiling on custom lessons in one subtopic.
pub const MAX_CUSTOM_PER_SUBTOPIC: u32 = 2;

/// Refinement returns at most this many candidates.
pub const MAX_TITLE_CANDIDATES: usize = 5;

/// Total custom lessons allowed across a course.
///
/// A single-subtopic course still gets room for four.
pub fn custom_lesson_limit(num_subtopics: u32) -> u32 {
    if num_subtopics == 1 {
        num_subtopics.max(4)
    } else {
        num_subtopics
    }
}

pub fn validate_subtopic_count(num_subtopics: u32) -> Result<(), WorkflowError> {
    if num_subtopics == 0 || num_subtopics > MAX_SUBTOPICS {
        return Err(WorkflowError::InvalidRequest(format!(
            "number of subtopics must be between 1 and {MAX_SUBTOPICS}, got {num_subtopics}"
        )));
    }
    Ok(())
}

/// Check `requests` against the custom lessons a course already has.
///
/// `existing` holds the subtopic index of every custom lesson already accepted
/// (in the index or still pending).
pub fn check_custom_lessons(
    course_id: &str,
    num_subtopics: u32,
    max_per_subtopic: u32,
    existing: &[usize],
    requests: &[CustomLessonRequest],
) -> Result<(), WorkflowError> {
    let ceiling = custom_lesson_limit(num_subtopics);
    let total = existing.len() + requests.len();
    if total > ceiling as usize {
        return Err(WorkflowError::QuotaExceeded {
            course_id: course_id.to_string(),
            kind: QuotaKind::CustomLessons,
            current: existing.len() as u32,
            ceiling,
        });
    }

    let mut per_subtopic: HashMap<usize, u32> = HashMap::new();
    for &idx in existing {
        *per_subtopic.entry(idx).or_default() += 1;
    }
    // Lessons carried into a smaller index must fit as well.
    if let Some((&subtopic_index, &current)) = per_subtopic
        .iter()
        .filter(|&(_, &count)| count > max_per_subtopic)
        .min_by_key(|&(&idx, _)| idx)
    {
        return Err(WorkflowError::PerSubtopicLimit {
            course_id: course_id.to_string(),
            subtopic_index,
            current,
            ceiling: max_per_subtopic,
        });
    }
    for request in requests {
        if request.title.trim().is_empty() {
            return Err(WorkflowError::InvalidRequest("custom lesson title must not be empty".to_string()));
        }
        if request.subtopic_index >= num_subtopics as usize {
            return Err(WorkflowError::ContentNotFound {
                course_id: course_id.to_string(),
                subtopic_id: Some(format!("#{}", request.subtopic_index)),
                lesson_id: None,
            });
        }
        let count = per_subtopic.entry(request.subtopic_index).or_default();
        if *count >= max_per_subtopic {
            return Err(WorkflowError::PerSubtopicLimit {
                course_id: course_id.to_string(),
                subtopic_index: request.subtopic_index,
                current: *count,
                ceiling: max_per_subtopic,
            });
        }
        *count += 1;
    }
    Ok(())
}

/// Subtopic indices of the custom lessons currently in an index.
pub fn indexed_custom_positions(subtopics: &[Subtopic]) -> Vec<usize> {
    subtopics
        .iter()
        .enumerate()
        .flat_map(|(i, s)| s.lessons.iter().filter(|l| l.is_custom).map(move |_| i))
        .collect()
}

/// Custom lessons of an index, turned back into requests so they survive a regeneration.
///
/// Lessons whose subtopic no longer exists move to the last subtopic with room
/// under `max_per_subtopic`, searching backwards. When no subtopic has room they
/// land on the last one and [`check_custom_lessons`] rejects the rebuild.
pub fn carry_over_custom_lessons(
    subtopics: &[Subtopic],
    num_subtopics: u32,
    max_per_subtopic: u32,
) -> Vec<CustomLessonRequest> {
    let n = num_subtopics.max(1) as usize;
    let mut per_subtopic = vec![0u32; n];
    let mut carried: Vec<CustomLessonRequest> = Vec::new();
    let mut displaced: Vec<CustomLessonRequest> = Vec::new();

    for (i, subtopic) in subtopics.iter().enumerate() {
        for lesson in subtopic.lessons.iter().filter(|l| l.is_custom) {
            let request = CustomLessonRequest {
                subtopic_index: i,
                title: lesson.title.clone(),
                original_title: lesson.original_title.clone(),
            };
            if i < n {
                per_subtopic[i] += 1;
                carried.push(request);
            } else {
                displaced.push(request);
            }
        }
    }

    for mut request in displaced {
        let target = (0..n).rev().find(|&i| per_subtopic[i] < max_per_subtopic).unwrap_or(n - 1);
        per_subtopic[target] += 1;
        request.subtopic_index = target;
        carried.push(request);
    }
    carried
}

/// Assemble a new index.
///
/// Each subtopic keeps at most `lessons_per_subtopic` generated lessons, then
/// its custom lessons in request order. Lessons whose normalized title matches
/// one in `previous` inherit its content, videos, change count and completion.
pub fn assemble_index(
    course_id: &str,
    suggestions: Vec<SubtopicSuggestion>,
    num_subtopics: u32,
    lessons_per_subtopic: u32,
    custom: &[CustomLessonRequest],
    previous: &[Subtopic],
) -> Result<Vec<Subtopic>, ProviderError> {
    if suggestions.len() < num_subtopics as usize {
        return Err(ProviderError::Malformed(format!(
            "expected {num_subtopics} subtopics, provider returned {}",
            suggestions.len()
        )));
    }

    let mut carried: HashMap<String, &Lesson> = HashMap::new();
    for lesson in previous.iter().flat_map(|s| s.lessons.iter()) {
        carried.entry(normalize_title(&lesson.title)).or_insert(lesson);
    }

    let mut subtopics = Vec::with_capacity(num_subtopics as usize);
    for (index, suggestion) in suggestions.into_iter().take(num_subtopics as usize).enumerate() {
        if suggestion.title.trim().is_empty() {
            return Err(ProviderError::Malformed(format!("subtopic {} has no title", index + 1)));
        }
        let generated: Vec<TitleCandidate> = suggestion
            .lessons
            .into_iter()
            .filter(|l| !l.title.trim().is_empty())
            .take(lessons_per_subtopic as usize)
            .collect();
        if generated.is_empty() {
            return Err(ProviderError::Malformed(format!(
                "subtopic '{}' has no lessons",
                suggestion.title
            )));
        }

        let subtopic_id = Uuid::new_v4().to_string();
        let customs = custom
            .iter()
            .filter(|r| r.subtopic_index == index)
            .map(|r| (r.candidate(), true));
        let lessons = generated
            .into_iter()
            .map(|t| (t, false))
            .chain(customs)
            .enumerate()
            .map(|(position, (title, is_custom))| {
                let mut lesson = Lesson::new(course_id, &subtopic_id, position as u32, title, is_custom);
                if let Some(old) = carried.remove(&normalize_title(&lesson.title)) {
                    inherit_progress(&mut lesson, old);
                }
                lesson
            })
            .collect();

        subtopics.push(Subtopic {
            id: subtopic_id,
            position: index as u32,
            title: suggestion.title,
            original_title: suggestion.original_title,
            lessons,
        });
    }
    Ok(subtopics)
}

fn inherit_progress(lesson: &mut Lesson, old: &Lesson) {
    lesson.content = old.content.clone();
    lesson.content_html = old.content_html.clone();
    lesson.video_history = old.video_history.clone();
    lesson.video_change_count = old.video_change_count;
    lesson.is_completed = old.is_completed;
}

fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Trim provider candidates to a small ordered list without blanks or duplicates.
pub fn tidy_candidates(candidates: Vec<TitleCandidate>) -> Vec<TitleCandidate> {
    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|c| !c.title.trim().is_empty())
        .filter(|c| seen.insert(normalize_title(&c.title)))
        .take(MAX_TITLE_CANDIDATES)
        .collect()
}
