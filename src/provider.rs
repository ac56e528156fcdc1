use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::models::{TitleCandidate, VideoRef};

/// Input for syllabus suggestions.
#[derive(Debug, Clone, Serialize)]
pub struct IndexContext {
    pub topic: String,
    pub language: String,
    pub num_subtopics: u32,
    pub lessons_per_subtopic: u32,
}

/// Input for one lesson body + initial video.
#[derive(Debug, Clone, Serialize)]
pub struct LessonContext {
    pub topic: String,
    pub language: String,
    pub subtopic_title: String,
    pub lesson_title: String,
}

/// Input for custom-lesson title refinement.
#[derive(Debug, Clone, Serialize)]
pub struct RefinementContext {
    pub topic: String,
    pub language: String,
    pub subtopic_title: String,
    pub request: String,
}

/// Input for a replacement video. Videos already shown are excluded.
#[derive(Debug, Clone, Serialize)]
pub struct VideoContext {
    pub topic: String,
    pub language: String,
    pub subtopic_title: String,
    pub lesson_title: String,
    pub exclude_video_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubtopicSuggestion {
    pub title: String,
    #[serde(default)]
    pub original_title: Option<String>,
    pub lessons: Vec<TitleCandidate>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneratedLesson {
    pub content: String,
    pub video: VideoRef,
}

/// The external generation intelligence. Potentially slow, potentially failing,
/// safe to retry.
#[async_trait::async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn suggest_index(&self, ctx: &IndexContext) -> Result<Vec<SubtopicSuggestion>, ProviderError>;

    async fn generate_lesson_content(&self, ctx: &LessonContext) -> Result<GeneratedLesson, ProviderError>;

    async fn suggest_lesson_titles(&self, ctx: &RefinementContext) -> Result<Vec<TitleCandidate>, ProviderError>;

    async fn select_replacement_video(&self, ctx: &VideoContext) -> Result<VideoRef, ProviderError>;
}

/// JSON-over-HTTP provider client.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    timeout_str: String,
    max_retries: u32,
}

impl HttpProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let timeout = humantime::parse_duration(&config.timeout).context("parsing provider timeout")?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("lessonforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building provider HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout,
            timeout_str: config.timeout.clone(),
            max_retries: config.max_retries,
        })
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ProviderError> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(2 * u64::from(attempt));
                warn!(endpoint = %path, attempt, delay_secs = delay.as_secs(), "retrying provider call");
                tokio::time::sleep(delay).await;
            }
            match self.post_once(path, body).await {
                Ok(v) => return Ok(v),
                // A malformed body won't improve on retry.
                Err(e @ ProviderError::Malformed(_)) => return Err(e),
                Err(e) => {
                    warn!(endpoint = %path, attempt, error = %e, "provider call failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ProviderError::Malformed("no attempts made".to_string())))
    }

    async fn post_once<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ProviderError> {
        let endpoint = format!("{}/{}", self.base_url, path);
        debug!(endpoint = %endpoint, "calling generation provider");

        let mut request = self.client.post(&endpoint).json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(r)) => r,
            Ok(Err(source)) => return Err(ProviderError::Http { endpoint, source }),
            Err(_) => return Err(ProviderError::Timeout(self.timeout_str.clone())),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                endpoint,
                status: status.as_u16(),
            });
        }

        match tokio::time::timeout(self.timeout, response.json::<T>()).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(ProviderError::Malformed(format!("{endpoint}: {e}"))),
            Err(_) => Err(ProviderError::Timeout(self.timeout_str.clone())),
        }
    }
}

#[derive(Deserialize)]
struct IndexResponse {
    subtopics: Vec<SubtopicSuggestion>,
}

#[derive(Deserialize)]
struct CandidatesResponse {
    candidates: Vec<TitleCandidate>,
}

#[derive(Deserialize)]
struct VideoResponse {
    video: VideoRef,
}

#[async_trait::async_trait]
impl GenerationProvider for HttpProvider {
    async fn suggest_index(&self, ctx: &IndexContext) -> Result<Vec<SubtopicSuggestion>, ProviderError> {
        let resp: IndexResponse = self.post("index", ctx).await?;
        Ok(resp.subtopics)
    }

    async fn generate_lesson_content(&self, ctx: &LessonContext) -> Result<GeneratedLesson, ProviderError> {
        self.post("lesson", ctx).await
    }

    async fn suggest_lesson_titles(&self, ctx: &RefinementContext) -> Result<Vec<TitleCandidate>, ProviderError> {
        let resp: CandidatesResponse = self.post("lesson-titles", ctx).await?;
        Ok(resp.candidates)
    }

    async fn select_replacement_video(&self, ctx: &VideoContext) -> Result<VideoRef, ProviderError> {
        let resp: VideoResponse = self.post("replacement-video", ctx).await?;
        Ok(resp.video)
    }
}

#[cfg(test)]
pub mod stub {
    //! Deterministic provider for tests: counts calls, can fail or block on demand.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tokio::sync::Semaphore;

    use super::*;

    #[derive(Default)]
    pub struct StubProvider {
        pub index_calls: AtomicUsize,
        pub lesson_calls: AtomicUsize,
        pub title_calls: AtomicUsize,
        pub video_calls: AtomicUsize,
        pub fail: AtomicBool,
        /// Lessons per generated subtopic; when empty every subtopic gets `lessons_per_subtopic`.
        pub index_shape: Mutex<Vec<usize>>,
        /// Suffix for generated titles, so regenerations can produce different syllabi.
        pub title_suffix: Mutex<String>,
        /// When set, lesson generation waits for a permit before answering.
        pub gate: Option<Semaphore>,
    }

    impl StubProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn gated() -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::default()
            }
        }

        pub fn with_shape(shape: Vec<usize>) -> Self {
            let stub = Self::default();
            *stub.index_shape.lock().unwrap() = shape;
            stub
        }

        pub fn release(&self, n: usize) {
            if let Some(ref gate) = self.gate {
                gate.add_permits(n);
            }
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn lesson_calls(&self) -> usize {
            self.lesson_calls.load(Ordering::SeqCst)
        }

        pub fn video_calls(&self) -> usize {
            self.video_calls.load(Ordering::SeqCst)
        }

        pub fn index_calls(&self) -> usize {
            self.index_calls.load(Ordering::SeqCst)
        }

        fn check_fail(&self) -> Result<(), ProviderError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(ProviderError::Status {
                    endpoint: "stub".to_string(),
                    status: 503,
                })
            } else {
                Ok(())
            }
        }
    }

    pub fn stub_video(id: &str) -> VideoRef {
        VideoRef {
            external_video_id: id.to_string(),
            channel_id: "stub-channel".to_string(),
            channel_title: "Stub Channel".to_string(),
        }
    }

    #[async_trait::async_trait]
    impl GenerationProvider for StubProvider {
        async fn suggest_index(&self, ctx: &IndexContext) -> Result<Vec<SubtopicSuggestion>, ProviderError> {
            self.index_calls.fetch_add(1, Ordering::SeqCst);
            self.check_fail()?;
            let shape = self.index_shape.lock().unwrap().clone();
            let suffix = self.title_suffix.lock().unwrap().clone();
            Ok((0..ctx.num_subtopics as usize)
                .map(|s| {
                    let count = shape.get(s).copied().unwrap_or(ctx.lessons_per_subtopic as usize);
                    SubtopicSuggestion {
                        title: format!("{} part {}", ctx.topic, s + 1),
                        original_title: None,
                        lessons: (0..count)
                            .map(|l| TitleCandidate {
                                title: format!("Lesson {}.{}{suffix}", s + 1, l + 1),
                                original_title: None,
                            })
                            .collect(),
                    }
                })
                .collect())
        }

        async fn generate_lesson_content(&self, ctx: &LessonContext) -> Result<GeneratedLesson, ProviderError> {
            let n = self.lesson_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(ref gate) = self.gate {
                gate.acquire().await.expect("gate closed").forget();
            }
            self.check_fail()?;
            Ok(GeneratedLesson {
                content: format!("# {}\n\nBody for {}.", ctx.lesson_title, ctx.subtopic_title),
                video: stub_video(&format!("initial-{n}")),
            })
        }

        async fn suggest_lesson_titles(&self, ctx: &RefinementContext) -> Result<Vec<TitleCandidate>, ProviderError> {
            self.title_calls.fetch_add(1, Ordering::SeqCst);
            self.check_fail()?;
            Ok(vec![
                TitleCandidate {
                    title: format!("{} basics", ctx.request),
                    original_title: None,
                },
                TitleCandidate {
                    title: format!("{} in practice", ctx.request),
                    original_title: None,
                },
            ])
        }

        async fn select_replacement_video(&self, ctx: &VideoContext) -> Result<VideoRef, ProviderError> {
            let n = self.video_calls.fetch_add(1, Ordering::SeqCst);
            self.check_fail()?;
            Ok(stub_video(&format!("replacement-{n}-after-{}", ctx.exclude_video_ids.len())))
        }
    }
}
