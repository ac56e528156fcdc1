use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NotifierConfig;
use crate::error::NotifyError;
use crate::models::CompletionEvent;
use crate::store;

/// Receives "course completed" events (certificate issuance, reporting).
#[async_trait::async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, event: &CompletionEvent) -> Result<(), NotifyError>;
}

/// Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait::async_trait]
impl CompletionNotifier for LogNotifier {
    async fn notify(&self, event: &CompletionEvent) -> Result<(), NotifyError> {
        info!(
            course = %event.course_id,
            event_id = %event.event_id,
            last_lesson = %event.last_lesson_id,
            "course completed, certificate eligible"
        );
        Ok(())
    }
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl CompletionNotifier for WebhookNotifier {
    async fn notify(&self, event: &CompletionEvent) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        info!(course = %event.course_id, event_id = %event.event_id, "completion delivered");
        Ok(())
    }
}

pub fn from_config(config: &NotifierConfig) -> Result<Arc<dyn CompletionNotifier>> {
    Ok(match config.webhook_url {
        Some(ref url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(LogNotifier),
    })
}

/// How long one deliverer owns an outbox row. Outlasts the webhook timeout.
const DELIVERY_LEASE: Duration = Duration::from_secs(120);

/// Deliver one completion event and record the outcome in the outbox.
///
/// The row is claimed first; when another deliverer holds it, nothing is sent
/// and false is returned.
pub async fn deliver(pool: &SqlitePool, notifier: &dyn CompletionNotifier, event: &CompletionEvent) -> Result<bool> {
    if !store::claim_completion(pool, &event.course_id, DELIVERY_LEASE).await? {
        debug!(course = %event.course_id, event_id = %event.event_id, "completion already claimed");
        return Ok(false);
    }
    match notifier.notify(event).await {
        Ok(()) => {
            store::mark_completion_delivered(pool, &event.course_id).await?;
            Ok(true)
        }
        Err(e) => {
            warn!(course = %event.course_id, error = %e, "completion notification failed, will retry");
            store::record_completion_failure(pool, &event.course_id, &e.to_string()).await?;
            Ok(false)
        }
    }
}

/// Retries undelivered completion events. Wakes every `interval`.
pub async fn notify_loop(
    pool: SqlitePool,
    notifier: Arc<dyn CompletionNotifier>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("completion notifier started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("completion notifier shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let pending = match store::get_undelivered_completions(&pool, 50).await {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to load undelivered completions");
                continue;
            }
        };

        for event in &pending {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = deliver(&pool, notifier.as_ref(), event).await {
                error!(course = %event.course_id, error = %e, "failed to record completion delivery");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::recording::RecordingNotifier;
    use super::*;
    use crate::db::create_test_pool;

    #[tokio::test]
    async fn failed_delivery_is_retried_by_the_loop() {
        let pool = create_test_pool().await;
        let course_id = store::insert_course(&pool, "Rust", "en", 1, 1).await.unwrap();
        let event = store::complete_course(&pool, &course_id, "l1").await.unwrap().unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        notifier.fail.store(true, Ordering::SeqCst);
        assert!(!deliver(&pool, notifier.as_ref(), &event).await.unwrap());
        assert_eq!(store::get_undelivered_completions(&pool, 10).await.unwrap().len(), 1);

        notifier.fail.store(false, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(notify_loop(
            pool.clone(),
            notifier.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        for _ in 0..100 {
            if !notifier.events().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let delivered: Vec<String> = notifier.events().into_iter().map(|e| e.event_id).collect();
        assert_eq!(delivered, vec![event.event_id]);
        assert!(store::get_undelivered_completions(&pool, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_delivery_is_not_repeated_by_the_loop() {
        let pool = create_test_pool().await;
        let course_id = store::insert_course(&pool, "Rust", "en", 1, 1).await.unwrap();
        let event = store::complete_course(&pool, &course_id, "l1").await.unwrap().unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        notifier.delay_ms.store(200, Ordering::SeqCst);

        // Claim before the loop starts, as the inline delivery after completion does.
        let inline = {
            let pool = pool.clone();
            let notifier = notifier.clone();
            let event = event.clone();
            tokio::spawn(async move { deliver(&pool, notifier.as_ref(), &event).await })
        };
        for _ in 0..100 {
            if store::get_undelivered_completions(&pool, 10).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(notify_loop(
            pool.clone(),
            notifier.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        assert!(inline.await.unwrap().unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let delivered: Vec<String> = notifier.events().into_iter().map(|e| e.event_id).collect();
        assert_eq!(delivered, vec![event.event_id]);
    }

    #[tokio::test]
    async fn claimed_completion_cannot_be_claimed_twice() {
        let pool = create_test_pool().await;
        let course_id = store::insert_course(&pool, "Rust", "en", 1, 1).await.unwrap();
        store::complete_course(&pool, &course_id, "l1").await.unwrap().unwrap();

        assert!(store::claim_completion(&pool, &course_id, Duration::from_secs(60)).await.unwrap());
        assert!(!store::claim_completion(&pool, &course_id, Duration::from_secs(60)).await.unwrap());
        assert!(store::get_undelivered_completions(&pool, 10).await.unwrap().is_empty());

        // A failed attempt releases the claim.
        store::record_completion_failure(&pool, &course_id, "boom").await.unwrap();
        assert!(store::claim_completion(&pool, &course_id, Duration::ZERO).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        // An expired lease is up for grabs again.
        assert!(store::claim_completion(&pool, &course_id, Duration::from_secs(60)).await.unwrap());
    }
}
