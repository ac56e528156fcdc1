use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::notifier::CompletionNotifier;
use crate::orchestrator::Orchestrator;
use crate::provider::{GenerationProvider, HttpProvider};
use crate::{db, notifier, orchestrator, server, store};

/// Everything the daemon and the one-shot CLI commands share.
pub struct Services {
    pub pool: SqlitePool,
    pub orchestrator: Orchestrator,
    pub notifier: Arc<dyn CompletionNotifier>,
}

pub async fn build_services(config: &Config) -> Result<Services> {
    let pool = db::create_pool(config).await.context("creating database")?;
    info!(db_path = %config.db_path().display(), "database ready");

    let provider: Arc<dyn GenerationProvider> =
        Arc::new(HttpProvider::from_config(&config.provider).context("creating generation provider")?);
    let completion_notifier = notifier::from_config(&config.notifier).context("creating completion notifier")?;
    let settings = orchestrator::WorkflowSettings::from_config(&config.workflow, &config.provider.language_default)?;

    let orchestrator = Orchestrator::new(pool.clone(), provider, completion_notifier.clone(), settings);
    Ok(Services {
        pool,
        orchestrator,
        notifier: completion_notifier,
    })
}

pub async fn run(config: Config) -> Result<()> {
    let Services {
        pool,
        orchestrator,
        notifier: completion_notifier,
    } = build_services(&config).await?;

    let api_token = bootstrap_api_token(&pool, &config).await?;

    let cancel = CancellationToken::new();

    // Retry completion events the inline delivery could not hand off
    let retry_interval =
        humantime::parse_duration(&config.notifier.retry_interval).context("parsing notifier retry_interval")?;
    let notify_handle = tokio::spawn(notifier::notify_loop(
        pool.clone(),
        completion_notifier,
        retry_interval,
        cancel.clone(),
    ));

    let app_state = server::AppState {
        orchestrator: Arc::new(orchestrator),
        api_token: Arc::from(api_token),
    };

    let router = server::build_router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.service.listen)
        .await
        .with_context(|| format!("binding to {}", config.service.listen))?;

    info!(listen = %config.service.listen, "HTTP server listening");

    // Run the server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await
    });

    wait_for_shutdown().await?;
    info!("shutdown signal received");

    cancel.cancel();

    // In-flight generations finish inside their own tasks; give them a bounded window.
    let shutdown_timeout = std::time::Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = notify_handle.await;
        let _ = server_handle.await;
    })
    .await;

    pool.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn bootstrap_api_token(pool: &SqlitePool, config: &Config) -> Result<String> {
    // Priority: config value → DB stored value → auto-generate
    if let Some(ref token) = config.service.api_token {
        store::set_setting(pool, "api_token", token).await?;
        info!("using API token from config");
        return Ok(token.clone());
    }

    if let Some(token) = store::get_setting(pool, "api_token").await? {
        info!("using stored API token");
        return Ok(token);
    }

    let token = generate_token();
    store::set_setting(pool, "api_token", &token).await?;
    warn!(token = %token, "API token generated, save it: it won't be shown again");
    Ok(token)
}

fn generate_token() -> String {
    use rand::distr::Alphanumeric;
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

async fn wait_for_shutdown() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("registering SIGTERM handler")?;
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("waiting for ctrl-c")?;
    }

    Ok(())
}
