use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::index::MAX_CUSTOM_PER_SUBTOPIC;
use crate::lesson::MAX_VIDEO_CHANGES;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Bearer token for the API. Generated and stored on first start when unset.
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_version() -> u32 {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "lessonforge.db".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_language")]
    pub language_default: String,
}

fn default_timeout() -> String {
    "2m".to_string()
}
fn default_max_retries() -> u32 {
    1
}
fn default_language() -> String {
    "en".to_string()
}

/// What a second caller gets while the same lesson is already generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InFlightPolicy {
    /// Short-circuit with `GenerationInProgress`.
    Reject,
    /// Wait for the in-flight call and return its result.
    Wait,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_max_video_changes")]
    pub max_video_changes: u32,
    #[serde(default = "default_regeneration_quota")]
    pub index_regeneration_quota: u32,
    #[serde(default = "default_lessons_per_subtopic")]
    pub lessons_per_subtopic: u32,
    #[serde(default = "default_max_custom_per_subtopic")]
    pub max_custom_per_subtopic: u32,
    #[serde(default = "default_in_flight_policy")]
    pub in_flight_policy: InFlightPolicy,
    #[serde(default = "default_in_flight_wait")]
    pub in_flight_wait: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_video_changes: default_max_video_changes(),
            index_regeneration_quota: default_regeneration_quota(),
            lessons_per_subtopic: default_lessons_per_subtopic(),
            max_custom_per_subtopic: default_max_custom_per_subtopic(),
            in_flight_policy: default_in_flight_policy(),
            in_flight_wait: default_in_flight_wait(),
        }
    }
}

fn default_max_video_changes() -> u32 {
    MAX_VIDEO_CHANGES
}
fn default_regeneration_quota() -> u32 {
    1
}
fn default_lessons_per_subtopic() -> u32 {
    2
}
fn default_max_custom_per_subtopic() -> u32 {
    MAX_CUSTOM_PER_SUBTOPIC
}
fn default_in_flight_policy() -> InFlightPolicy {
    InFlightPolicy::Reject
}
fn default_in_flight_wait() -> String {
    "5m".to_string()
}

#[derive(Debug, Deserialize)]
pub struct NotifierConfig {
    /// Certificate/reporting webhook. Completion events are only logged when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_retry_interval")]
    pub retry_interval: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            retry_interval: default_retry_interval(),
        }
    }
}

fn default_retry_interval() -> String {
    "1m".to_string()
}

impl Config {
    /// Resolve the database path (relative to data_dir if not absolute).
    pub fn db_path(&self) -> PathBuf {
        let db_path = Path::new(&self.database.path);
        if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            self.service.data_dir.join(db_path)
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.service.version != 1 {
        return Err(ConfigError::Validation(format!(
            "unsupported config version {} (this binary supports version 1)",
            config.service.version
        ))
        .into());
    }

    config
        .service
        .listen
        .parse::<std::net::SocketAddr>()
        .map_err(|e| ConfigError::Validation(format!("listen address '{}': {}", config.service.listen, e)))?;

    if let Some(ref token) = config.service.api_token
        && token.len() < 16
    {
        return Err(ConfigError::Validation("api_token must be at least 16 characters".to_string()).into());
    }

    // Provider
    if !(config.provider.base_url.starts_with("http://") || config.provider.base_url.starts_with("https://")) {
        return Err(ConfigError::Validation(format!(
            "provider base_url '{}' must be an http(s) URL",
            config.provider.base_url
        ))
        .into());
    }
    humantime::parse_duration(&config.provider.timeout)
        .map_err(|e| ConfigError::Validation(format!("provider timeout '{}': {}", config.provider.timeout, e)))?;
    if config.provider.language_default.trim().is_empty() {
        return Err(ConfigError::Validation("provider language_default must not be empty".to_string()).into());
    }

    // Workflow quotas
    let wf = &config.workflow;
    if wf.max_video_changes > MAX_VIDEO_CHANGES {
        return Err(ConfigError::Validation(format!(
            "workflow max_video_changes {} exceeds the hard ceiling of {}",
            wf.max_video_changes, MAX_VIDEO_CHANGES
        ))
        .into());
    }
    if !(1..=2).contains(&wf.lessons_per_subtopic) {
        return Err(ConfigError::Validation(format!(
            "workflow lessons_per_subtopic must be 1 or 2, got {}",
            wf.lessons_per_subtopic
        ))
        .into());
    }
    if !(1..=MAX_CUSTOM_PER_SUBTOPIC).contains(&wf.max_custom_per_subtopic) {
        return Err(ConfigError::Validation(format!(
            "workflow max_custom_per_subtopic must be between 1 and {}, got {}",
            MAX_CUSTOM_PER_SUBTOPIC, wf.max_custom_per_subtopic
        ))
        .into());
    }
    humantime::parse_duration(&wf.in_flight_wait)
        .map_err(|e| ConfigError::Validation(format!("workflow in_flight_wait '{}': {}", wf.in_flight_wait, e)))?;

    // Notifier
    if let Some(ref url) = config.notifier.webhook_url
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        return Err(ConfigError::Validation(format!("notifier webhook_url '{url}' must be an http(s) URL")).into());
    }
    humantime::parse_duration(&config.notifier.retry_interval).map_err(|e| {
        ConfigError::Validation(format!(
            "notifier retry_interval '{}': {}",
            config.notifier.retry_interval, e
        ))
    })?;

    Ok(())
}
