//! # Configuration
//!
//! Manages the loading and parsing of the application's configuration file (`config.yaml`).
//! Defines the structs for transport, pipeline, session storage, resources and logging.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::domain::errors::ConfigurationError;

/// Main application configuration structure.
/// Matches the layout of `data/config.yaml`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Telegram,
    Console,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_token_env")]
    pub token_env: String, // e.g. "TELEGRAM_BOT_TOKEN"
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_updates_limit")]
    pub updates_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            token: None,
            token_env: default_token_env(),
            api_url: default_api_url(),
            poll_timeout_secs: default_poll_timeout(),
            updates_limit: default_updates_limit(),
        }
    }
}

impl TransportConfig {
    /// Explicit token first, then the configured environment variable.
    pub fn credential(&self) -> Result<String, ConfigurationError> {
        if let Some(token) = self.token.as_ref().filter(|t| !t.trim().is_empty()) {
            return Ok(token.clone());
        }
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigurationError::MissingCredential(self.token_env.clone()))
    }
}

fn default_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}
fn default_api_url() -> String {
    "https://api.telegram.org".to_string()
}
fn default_poll_timeout() -> u64 {
    30
}
fn default_updates_limit() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default)]
    pub concurrent_conversations: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            command_prefix: default_command_prefix(),
            max_redirects: default_max_redirects(),
            concurrent_conversations: false,
        }
    }
}

fn default_command_prefix() -> String {
    "/".to_string()
}
fn default_max_redirects() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    #[default]
    File,
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    #[serde(default)]
    pub backend: SessionBackend,
    #[serde(default = "default_sessions_path")]
    pub path: String,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            backend: SessionBackend::default(),
            path: default_sessions_path(),
            redis_url: None,
            redis_prefix: default_redis_prefix(),
        }
    }
}

fn default_sessions_path() -> String {
    "data/sessions".to_string()
}
fn default_redis_prefix() -> String {
    "switchboard:session:".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResourcesConfig {
    #[serde(default = "default_resources_dir")]
    pub dir: String,
    #[serde(default = "default_locale")]
    pub default_locale: String,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            dir: default_resources_dir(),
            default_locale: default_locale(),
        }
    }
}

fn default_resources_dir() -> String {
    "resources".to_string()
}
fn default_locale() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            file: default_log_file(),
            filter: default_log_filter(),
        }
    }
}

fn default_log_dir() -> String {
    "data".to_string()
}
fn default_log_file() -> String {
    "session.log".to_string()
}
fn default_log_filter() -> String {
    "info,reqwest=warn,hyper=warn".to_string()
}
