//! Configuration management for offsync
//!
//! Handles loading and validation of `offsync.toml` configuration files.
//!
//! Resolution order for the config file:
//! 1. An explicit path (`--config`)
//! 2. `OFFSYNC_CONFIG`
//! 3. `<config_dir>/offsync/offsync.toml`
//!
//! A missing file at the default location is not an error; defaults apply.
//! Environment overrides (`OFFSYNC_REMOTE_URL`, `OFFSYNC_REMOTE_KEY`,
//! `OFFSYNC_DB_PATH`) are applied after the file is parsed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendMode;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "OFFSYNC_CONFIG";
/// Environment override for `remote.url`.
pub const REMOTE_URL_ENV: &str = "OFFSYNC_REMOTE_URL";
/// Environment override for `remote.api_key`.
pub const REMOTE_KEY_ENV: &str = "OFFSYNC_REMOTE_KEY";
/// Environment override for `storage.db_path`.
pub const DB_PATH_ENV: &str = "OFFSYNC_DB_PATH";

/// Values shipped in sample configs that must never be treated as a real remote.
const PLACEHOLDER_MARKERS: &[&str] = &["placeholder", "your-project", "example", "changeme"];

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for machines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Durable store settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Remote backend settings
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Drain scheduling and retry settings
    #[serde(default)]
    pub sync: SyncConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,

    /// Data directory path
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
            data_dir: default_data_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> String {
    "~/.local/share/offsync".to_string()
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path. Defaults to `<data_dir>/offsync.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,

    /// Maximum number of pending records before enqueue is rejected
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_pending: default_max_pending(),
        }
    }
}

fn default_max_pending() -> usize {
    10_000
}

/// Remote backend configuration
///
/// Absent or placeholder `url`/`api_key` select the local-only adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Upper bound for every remote call
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Entity that receives `record_activity` events
    #[serde(default = "default_activity_entity")]
    pub activity_entity: String,

    /// Poll interval for remote subscriptions
    #[serde(default = "default_subscribe_poll_ms")]
    pub subscribe_poll_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_ms: default_timeout_ms(),
            activity_entity: default_activity_entity(),
            subscribe_poll_ms: default_subscribe_poll_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_activity_entity() -> String {
    "activity_events".to_string()
}

fn default_subscribe_poll_ms() -> u64 {
    5_000
}

/// Drain scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Records with more failed replays than this are skipped by automatic drains
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Periodic drain interval; 0 disables the timer
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Connectivity probe interval; 0 disables the monitor
    #[serde(default = "default_probe_secs")]
    pub connectivity_probe_secs: u64,

    /// Backoff applied to periodic drains after a pass stopped on a network failure
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            flush_interval_secs: default_flush_interval_secs(),
            connectivity_probe_secs: default_probe_secs(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_flush_interval_secs() -> u64 {
    60
}

fn default_probe_secs() -> u64 {
    15
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

impl SyncConfig {
    /// Backoff policy for periodic drains after a failed pass.
    #[must_use]
    pub fn backoff_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
            2.0,
            0.1,
            None,
        )
    }
}

/// Resolved remote endpoint plus credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCredentials {
    pub url: String,
    pub api_key: String,
}

impl Config {
    /// Load configuration, resolving the file location as described in the module docs.
    pub fn load(explicit: Option<&Path>) -> crate::Result<Self> {
        let mut config = match resolve_config_path(explicit) {
            Some(path) if path.exists() => Self::load_from(&path)?,
            Some(path) if explicit.is_some() => {
                return Err(ConfigError::FileNotFound(path.display().to_string()).into());
            }
            _ => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path (no env overrides).
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ReadFailed(path.display().to_string(), e.to_string())
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(REMOTE_URL_ENV) {
            self.remote.url = Some(url);
        }
        if let Some(key) = lookup(REMOTE_KEY_ENV) {
            self.remote.api_key = Some(key);
        }
        if let Some(path) = lookup(DB_PATH_ENV) {
            self.storage.db_path = Some(path);
        }
    }

    /// Validate field ranges.
    pub fn validate(&self) -> crate::Result<()> {
        if self.storage.max_pending == 0 {
            return Err(
                ConfigError::ValidationError("storage.max_pending must be > 0".to_string()).into(),
            );
        }
        if self.remote.timeout_ms == 0 {
            return Err(
                ConfigError::ValidationError("remote.timeout_ms must be > 0".to_string()).into(),
            );
        }
        if self.remote.activity_entity.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "remote.activity_entity must not be empty".to_string(),
            )
            .into());
        }
        if let Some(url) = self.remote_credentials().map(|c| c.url) {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::ValidationError(format!(
                    "remote.url must be an http(s) URL, got {url}"
                ))
                .into());
            }
        }
        Ok(())
    }

    /// The remote endpoint, if a real (non-placeholder) URL and key are configured.
    #[must_use]
    pub fn remote_credentials(&self) -> Option<RemoteCredentials> {
        let url = self.remote.url.as_deref().map(str::trim)?;
        let api_key = self.remote.api_key.as_deref().map(str::trim)?;
        if is_placeholder(url) || is_placeholder(api_key) {
            return None;
        }
        Some(RemoteCredentials {
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Which adapter this configuration selects. Fixed for the process lifetime.
    #[must_use]
    pub fn backend_mode(&self) -> BackendMode {
        if self.remote_credentials().is_some() {
            BackendMode::Remote
        } else {
            BackendMode::Local
        }
    }

    /// Resolved database path.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        match &self.storage.db_path {
            Some(path) => expand_tilde(path),
            None => expand_tilde(&self.general.data_dir).join("offsync.db"),
        }
    }

    /// Resolved log file path, if any.
    #[must_use]
    pub fn log_file(&self) -> Option<PathBuf> {
        self.general.log_file.as_deref().map(expand_tilde)
    }

    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote.timeout_ms)
    }
}

/// Whether a configured value is missing or a sample placeholder.
#[must_use]
pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return true;
    }
    let lower = value.to_lowercase();
    lower.starts_with("your-")
        || lower.starts_with("your_")
        || PLACEHOLDER_MARKERS.iter().any(|m| lower.contains(m))
}

/// Resolve the config file path.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("offsync").join("offsync.toml"))
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
