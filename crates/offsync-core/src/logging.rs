//! Structured logging for offsync
//!
//! Built on `tracing`, with two output formats:
//!
//! - **pretty**: human-friendly output on stderr
//! - **json**: JSON lines for daemons and log shippers
//!
//! An optional log file receives the same events without ANSI colors.
//!
//! # Correlation Fields
//!
//! Spans and events use these field names:
//! - `record_id`, `kind`: a queued write
//! - `entity`: backend collection name
//! - `mode`: `local` or `remote`
//! - `trigger`: what started a drain
//!
//! Payload bodies are never logged; only ids, kinds and counts.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::Config;

static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter; `RUST_LOG` takes precedence when set
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LogConfig {
    /// Derive logging settings from the `[general]` section.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            level: config.general.log_level.clone(),
            format: config.general.log_format,
            file: config.log_file(),
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    let existed = path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    #[cfg(unix)]
    if !existed {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

/// Install the global subscriber. Call once at startup.
///
/// A second call returns [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            config
                .level
                .parse::<LogLevel>()
                .map_err(|_| LogError::InvalidLevel(config.level.clone()))?;
            EnvFilter::new(&config.level)
        }
    };

    let file = config.file.as_deref().map(open_log_file).transpose()?;

    match config.format {
        LogFormat::Pretty => {
            let stderr_layer = fmt::layer()
                .with_writer(io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true);
            let file_layer = file.map(|file| {
                fmt::layer()
                    .with_writer(file)
                    .with_target(true)
                    .with_ansi(false)
            });
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer);
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let stderr_layer = fmt::layer()
                .json()
                .with_timer(SystemTime)
                .with_writer(io::stderr)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(false)
                .flatten_event(true);
            let file_layer = file.map(|file| {
                fmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_writer(file)
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true)
            });
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer);
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    let _ = LOGGING_INITIALIZED.set(true);

    tracing::info!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );

    Ok(())
}

/// Check if logging has been initialized
pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.get().is_some()
}

/// Log levels accepted by `general.log_level` and `--log-level`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: {s}. Expected one of: trace, debug, info, warn, error"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct CaptureWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl CaptureWriter {
        fn new() -> Self {
            Self {
                buffer: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn contents(&self) -> String {
            String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CaptureWriter {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn log_level_from_str() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn log_level_orders_by_severity() {
        assert!(LogLevel::Trace < LogLevel::Error);
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
    }

    #[test]
    fn log_config_from_general_section() {
        let mut config = Config::default();
        config.general.log_level = "debug".to_string();
        config.general.log_format = LogFormat::Json;
        config.general.log_file = Some("/tmp/offsync.log".to_string());

        let log = LogConfig::from_config(&config);
        assert_eq!(log.level, "debug");
        assert_eq!(log.format, LogFormat::Json);
        assert_eq!(log.file, Some(PathBuf::from("/tmp/offsync.log")));
    }

    #[test]
    fn json_layer_flattens_correlation_fields() {
        let writer = CaptureWriter::new();
        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .json()
                .with_writer(writer.clone())
                .flatten_event(true),
        );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(record_id = "pw-1", kind = "tasks", "write queued");
        });

        let line = writer.contents();
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["record_id"], "pw-1");
        assert_eq!(value["kind"], "tasks");
        assert_eq!(value["message"], "write queued");
    }

    #[cfg(unix)]
    #[test]
    fn log_file_created_with_restrictive_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("offsync.log");
        let _file = open_log_file(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }
}
