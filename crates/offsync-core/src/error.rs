//! Error types for offsync-core
//!
//! The write path distinguishes three failure classes:
//!
//! - [`NetworkFailure`]: transient, the write is queued and replayed later.
//! - [`ApplicationFailure`]: the remote rejected the write; surfaced, never queued.
//! - [`StorageError`]: the local durable medium failed; surfaced, queueing impossible.

use std::fmt::{self, Write};
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for offsync-core
#[derive(Error, Debug)]
pub enum Error {
    /// Durable record store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Backend adapter errors
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// A caller-facing write failed
    #[error("Write failed: {0}")]
    Write(#[from] WriteError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, closed channels, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Backend(err) => Some(err.remediation()),
            Self::Write(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Status", "offsync status")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Restart the sync daemon or retry the command.")
                    .command("Status", "offsync status")
                    .alternative("If the issue persists, restart offsync run."),
            ),
        }
    }
}

/// Durable record store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Record store is not open")]
    NotOpen,

    #[error("Database corruption detected: {details}")]
    Corruption { details: String },

    #[error("Database schema version ({current}) is newer than supported ({supported})")]
    SchemaTooNew { current: i32, supported: i32 },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Pending-write queue is full ({limit} records)")]
    QueueFull { limit: usize },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Record serialization failed: {0}")]
    Serialization(String),
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => Remediation::new(
                "Database operation failed. Check data directory permissions and free disk space.",
            )
            .command("Status", "offsync status")
            .alternative("Ensure the data directory is writable."),
            Self::NotOpen => Remediation::new("The record store was closed or never opened.")
                .command("Status", "offsync status")
                .alternative("Restart the process so the store is reopened."),
            Self::Corruption { .. } => Remediation::new(
                "Database corruption detected. Export what can be read, then start a fresh store.",
            )
            .command("Export pending writes", "offsync export --out pending.jsonl")
            .alternative("Move the database file aside and re-import the export."),
            Self::SchemaTooNew { current, supported } => Remediation::new(format!(
                "Database schema version {current} is newer than supported ({supported}). Upgrade offsync."
            ))
            .command("Check version", "offsync --version")
            .alternative("Restore a database created by this version."),
            Self::MigrationFailed(_) => {
                Remediation::new("Database migration failed. Back up the file and retry.")
                    .command("Status", "offsync status")
                    .alternative("Backup the database file before retrying.")
            }
            Self::QueueFull { limit } => Remediation::new(format!(
                "{limit} writes are already waiting to sync. Restore connectivity and flush."
            ))
            .command("Flush now", "offsync flush")
            .command("Inspect exhausted records", "offsync list --exhausted")
            .alternative("Raise storage.max_pending in offsync.toml."),
            Self::InvalidRecord(_) => Remediation::new("The record is malformed.")
                .command("List pending", "offsync list")
                .alternative("Check the kind and payload of the write."),
            Self::Serialization(_) => {
                Remediation::new("A stored record could not be encoded or decoded.")
                    .command("Export pending writes", "offsync export --out pending.jsonl")
                    .alternative("Inspect the export for the malformed record and purge it.")
            }
        }
    }
}

/// How a network failure manifested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkFailureKind {
    /// DNS resolution or connection establishment failed
    Connect,
    /// The call did not complete within the configured bound
    Timeout,
    /// The request or response body failed mid-flight
    Transport,
    /// The remote answered with a gateway/availability status
    Unavailable,
}

impl fmt::Display for NetworkFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// The remote could not be reached. Retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed ({kind}): {reason}")]
pub struct NetworkFailure {
    pub operation: String,
    pub kind: NetworkFailureKind,
    pub reason: String,
}

impl NetworkFailure {
    #[must_use]
    pub fn new(
        operation: impl Into<String>,
        kind: NetworkFailureKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            kind,
            reason: reason.into(),
        }
    }
}

/// The remote answered and rejected the request. Not retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} rejected{}: {message}", status_suffix(.status))]
pub struct ApplicationFailure {
    pub operation: String,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl ApplicationFailure {
    #[must_use]
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            status: None,
            code: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Errors returned by a backend adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("network failure: {0}")]
    Network(#[from] NetworkFailure),

    #[error("application failure: {0}")]
    Application(#[from] ApplicationFailure),

    #[error("local storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl BackendError {
    /// Only network failures are eligible for queueing.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Network(_) => Remediation::new(
                "The remote backend is unreachable. Writes are queued and sync on reconnect.",
            )
            .command("Pending writes", "offsync status")
            .command("Flush now", "offsync flush")
            .alternative("Check remote.url and network connectivity."),
            Self::Application(_) => Remediation::new(
                "The remote backend rejected the request. Fix the data or credentials and retry.",
            )
            .command("Show config", "offsync config show")
            .alternative("Check remote.api_key and the entity schema."),
            Self::Storage(err) => err.remediation(),
        }
    }
}

/// Failures a caller of `SyncController::write` can observe.
///
/// Network failures never appear here: they are absorbed by queueing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("rejected by remote: {0}")]
    Application(#[from] ApplicationFailure),

    #[error("could not persist write locally: {0}")]
    Storage(#[from] StorageError),
}

impl WriteError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Application(failure) => {
                BackendError::Application(failure.clone()).remediation()
            }
            Self::Storage(err) => err.remediation(),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Show effective config", "offsync config show")
                .alternative("Validate the TOML syntax."),
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
                    .command("Show effective config", "offsync config show")
                    .alternative("Recreate the config from defaults.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show effective config", "offsync config show")
                    .alternative("Review validation errors and adjust offsync.toml.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
