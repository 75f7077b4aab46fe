//! Error types for runledger-core

use std::fmt::Write;
use thiserror::Error;

use crate::event::{EntityId, EventKind};
use crate::lifecycle::{LifecycleState, RequiredState};
use crate::sink::EntityKind;

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
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

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

/// Main error type for runledger-core
#[derive(Error, Debug)]
pub enum Error {
    /// An event arrived in a lifecycle state that does not admit it
    #[error("{event} is not allowed in state {state} (requires {required})")]
    StateViolation {
        event: EventKind,
        state: LifecycleState,
        required: RequiredState,
    },

    /// A load queue with the same name is already tracked
    #[error("Load queue '{name}' is already running")]
    AlreadyRunningConflict { name: String },

    #[error("Load queue '{0}' is not known")]
    UnknownLoadQueue(String),

    #[error("Thread '{0}' is not registered with any load queue")]
    ThreadNotRegistered(String),

    #[error("Checkpoint '{name}' was never started on thread '{thread}'")]
    UnknownCheckpoint { thread: String, name: String },

    /// Write sink failures
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The consumer thread is gone (queue disconnected or worker panicked)
    #[error("Event pipeline is closed: {0}")]
    PipelineClosed(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::StateViolation { event, required, .. } => Some(
                Remediation::new(format!(
                    "Emit lifecycle events in order: {event} requires {required}."
                ))
                .command("Inspect the report", "runledger summary --db <path>")
                .alternative("Check that every start event has a matching end event."),
            ),
            Self::AlreadyRunningConflict { name } => Some(
                Remediation::new(format!(
                    "End or clean up load queue '{name}' before starting it again."
                ))
                .command("Inspect the report", "runledger summary --db <path>")
                .alternative("Give concurrent load queues distinct names."),
            ),
            Self::UnknownLoadQueue(name) => Some(
                Remediation::new(format!("Remember load queue '{name}' before referencing it."))
                    .command("Inspect the report", "runledger summary --db <path>"),
            ),
            Self::ThreadNotRegistered(thread) => Some(
                Remediation::new(format!(
                    "Register thread '{thread}' with a load queue before emitting checkpoints."
                ))
                .command("Inspect the report", "runledger summary --db <path>"),
            ),
            Self::UnknownCheckpoint { name, .. } => Some(
                Remediation::new(format!("Start checkpoint '{name}' before ending it."))
                    .command("Inspect the report", "runledger summary --db <path>")
                    .alternative("Checkpoints are keyed by thread; end them on the same thread."),
            ),
            Self::Sink(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Check path", "ls -l <path>")
                    .alternative("Verify the database directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < events.jsonl")
                    .alternative("Event files hold one JSON envelope per line."),
            ),
            Self::PipelineClosed(_) => Some(
                Remediation::new("The consumer thread stopped. Check logs for the cause and retry.")
                    .command("Inspect the report", "runledger summary --db <path>")
                    .alternative("Restart the recording with a fresh pipeline."),
            ),
        }
    }
}

/// How the processor should react to a failed sink write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkErrorClass {
    /// The row referenced by the write may have been deleted concurrently
    ReferentialGhost,
    /// Transient backend failure
    Retryable,
    /// The backend is unusable
    Terminal,
}

/// A batched write rejected at flush time, with the parent row it targeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedWrite {
    pub entity: EntityKind,
    pub id: EntityId,
    pub error: SinkError,
}

/// Write sink errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The write referenced a parent row that does not exist
    #[error("Referential integrity violation writing {entity}: {message}")]
    ReferentialIntegrity { entity: EntityKind, message: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Database is busy: {0}")]
    Busy(String),

    #[error("Sanity check failed: {0}")]
    SanityCheck(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    /// Some buffered writes failed during a flush; the others were committed
    #[error("{} batched write(s) failed, first: {}", .0.len(), first_failure(.0))]
    BatchFailed(Vec<FailedWrite>),
}

fn first_failure(failed: &[FailedWrite]) -> String {
    failed
        .first()
        .map_or_else(String::new, |write| write.error.to_string())
}

impl SinkError {
    /// A batch failure is a ghost only when every failed write is one.
    #[must_use]
    pub fn class(&self) -> SinkErrorClass {
        match self {
            Self::ReferentialIntegrity { .. } => SinkErrorClass::ReferentialGhost,
            Self::Busy(_) | Self::Database(_) => SinkErrorClass::Retryable,
            Self::SanityCheck(_) | Self::Connection(_) => SinkErrorClass::Terminal,
            Self::BatchFailed(failed) => failed
                .iter()
                .map(|write| write.error.class())
                .find(|class| *class != SinkErrorClass::ReferentialGhost)
                .unwrap_or(SinkErrorClass::ReferentialGhost),
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ReferentialIntegrity { entity, .. } => Remediation::new(format!(
                "A {entity} row referenced by the write no longer exists."
            ))
            .command("Inspect the report", "runledger summary --db <path>")
            .alternative("Avoid deleting report rows while a run is being recorded."),
            Self::Database(_) => {
                Remediation::new("Database operation failed. Check permissions and retry.")
                    .command("Check database", "sqlite3 <path> 'PRAGMA integrity_check;'")
                    .alternative("Ensure the database directory is writable.")
            }
            Self::Busy(_) => Remediation::new("Another process holds the database lock.")
                .command("Find holders", "fuser <path>")
                .alternative("Retry once the other writer has finished."),
            Self::SanityCheck(_) => Remediation::new(
                "The database failed its sanity check. Point runledger at a compatible database.",
            )
            .command("Check schema", "sqlite3 <path> 'PRAGMA user_version;'")
            .alternative("Start a fresh database file."),
            Self::Connection(_) => Remediation::new("Could not open the database.")
                .command("Check path", "ls -l <path>")
                .alternative("Verify [storage].db_path in the config file."),
            Self::BatchFailed(failed) => match failed.first() {
                Some(write) => write.error.remediation(),
                None => Remediation::new("Retry the flush.")
                    .command("Inspect the report", "runledger summary --db <path>"),
            },
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

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
                .command("Show effective config", "runledger config")
                .alternative("Validate the TOML syntax of the config file."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show effective config", "runledger config")
                    .alternative("Remove the offending key to fall back to its default.")
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
