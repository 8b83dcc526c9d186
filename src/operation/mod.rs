//! Persisted, pollable records of long-running sandbox actions.
//!
//! An operation is created `pending`, moves to `started`, and ends in
//! exactly one of `completed` or `failed`. Its log only grows.

mod error;
mod store;
mod tracker;

pub use error::OperationError;
pub use store::{FileOperationStore, MemoryOperationStore, OperationStore};
pub use tracker::OperationTracker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Kind of sandbox action an operation tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Create a sandbox.
    Create,
    /// Start a stopped sandbox.
    Start,
    /// Stop a running sandbox.
    Stop,
    /// Recreate a sandbox from a type.
    Reset,
    /// Remove a sandbox.
    Destroy,
    /// Remove every sandbox.
    Cleanup,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reset => "reset",
            Self::Destroy => "destroy",
            Self::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

impl FromStr for OperationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "reset" => Ok(Self::Reset),
            "destroy" => Ok(Self::Destroy),
            "cleanup" => Ok(Self::Cleanup),
            _ => anyhow::bail!(
                "Unknown operation type: '{s}'. Valid: create, start, stop, reset, destroy, cleanup"
            ),
        }
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Registered, not yet running.
    Pending,
    /// Running.
    Started,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl OperationStatus {
    /// Returns true for `completed` and `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Started) | (Self::Started, Self::Completed | Self::Failed)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Severity of a log entry.
/// Severity of a log entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Progress.
    #[default]
    Info,
    /// Something went wrong but the action continued.
    Warning,
    /// The action failed.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One line of an operation's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// What happened.
    pub message: String,
}

/// One tracked action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique id, also the record's file name.
    pub operation_id: String,
    /// Action this record tracks.
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    /// Lifecycle state.
    pub status: OperationStatus,
    /// Target sandbox, once known.
    pub sandbox_id: Option<String>,
    /// Latest human-readable status line.
    #[serde(default)]
    pub message: String,
    /// When the record was registered.
    pub created_at: DateTime<Utc>,
    /// Time of the last change.
    pub updated_at: DateTime<Utc>,
    /// Action parameters and results, as strings.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Every step, oldest first.
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

impl Operation {
    /// Creates a pending operation with a generated id.
    pub fn new(operation_type: OperationType, sandbox_id: Option<String>) -> Self {
        Self::with_id(Self::generate_id(operation_type), operation_type, sandbox_id)
    }

    /// Creates a pending operation with a caller-supplied id.
    pub fn with_id(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        sandbox_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            operation_id: operation_id.into(),
            operation_type,
            status: OperationStatus::Pending,
            sandbox_id,
            message: "Pending".to_string(),
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
            log: Vec::new(),
        }
    }

    /// `{type}_{unique}`
    pub fn generate_id(operation_type: OperationType) -> String {
        format!("{operation_type}_{}", Uuid::new_v4().simple())
    }

    /// Returns true once the operation has completed or failed.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves to `next`, recording `message`. Rejects regressions and skips.
    pub(crate) fn transition(&mut self, next: OperationStatus, message: impl Into<String>) -> Result<(), OperationError> {
        if !self.status.can_become(next) {
            return Err(OperationError::InvalidTransition {
                operation_id: self.operation_id.clone(),
                from: self.status,
                to: next,
            });
        }

        let message = message.into();
        let level = match next {
            OperationStatus::Failed => LogLevel::Error,
            _ => LogLevel::Info,
        };
        self.status = next;
        self.push_log(level, message.clone());
        self.message = message;
        Ok(())
    }

    /// Appends a log entry and mirrors it to tracing.
    pub(crate) fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let id = self.operation_id.as_str();
        match level {
            LogLevel::Info => info!(operation = id, "{message}"),
            LogLevel::Warning => warn!(operation = id, "{message}"),
            LogLevel::Error => error!(operation = id, "{message}"),
        }

        let now = Utc::now();
        self.updated_at = now;
        self.log.push(LogEntry {
            timestamp: now,
            level,
            message,
        });
    }
}
