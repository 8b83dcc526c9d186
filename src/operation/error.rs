//! Errors raised by operation tracking.

use super::{OperationStatus, OperationType};
use crate::sandbox::SandboxError;

/// Errors that can occur while tracking an operation.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// No record with this id exists.
    #[error("Operation not found: {operation_id}")]
    NotFound {
        /// The id that was looked up.
        operation_id: String,
    },

    /// A record with this id already exists.
    #[error("Operation already exists: {operation_id}")]
    AlreadyExists {
        /// The taken id.
        operation_id: String,
    },

    /// The requested status change would regress or skip a state.
    #[error("Operation {operation_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Record being changed.
        operation_id: String,
        /// Current status.
        from: OperationStatus,
        /// Requested status.
        to: OperationStatus,
    },

    /// The tracker was asked to run an action of a different type.
    #[error("Operation {operation_id} tracks '{expected}', not '{requested}'")]
    TypeMismatch {
        /// Record being run.
        operation_id: String,
        /// Type the record was registered with.
        expected: OperationType,
        /// Type of the action attempted.
        requested: OperationType,
    },

    /// Reading or writing the store failed.
    #[error("Operation store error: {message}")]
    Store {
        /// Error chain from the store.
        message: String,
    },

    /// The tracked sandbox action failed.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl OperationError {
    /// Creates a `Store` error, keeping the full context chain.
    pub fn store(err: &anyhow::Error) -> Self {
        Self::Store {
            message: format!("{err:#}"),
        }
    }

    /// Returns the sandbox error behind this failure, if any.
    pub fn as_sandbox(&self) -> Option<&SandboxError> {
        match self {
            Self::Sandbox(e) => Some(e),
            _ => None,
        }
    }

    /// Returns true if no record with the requested id exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
