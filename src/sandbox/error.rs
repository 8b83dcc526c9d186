//! Domain-specific error types for sandbox orchestration.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use crate::process::ProcessError;

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A manager subcommand exited non-zero.
    #[error("Manager command '{subcommand}' failed with exit code {exit_code}: {stderr}")]
    Orchestration {
        /// Subcommand that failed.
        subcommand: String,
        /// Its exit code.
        exit_code: i32,
        /// Its error output, or stdout when stderr was empty.
        stderr: String,
    },

    /// A command executed inside a sandbox exited non-zero.
    #[error("Command in sandbox '{sandbox_id}' failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        /// Sandbox the command ran in.
        sandbox_id: String,
        /// Exit code of the command.
        exit_code: i32,
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
    },

    /// No sandbox with this id is listed.
    #[error("Sandbox not found: {id}")]
    NotFound {
        /// The id that was looked up.
        id: String,
    },

    /// The manager could not create the sandbox.
    #[error("Failed to create sandbox: {message}")]
    Creation {
        /// Manager output or reason.
        message: String,
    },

    /// Execution exceeded the configured timeout.
    #[error("Execution timed out after {timeout_secs} seconds")]
    Timeout {
        /// The timeout that was hit.
        timeout_secs: u64,
        /// Output captured before the timeout.
        stdout: String,
        /// Error output captured before the timeout.
        stderr: String,
    },

    /// Refused to act on the manager or on the container we are running in.
    #[error("Refusing to {action} protected container '{container}'")]
    ProtectedContainer {
        /// Refused action, `stop` or `destroy`.
        action: String,
        /// Target container name.
        container: String,
    },

    /// The manager process could not be reached at all.
    #[error("Sandbox manager is unavailable: {message}")]
    ManagerUnavailable {
        /// Why the runtime could not be run.
        message: String,
    },

    /// No configuration exists for the requested language.
    #[error("Unsupported language '{language}' (supported: {supported})")]
    UnsupportedLanguage {
        /// Requested language id.
        language: String,
        /// Configured language ids, comma separated.
        supported: String,
    },

    /// A caller-supplied value was rejected before reaching the manager.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },

    /// The manager replied with output that could not be decoded.
    #[error("Malformed manager output: {message}")]
    MalformedOutput {
        /// What could not be decoded.
        message: String,
    },
}

impl SandboxError {
    /// Creates an `Orchestration` error.
    pub fn orchestration(subcommand: impl Into<String>, exit_code: i32, stderr: impl Into<String>) -> Self {
        Self::Orchestration {
            subcommand: subcommand.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a `Creation` error.
    pub fn creation(message: impl Into<String>) -> Self {
        Self::Creation {
            message: message.into(),
        }
    }

    /// Creates a `ProtectedContainer` error.
    pub fn protected(action: impl Into<String>, container: impl Into<String>) -> Self {
        Self::ProtectedContainer {
            action: action.into(),
            container: container.into(),
        }
    }

    /// Creates a `ManagerUnavailable` error.
    pub fn manager_unavailable(message: impl Into<String>) -> Self {
        Self::ManagerUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `UnsupportedLanguage` error listing the known languages.
    pub fn unsupported_language<I, S>(language: impl Into<String>, supported: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let supported: Vec<String> = supported.into_iter().map(|s| s.as_ref().to_string()).collect();
        Self::UnsupportedLanguage {
            language: language.into(),
            supported: supported.join(", "),
        }
    }

    /// Creates an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a `MalformedOutput` error.
    pub fn malformed_output(message: impl Into<String>) -> Self {
        Self::MalformedOutput {
            message: message.into(),
        }
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the sandbox does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the target was a protected container.
    pub fn is_protected(&self) -> bool {
        matches!(self, Self::ProtectedContainer { .. })
    }

    /// Returns true if the manager reported a non-zero exit.
    pub fn is_orchestration(&self) -> bool {
        matches!(self, Self::Orchestration { .. } | Self::CommandFailed { .. })
    }
}

impl From<ProcessError> for SandboxError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::TimedOut {
                timeout_secs,
                stdout,
                stderr,
                ..
            } => Self::Timeout {
                timeout_secs,
                stdout,
                stderr,
            },
            other => Self::manager_unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestration_error() {
        let err = SandboxError::orchestration("start", 1, "no such sandbox");
        assert!(err.is_orchestration());
        assert!(!err.is_timeout());
        assert_eq!(
            err.to_string(),
            "Manager command 'start' failed with exit code 1: no such sandbox"
        );
    }

    #[test]
    fn test_protected_error() {
        let err = SandboxError::protected("destroy", "sandbox-manager");
        assert!(err.is_protected());
        assert!(!err.is_timeout());
        assert_eq!(
            err.to_string(),
            "Refusing to destroy protected container 'sandbox-manager'"
        );
    }

    #[test]
    fn test_unsupported_language_lists_alternatives() {
        let err = SandboxError::unsupported_language("cobol", ["bash", "python"]);
        assert_eq!(
            err.to_string(),
            "Unsupported language 'cobol' (supported: bash, python)"
        );
    }

    #[test]
    fn test_command_failed_counts_as_orchestration() {
        let err = SandboxError::CommandFailed {
            sandbox_id: "demo".to_string(),
            exit_code: 2,
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert!(err.is_orchestration());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_from_process_timeout_keeps_output() {
        let err = SandboxError::from(ProcessError::TimedOut {
            program: "docker".to_string(),
            timeout_secs: 5,
            stdout: "partial".to_string(),
            stderr: String::new(),
        });
        assert_eq!(err.to_string(), "Execution timed out after 5 seconds");
        match err {
            SandboxError::Timeout {
                timeout_secs,
                stdout,
                ..
            } => {
                assert_eq!(timeout_secs, 5);
                assert_eq!(stdout, "partial");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_from_process_spawn_failure() {
        let err = SandboxError::from(ProcessError::Spawn {
            program: "docker".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        });
        assert!(matches!(err, SandboxError::ManagerUnavailable { .. }));
        assert!(err.to_string().contains("docker"));
    }
}
