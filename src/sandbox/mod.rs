//! Sandbox orchestration through the manager container.
//!
//! Every sandbox operation is delegated to a privileged manager process via
//! its command-line protocol. This module owns the entity model, the protocol
//! client, listing and status normalization, and the public `SandboxManager`.

/// Sandbox types from Dockerfile templates.
pub mod catalog;
mod error;
mod manager;
mod protocol;
mod registry;
mod resolver;

pub use error::SandboxError;
pub use manager::SandboxManager;
pub use protocol::ManagerClient;
pub use registry::{normalize_status, parse_list_output, parse_ports, ListRow, SandboxRegistry};
pub use resolver::{ContainerDirectory, DockerDirectory, ManagerResolver};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized lifecycle state of a sandbox container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Container is up.
    Running,
    /// Container exists but is not running.
    Stopped,
    /// The manager reported a status we do not recognise.
    Unknown,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Runtime details that do not identify the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMetadata {
    /// Full container name, `{prefix}-{id}`.
    pub container_name: String,
    /// Published ports.
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// A sandbox as seen in the live listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInstance {
    /// Public id, the container name without the prefix.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Type derived from the image name.
    #[serde(rename = "type")]
    pub sandbox_type: String,
    /// Normalized status.
    pub status: SandboxStatus,
    /// Image reference as listed.
    pub image: String,
    /// Creation time, when the manager reports one.
    pub created_at: Option<DateTime<Utc>>,
    /// Runtime details.
    pub metadata: SandboxMetadata,
}

impl SandboxInstance {
    /// Returns true if the sandbox is running.
    pub fn is_running(&self) -> bool {
        self.status == SandboxStatus::Running
    }
}

/// Outcome of a command executed inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Captured stdout.
    pub output: String,
    /// Captured stderr.
    pub error: String,
    /// Process exit code; 124 on timeout.
    pub exit_code: i32,
    /// Wall-clock seconds measured by the caller.
    pub execution_time: f64,
    /// True if the command hit its timeout.
    pub timed_out: bool,
}

/// Exit code reported for executions that hit their timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

impl ExecutionResult {
    /// Returns true if the command exited 0 within its timeout.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Converts an execution failure into a result.
    ///
    /// Timeouts and non-zero exits become results; every other error
    /// (missing sandbox, unreachable manager, ...) returns `None`.
    pub fn from_error(err: &SandboxError, execution_time: f64) -> Option<Self> {
        match err {
            SandboxError::Timeout {
                timeout_secs,
                stdout,
                stderr,
            } => {
                let error = if stderr.is_empty() {
                    format!("Execution timed out after {timeout_secs} seconds")
                } else {
                    stderr.clone()
                };
                Some(Self {
                    output: stdout.clone(),
                    error,
                    exit_code: TIMEOUT_EXIT_CODE,
                    execution_time,
                    timed_out: true,
                })
            }
            SandboxError::CommandFailed {
                exit_code,
                stdout,
                stderr,
                ..
            } => Some(Self {
                output: stdout.clone(),
                error: stderr.clone(),
                exit_code: *exit_code,
                execution_time,
                timed_out: false,
            }),
            _ => None,
        }
    }
}

/// Counts over a sandbox listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStats {
    /// Every listed sandbox.
    pub total: usize,
    /// Sandboxes with status running.
    pub running: usize,
    /// Sandboxes with status stopped.
    pub stopped: usize,
}

impl SandboxStats {
    /// Tallies a listing. Unknown statuses count toward the total only.
    pub fn from_instances(instances: &[SandboxInstance]) -> Self {
        let running = instances
            .iter()
            .filter(|s| s.status == SandboxStatus::Running)
            .count();
        let stopped = instances
            .iter()
            .filter(|s| s.status == SandboxStatus::Stopped)
            .count();
        Self {
            total: instances.len(),
            running,
            stopped,
        }
    }
}

/// Container name for sandbox `id`.
pub fn container_name(prefix: &str, id: &str) -> String {
    format!("{prefix}-{id}")
}

/// True if either name contains the other. Empty names never overlap.
pub(crate) fn names_overlap(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && (a.contains(b) || b.contains(a))
}
