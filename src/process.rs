//! Bounded-time subprocess execution.
//!
//! Spawns a command with stdin closed, drains stdout and stderr concurrently
//! so a chatty stream can never block a silent one, and escalates SIGTERM to
//! SIGKILL once the deadline passes. Output read before a timeout is kept.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Time a child gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Time the pipe readers get to finish once the child is gone. Grandchildren
/// that inherited the pipes can keep them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK_SIZE: usize = 8192;

/// Captured result of a process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Trimmed standard output.
    pub stdout: String,
    /// Trimmed standard error.
    pub stderr: String,
    /// Exit code, or -1 when the process was terminated by a signal.
    pub exit_code: i32,
}

impl ProcessOutput {
    /// Returns true if the process exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors that can occur while running a subprocess.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The program could not be started at all.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the process failed.
    #[error("I/O error while running '{program}': {source}")]
    Io {
        /// Program being waited on.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The process exceeded its deadline and was terminated.
    #[error("'{program}' timed out after {timeout_secs} seconds")]
    TimedOut {
        /// Program that was terminated.
        program: String,
        /// Deadline that was exceeded.
        timeout_secs: u64,
        /// Output collected before termination.
        stdout: String,
        /// Error output collected before termination.
        stderr: String,
    },
}

impl ProcessError {
    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Returns true if the program could not be spawned.
    pub fn is_spawn(&self) -> bool {
        matches!(self, Self::Spawn { .. })
    }
}

/// Runs external commands. The seam every layer above the OS process sits on.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, giving up after `timeout`.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, ProcessError>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace_period: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl ProcessRunner {
    /// Creates a runner with the default one second grace period.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides how long a child may take to honour SIGTERM.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, ProcessError> {
        debug!(program, ?args, timeout_secs = timeout.as_secs(), "Spawning process");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| spawn_reader(pipe, Arc::clone(&stdout_buf)));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| spawn_reader(pipe, Arc::clone(&stderr_buf)));

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            () = tokio::time::sleep(timeout) => None,
        };

        if waited.is_none() {
            warn!(program, timeout_secs = timeout.as_secs(), "Process timed out, terminating");
            terminate(&mut child, self.grace_period).await;
        }

        drain(stdout_task, "stdout").await;
        drain(stderr_task, "stderr").await;

        let stdout = collected_text(&stdout_buf);
        let stderr = collected_text(&stderr_buf);

        match waited {
            Some(Ok(status)) => {
                let exit_code = status.code().unwrap_or(-1);
                debug!(program, exit_code, "Process exited");
                Ok(ProcessOutput {
                    stdout,
                    stderr,
                    exit_code,
                })
            }
            Some(Err(source)) => Err(ProcessError::Io {
                program: program.to_string(),
                source,
            }),
            None => Err(ProcessError::TimedOut {
                program: program.to_string(),
                timeout_secs: timeout.as_secs(),
                stdout,
                stderr,
            }),
        }
    }
}

/// Copies everything from `pipe` into `sink` until EOF.
fn spawn_reader<R>(mut pipe: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<std::io::Result<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let n = pipe.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&chunk[..n]);
        }
    })
}

/// Waits for a reader task, abandoning it if its pipe never closes.
async fn drain(task: Option<JoinHandle<std::io::Result<()>>>, stream: &'static str) {
    let Some(mut task) = task else {
        return;
    };

    match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(stream, error = %e, "Error reading process output"),
        Ok(Err(e)) => warn!(stream, error = %e, "Output reader task failed"),
        Err(_) => {
            debug!(stream, "Pipe still open after exit, keeping partial output");
            task.abort();
        }
    }
}

fn collected_text(buf: &Mutex<Vec<u8>>) -> String {
    let bytes = buf.lock().unwrap_or_else(PoisonError::into_inner);
    String::from_utf8_lossy(&bytes).trim().to_string()
}

/// SIGTERM, wait out the grace period, SIGKILL.
async fn terminate(child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        send_sigterm(pid);

        if tokio::time::timeout(grace_period, child.wait()).await.is_ok() {
            return;
        }
        debug!(pid, "Process ignored SIGTERM, sending SIGKILL");
    }

    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill timed out process");
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}
