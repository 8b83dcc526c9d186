//! Client for the manager's command-line protocol.
//!
//! Each call runs `<runtime> exec <manager> <script> <subcommand> [args...]`.
//! Arguments are passed as separate argv entries, never through a shell on
//! the host side, so a raw command for `exec` travels as one argument.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::resolver::{ContainerDirectory, ManagerResolver};
use super::{SandboxError, TIMEOUT_EXIT_CODE};
use crate::config::ManagerConfig;
use crate::process::{CommandRunner, ProcessOutput};

/// Extra wall-clock time given to the runtime on top of an exec or stop
/// timeout, so the manager reports the timeout rather than being killed.
const TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Bounded time for the `current` probe.
const CURRENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Speaks the manager protocol.
pub struct ManagerClient {
    runner: Arc<dyn CommandRunner>,
    resolver: ManagerResolver,
    runtime: String,
    script: String,
    command_timeout: Duration,
}

impl ManagerClient {
    /// Builds a client that resolves the manager through `directory`.
    pub fn new(
        config: &ManagerConfig,
        runner: Arc<dyn CommandRunner>,
        directory: Arc<dyn ContainerDirectory>,
    ) -> Self {
        Self {
            runner,
            resolver: ManagerResolver::new(config, directory),
            runtime: config.runtime.clone(),
            script: config.script.clone(),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    /// Resolves the manager container name.
    pub async fn manager_name(&self) -> String {
        self.resolver.resolve().await
    }

    // ---- Subcommands ----

    /// `create <type> <name> [ports]`
    pub async fn create(&self, sandbox_type: &str, name: &str, ports: &[u16]) -> Result<(), SandboxError> {
        let mut args = vec![sandbox_type.to_string(), name.to_string()];
        if !ports.is_empty() {
            let joined: Vec<String> = ports.iter().map(u16::to_string).collect();
            args.push(joined.join(","));
        }
        self.checked("create", args, self.command_timeout).await?;
        Ok(())
    }

    /// `start <id>`
    pub async fn start(&self, id: &str) -> Result<(), SandboxError> {
        self.checked("start", vec![id.to_string()], self.command_timeout)
            .await?;
        Ok(())
    }

    /// `stop <id> [timeout]`
    pub async fn stop(&self, id: &str, timeout_secs: Option<u64>) -> Result<(), SandboxError> {
        let mut args = vec![id.to_string()];
        let mut wall = self.command_timeout;
        if let Some(secs) = timeout_secs {
            args.push(secs.to_string());
            wall = wall.saturating_add(Duration::from_secs(secs));
        }
        self.checked("stop", args, wall).await?;
        Ok(())
    }

    /// `reset <id> <type>`
    pub async fn reset(&self, id: &str, sandbox_type: &str) -> Result<(), SandboxError> {
        self.checked(
            "reset",
            vec![id.to_string(), sandbox_type.to_string()],
            self.command_timeout,
        )
        .await?;
        Ok(())
    }

    /// `destroy <id>`
    pub async fn destroy(&self, id: &str) -> Result<(), SandboxError> {
        self.checked("destroy", vec![id.to_string()], self.command_timeout)
            .await?;
        Ok(())
    }

    /// `exec <id> <command> <user> <timeout>`
    ///
    /// Exit 124 becomes `Timeout`, any other non-zero exit `CommandFailed`.
    pub async fn exec(
        &self,
        id: &str,
        command: &str,
        user: &str,
        timeout_secs: u64,
    ) -> Result<ProcessOutput, SandboxError> {
        let args = vec![
            id.to_string(),
            command.to_string(),
            user.to_string(),
            timeout_secs.to_string(),
        ];
        let wall = Duration::from_secs(timeout_secs).saturating_add(TIMEOUT_MARGIN);

        let output = match self.invoke("exec", &args, wall).await {
            Ok(output) => output,
            Err(SandboxError::Timeout { stdout, stderr, .. }) => {
                return Err(SandboxError::Timeout {
                    timeout_secs,
                    stdout,
                    stderr,
                })
            }
            Err(e) => return Err(e),
        };

        match output.exit_code {
            0 => Ok(output),
            TIMEOUT_EXIT_CODE => Err(SandboxError::Timeout {
                timeout_secs,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            exit_code => Err(SandboxError::CommandFailed {
                sandbox_id: id.to_string(),
                exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
        }
    }

    /// `list [all]`, returning the raw listing.
    pub async fn list(&self, all: bool) -> Result<String, SandboxError> {
        let args = if all { vec!["all".to_string()] } else { Vec::new() };
        Ok(self.checked("list", args, self.command_timeout).await?.stdout)
    }

    /// `cleanup`. Best effort: a non-zero exit is logged and its output
    /// returned anyway.
    pub async fn cleanup(&self) -> Result<String, SandboxError> {
        let output = self.invoke("cleanup", &[], self.command_timeout).await?;
        if !output.success() {
            warn!(
                exit_code = output.exit_code,
                stderr = %output.stderr,
                "Manager cleanup reported errors"
            );
        }
        Ok(output.stdout)
    }

    /// `current`: the container this process runs in, if the manager can
    /// tell. Every failure maps to `None`.
    pub async fn current(&self) -> Option<String> {
        match self.invoke("current", &[], CURRENT_TIMEOUT).await {
            Ok(output) if output.success() => {
                let name = output.stdout.lines().next().unwrap_or("").trim();
                (!name.is_empty()).then(|| name.to_string())
            }
            Ok(output) => {
                debug!(exit_code = output.exit_code, "Current container unknown");
                None
            }
            Err(e) => {
                debug!(error = %e, "Current container probe failed");
                None
            }
        }
    }

    // ---- Internals ----

    async fn checked(
        &self,
        subcommand: &str,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<ProcessOutput, SandboxError> {
        let output = self.invoke(subcommand, &args, timeout).await?;
        if output.success() {
            Ok(output)
        } else {
            let message = if output.stderr.is_empty() {
                output.stdout
            } else {
                output.stderr
            };
            Err(SandboxError::orchestration(subcommand, output.exit_code, message))
        }
    }

    /// Runs a subcommand, re-resolving the manager once if the runtime says
    /// the cached container is gone.
    async fn invoke(
        &self,
        subcommand: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, SandboxError> {
        let manager = self.resolver.resolve().await;
        let output = self.run_in(&manager, subcommand, args, timeout).await?;

        if output.success() || !manager_missing(&output.stderr, &manager) {
            return Ok(output);
        }

        self.resolver.invalidate();
        let refreshed = self.resolver.resolve().await;
        if refreshed == manager {
            return Ok(output);
        }

        warn!(stale = %manager, current = %refreshed, "Manager container moved, retrying");
        self.run_in(&refreshed, subcommand, args, timeout).await
    }

    async fn run_in(
        &self,
        manager: &str,
        subcommand: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, SandboxError> {
        let argv = self.argv(manager, subcommand, args);
        debug!(runtime = %self.runtime, ?argv, "Invoking manager");
        Ok(self.runner.run(&self.runtime, &argv, timeout).await?)
    }

    fn argv(&self, manager: &str, subcommand: &str, args: &[String]) -> Vec<String> {
        let mut argv = vec![
            "exec".to_string(),
            manager.to_string(),
            self.script.clone(),
            subcommand.to_string(),
        ];
        argv.extend(args.iter().cloned());
        argv
    }
}

/// True if the runtime's error says the manager container itself is gone.
fn manager_missing(stderr: &str, manager: &str) -> bool {
    stderr.contains(&format!("No such container: {manager}"))
        || (stderr.contains("is not running") && stderr.contains(manager))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::{manager_client, FakeManager, StaticDirectory};

    #[tokio::test]
    async fn test_argv_layout() {
        let fake = FakeManager::new();
        let config = Config::for_tests();
        let client = manager_client(&config, &fake);

        client.create("python", "demo", &[8080, 3000]).await.unwrap();

        let calls = fake.raw_calls();
        assert_eq!(
            calls[0],
            vec![
                "docker",
                "exec",
                "sandbox-manager",
                "/usr/local/bin/sandbox-manager",
                "create",
                "python",
                "demo",
                "8080,3000"
            ]
        );
    }

    #[tokio::test]
    async fn test_exec_passes_command_as_single_argument() {
        let fake = FakeManager::new();
        fake.add_container("sandbox-demo", "running", "img", "");
        let client = manager_client(&Config::for_tests(), &fake);

        let output = client
            .exec("demo", "echo hi; echo $HOME", "sandbox-user", 10)
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
        let call = fake.calls().pop().unwrap();
        assert_eq!(call, vec!["exec", "demo", "echo hi; echo $HOME", "sandbox-user", "10"]);
    }

    #[tokio::test]
    async fn test_huge_timeouts_do_not_overflow() {
        let fake = FakeManager::new();
        fake.add_container("sandbox-demo", "running", "img", "");
        let client = manager_client(&Config::for_tests(), &fake);

        client.exec("demo", "true", "sandbox-user", u64::MAX).await.unwrap();
        client.stop("demo", Some(u64::MAX)).await.unwrap();

        let calls = fake.calls();
        assert_eq!(calls[0][4], u64::MAX.to_string());
        assert_eq!(calls[1], vec!["stop".to_string(), "demo".to_string(), u64::MAX.to_string()]);
    }

    #[tokio::test]
    async fn test_exec_124_is_timeout() {
        let fake = FakeManager::new();
        fake.add_container("sandbox-demo", "running", "img", "");
        fake.script_exec("sleep", "", "", 124);
        let client = manager_client(&Config::for_tests(), &fake);

        let err = client.exec("demo", "sleep 100", "sandbox-user", 7).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("7 seconds"));
    }

    #[tokio::test]
    async fn test_exec_nonzero_is_command_failure() {
        let fake = FakeManager::new();
        fake.add_container("sandbox-demo", "running", "img", "");
        fake.script_exec("false", "", "nope", 1);
        let client = manager_client(&Config::for_tests(), &fake);

        let err = client.exec("demo", "false", "sandbox-user", 10).await.unwrap_err();
        match err {
            SandboxError::CommandFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "nope");
            }
            other => panic!("expected command failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_subcommand_is_orchestration_error() {
        let fake = FakeManager::new();
        let client = manager_client(&Config::for_tests(), &fake);

        let err = client.start("ghost").await.unwrap_err();
        assert!(err.is_orchestration());
        assert!(err.to_string().contains("start"));
    }

    #[tokio::test]
    async fn test_cleanup_succeeds_despite_nonzero_exit() {
        let fake = FakeManager::new();
        fake.fail_subcommand("cleanup", "partial failure");
        let client = manager_client(&Config::for_tests(), &fake);

        assert!(client.cleanup().await.is_ok());
    }

    #[tokio::test]
    async fn test_current_maps_failure_to_none() {
        let fake = FakeManager::new();
        let client = manager_client(&Config::for_tests(), &fake);
        assert_eq!(client.current().await, None);

        fake.set_current(Some("sandbox-self"));
        assert_eq!(client.current().await.as_deref(), Some("sandbox-self"));
    }

    #[tokio::test]
    async fn test_retries_once_when_manager_moves() {
        let fake = FakeManager::new();
        fake.set_manager_name("sandbox-manager-2");
        let directory = StaticDirectory::new(Some("sandbox-manager-1"));
        let mut config = Config::for_tests();
        config.manager.container = None;
        let client = ManagerClient::new(&config.manager, fake.clone(), directory.clone());

        // First detection caches the stale name.
        client.manager_name().await;
        directory.set(Some("sandbox-manager-2"));

        let listing = client.list(true).await.unwrap();
        assert!(listing.is_empty());

        let managers: Vec<String> = fake.raw_calls().iter().map(|c| c[2].clone()).collect();
        assert_eq!(managers, vec!["sandbox-manager-1", "sandbox-manager-2"]);
    }

    #[test]
    fn test_manager_missing() {
        assert!(manager_missing(
            "Error response from daemon: No such container: sandbox-manager",
            "sandbox-manager"
        ));
        assert!(manager_missing(
            "Error response from daemon: container sandbox-manager is not running",
            "sandbox-manager"
        ));
        assert!(!manager_missing("sandbox demo is not running", "sandbox-manager"));
    }
}
