//! Public orchestration API.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::ManagerClient;
use super::registry::SandboxRegistry;
use super::resolver::{ContainerDirectory, DockerDirectory};
use super::{
    container_name, names_overlap, ExecutionResult, SandboxError, SandboxInstance, SandboxMetadata,
    SandboxStats, SandboxStatus,
};
use crate::config::{Config, ProtectionConfig, SandboxConfig};
use crate::process::{CommandRunner, ProcessRunner};

/// Creates, drives and inspects sandboxes through the manager.
pub struct SandboxManager {
    client: Arc<ManagerClient>,
    registry: SandboxRegistry,
    sandbox: SandboxConfig,
    protection: ProtectionConfig,
    manager_pattern: String,
}

impl SandboxManager {
    /// Builds a manager that talks to the real container runtime.
    pub fn from_config(config: &Config) -> Self {
        Self::with_runner(config, Arc::new(ProcessRunner::new()), Arc::new(DockerDirectory))
    }

    /// Builds a manager on top of a custom command runner and container
    /// directory.
    pub fn with_runner(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
        directory: Arc<dyn ContainerDirectory>,
    ) -> Self {
        let client = Arc::new(ManagerClient::new(&config.manager, runner, directory));
        Self::with_client(config, client)
    }

    pub(crate) fn with_client(config: &Config, client: Arc<ManagerClient>) -> Self {
        let registry = SandboxRegistry::new(
            Arc::clone(&client),
            &config.sandbox.prefix,
            &config.manager.name_pattern,
        );
        Self {
            client,
            registry,
            sandbox: config.sandbox.clone(),
            protection: config.protection.clone(),
            manager_pattern: config.manager.name_pattern.clone(),
        }
    }

    /// Sandbox defaults in effect.
    pub fn settings(&self) -> &SandboxConfig {
        &self.sandbox
    }

    /// Container name for a sandbox id.
    pub fn container_name(&self, id: &str) -> String {
        container_name(&self.sandbox.prefix, id)
    }

    // ---- Lifecycle ----

    /// Creates a sandbox. Type defaults to the configured default, name to
    /// `auto-<random>`.
    pub async fn create(
        &self,
        sandbox_type: Option<&str>,
        name: Option<&str>,
        ports: &[u16],
    ) -> Result<SandboxInstance, SandboxError> {
        let sandbox_type = sandbox_type.unwrap_or(&self.sandbox.default_type);
        let id = match name {
            Some(name) => {
                validate_id(name)?;
                name.to_string()
            }
            None => generated_id(),
        };

        info!(id = %id, sandbox_type, "Creating sandbox");
        self.client
            .create(sandbox_type, &id, ports)
            .await
            .map_err(|e| match e {
                SandboxError::Orchestration { stderr, .. } => SandboxError::creation(stderr),
                other => other,
            })?;

        let container = self.container_name(&id);
        Ok(SandboxInstance {
            name: container.clone(),
            sandbox_type: sandbox_type.to_string(),
            status: SandboxStatus::Running,
            image: String::new(),
            created_at: Some(chrono::Utc::now()),
            metadata: SandboxMetadata {
                container_name: container,
                ports: ports.to_vec(),
            },
            id,
        })
    }

    /// Starts a stopped sandbox.
    pub async fn start(&self, id: &str) -> Result<(), SandboxError> {
        validate_id(id)?;
        info!(id, "Starting sandbox");
        self.client.start(id).await
    }

    /// Stops a sandbox. Refuses protected containers before contacting the
    /// manager.
    pub async fn stop(&self, id: &str, timeout_secs: Option<u64>) -> Result<(), SandboxError> {
        validate_id(id)?;
        self.ensure_not_protected("stop", id).await?;
        let timeout = timeout_secs.unwrap_or(self.sandbox.stop_timeout_secs);
        info!(id, timeout_secs = timeout, "Stopping sandbox");
        self.client.stop(id, Some(timeout)).await
    }

    /// Recreates a sandbox from a (possibly different) type.
    pub async fn reset_to(&self, id: &str, sandbox_type: Option<&str>) -> Result<SandboxInstance, SandboxError> {
        validate_id(id)?;
        let sandbox_type = sandbox_type.unwrap_or(&self.sandbox.default_type);
        info!(id, sandbox_type, "Resetting sandbox");
        self.client.reset(id, sandbox_type).await?;

        let container = self.container_name(id);
        Ok(SandboxInstance {
            id: id.to_string(),
            name: container.clone(),
            sandbox_type: sandbox_type.to_string(),
            status: SandboxStatus::Running,
            image: String::new(),
            created_at: Some(chrono::Utc::now()),
            metadata: SandboxMetadata {
                container_name: container,
                ports: Vec::new(),
            },
        })
    }

    /// Destroys a sandbox. Refuses protected containers before contacting
    /// the manager.
    pub async fn destroy(&self, id: &str) -> Result<bool, SandboxError> {
        validate_id(id)?;
        self.ensure_not_protected("destroy", id).await?;
        info!(id, "Destroying sandbox");
        self.client.destroy(id).await?;
        Ok(true)
    }

    /// Runs a shell command inside a sandbox.
    ///
    /// Exit 124 surfaces as `Timeout`, other non-zero exits as
    /// `CommandFailed`; see `ExecutionResult::from_error`.
    pub async fn execute(
        &self,
        id: &str,
        command: &str,
        user: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> Result<ExecutionResult, SandboxError> {
        if !self.exists(id).await? {
            return Err(SandboxError::not_found(id));
        }

        let user = user.unwrap_or(&self.sandbox.default_user);
        let timeout = timeout_secs.unwrap_or(self.sandbox.exec_timeout_secs);

        let started = Instant::now();
        let output = self.client.exec(id, command, user, timeout).await?;
        let execution_time = started.elapsed().as_secs_f64();
        debug!(id, exit_code = output.exit_code, execution_time, "Command finished");

        Ok(ExecutionResult {
            output: output.stdout,
            error: output.stderr,
            exit_code: output.exit_code,
            execution_time,
            timed_out: false,
        })
    }

    /// Removes every sandbox the manager knows about. Returns the number it
    /// reports removing.
    pub async fn cleanup_all(&self) -> Result<usize, SandboxError> {
        info!("Cleaning up all sandboxes");
        let output = self.client.cleanup().await?;
        Ok(cleanup_count(&output))
    }

    // ---- Queries ----

    /// Lists sandboxes.
    pub async fn list_all(&self, include_stopped: bool) -> Result<Vec<SandboxInstance>, SandboxError> {
        self.registry.list(include_stopped).await
    }

    /// Looks up one sandbox.
    pub async fn get_sandbox(&self, id: &str) -> Result<Option<SandboxInstance>, SandboxError> {
        self.registry.get(id).await
    }

    /// Returns true if the sandbox is listed (running or stopped).
    pub async fn exists(&self, id: &str) -> Result<bool, SandboxError> {
        Ok(self.get_sandbox(id).await?.is_some())
    }

    /// Container the orchestrator itself runs in, if the manager can tell.
    pub async fn current_container(&self) -> Option<String> {
        self.client.current().await
    }

    /// Counts over `list`, or over a fresh full listing.
    pub async fn stats(&self, list: Option<&[SandboxInstance]>) -> Result<SandboxStats, SandboxError> {
        match list {
            Some(list) => Ok(SandboxStats::from_instances(list)),
            None => Ok(SandboxStats::from_instances(&self.list_all(true).await?)),
        }
    }

    // ---- Protection ----

    async fn ensure_not_protected(&self, action: &str, id: &str) -> Result<(), SandboxError> {
        let target = self.container_name(id);

        if !self.manager_pattern.is_empty() && target.contains(&self.manager_pattern) {
            return Err(SandboxError::protected(action, target));
        }

        match self.current_container().await {
            Some(current) if names_overlap(&target, &current) => {
                Err(SandboxError::protected(action, target))
            }
            Some(current) if !self.manager_pattern.is_empty() && current.contains(&self.manager_pattern) => {
                warn!(current = %current, target = %target, action, "Running inside the manager container, refusing");
                Err(SandboxError::protected(action, target))
            }
            Some(_) => Ok(()),
            None if self.protection.fail_closed => {
                warn!(target = %target, action, "Current container unknown, refusing");
                Err(SandboxError::protected(action, target))
            }
            None => {
                warn!(target = %target, action, "Current container unknown, proceeding unprotected");
                Ok(())
            }
        }
    }
}

fn generated_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("auto-{}", &suffix[..8])
}

/// Sandbox ids become container names; keep them to what runtimes accept.
fn validate_id(id: &str) -> Result<(), SandboxError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.starts_with(['-', '.']);
    if valid {
        Ok(())
    } else {
        Err(SandboxError::invalid_argument(format!("invalid sandbox id '{id}'")))
    }
}

/// First integer in the cleanup output, else the number of non-empty lines.
fn cleanup_count(output: &str) -> usize {
    output
        .split(|c: char| !c.is_ascii_digit())
        .find(|token| !token.is_empty())
        .and_then(|token| token.parse().ok())
        .unwrap_or_else(|| output.lines().filter(|l| !l.trim().is_empty()).count())
}
