//! Package installation inside a sandbox.

use serde::Serialize;
use tracing::{info, warn};

use super::CodeExecutionService;
use crate::sandbox::{ExecutionResult, SandboxError};

/// Outcome of installing a batch of packages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstallationResult {
    /// True if every package installed.
    pub success: bool,
    /// Packages that installed, in request order.
    pub installed_packages: Vec<String>,
    /// Packages that did not.
    pub failed_packages: Vec<String>,
    /// Combined installer output.
    pub output: String,
    /// Installer errors, one block per failed package.
    pub error: String,
}

fn install_command(template: &str, package: &str) -> String {
    template.replace("{package}", &shell_words::quote(package))
}

impl CodeExecutionService {
    /// Installs `packages` one at a time with the language's installer.
    ///
    /// A failing package is recorded and the rest still install. Only a
    /// missing sandbox or an unknown language fail the whole call; both are
    /// checked before the first package.
    pub async fn install_packages(
        &self,
        sandbox_id: &str,
        language: &str,
        packages: &[String],
    ) -> Result<InstallationResult, SandboxError> {
        let config = self.language(language)?;
        let Some(template) = config.install_command.as_deref() else {
            return Err(SandboxError::invalid_argument(format!(
                "language '{language}' has no package installer"
            )));
        };

        if !self.manager.exists(sandbox_id).await? {
            return Err(SandboxError::not_found(sandbox_id));
        }

        let mut result = InstallationResult::default();
        for package in packages {
            let command = install_command(template, package);
            info!(sandbox_id, package = %package, "Installing package");

            let outcome = match self
                .manager
                .execute(sandbox_id, &command, Some(&self.default_user), Some(self.install_timeout_secs))
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => match ExecutionResult::from_error(&e, 0.0) {
                    Some(outcome) => outcome,
                    None => {
                        warn!(sandbox_id, package = %package, error = %e, "Package install errored");
                        result.error.push_str(&format!("{package}: {e}\n"));
                        result.failed_packages.push(package.clone());
                        continue;
                    }
                },
            };

            if !outcome.output.is_empty() {
                result.output.push_str(&outcome.output);
                result.output.push('\n');
            }
            if outcome.success() {
                result.installed_packages.push(package.clone());
            } else {
                warn!(sandbox_id, package = %package, exit_code = outcome.exit_code, "Package install failed");
                result.error.push_str(&format!("{package}: {}\n", outcome.error.trim()));
                result.failed_packages.push(package.clone());
            }
        }

        result.success = result.failed_packages.is_empty();
        Ok(result)
    }
}
