//! What is installed inside a sandbox.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use super::CodeExecutionService;
use crate::sandbox::SandboxError;

const PROBE_TIMEOUT_SECS: u64 = 10;

/// System package managers probed alongside the language tools.
const SYSTEM_PACKAGE_MANAGERS: &[(&str, &str)] = &[
    ("pip", "pip3 --version"),
    ("npm", "npm --version"),
    ("apt", "apt-get --version"),
    ("apk", "apk --version"),
];

/// Versions of the languages and package managers found in a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SandboxEnvironment {
    /// Language id to version line.
    pub languages: BTreeMap<String, String>,
    /// Package manager to version line.
    pub package_managers: BTreeMap<String, String>,
    /// Distribution name, or kernel when no release file exists.
    pub os: Option<String>,
}

/// First non-empty line of stdout, else of stderr. Some interpreters print
/// their version on stderr.
fn first_line(stdout: &str, stderr: &str) -> Option<String> {
    [stdout, stderr].into_iter().find_map(|text| {
        text.lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    })
}

fn pretty_name(os_release: &str) -> Option<String> {
    os_release.lines().find_map(|line| {
        let value = line.strip_prefix("PRETTY_NAME=")?;
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

impl CodeExecutionService {
    /// Probes the sandbox for language versions, package managers and OS.
    /// Tools that are absent are left out of the report.
    pub async fn sandbox_environment(&self, sandbox_id: &str) -> Result<SandboxEnvironment, SandboxError> {
        if !self.manager.exists(sandbox_id).await? {
            return Err(SandboxError::not_found(sandbox_id));
        }

        let mut env = SandboxEnvironment::default();

        for (id, language) in &self.languages {
            if let Some(version) = self.probe(sandbox_id, &language.version_command()).await? {
                env.languages.insert(id.clone(), version);
            }
        }

        for (name, command) in SYSTEM_PACKAGE_MANAGERS {
            if let Some(version) = self.probe(sandbox_id, command).await? {
                env.package_managers.insert(name.to_string(), version);
            }
        }

        env.os = match self.probe_raw(sandbox_id, "cat /etc/os-release").await? {
            Some(release) if pretty_name(&release).is_some() => pretty_name(&release),
            _ => self.probe(sandbox_id, "uname -sr").await?,
        };

        Ok(env)
    }

    async fn probe(&self, sandbox_id: &str, command: &str) -> Result<Option<String>, SandboxError> {
        match self.run_probe(sandbox_id, command).await? {
            Some((stdout, stderr)) => Ok(first_line(&stdout, &stderr)),
            None => Ok(None),
        }
    }

    async fn probe_raw(&self, sandbox_id: &str, command: &str) -> Result<Option<String>, SandboxError> {
        Ok(self.run_probe(sandbox_id, command).await?.map(|(stdout, _)| stdout))
    }

    /// Output of a successful probe. A failing or slow probe means the tool
    /// is missing; anything else aborts the report.
    async fn run_probe(&self, sandbox_id: &str, command: &str) -> Result<Option<(String, String)>, SandboxError> {
        match self
            .manager
            .execute(sandbox_id, command, Some(&self.default_user), Some(PROBE_TIMEOUT_SECS))
            .await
        {
            Ok(result) => Ok(Some((result.output, result.error))),
            Err(e @ (SandboxError::CommandFailed { .. } | SandboxError::Timeout { .. })) => {
                debug!(sandbox_id, command, error = %e, "Probe failed");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
