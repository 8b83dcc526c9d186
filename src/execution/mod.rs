//! Running source code inside sandboxes.
//!
//! Code is staged as `code_<unique>.<ext>` in the working directory,
//! launched with the language's strategy, and timed out like any other
//! command. Timeouts and non-zero exits come back as results; only
//! infrastructure failures are errors.

mod environment;
mod files;
mod language;
mod packages;

pub use environment::SandboxEnvironment;
pub use language::{BareInterpreter, HandlerRegistry, LanguageErrorHandler};
pub use packages::InstallationResult;

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, LanguageConfig};
use crate::sandbox::{ExecutionResult, SandboxError, SandboxInstance, SandboxManager};

/// Timeout for file transfers and other housekeeping commands.
const FILE_TIMEOUT_SECS: u64 = 60;

/// Per-call overrides. Unset fields use the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Sandbox type for ephemeral runs.
    pub sandbox_type: Option<String>,
    /// Seconds before the run is stopped.
    pub timeout_secs: Option<u64>,
    /// Directory the code file is staged in.
    pub working_dir: Option<String>,
    /// User the code runs as.
    pub user: Option<String>,
    /// Files to read back after the run.
    pub output_files: Vec<String>,
    /// Destroy the ephemeral sandbox afterwards.
    pub auto_cleanup: Option<bool>,
}

/// Where and how the code ran.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeExecutionMetadata {
    /// Staged code file inside the sandbox.
    pub file_path: String,
    /// Directory the launch command ran in.
    pub working_dir: String,
    /// Interpreter from the language configuration.
    pub interpreter: String,
}

/// Outcome of running code, with any requested output files.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeExecutionResult {
    /// Output, exit code and timing of the launch command.
    #[serde(flatten)]
    pub result: ExecutionResult,
    /// Language id the code was run as.
    pub language: String,
    /// Sandbox the code ran in.
    pub sandbox_id: String,
    /// Path to content, for output files that could be read.
    pub files: BTreeMap<String, String>,
    /// Staging details.
    pub metadata: CodeExecutionMetadata,
}

/// Options for `create_persistent_sandbox`.
#[derive(Debug, Clone, Default)]
pub struct PersistentOptions {
    /// Sandbox id (generated if unset).
    pub name: Option<String>,
    /// Sandbox type (configured default if unset).
    pub sandbox_type: Option<String>,
    /// Directory created for later runs.
    pub working_dir: Option<String>,
}

/// A named sandbox prepared for repeated runs.
#[derive(Debug, Clone, Serialize)]
pub struct PersistentSandbox {
    /// The created sandbox.
    pub sandbox: SandboxInstance,
    /// Language the sandbox was prepared for.
    pub language: String,
    /// Directory created inside the sandbox.
    pub working_dir: String,
    /// Package install outcome, if packages were requested.
    pub installation: Option<InstallationResult>,
}

/// Executes code in sandboxes.
pub struct CodeExecutionService {
    manager: Arc<SandboxManager>,
    languages: BTreeMap<String, LanguageConfig>,
    handlers: HandlerRegistry,
    working_dir: String,
    default_user: String,
    default_timeout_secs: u64,
    auto_cleanup: bool,
    ephemeral_type: String,
    install_timeout_secs: u64,
    file_timeout_secs: u64,
}

fn unique_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

impl CodeExecutionService {
    /// Builds a service over `manager` with the configured languages.
    pub fn new(manager: Arc<SandboxManager>, config: &Config) -> Self {
        Self {
            manager,
            languages: config.languages.clone(),
            handlers: HandlerRegistry::new(),
            working_dir: config.execution.working_dir.clone(),
            default_user: config.sandbox.default_user.clone(),
            default_timeout_secs: config.sandbox.exec_timeout_secs,
            auto_cleanup: config.execution.auto_cleanup,
            ephemeral_type: config
                .execution
                .ephemeral_type
                .clone()
                .unwrap_or_else(|| config.sandbox.default_type.clone()),
            install_timeout_secs: config.execution.install_timeout_secs,
            file_timeout_secs: FILE_TIMEOUT_SECS,
        }
    }

    /// Uses `handlers` for launch commands.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// The sandbox manager runs go through.
    pub fn manager(&self) -> &SandboxManager {
        &self.manager
    }

    /// Configuration for `language`.
    pub fn language(&self, language: &str) -> Result<&LanguageConfig, SandboxError> {
        self.languages
            .get(language)
            .ok_or_else(|| SandboxError::unsupported_language(language, self.languages.keys()))
    }

    /// Runs code in a throwaway sandbox. The sandbox is destroyed afterwards
    /// unless auto cleanup is off, even when the run fails.
    pub async fn execute_ephemeral(
        &self,
        code: &str,
        language: &str,
        options: &ExecutionOptions,
    ) -> Result<CodeExecutionResult, SandboxError> {
        self.language(language)?;
        let sandbox_type = options.sandbox_type.as_deref().unwrap_or(&self.ephemeral_type);
        let name = format!("exec-{}", unique_suffix());

        let sandbox = self.manager.create(Some(sandbox_type), Some(&name), &[]).await?;
        info!(sandbox = %sandbox.id, language, "Created ephemeral sandbox");

        let result = self.execute_in_sandbox(&sandbox.id, code, language, options).await;

        if options.auto_cleanup.unwrap_or(self.auto_cleanup) {
            if let Err(e) = self.manager.destroy(&sandbox.id).await {
                warn!(sandbox = %sandbox.id, error = %e, "Failed to destroy ephemeral sandbox");
            }
        } else {
            info!(sandbox = %sandbox.id, "Keeping ephemeral sandbox");
        }

        result
    }

    /// Stages `code` in an existing sandbox and runs it.
    pub async fn execute_in_sandbox(
        &self,
        sandbox_id: &str,
        code: &str,
        language: &str,
        options: &ExecutionOptions,
    ) -> Result<CodeExecutionResult, SandboxError> {
        let config = self.language(language)?;
        let handler = self.handlers.get(language);

        let working_dir = options.working_dir.as_deref().unwrap_or(&self.working_dir);
        let file_path = format!(
            "{}/code_{}.{}",
            working_dir.trim_end_matches('/'),
            unique_suffix(),
            config.extension
        );
        let user = options.user.as_deref().unwrap_or(&self.default_user);
        let timeout = options.timeout_secs.unwrap_or(self.default_timeout_secs);

        let prepared = handler.prepare_code(code);
        let stage = format!(
            "{} && {}",
            files::mkdir_command(working_dir),
            files::write_command(&file_path, prepared.as_bytes())
        );
        debug!(sandbox_id, file = %file_path, "Staging code");
        self.manager
            .execute(sandbox_id, &stage, Some(user), Some(self.file_timeout_secs))
            .await?;

        let launch = format!(
            "cd {} && {}",
            shell_words::quote(working_dir),
            handler.build_execution_command(&config.interpreter, &file_path)
        );

        let started = Instant::now();
        let result = match self
            .manager
            .execute(sandbox_id, &launch, Some(user), Some(timeout))
            .await
        {
            Ok(result) => result,
            Err(e) => ExecutionResult::from_error(&e, started.elapsed().as_secs_f64()).ok_or(e)?,
        };
        if result.timed_out {
            warn!(sandbox_id, timeout_secs = timeout, "Code execution timed out");
        }

        let mut files = BTreeMap::new();
        for path in &options.output_files {
            match self.download_file(sandbox_id, path).await {
                Ok(content) => {
                    files.insert(path.clone(), String::from_utf8_lossy(&content).into_owned());
                }
                Err(e) => warn!(sandbox_id, path = %path, error = %e, "Could not retrieve output file"),
            }
        }

        Ok(CodeExecutionResult {
            result,
            language: language.to_string(),
            sandbox_id: sandbox_id.to_string(),
            files,
            metadata: CodeExecutionMetadata {
                file_path,
                working_dir: working_dir.to_string(),
                interpreter: config.interpreter.clone(),
            },
        })
    }

    /// Creates a named sandbox for `language`, installs `requirements`, and
    /// creates its working directory.
    pub async fn create_persistent_sandbox(
        &self,
        language: &str,
        requirements: &[String],
        options: &PersistentOptions,
    ) -> Result<PersistentSandbox, SandboxError> {
        self.language(language)?;
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{language}-{}", &unique_suffix()[..8]));
        let sandbox_type = options.sandbox_type.as_deref().unwrap_or(&self.ephemeral_type);

        let sandbox = self.manager.create(Some(sandbox_type), Some(&name), &[]).await?;
        info!(sandbox = %sandbox.id, language, "Created persistent sandbox");

        let installation = if requirements.is_empty() {
            None
        } else {
            Some(self.install_packages(&sandbox.id, language, requirements).await?)
        };

        let working_dir = options
            .working_dir
            .clone()
            .unwrap_or_else(|| self.working_dir.clone());
        self.manager
            .execute(
                &sandbox.id,
                &files::mkdir_command(&working_dir),
                Some(&self.default_user),
                Some(self.file_timeout_secs),
            )
            .await?;

        Ok(PersistentSandbox {
            sandbox,
            language: language.to_string(),
            working_dir,
            installation,
        })
    }
}
