//! CLI command implementations.
//!
//! Each submodule implements a group of sandman commands. Rendering lives in
//! `format` as pure functions so it can be tested without a runtime.

pub mod code;
pub mod format;
pub mod lifecycle;
pub mod ops;
pub mod sandbox;

use anyhow::{Context as _, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use sandman::config::Config;
use sandman::execution::CodeExecutionService;
use sandman::operation::FileOperationStore;
use sandman::sandbox::SandboxManager;

/// Loads `path` if given, else the project or user configuration.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            Config::load(&cwd)
        }
    }
}

/// What every command needs: configuration and output mode.
pub struct Context {
    pub config: Config,
    pub json: bool,
}

impl Context {
    pub fn new(config: Config, json: bool) -> Self {
        Self { config, json }
    }

    pub fn manager(&self) -> Arc<SandboxManager> {
        Arc::new(SandboxManager::from_config(&self.config))
    }

    pub fn execution(&self) -> CodeExecutionService {
        CodeExecutionService::new(self.manager(), &self.config)
    }

    pub fn store(&self) -> Arc<FileOperationStore> {
        Arc::new(FileOperationStore::new(self.config.operations.dir.clone()))
    }

    /// Prints `value` as JSON in JSON mode, else the text from `text`.
    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
        } else {
            print!("{}", text());
        }
        Ok(())
    }
}
