//! Locating the manager container.
//!
//! An explicitly configured container name always wins. Otherwise the
//! container runtime is asked for running containers whose name contains the
//! manager pattern, the first match is cached, and the configured default
//! name is used when detection finds nothing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::Docker;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;

/// Source of running container names.
#[async_trait]
pub trait ContainerDirectory: Send + Sync {
    /// Returns the first running container whose name contains `pattern`.
    async fn find_running(&self, pattern: &str) -> Result<Option<String>>;
}

/// Queries the local Docker daemon.
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerDirectory;

#[async_trait]
impl ContainerDirectory for DockerDirectory {
    async fn find_running(&self, pattern: &str) -> Result<Option<String>> {
        let docker = Docker::connect_with_local_defaults().context("Failed to connect to Docker")?;

        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![pattern.to_string()]);
        let options = ListContainersOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };

        let containers = docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        Ok(containers
            .into_iter()
            .flat_map(|c| c.names.unwrap_or_default())
            .map(|name| name.trim_start_matches('/').to_string())
            .find(|name| name.contains(pattern)))
    }
}

/// Memoized manager-name lookup with explicit invalidation.
pub struct ManagerResolver {
    configured: Option<String>,
    pattern: String,
    fallback: String,
    directory: Arc<dyn ContainerDirectory>,
    cached: RwLock<Option<String>>,
}

impl ManagerResolver {
    /// Resolver for `config`, detecting through `directory`.
    pub fn new(config: &ManagerConfig, directory: Arc<dyn ContainerDirectory>) -> Self {
        Self {
            configured: config.container.clone().filter(|name| !name.trim().is_empty()),
            pattern: config.name_pattern.clone(),
            fallback: config.default_container.clone(),
            directory,
            cached: RwLock::new(None),
        }
    }

    /// Returns the manager container name.
    pub async fn resolve(&self) -> String {
        if let Some(name) = &self.configured {
            return name.clone();
        }
        if let Some(name) = self.cached() {
            return name;
        }

        match self.directory.find_running(&self.pattern).await {
            Ok(Some(name)) => {
                info!(container = %name, "Detected manager container");
                *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(name.clone());
                name
            }
            Ok(None) => {
                warn!(
                    pattern = %self.pattern,
                    fallback = %self.fallback,
                    "No running manager container found, using default name"
                );
                self.fallback.clone()
            }
            Err(e) => {
                warn!(
                    error = %format!("{e:#}"),
                    fallback = %self.fallback,
                    "Manager detection failed, using default name"
                );
                self.fallback.clone()
            }
        }
    }

    /// Forgets the detected name so the next `resolve` detects again.
    /// A configured name is never forgotten.
    pub fn invalidate(&self) {
        let previous = self
            .cached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(name) = previous {
            debug!(container = %name, "Invalidated cached manager name");
        }
    }

    fn cached(&self) -> Option<String> {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
