//! Catalog of sandbox types available to `create`.
//!
//! Each type is a directory under the templates dir holding a `Dockerfile`.
//! A line `# Description: <text>` in the Dockerfile supplies the summary.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

const DESCRIPTOR_FILE: &str = "Dockerfile";
const DESCRIPTION_MARKER: &str = "# Description:";

/// One available sandbox type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxType {
    /// Directory name under the templates dir.
    pub name: String,
    /// Text after the `# Description:` marker, if any.
    pub description: Option<String>,
}

/// Lists sandbox types under `dir`, sorted by name. A missing directory is
/// an empty catalog.
pub fn load_catalog(dir: &Path) -> Result<Vec<SandboxType>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read templates dir: {}", dir.display()))?;

    let mut types = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", dir.display()))?;
        let descriptor = entry.path().join(DESCRIPTOR_FILE);
        if !descriptor.is_file() {
            continue;
        }

        let content = fs::read_to_string(&descriptor)
            .with_context(|| format!("Failed to read {}", descriptor.display()))?;

        types.push(SandboxType {
            name: entry.file_name().to_string_lossy().into_owned(),
            description: description(&content),
        });
    }

    types.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(types)
}

fn description(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.trim().strip_prefix(DESCRIPTION_MARKER))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
