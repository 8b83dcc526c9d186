//! Read path: turns the manager's `list` output into sandbox instances.
//!
//! The manager speaks two listing dialects. The current one prints four
//! columns (`name status image ports`) with a single-word runtime state; the
//! legacy one prints three (`name status image`) where the status is the
//! human form from `docker ps` and may contain spaces. Rows are parsed with
//! the richer pattern first and fall back to the legacy one.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::protocol::ManagerClient;
use super::{names_overlap, SandboxError, SandboxInstance, SandboxMetadata, SandboxStatus};

/// Runtime states that appear verbatim in the four-column dialect.
const RUNTIME_STATES: &[&str] = &[
    "running",
    "restarting",
    "stopped",
    "exited",
    "created",
    "paused",
    "dead",
    "removing",
];

/// One parsed row of `list` output, before filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRow {
    /// Container name.
    pub name: String,
    /// Raw status, possibly several words.
    pub status: String,
    /// Image reference.
    pub image: String,
    /// Raw port column; empty for the legacy dialect.
    pub ports: String,
}

/// Parses raw `list` output. Blank lines, headers and rows that match
/// neither dialect are skipped.
pub fn parse_list_output(output: &str) -> Vec<ListRow> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let row = parse_row(line);
            if row.is_none() {
                warn!(line, "Skipping unparseable list row");
            }
            row
        })
        .collect()
}

fn parse_row(line: &str) -> Option<ListRow> {
    let first = line.split_whitespace().next()?;
    if first.eq_ignore_ascii_case("name") || first.eq_ignore_ascii_case("names") {
        return None;
    }

    if line.contains('\t') {
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        if let [name, status, image, rest @ ..] = fields.as_slice() {
            if !name.is_empty() && !image.is_empty() {
                return Some(ListRow {
                    name: (*name).to_string(),
                    status: (*status).to_string(),
                    image: (*image).to_string(),
                    ports: rest.first().map(|p| (*p).to_string()).unwrap_or_default(),
                });
            }
        }
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 3 {
        return None;
    }

    let is_state = RUNTIME_STATES.contains(&tokens[1].to_ascii_lowercase().as_str());
    match tokens.as_slice() {
        [name, status, image, ports] if is_state && looks_like_ports(ports) => Some(ListRow {
            name: (*name).to_string(),
            status: (*status).to_string(),
            image: (*image).to_string(),
            ports: (*ports).to_string(),
        }),
        [name, status, image] if is_state => Some(ListRow {
            name: (*name).to_string(),
            status: (*status).to_string(),
            image: (*image).to_string(),
            ports: String::new(),
        }),
        [name, status @ .., image] => Some(ListRow {
            name: (*name).to_string(),
            status: status.join(" "),
            image: (*image).to_string(),
            ports: String::new(),
        }),
        _ => None,
    }
}

fn looks_like_ports(token: &str) -> bool {
    token.eq_ignore_ascii_case("none")
        || (!token.is_empty() && token.chars().all(|c| c.is_ascii_digit() || c == ','))
}

/// Maps a raw status string from either dialect onto `SandboxStatus`.
pub fn normalize_status(raw: &str) -> SandboxStatus {
    let lower = raw.trim().to_ascii_lowercase();
    let word = lower.split_whitespace().next().unwrap_or("");

    match word {
        "running" | "restarting" | "up" => SandboxStatus::Running,
        "stopped" | "exited" | "created" | "paused" => SandboxStatus::Stopped,
        _ => {
            warn!(status = raw, "Unrecognised sandbox status");
            SandboxStatus::Unknown
        }
    }
}

/// Parses a comma-separated port list. Tokens that are not ports are dropped.
pub fn parse_ports(raw: &str) -> Vec<u16> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
        return Vec::new();
    }

    raw.split(',')
        .filter_map(|token| token.trim().parse::<u16>().ok())
        .filter(|port| *port > 0)
        .collect()
}

/// Sandbox type from an image reference: repository basename, tag and
/// digest stripped, sandbox prefix removed.
fn image_type(image: &str, prefix: &str) -> String {
    let repo = image.rsplit('/').next().unwrap_or(image);
    let repo = repo.split([':', '@']).next().unwrap_or(repo);
    repo.strip_prefix(&format!("{prefix}-"))
        .unwrap_or(repo)
        .to_string()
}

/// Lists and looks up sandboxes, hiding protected containers.
pub struct SandboxRegistry {
    client: Arc<ManagerClient>,
    prefix: String,
    manager_pattern: String,
}

impl SandboxRegistry {
    /// Registry for containers named `<prefix>-<id>`, hiding any whose name
    /// contains `manager_pattern`.
    pub fn new(client: Arc<ManagerClient>, prefix: impl Into<String>, manager_pattern: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            manager_pattern: manager_pattern.into(),
        }
    }

    /// Returns the sandbox id for a container name, or `None` if the
    /// container is not a listable sandbox.
    pub fn sandbox_id(&self, name: &str, current: Option<&str>) -> Option<String> {
        if !self.manager_pattern.is_empty() && name.contains(&self.manager_pattern) {
            return None;
        }
        if current.is_some_and(|current| names_overlap(name, current)) {
            return None;
        }
        name.strip_prefix(&format!("{}-", self.prefix))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    fn instance(&self, row: ListRow, id: String) -> SandboxInstance {
        SandboxInstance {
            id,
            sandbox_type: image_type(&row.image, &self.prefix),
            status: normalize_status(&row.status),
            image: row.image,
            created_at: None,
            metadata: SandboxMetadata {
                container_name: row.name.clone(),
                ports: parse_ports(&row.ports),
            },
            name: row.name,
        }
    }

    /// Lists sandboxes, optionally including stopped ones.
    pub async fn list(&self, include_stopped: bool) -> Result<Vec<SandboxInstance>, SandboxError> {
        let raw = self.client.list(include_stopped).await?;
        let current = self.client.current().await;
        let mut seen = HashSet::new();

        let instances: Vec<SandboxInstance> = parse_list_output(&raw)
            .into_iter()
            .filter_map(|row| {
                let id = self.sandbox_id(&row.name, current.as_deref())?;
                if !seen.insert(id.clone()) {
                    warn!(id, "Duplicate sandbox id in listing");
                    return None;
                }
                Some(self.instance(row, id))
            })
            .filter(|instance| include_stopped || instance.status != SandboxStatus::Stopped)
            .collect();

        debug!(count = instances.len(), include_stopped, "Listed sandboxes");
        Ok(instances)
    }

    /// Finds one sandbox by id in a fresh full listing.
    pub async fn get(&self, id: &str) -> Result<Option<SandboxInstance>, SandboxError> {
        Ok(self.list(true).await?.into_iter().find(|s| s.id == id))
    }
}
