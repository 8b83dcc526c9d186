//! `sandman.toml` loading and defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "sandman.toml";
const APP_DIR: &str = "sandman";

/// Top-level configuration, one field per `sandman.toml` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// How to reach the manager container
    #[serde(default)]
    pub manager: ManagerConfig,
    /// Sandbox naming and command defaults
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Protected-container policy
    #[serde(default)]
    pub protection: ProtectionConfig,
    /// Code execution defaults
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Per-language settings. Entries here are merged over the built-in set.
    #[serde(default = "default_languages", deserialize_with = "merge_languages")]
    pub languages: BTreeMap<String, LanguageConfig>,
    /// Operation record storage
    #[serde(default)]
    pub operations: OperationsConfig,
    /// Webhooks for finished operations
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manager: ManagerConfig::default(),
            sandbox: SandboxConfig::default(),
            protection: ProtectionConfig::default(),
            execution: ExecutionConfig::default(),
            languages: default_languages(),
            operations: OperationsConfig::default(),
            notifications: NotificationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// How to reach the manager container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Container runtime CLI used to exec into the manager
    /// - Default: "docker"
    /// - Alternatives: "podman", "/usr/local/bin/docker"
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Manager container name. Skips auto-detection when set.
    #[serde(default)]
    pub container: Option<String>,

    /// Substring identifying the manager container during auto-detection
    #[serde(default = "default_manager_pattern")]
    pub name_pattern: String,

    /// Name used when auto-detection finds nothing
    #[serde(default = "default_manager_pattern")]
    pub default_container: String,

    /// Path of the manager script inside the manager container
    #[serde(default = "default_script")]
    pub script: String,

    /// Wall-clock limit for non-exec subcommands
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            container: None,
            name_pattern: default_manager_pattern(),
            default_container: default_manager_pattern(),
            script: default_script(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

/// `[sandbox]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container name prefix; sandbox `demo` lives in `<prefix>-demo`
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Type used when `create`/`reset` get none
    #[serde(default = "default_sandbox_type")]
    pub default_type: String,

    /// User commands run as inside the sandbox
    #[serde(default = "default_user")]
    pub default_user: String,

    /// Default timeout for `exec`
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,

    /// Grace period passed to `stop`
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Directory of sandbox type templates
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            default_type: default_sandbox_type(),
            default_user: default_user(),
            exec_timeout_secs: default_exec_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            templates_dir: default_templates_dir(),
        }
    }
}

/// `[protection]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Refuse stop/destroy when the current container cannot be determined
    #[serde(default)]
    pub fail_closed: bool,
}

/// `[execution]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Directory code files are staged in
    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    /// Destroy ephemeral sandboxes after each run
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,

    /// Sandbox type for ephemeral runs (falls back to `sandbox.default_type`)
    #[serde(default)]
    pub ephemeral_type: Option<String>,

    /// Timeout for each package install
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            auto_cleanup: true,
            ephemeral_type: None,
            install_timeout_secs: default_install_timeout(),
        }
    }
}

/// One `[languages.<id>]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// Interpreter binary inside the sandbox
    pub interpreter: String,

    /// File extension for staged code, without the dot
    pub extension: String,

    /// Prints the language version (default: `<interpreter> --version`)
    #[serde(default)]
    pub version_command: Option<String>,

    /// Installs one package; `{package}` is replaced by the quoted name
    #[serde(default)]
    pub install_command: Option<String>,

    /// Package manager shown in environment reports
    #[serde(default)]
    pub package_manager: Option<String>,
}

impl LanguageConfig {
    fn new(interpreter: &str, extension: &str, install: Option<&str>, package_manager: Option<&str>) -> Self {
        Self {
            interpreter: interpreter.to_string(),
            extension: extension.to_string(),
            version_command: None,
            install_command: install.map(str::to_string),
            package_manager: package_manager.map(str::to_string),
        }
    }

    /// Command printing the language version.
    pub fn version_command(&self) -> String {
        self.version_command
            .clone()
            .unwrap_or_else(|| format!("{} --version", self.interpreter))
    }
}

/// `[operations]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsConfig {
    /// Where operation records are persisted
    #[serde(default = "default_operations_dir")]
    pub dir: PathBuf,

    /// Per-sandbox stop timeout during cleanup
    #[serde(default = "default_cleanup_stop_timeout")]
    pub cleanup_stop_timeout_secs: u64,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            dir: default_operations_dir(),
            cleanup_stop_timeout_secs: default_cleanup_stop_timeout(),
        }
    }
}

/// Operation notification targets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// On operation completed: "webhook:<url>", a bare URL, or "none"
    #[serde(default)]
    pub on_complete: Option<String>,

    /// On operation failed: "webhook:<url>", a bare URL, or "none"
    #[serde(default)]
    pub on_error: Option<String>,
}

/// Log line format on stderr
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// `[logging]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Format of stderr output
    #[serde(default)]
    pub format: LogFormat,

    /// Also write logs to this file, rotated daily
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_manager_pattern() -> String {
    "sandbox-manager".to_string()
}

fn default_script() -> String {
    "/usr/local/bin/sandbox-manager".to_string()
}

fn default_command_timeout() -> u64 {
    120
}

fn default_prefix() -> String {
    "sandbox".to_string()
}

fn default_sandbox_type() -> String {
    "ubuntu-full".to_string()
}

fn default_user() -> String {
    "sandbox-user".to_string()
}

fn default_exec_timeout() -> u64 {
    30
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_working_dir() -> String {
    "/tmp".to_string()
}

fn default_install_timeout() -> u64 {
    300
}

fn default_operations_dir() -> PathBuf {
    PathBuf::from(".sandman/operations")
}

fn default_cleanup_stop_timeout() -> u64 {
    5
}

fn default_languages() -> BTreeMap<String, LanguageConfig> {
    BTreeMap::from([
        (
            "python".to_string(),
            LanguageConfig::new("python3", "py", Some("pip3 install {package}"), Some("pip")),
        ),
        (
            "javascript".to_string(),
            LanguageConfig::new("node", "js", Some("npm install -g {package}"), Some("npm")),
        ),
        (
            "typescript".to_string(),
            LanguageConfig::new("ts-node", "ts", Some("npm install -g {package}"), Some("npm")),
        ),
        ("bash".to_string(), LanguageConfig::new("bash", "sh", None, None)),
        (
            "ruby".to_string(),
            LanguageConfig::new("ruby", "rb", Some("gem install {package}"), Some("gem")),
        ),
    ])
}

fn merge_languages<'de, D>(deserializer: D) -> Result<BTreeMap<String, LanguageConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = BTreeMap::<String, LanguageConfig>::deserialize(deserializer)?;
    let mut languages = default_languages();
    languages.extend(overrides);
    Ok(languages)
}

impl Config {
    /// Load configuration from the project directory, then the user config
    /// directory, using defaults if neither exists
    pub fn load(project_dir: &Path) -> Result<Self> {
        let project_path = project_dir.join(CONFIG_FILE);
        if project_path.exists() {
            return Self::load_from(&project_path);
        }

        if let Some(user_path) = dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE)) {
            if user_path.exists() {
                return Self::load_from(&user_path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Language ids with a configuration, sorted
    pub fn language_ids(&self) -> Vec<&str> {
        self.languages.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
impl Config {
    /// Defaults with a fixed manager container so tests never touch Docker.
    pub(crate) fn for_tests() -> Self {
        let mut config = Self::default();
        config.manager.container = Some("sandbox-manager".to_string());
        config
    }
}
