//! In-memory stand-ins for the container runtime and manager process.
//!
//! `FakeManager` answers the manager protocol the way the real script does,
//! keeping containers and staged files in memory and recording every argv.

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::process::{CommandRunner, ProcessError, ProcessOutput};
use crate::sandbox::{ContainerDirectory, ManagerClient, SandboxManager};

const PREFIX: &str = "sandbox-";
const MANAGER: &str = "sandbox-manager";

#[derive(Debug, Clone)]
struct FakeContainer {
    status: String,
    image: String,
    ports: String,
}

#[derive(Debug, Clone)]
struct ScriptedExec {
    pattern: String,
    output: ProcessOutput,
}

#[derive(Debug, Default)]
struct FakeState {
    manager_name: String,
    containers: BTreeMap<String, FakeContainer>,
    current: Option<String>,
    files: HashMap<(String, String), Vec<u8>>,
    scripted: Vec<ScriptedExec>,
    failing: HashMap<String, String>,
    broken: Vec<String>,
    calls: Vec<Vec<String>>,
    legacy_listing: bool,
    unreachable: bool,
}

/// Scripted manager process.
#[derive(Debug)]
pub(crate) struct FakeManager {
    state: Mutex<FakeState>,
}

fn ok(stdout: impl Into<String>) -> ProcessOutput {
    ProcessOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn fail(exit_code: i32, stderr: impl Into<String>) -> ProcessOutput {
    ProcessOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code,
    }
}

impl FakeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                manager_name: MANAGER.to_string(),
                ..FakeState::default()
            }),
        })
    }

    /// A manager whose runtime binary cannot be spawned.
    pub fn unreachable() -> Arc<Self> {
        let fake = Self::new();
        fake.with(|s| s.unreachable = true);
        fake
    }

    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_container(&self, name: &str, status: &str, image: &str, ports: &str) {
        self.with(|s| {
            s.containers.insert(
                name.to_string(),
                FakeContainer {
                    status: status.to_string(),
                    image: image.to_string(),
                    ports: ports.to_string(),
                },
            );
        });
    }

    pub fn set_current(&self, name: Option<&str>) {
        self.with(|s| s.current = name.map(str::to_string));
    }

    /// Only this manager container answers; others report "No such container".
    pub fn set_manager_name(&self, name: &str) {
        self.with(|s| s.manager_name = name.to_string());
    }

    /// Answers `exec` commands containing `pattern` with a fixed output.
    pub fn script_exec(&self, pattern: &str, stdout: &str, stderr: &str, exit_code: i32) {
        self.with(|s| {
            s.scripted.push(ScriptedExec {
                pattern: pattern.to_string(),
                output: ProcessOutput {
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    exit_code,
                },
            });
        });
    }

    /// Makes every call to `subcommand` exit 1 with `stderr`.
    pub fn fail_subcommand(&self, subcommand: &str, stderr: &str) {
        self.with(|s| {
            s.failing.insert(subcommand.to_string(), stderr.to_string());
        });
    }

    /// Makes the runner itself error on `exec` commands containing `pattern`.
    pub fn break_exec(&self, pattern: &str) {
        self.with(|s| s.broken.push(pattern.to_string()));
    }

    pub fn use_legacy_listing(&self) {
        self.with(|s| s.legacy_listing = true);
    }

    pub fn put_file(&self, container: &str, path: &str, content: &[u8]) {
        self.with(|s| {
            s.files
                .insert((container.to_string(), path.to_string()), content.to_vec());
        });
    }

    pub fn file(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        self.with(|s| s.files.get(&(container.to_string(), path.to_string())).cloned())
    }

    pub fn container_names(&self) -> Vec<String> {
        self.with(|s| s.containers.keys().cloned().collect())
    }

    /// Every argv, runtime binary first.
    pub fn raw_calls(&self) -> Vec<Vec<String>> {
        self.with(|s| s.calls.clone())
    }

    /// Every manager call as `[subcommand, args...]`.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.raw_calls()
            .into_iter()
            .filter(|argv| argv.len() > 4)
            .map(|argv| argv[4..].to_vec())
            .collect()
    }

    pub fn count(&self, subcommand: &str) -> usize {
        self.calls().iter().filter(|c| c[0] == subcommand).count()
    }

    pub fn last_call(&self, subcommand: &str) -> Option<Vec<String>> {
        self.calls().into_iter().rev().find(|c| c[0] == subcommand)
    }

    /// Commands passed to `exec`, in order.
    pub fn exec_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c[0] == "exec" && c.len() > 2)
            .map(|c| c[2].clone())
            .collect()
    }
}

impl FakeState {
    fn dispatch(&mut self, manager: &str, subcommand: &str, args: &[String]) -> ProcessOutput {
        if manager != self.manager_name {
            return fail(1, format!("Error response from daemon: No such container: {manager}"));
        }
        if let Some(stderr) = self.failing.get(subcommand) {
            return fail(1, stderr.clone());
        }

        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        match subcommand {
            "create" => self.create(&arg(0), &arg(1), &arg(2)),
            "start" => self.set_status(&arg(0), "running"),
            "stop" => self.set_status(&arg(0), "exited"),
            "reset" => self.reset(&arg(0), &arg(1)),
            "destroy" => self.destroy(&arg(0)),
            "exec" => self.exec(&arg(0), &arg(1)),
            "list" => ok(self.list(arg(0) == "all")),
            "cleanup" => self.cleanup(),
            "current" => match &self.current {
                Some(name) => ok(name.clone()),
                None => fail(1, ""),
            },
            other => fail(2, format!("Unknown command: {other}")),
        }
    }

    fn create(&mut self, sandbox_type: &str, id: &str, ports: &str) -> ProcessOutput {
        let name = format!("{PREFIX}{id}");
        if self.containers.contains_key(&name) {
            return fail(1, format!("Conflict. The container name \"/{name}\" is already in use"));
        }
        self.containers.insert(
            name.clone(),
            FakeContainer {
                status: "running".to_string(),
                image: format!("{PREFIX}{sandbox_type}:latest"),
                ports: ports.to_string(),
            },
        );
        ok(format!("Created {name}"))
    }

    fn set_status(&mut self, id: &str, status: &str) -> ProcessOutput {
        match self.containers.get_mut(&format!("{PREFIX}{id}")) {
            Some(container) => {
                container.status = status.to_string();
                ok("")
            }
            None => fail(1, format!("No such sandbox: {id}")),
        }
    }

    fn reset(&mut self, id: &str, sandbox_type: &str) -> ProcessOutput {
        match self.containers.get_mut(&format!("{PREFIX}{id}")) {
            Some(container) => {
                container.status = "running".to_string();
                container.image = format!("{PREFIX}{sandbox_type}:latest");
                ok("")
            }
            None => fail(1, format!("No such sandbox: {id}")),
        }
    }

    fn destroy(&mut self, id: &str) -> ProcessOutput {
        let name = format!("{PREFIX}{id}");
        if self.containers.remove(&name).is_none() {
            return fail(1, format!("No such sandbox: {id}"));
        }
        self.files.retain(|(container, _), _| *container != name);
        ok("")
    }

    fn list(&self, all: bool) -> String {
        self.containers
            .iter()
            .filter(|(_, c)| all || c.status == "running")
            .map(|(name, c)| {
                if self.legacy_listing {
                    let status = if c.status == "running" {
                        "Up 2 hours"
                    } else {
                        "Exited (0) 5 minutes ago"
                    };
                    format!("{name} {status} {}", c.image)
                } else {
                    let ports = if c.ports.is_empty() { "none" } else { c.ports.as_str() };
                    format!("{name} {} {} {ports}", c.status, c.image)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn cleanup(&mut self) -> ProcessOutput {
        let before = self.containers.len();
        self.containers
            .retain(|name, _| !name.starts_with(PREFIX) || name.contains(MANAGER));
        ok(format!("Removed {} sandboxes", before - self.containers.len()))
    }

    fn exec(&mut self, id: &str, command: &str) -> ProcessOutput {
        let name = format!("{PREFIX}{id}");
        match self.containers.get(&name) {
            Some(c) if c.status == "running" => {}
            Some(_) => return fail(1, format!("Container {name} is not running")),
            None => return fail(1, format!("No such sandbox: {id}")),
        }

        if let Some(scripted) = self.scripted.iter().find(|s| command.contains(&s.pattern)) {
            return scripted.output.clone();
        }

        let mut outputs = Vec::new();
        for segment in command.split(" && ") {
            match self.run_segment(&name, segment.trim()) {
                Ok(out) if !out.is_empty() => outputs.push(out),
                Ok(_) => {}
                Err(e) => return fail(1, e.to_string()),
            }
        }
        ok(outputs.join("\n"))
    }

    fn run_segment(&mut self, container: &str, segment: &str) -> Result<String> {
        if let Some((echo, path)) = segment.split_once(" | base64 -d > ") {
            let encoded = echo.trim_start_matches("echo ").trim();
            let content = STANDARD.decode(encoded)?;
            let path = unquote(path)?;
            self.files.insert((container.to_string(), path), content);
            return Ok(String::new());
        }

        if let Some(rest) = segment.strip_prefix("base64 ") {
            let path = unquote(rest)?;
            let Some(content) = self.files.get(&(container.to_string(), path.clone())) else {
                bail!("base64: {path}: No such file or directory");
            };
            let encoded = STANDARD.encode(content);
            // GNU base64 wraps at 76 columns.
            let wrapped: Vec<String> = encoded
                .as_bytes()
                .chunks(76)
                .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                .collect();
            return Ok(wrapped.join("\n"));
        }

        if segment.starts_with("echo ") {
            let words = shell_words::split(segment)?;
            return Ok(words[1..].join(" "));
        }

        Ok(String::new())
    }
}

fn unquote(word: &str) -> Result<String> {
    let words = shell_words::split(word.trim())?;
    match words.into_iter().next() {
        Some(w) => Ok(w),
        None => bail!("missing path"),
    }
}

#[async_trait]
impl CommandRunner for FakeManager {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
    ) -> Result<ProcessOutput, ProcessError> {
        let mut state = self.state.lock().unwrap();
        let mut argv = vec![program.to_string()];
        argv.extend(args.iter().cloned());
        state.calls.push(argv);

        if state.unreachable {
            return Err(ProcessError::Spawn {
                program: program.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
            });
        }

        let broken = matches!(
            args,
            [_, _, _, subcommand, _, command, ..]
                if subcommand == "exec" && state.broken.iter().any(|p| command.contains(p))
        );
        if broken {
            return Err(ProcessError::Io {
                program: program.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "Broken pipe"),
            });
        }

        match args {
            [exec, manager, _script, subcommand, rest @ ..] if exec == "exec" => {
                Ok(state.dispatch(manager, subcommand, rest))
            }
            _ => Ok(fail(125, "unsupported runtime invocation")),
        }
    }
}

/// Container directory with a fixed answer.
#[derive(Debug, Default)]
pub(crate) struct StaticDirectory {
    name: Mutex<Option<String>>,
    failing: bool,
    lookups: AtomicUsize,
}

impl StaticDirectory {
    pub fn new(name: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            name: Mutex::new(name.map(str::to_string)),
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            failing: true,
            ..Self::default()
        })
    }

    pub fn set(&self, name: Option<&str>) {
        *self.name.lock().unwrap() = name.map(str::to_string);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerDirectory for StaticDirectory {
    async fn find_running(&self, _pattern: &str) -> Result<Option<String>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            bail!("Cannot connect to the Docker daemon");
        }
        Ok(self.name.lock().unwrap().clone())
    }
}

pub(crate) fn manager_client(config: &Config, fake: &Arc<FakeManager>) -> Arc<ManagerClient> {
    Arc::new(ManagerClient::new(
        &config.manager,
        fake.clone(),
        StaticDirectory::new(None),
    ))
}

pub(crate) fn sandbox_manager(config: &Config, fake: &Arc<FakeManager>) -> Arc<SandboxManager> {
    Arc::new(SandboxManager::with_runner(
        config,
        fake.clone(),
        StaticDirectory::new(None),
    ))
}
