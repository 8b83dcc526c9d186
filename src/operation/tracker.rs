//! Runs sandbox actions inside a persisted operation record.
//!
//! Every action follows the same shape: mark the record started, log each
//! step (validation, environment check, manager call, verification) as it
//! happens, then mark it completed with a summary or failed with the error.
//! The record is saved after every change so another process can poll it.

use std::sync::Arc;
use tracing::warn;

use super::{LogLevel, Operation, OperationError, OperationStatus, OperationStore, OperationType};
use crate::notifications::{NotificationEvent, Notifier};
use crate::sandbox::{SandboxError, SandboxInstance, SandboxManager};

type StepResult<T> = Result<(T, String), OperationError>;

/// Drives one operation record through its lifecycle.
pub struct OperationTracker {
    store: Arc<dyn OperationStore>,
    manager: Arc<SandboxManager>,
    operation: Operation,
    notifier: Option<Notifier>,
    cleanup_stop_timeout_secs: u64,
}

impl OperationTracker {
    /// Registers a new pending operation in the store and tracks it.
    pub fn begin(
        store: Arc<dyn OperationStore>,
        manager: Arc<SandboxManager>,
        operation: Operation,
    ) -> Result<Self, OperationError> {
        store.create(&operation)?;
        Ok(Self::from_parts(store, manager, operation))
    }

    /// Adopts an operation already in the store.
    pub fn load(
        store: Arc<dyn OperationStore>,
        manager: Arc<SandboxManager>,
        operation_id: &str,
    ) -> Result<Self, OperationError> {
        let operation = store
            .find(operation_id)?
            .ok_or_else(|| OperationError::NotFound {
                operation_id: operation_id.to_string(),
            })?;
        Ok(Self::from_parts(store, manager, operation))
    }

    fn from_parts(store: Arc<dyn OperationStore>, manager: Arc<SandboxManager>, operation: Operation) -> Self {
        Self {
            store,
            manager,
            operation,
            notifier: None,
            cleanup_stop_timeout_secs: 5,
        }
    }

    /// Sends a webhook when the operation reaches a terminal state.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Per-sandbox stop timeout used by `cleanup_all_sandboxes`.
    pub fn with_cleanup_stop_timeout(mut self, secs: u64) -> Self {
        self.cleanup_stop_timeout_secs = secs;
        self
    }

    /// The record as last persisted.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Consumes the tracker, returning the record.
    pub fn into_operation(self) -> Operation {
        self.operation
    }

    // ---- Record updates ----

    /// Moves a pending record to `started`.
    pub fn mark_started(&mut self, message: impl Into<String>) -> Result<(), OperationError> {
        self.operation.transition(OperationStatus::Started, message)?;
        self.persist()
    }

    /// Adds a log entry and saves.
    pub fn append_log(&mut self, message: impl Into<String>, level: LogLevel) -> Result<(), OperationError> {
        self.operation.push_log(level, message);
        self.persist()
    }

    /// Moves a started record to `completed` with a summary.
    pub fn mark_completed(&mut self, message: impl Into<String>) -> Result<(), OperationError> {
        self.operation.transition(OperationStatus::Completed, message)?;
        self.persist()
    }

    /// Moves a started record to `failed` with the error text.
    pub fn mark_failed(&mut self, message: impl Into<String>) -> Result<(), OperationError> {
        self.operation.transition(OperationStatus::Failed, message)?;
        self.persist()
    }

    fn persist(&self) -> Result<(), OperationError> {
        self.store.save(&self.operation)
    }

    fn step(&mut self, message: impl Into<String>) -> Result<(), OperationError> {
        self.append_log(message, LogLevel::Info)
    }

    fn warning(&mut self, message: impl Into<String>) -> Result<(), OperationError> {
        self.append_log(message, LogLevel::Warning)
    }

    fn set_meta(&mut self, key: &str, value: impl ToString) {
        self.operation
            .metadata
            .insert(key.to_string(), value.to_string());
    }

    /// Checks the record can run `requested` against `sandbox_id`.
    fn prepare(&mut self, requested: OperationType, sandbox_id: Option<&str>) -> Result<(), OperationError> {
        if self.operation.operation_type != requested {
            return Err(OperationError::TypeMismatch {
                operation_id: self.operation.operation_id.clone(),
                expected: self.operation.operation_type,
                requested,
            });
        }

        match (self.operation.sandbox_id.as_deref(), sandbox_id) {
            (Some(recorded), Some(given)) if recorded != given => {
                Err(SandboxError::invalid_argument(format!(
                    "operation {} is for sandbox '{recorded}', not '{given}'",
                    self.operation.operation_id
                ))
                .into())
            }
            (None, Some(given)) => {
                self.operation.sandbox_id = Some(given.to_string());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Records the outcome, notifies, and hands the result back.
    async fn finish<T>(&mut self, outcome: StepResult<T>) -> Result<T, OperationError> {
        match outcome {
            Ok((value, summary)) => {
                self.mark_completed(summary)?;
                self.notify(NotificationEvent::Complete).await;
                Ok(value)
            }
            Err(err) => {
                if let Err(record_err) = self.mark_failed(err.to_string()) {
                    warn!(
                        operation = %self.operation.operation_id,
                        error = %record_err,
                        "Failed to record operation failure"
                    );
                }
                self.notify(NotificationEvent::Error).await;
                Err(err)
            }
        }
    }

    async fn notify(&self, event: NotificationEvent) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(event, &self.operation).await;
        }
    }

    async fn lookup(&self, id: &str) -> Result<SandboxInstance, OperationError> {
        Ok(self
            .manager
            .get_sandbox(id)
            .await?
            .ok_or_else(|| SandboxError::not_found(id))?)
    }

    // ---- Actions ----

    /// Creates a sandbox.
    pub async fn create_sandbox(
        &mut self,
        sandbox_type: Option<&str>,
        name: Option<&str>,
        ports: &[u16],
    ) -> Result<SandboxInstance, OperationError> {
        let sandbox_type = sandbox_type
            .unwrap_or(&self.manager.settings().default_type)
            .to_string();
        self.mark_started(format!("Creating {sandbox_type} sandbox"))?;
        let outcome = self.run_create(&sandbox_type, name, ports).await;
        self.finish(outcome).await
    }

    async fn run_create(
        &mut self,
        sandbox_type: &str,
        name: Option<&str>,
        ports: &[u16],
    ) -> StepResult<SandboxInstance> {
        self.prepare(OperationType::Create, name)?;
        self.set_meta("sandbox_type", sandbox_type);
        if !ports.is_empty() {
            let ports: Vec<String> = ports.iter().map(u16::to_string).collect();
            self.set_meta("ports", ports.join(","));
        }
        self.step("Validated create request")?;

        if let Some(name) = name {
            self.step(format!("Checking that '{name}' is not taken"))?;
            if self.manager.exists(name).await? {
                return Err(SandboxError::creation(format!("sandbox '{name}' already exists")).into());
            }
        }

        self.step("Requesting sandbox from manager")?;
        let created = self.manager.create(Some(sandbox_type), name, ports).await?;
        self.operation.sandbox_id = Some(created.id.clone());

        self.step(format!("Verifying sandbox '{}'", created.id))?;
        let Some(listed) = self.manager.get_sandbox(&created.id).await? else {
            return Err(SandboxError::creation(format!(
                "sandbox '{}' was not listed after creation",
                created.id
            ))
            .into());
        };
        if !listed.is_running() {
            self.warning(format!("Sandbox '{}' reports status {}", listed.id, listed.status))?;
        }

        let summary = format!("Sandbox '{}' created", listed.id);
        Ok((listed, summary))
    }

    /// Starts a sandbox. Starting a running sandbox completes immediately.
    pub async fn start_sandbox(&mut self, id: &str) -> Result<SandboxInstance, OperationError> {
        self.mark_started(format!("Starting sandbox '{id}'"))?;
        let outcome = self.run_start(id).await;
        self.finish(outcome).await
    }

    async fn run_start(&mut self, id: &str) -> StepResult<SandboxInstance> {
        self.prepare(OperationType::Start, Some(id))?;
        self.step("Validated start request")?;
        self.step("Looking up sandbox")?;
        let sandbox = self.lookup(id).await?;
        if sandbox.is_running() {
            let summary = format!("Sandbox '{id}' is already running");
            self.step(summary.clone())?;
            return Ok((sandbox, summary));
        }

        self.step("Starting sandbox via manager")?;
        self.manager.start(id).await?;

        self.step("Verifying sandbox state")?;
        let refreshed = self.lookup(id).await?;
        if !refreshed.is_running() {
            self.warning(format!("Sandbox '{id}' reports status {} after start", refreshed.status))?;
        }
        Ok((refreshed, format!("Sandbox '{id}' started")))
    }

    /// Stops a sandbox. Returns false if it was already stopped.
    pub async fn stop_sandbox(&mut self, id: &str, timeout_secs: Option<u64>) -> Result<bool, OperationError> {
        self.mark_started(format!("Stopping sandbox '{id}'"))?;
        let outcome = self.run_stop(id, timeout_secs).await;
        self.finish(outcome).await
    }

    async fn run_stop(&mut self, id: &str, timeout_secs: Option<u64>) -> StepResult<bool> {
        self.prepare(OperationType::Stop, Some(id))?;
        let timeout = timeout_secs.unwrap_or(self.manager.settings().stop_timeout_secs);
        self.set_meta("timeout_secs", timeout);
        self.step("Validated stop request")?;

        self.step("Looking up sandbox")?;
        let sandbox = self.lookup(id).await?;
        if !sandbox.is_running() {
            let summary = format!("Sandbox '{id}' is already stopped");
            self.step(summary.clone())?;
            return Ok((false, summary));
        }

        self.step(format!("Stopping sandbox via manager (timeout {timeout}s)"))?;
        self.manager.stop(id, Some(timeout)).await?;

        self.step("Verifying sandbox state")?;
        match self.manager.get_sandbox(id).await? {
            Some(s) if s.is_running() => {
                self.warning(format!("Sandbox '{id}' still reports status {}", s.status))?;
            }
            Some(_) => {}
            None => self.warning(format!("Sandbox '{id}' is no longer listed"))?,
        }
        Ok((true, format!("Sandbox '{id}' stopped")))
    }

    /// Recreates a sandbox from a type.
    pub async fn reset_sandbox(&mut self, id: &str, sandbox_type: Option<&str>) -> Result<SandboxInstance, OperationError> {
        self.mark_started(format!("Resetting sandbox '{id}'"))?;
        let outcome = self.run_reset(id, sandbox_type).await;
        self.finish(outcome).await
    }

    async fn run_reset(&mut self, id: &str, sandbox_type: Option<&str>) -> StepResult<SandboxInstance> {
        self.prepare(OperationType::Reset, Some(id))?;
        let sandbox_type = sandbox_type
            .unwrap_or(&self.manager.settings().default_type)
            .to_string();
        self.set_meta("sandbox_type", &sandbox_type);
        self.step("Validated reset request")?;

        self.step("Looking up sandbox")?;
        self.lookup(id).await?;

        self.step(format!("Resetting sandbox to {sandbox_type} via manager"))?;
        self.manager.reset_to(id, Some(&sandbox_type)).await?;

        self.step("Verifying sandbox state")?;
        let refreshed = self.lookup(id).await?;
        if !refreshed.is_running() {
            self.warning(format!("Sandbox '{id}' reports status {} after reset", refreshed.status))?;
        }
        Ok((refreshed, format!("Sandbox '{id}' reset to {sandbox_type}")))
    }

    /// Destroys a sandbox.
    pub async fn destroy_sandbox(&mut self, id: &str) -> Result<(), OperationError> {
        self.mark_started(format!("Destroying sandbox '{id}'"))?;
        let outcome = self.run_destroy(id).await;
        self.finish(outcome).await
    }

    async fn run_destroy(&mut self, id: &str) -> StepResult<()> {
        self.prepare(OperationType::Destroy, Some(id))?;
        self.step("Validated destroy request")?;
        self.step("Looking up sandbox")?;
        self.lookup(id).await?;

        self.step("Destroying sandbox via manager")?;
        self.manager.destroy(id).await?;

        self.step("Verifying removal")?;
        if self.manager.exists(id).await? {
            self.warning(format!("Sandbox '{id}' is still listed after destroy"))?;
        }
        Ok(((), format!("Sandbox '{id}' destroyed")))
    }

    /// Stops every running sandbox, then asks the manager to remove them
    /// all. Returns the count the manager reports.
    pub async fn cleanup_all_sandboxes(&mut self) -> Result<usize, OperationError> {
        self.mark_started("Cleaning up all sandboxes")?;
        let outcome = self.run_cleanup().await;
        self.finish(outcome).await
    }

    async fn run_cleanup(&mut self) -> StepResult<usize> {
        self.prepare(OperationType::Cleanup, None)?;
        self.step("Listing sandboxes")?;
        let sandboxes = self.manager.list_all(true).await?;
        let stats = self.manager.stats(Some(&sandboxes)).await?;
        self.set_meta("running", stats.running);
        self.set_meta("stopped", stats.stopped);
        self.step(format!(
            "Found {} sandboxes ({} running, {} stopped)",
            stats.total, stats.running, stats.stopped
        ))?;

        let timeout = self.cleanup_stop_timeout_secs;
        for sandbox in sandboxes.iter().filter(|s| s.is_running()) {
            self.step(format!("Stopping sandbox '{}'", sandbox.id))?;
            if let Err(e) = self.manager.stop(&sandbox.id, Some(timeout)).await {
                self.warning(format!("Failed to stop sandbox '{}': {e}", sandbox.id))?;
            }
        }

        self.step("Removing sandboxes via manager")?;
        let removed = self.manager.cleanup_all().await?;
        self.set_meta("removed", removed);
        Ok((removed, format!("Cleaned up {removed} sandboxes")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::operation::MemoryOperationStore;
    use crate::testing::{sandbox_manager, FakeManager};

    struct Harness {
        fake: Arc<FakeManager>,
        store: Arc<MemoryOperationStore>,
        manager: Arc<SandboxManager>,
    }

    impl Harness {
        fn new() -> Self {
            let fake = FakeManager::new();
            let manager = sandbox_manager(&Config::for_tests(), &fake);
            Self {
                fake,
                store: Arc::new(MemoryOperationStore::new()),
                manager,
            }
        }

        fn tracker(&self, operation_type: OperationType, sandbox_id: Option<&str>) -> OperationTracker {
            OperationTracker::begin(
                self.store.clone(),
                self.manager.clone(),
                Operation::new(operation_type, sandbox_id.map(str::to_string)),
            )
            .unwrap()
        }

        fn stored(&self, tracker: &OperationTracker) -> Operation {
            self.store
                .find(&tracker.operation().operation_id)
                .unwrap()
                .unwrap()
        }
    }

    fn messages(op: &Operation) -> Vec<String> {
        op.log.iter().map(|e| e.message.clone()).collect()
    }

    #[tokio::test]
    async fn test_stop_running_sandbox() {
        let h = Harness::new();
        h.fake.add_container("sandbox-demo", "running", "img", "");
        let mut tracker = h.tracker(OperationType::Stop, Some("demo"));

        assert!(tracker.stop_sandbox("demo", Some(3)).await.unwrap());

        let op = h.stored(&tracker);
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.message, "Sandbox 'demo' stopped");
        assert_eq!(op.metadata["timeout_secs"], "3");
        assert_eq!(messages(&op)[0], "Stopping sandbox 'demo'");
        assert!(messages(&op).iter().any(|m| m.contains("Verifying")));
        assert_eq!(h.fake.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_stop_already_stopped_short_circuits() {
        let h = Harness::new();
        h.fake.add_container("sandbox-demo", "exited", "img", "");
        let mut tracker = h.tracker(OperationType::Stop, None);

        assert!(!tracker.stop_sandbox("demo", None).await.unwrap());

        let op = h.stored(&tracker);
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.message, "Sandbox 'demo' is already stopped");
        assert_eq!(op.sandbox_id.as_deref(), Some("demo"));
        assert_eq!(h.fake.count("stop"), 0);
    }

    #[tokio::test]
    async fn test_start_already_running_short_circuits() {
        let h = Harness::new();
        h.fake.add_container("sandbox-demo", "running", "img", "");
        let mut tracker = h.tracker(OperationType::Start, Some("demo"));

        let instance = tracker.start_sandbox("demo").await.unwrap();
        assert!(instance.is_running());
        assert_eq!(h.fake.count("start"), 0);
        assert_eq!(h.stored(&tracker).message, "Sandbox 'demo' is already running");
    }

    #[tokio::test]
    async fn test_start_failure_is_recorded_and_raised() {
        let h = Harness::new();
        h.fake.add_container("sandbox-demo", "exited", "img", "");
        h.fake.fail_subcommand("start", "out of memory");
        let mut tracker = h.tracker(OperationType::Start, Some("demo"));

        let err = tracker.start_sandbox("demo").await.unwrap_err();
        assert!(err.as_sandbox().unwrap().is_orchestration());

        let op = h.stored(&tracker);
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(op.message.contains("out of memory"));
        assert_eq!(op.log.last().unwrap().level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_missing_sandbox_fails_operation() {
        let h = Harness::new();
        let mut tracker = h.tracker(OperationType::Destroy, Some("ghost"));

        let err = tracker.destroy_sandbox("ghost").await.unwrap_err();
        assert!(err.as_sandbox().unwrap().is_not_found());
        assert_eq!(h.stored(&tracker).status, OperationStatus::Failed);
        assert_eq!(h.fake.count("destroy"), 0);
    }

    #[tokio::test]
    async fn test_create_records_sandbox_id() {
        let h = Harness::new();
        let mut tracker = h.tracker(OperationType::Create, None);

        let instance = tracker
            .create_sandbox(Some("python"), Some("demo"), &[8080])
            .await
            .unwrap();
        assert_eq!(instance.image, "sandbox-python:latest");
        assert_eq!(instance.metadata.ports, vec![8080]);

        let op = h.stored(&tracker);
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.sandbox_id.as_deref(), Some("demo"));
        assert_eq!(op.metadata["sandbox_type"], "python");
        assert_eq!(op.metadata["ports"], "8080");
    }

    #[tokio::test]
    async fn test_create_generated_name_is_recorded() {
        let h = Harness::new();
        let mut tracker = h.tracker(OperationType::Create, None);

        let instance = tracker.create_sandbox(None, None, &[]).await.unwrap();
        assert_eq!(h.stored(&tracker).sandbox_id, Some(instance.id));
    }

    #[tokio::test]
    async fn test_create_existing_name_fails() {
        let h = Harness::new();
        h.fake.add_container("sandbox-demo", "running", "img", "");
        let mut tracker = h.tracker(OperationType::Create, None);

        let err = tracker.create_sandbox(None, Some("demo"), &[]).await.unwrap_err();
        assert!(matches!(err.as_sandbox(), Some(SandboxError::Creation { .. })));
        assert_eq!(h.fake.count("create"), 0);
    }

    #[tokio::test]
    async fn test_reset_and_destroy() {
        let h = Harness::new();
        h.fake.add_container("sandbox-demo", "exited", "sandbox-ubuntu-full:latest", "");

        let mut reset = h.tracker(OperationType::Reset, Some("demo"));
        let instance = reset.reset_sandbox("demo", Some("node")).await.unwrap();
        assert_eq!(instance.sandbox_type, "node");
        assert!(instance.is_running());

        let mut destroy = h.tracker(OperationType::Destroy, Some("demo"));
        destroy.destroy_sandbox("demo").await.unwrap();
        assert_eq!(h.stored(&destroy).message, "Sandbox 'demo' destroyed");
        assert!(h.fake.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_protected_destroy_fails_without_manager_call() {
        let h = Harness::new();
        h.fake.add_container("sandbox-self", "running", "img", "");
        h.fake.set_current(Some("sandbox-self"));
        let mut tracker = h.tracker(OperationType::Destroy, Some("self"));

        // The listing hides the current container, so lookup already fails.
        let err = tracker.destroy_sandbox("self").await.unwrap_err();
        assert!(err.as_sandbox().is_some());
        assert_eq!(h.fake.count("destroy"), 0);
        assert_eq!(h.stored(&tracker).status, OperationStatus::Failed);
    }

    #[tokio::test]
    async fn test_cleanup_stops_running_then_removes_all() {
        let h = Harness::new();
        h.fake.add_container("sandbox-a", "running", "img", "");
        h.fake.add_container("sandbox-b", "running", "img", "");
        h.fake.add_container("sandbox-c", "exited", "img", "");
        h.fake.fail_subcommand("stop", "daemon busy");

        let mut tracker = h.tracker(OperationType::Cleanup, None).with_cleanup_stop_timeout(2);
        let removed = tracker.cleanup_all_sandboxes().await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(h.fake.count("stop"), 2);
        assert_eq!(h.fake.last_call("stop").unwrap()[2], "2");

        let op = h.stored(&tracker);
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.message, "Cleaned up 3 sandboxes");
        assert_eq!(op.metadata["running"], "2");
        assert_eq!(op.metadata["stopped"], "1");
        let warnings = op.log.iter().filter(|e| e.level == LogLevel::Warning).count();
        assert_eq!(warnings, 2);
    }

    #[tokio::test]
    async fn test_type_mismatch_fails_record() {
        let h = Harness::new();
        h.fake.add_container("sandbox-demo", "exited", "img", "");
        let mut tracker = h.tracker(OperationType::Stop, Some("demo"));

        let err = tracker.start_sandbox("demo").await.unwrap_err();
        assert!(matches!(err, OperationError::TypeMismatch { .. }));

        let op = h.stored(&tracker);
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.message, err.to_string());
        assert_eq!(h.fake.count("start"), 0);
    }

    #[tokio::test]
    async fn test_adopt_pending_record() {
        let h = Harness::new();
        h.fake.add_container("sandbox-demo", "exited", "img", "");
        let pending = Operation::with_id("op-from-api", OperationType::Start, Some("demo".to_string()));
        h.store.create(&pending).unwrap();

        let mut tracker = OperationTracker::load(h.store.clone(), h.manager.clone(), "op-from-api").unwrap();
        tracker.start_sandbox("demo").await.unwrap();
        assert_eq!(h.stored(&tracker).status, OperationStatus::Completed);

        // A finished record cannot be run again.
        let mut again = OperationTracker::load(h.store.clone(), h.manager.clone(), "op-from-api").unwrap();
        let err = again.start_sandbox("demo").await.unwrap_err();
        assert!(matches!(err, OperationError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_load_unknown_operation() {
        let h = Harness::new();
        let result = OperationTracker::load(h.store.clone(), h.manager.clone(), "nope");
        assert!(matches!(result, Err(OperationError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_sandbox_mismatch_is_rejected() {
        let h = Harness::new();
        let mut tracker = h.tracker(OperationType::Stop, Some("demo"));
        let err = tracker.stop_sandbox("other", None).await.unwrap_err();
        assert!(matches!(err.as_sandbox(), Some(SandboxError::InvalidArgument { .. })));

        let op = h.stored(&tracker);
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(op.message.contains("not 'other'"));
        assert_eq!(op.sandbox_id.as_deref(), Some("demo"));
        assert_eq!(h.fake.count("list"), 0);
    }
}
