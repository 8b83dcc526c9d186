//! Operation persistence.
//!
//! The file store keeps one TOML file per operation. Writes go to a temp
//! file that is renamed into place, so a poller never reads a torn record.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::{Operation, OperationError};

const RECORD_EXTENSION: &str = "toml";

/// Where operations live between polls.
pub trait OperationStore: Send + Sync {
    /// Stores a new record. Fails if the id is taken.
    fn create(&self, operation: &Operation) -> Result<(), OperationError>;

    /// Loads a record by id.
    fn find(&self, operation_id: &str) -> Result<Option<Operation>, OperationError>;

    /// Replaces an existing record.
    fn save(&self, operation: &Operation) -> Result<(), OperationError>;

    /// All records, newest first.
    fn list(&self) -> Result<Vec<Operation>, OperationError>;
}

/// Ids become file names.
fn validate_id(operation_id: &str) -> Result<(), OperationError> {
    let valid = !operation_id.is_empty()
        && operation_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(OperationError::Store {
            message: format!("invalid operation id '{operation_id}'"),
        })
    }
}

fn newest_first(mut operations: Vec<Operation>) -> Vec<Operation> {
    operations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    operations
}

/// TOML files in a directory.
#[derive(Debug, Clone)]
pub struct FileOperationStore {
    dir: PathBuf,
}

impl FileOperationStore {
    /// A store rooted at `dir`, created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, operation_id: &str) -> PathBuf {
        self.dir.join(format!("{operation_id}.{RECORD_EXTENSION}"))
    }

    fn read(path: &Path) -> Result<Operation> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read operation file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse operation file: {}", path.display()))
    }

    fn write(&self, operation: &Operation) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create directory: {}", self.dir.display()))?;

        let content = toml::to_string_pretty(operation).context("Failed to serialize operation")?;
        let path = self.path(&operation.operation_id);
        let tmp = path.with_extension(format!("{RECORD_EXTENSION}.tmp"));

        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write operation file: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move operation file into place: {}", path.display()))?;
        Ok(())
    }
}

impl OperationStore for FileOperationStore {
    fn create(&self, operation: &Operation) -> Result<(), OperationError> {
        validate_id(&operation.operation_id)?;
        if self.path(&operation.operation_id).exists() {
            return Err(OperationError::AlreadyExists {
                operation_id: operation.operation_id.clone(),
            });
        }
        self.write(operation).map_err(|e| OperationError::store(&e))
    }

    fn find(&self, operation_id: &str) -> Result<Option<Operation>, OperationError> {
        validate_id(operation_id)?;
        let path = self.path(operation_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some).map_err(|e| OperationError::store(&e))
    }

    fn save(&self, operation: &Operation) -> Result<(), OperationError> {
        validate_id(&operation.operation_id)?;
        self.write(operation).map_err(|e| OperationError::store(&e))
    }

    fn list(&self) -> Result<Vec<Operation>, OperationError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read directory: {}", self.dir.display()))
            .map_err(|e| OperationError::store(&e))?;

        let mut operations = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match Self::read(&path) {
                Ok(operation) => operations.push(operation),
                Err(e) => tracing::warn!(error = %format!("{e:#}"), "Skipping unreadable operation file"),
            }
        }
        Ok(newest_first(operations))
    }
}

/// Records kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryOperationStore {
    operations: Mutex<BTreeMap<String, Operation>>,
}

impl MemoryOperationStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl OperationStore for MemoryOperationStore {
    fn create(&self, operation: &Operation) -> Result<(), OperationError> {
        validate_id(&operation.operation_id)?;
        let mut operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        if operations.contains_key(&operation.operation_id) {
            return Err(OperationError::AlreadyExists {
                operation_id: operation.operation_id.clone(),
            });
        }
        operations.insert(operation.operation_id.clone(), operation.clone());
        Ok(())
    }

    fn find(&self, operation_id: &str) -> Result<Option<Operation>, OperationError> {
        let operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(operations.get(operation_id).cloned())
    }

    fn save(&self, operation: &Operation) -> Result<(), OperationError> {
        validate_id(&operation.operation_id)?;
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation.operation_id.clone(), operation.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<Operation>, OperationError> {
        let operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(newest_first(operations.values().cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{LogLevel, OperationStatus, OperationType};
    use tempfile::tempdir;

    fn started(operation_type: OperationType) -> Operation {
        let mut op = Operation::new(operation_type, Some("demo".to_string()));
        op.transition(OperationStatus::Started, "Working").unwrap();
        op.push_log(LogLevel::Warning, "Slow manager");
        op.metadata.insert("timeout".to_string(), "5".to_string());
        op
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileOperationStore::new(dir.path().join("ops"));
        let op = started(OperationType::Stop);

        store.create(&op).unwrap();
        let loaded = store.find(&op.operation_id).unwrap().unwrap();

        assert_eq!(loaded.operation_id, op.operation_id);
        assert_eq!(loaded.operation_type, OperationType::Stop);
        assert_eq!(loaded.status, OperationStatus::Started);
        assert_eq!(loaded.sandbox_id.as_deref(), Some("demo"));
        assert_eq!(loaded.log.len(), 2);
        assert_eq!(loaded.log[1].level, LogLevel::Warning);
        assert_eq!(loaded.metadata["timeout"], "5");
    }

    #[test]
    fn test_file_store_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = FileOperationStore::new(dir.path());
        let mut op = started(OperationType::Start);
        store.create(&op).unwrap();
        op.transition(OperationStatus::Completed, "Done").unwrap();
        store.save(&op).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.toml", op.operation_id)]);
        assert_eq!(
            store.find(&op.operation_id).unwrap().unwrap().status,
            OperationStatus::Completed
        );
    }

    #[test]
    fn test_create_rejects_duplicates() {
        let dir = tempdir().unwrap();
        let store = FileOperationStore::new(dir.path());
        let op = Operation::with_id("fixed-id", OperationType::Cleanup, None);

        store.create(&op).unwrap();
        let err = store.create(&op).unwrap_err();
        assert!(matches!(err, OperationError::AlreadyExists { .. }));
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let store = MemoryOperationStore::new();
        let op = Operation::with_id("../escape", OperationType::Start, None);
        assert!(store.create(&op).is_err());

        let dir = tempdir().unwrap();
        let files = FileOperationStore::new(dir.path());
        assert!(files.find("../../etc/passwd").is_err());
    }

    #[test]
    fn test_find_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = FileOperationStore::new(dir.path().join("never-created"));
        assert!(store.find("stop_abc").unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_list_skips_garbage() {
        let dir = tempdir().unwrap();
        let store = FileOperationStore::new(dir.path());
        store.create(&started(OperationType::Reset)).unwrap();
        fs::write(dir.path().join("broken.toml"), "not = [valid").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryOperationStore::new();
        let mut op = started(OperationType::Destroy);
        store.create(&op).unwrap();

        op.transition(OperationStatus::Failed, "boom").unwrap();
        store.save(&op).unwrap();

        let loaded = store.find(&op.operation_id).unwrap().unwrap();
        assert_eq!(loaded.status, OperationStatus::Failed);
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
