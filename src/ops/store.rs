//! ops::store
//!
//! Persistence for running operations.
//!
//! # Architecture
//!
//! The operation engine writes an [`OperationRecord`] when an operation
//! starts and deletes it once the operation reaches a terminal state.
//! Whatever is in the store at startup is therefore an operation that was
//! interrupted mid-flight and should be resumed.
//!
//! Two implementations are provided:
//!
//! - [`FileStore`] - one JSON file per operation under
//!   `<dir>/operations/<repository>/<id>.json`, fsynced on every write and
//!   guarded by a [`StoreLock`]
//! - [`MemoryStore`] - a map, for tests and ephemeral engines
//!
//! # Example
//!
//! ```
//! use stratum::ops::store::{MemoryStore, MetadataStore};
//!
//! let store = MemoryStore::new();
//! assert!(store.list(None).unwrap().is_empty());
//! assert!(store.get("foo", "missing").unwrap().is_none());
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use super::lock::{LockError, StoreLock};
use super::record::OperationRecord;

const OPERATIONS_DIR: &str = "operations";

/// Errors from the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error reading or writing a record.
    #[error("metadata store i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A record on disk could not be parsed.
    #[error("corrupt operation record {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    /// Serialization failed.
    #[error("cannot serialize operation record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The store directory is owned by another process.
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Keyed storage of operation records.
///
/// Records are keyed by repository and operation id. Implementations must
/// be safe to call from any thread.
pub trait MetadataStore: Send + Sync + std::fmt::Debug {
    /// Insert or replace a record.
    fn put(&self, record: &OperationRecord) -> Result<(), StoreError>;

    fn get(&self, repo: &str, id: &str) -> Result<Option<OperationRecord>, StoreError>;

    /// Remove a record. Removing a missing record is not an error.
    fn delete(&self, repo: &str, id: &str) -> Result<(), StoreError>;

    /// Records of one repository, or of all repositories.
    fn list(&self, repo: Option<&str>) -> Result<Vec<OperationRecord>, StoreError>;
}

/// In-memory store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<(String, String), OperationRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn put(&self, record: &OperationRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(
            (record.repository.clone(), record.id().to_string()),
            record.clone(),
        );
        Ok(())
    }

    fn get(&self, repo: &str, id: &str) -> Result<Option<OperationRecord>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(&(repo.to_string(), id.to_string())).cloned())
    }

    fn delete(&self, repo: &str, id: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.remove(&(repo.to_string(), id.to_string()));
        Ok(())
    }

    fn list(&self, repo: Option<&str>) -> Result<Vec<OperationRecord>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .iter()
            .filter(|((r, _), _)| repo.map_or(true, |want| r == want))
            .map(|(_, record)| record.clone())
            .collect())
    }
}

/// File-backed store.
///
/// Holds an exclusive lock on its directory for as long as it lives.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    _lock: StoreLock,
}

impl FileStore {
    /// Open the store rooted at `dir`, taking its lock.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Lock`] if another process owns the directory
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let lock = StoreLock::acquire(dir)?;
        let root = dir.join(OPERATIONS_DIR);
        fs::create_dir_all(&root)?;
        Ok(Self { root, _lock: lock })
    }

    fn repo_dir(&self, repo: &str) -> PathBuf {
        self.root.join(repo)
    }

    fn record_path(&self, repo: &str, id: &str) -> PathBuf {
        self.repo_dir(repo).join(format!("{id}.json"))
    }

    fn read_record(path: &Path) -> Result<OperationRecord, StoreError> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn list_dir(dir: &Path) -> Result<Vec<OperationRecord>, StoreError> {
        let mut paths: Vec<PathBuf> = match fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        paths.sort();
        paths.iter().map(|p| Self::read_record(p)).collect()
    }
}

impl MetadataStore for FileStore {
    fn put(&self, record: &OperationRecord) -> Result<(), StoreError> {
        let dir = self.repo_dir(&record.repository);
        fs::create_dir_all(&dir)?;

        let path = self.record_path(&record.repository, record.id());
        let content = serde_json::to_string_pretty(record)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        file.write_all(content.as_bytes())?;
        file.sync_all()?;

        debug!(path = %path.display(), "wrote operation record");
        Ok(())
    }

    fn get(&self, repo: &str, id: &str) -> Result<Option<OperationRecord>, StoreError> {
        let path = self.record_path(repo, id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    fn delete(&self, repo: &str, id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.record_path(repo, id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, repo: Option<&str>) -> Result<Vec<OperationRecord>, StoreError> {
        if let Some(repo) = repo {
            return Self::list_dir(&self.repo_dir(repo));
        }

        let mut repos: Vec<PathBuf> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        repos.sort();

        let mut records = Vec::new();
        for dir in repos {
            records.extend(Self::list_dir(&dir)?);
        }
        Ok(records)
    }
}
