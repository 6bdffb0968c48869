//! storage::engine
//!
//! Maps repositories, volume sets, volumes and commits onto copy-on-write
//! datasets.
//!
//! # Architecture
//!
//! ```text
//! <pool>/repo/<repo>                 metadata, active GUID, remotes
//! <pool>/repo/<repo>/<guid>          volume set
//! <pool>/repo/<repo>/<guid>/<vol>    volume
//! <pool>/repo/<repo>/<guid>@<id>     commit (recursive snapshot)
//! ```
//!
//! The repository dataset carries the GUID of its active volume set. Every
//! repository is created with a seed volume set holding the reserved
//! `initial` commit, so workspaces for a pull can always be cloned from an
//! existing snapshot.
//!
//! Checkout clones every volume of the commit into a new GUID and then
//! repoints the active property. Nothing is overwritten, so checking out the
//! same commit twice yields two independent volume sets.
//!
//! # Errors
//!
//! Backend failures are translated here and nowhere else: output mentioning
//! "does not exist" becomes [`Error::NoSuchObject`], "already exists" becomes
//! [`Error::ObjectExists`], and anything else is surfaced unchanged as
//! [`Error::Command`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use stratum::core::paths::DatasetPaths;
//! use stratum::core::types::{Commit, Repository};
//! use stratum::storage::engine::StorageEngine;
//! use stratum::storage::memory::MemoryBackend;
//!
//! let backend = Arc::new(MemoryBackend::new("tank"));
//! let engine = StorageEngine::new(backend, DatasetPaths::new("tank", "/mnt"));
//!
//! engine.create_repository(&Repository::new("foo")).unwrap();
//! let commit = engine.create_commit("foo", &Commit::new("hash")).unwrap();
//! assert!(commit.timestamp().is_some());
//! ```

mod commit;
mod operation;
mod remote;
mod repository;
mod volume;

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::core::error::{Error, Result};
use crate::core::paths::DatasetPaths;
use crate::core::types::Properties;

use super::backend::{DatasetEntry, DestroyMode, PropertyMap, StorageBackend};
use super::exec::CommandError;
use super::props;

/// Name of the per-operation scratch volume.
pub const SCRATCH_VOLUME: &str = "_scratch";

/// Translates backend results into the engine's error taxonomy.
pub(crate) trait CommandResultExt<T> {
    /// Map "does not exist" to [`Error::NoSuchObject`].
    fn or_no_such(self, message: impl FnOnce() -> String) -> Result<T>;

    /// Map "already exists" to [`Error::ObjectExists`].
    fn or_exists(self, message: impl FnOnce() -> String) -> Result<T>;
}

impl<T> CommandResultExt<T> for std::result::Result<T, CommandError> {
    fn or_no_such(self, message: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| {
            if e.is_does_not_exist() {
                Error::NoSuchObject(message())
            } else {
                Error::Command(e)
            }
        })
    }

    fn or_exists(self, message: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| {
            if e.is_already_exists() {
                Error::ObjectExists(message())
            } else if e.is_does_not_exist() {
                Error::NoSuchObject(e.output.clone())
            } else {
                Error::Command(e)
            }
        })
    }
}

pub(crate) fn no_such_repository(repo: &str) -> String {
    format!("no such repository '{repo}'")
}

pub(crate) fn no_such_commit(repo: &str, id: &str) -> String {
    format!("no such commit '{id}' in repository '{repo}'")
}

/// Serialize caller metadata for storage in a property.
pub(crate) fn encode_metadata(properties: &Properties) -> Result<String> {
    Ok(serde_json::to_string(properties)?)
}

/// Parse stored metadata. A missing property means no metadata.
pub(crate) fn decode_metadata(entry: &DatasetEntry) -> Result<Properties> {
    match entry.property(props::METADATA) {
        None => Ok(Properties::new()),
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => Ok(map),
            _ => Err(Error::InvalidState(format!(
                "metadata for '{}' must be a JSON object",
                entry.name
            ))),
        },
    }
}

pub(crate) fn metadata_property(properties: &Properties) -> Result<PropertyMap> {
    let mut map = PropertyMap::new();
    map.insert(props::METADATA.to_string(), encode_metadata(properties)?);
    Ok(map)
}

/// The versioned storage engine.
///
/// Cheap to clone; clones share the backend.
#[derive(Debug, Clone)]
pub struct StorageEngine {
    backend: Arc<dyn StorageBackend>,
    paths: DatasetPaths,
}

impl StorageEngine {
    pub fn new(backend: Arc<dyn StorageBackend>, paths: DatasetPaths) -> Self {
        Self { backend, paths }
    }

    pub fn paths(&self) -> &DatasetPaths {
        &self.paths
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Make sure the parent of all repositories exists.
    pub fn initialize(&self) -> Result<()> {
        let root = self.paths.repo_root();
        match self.backend.create(&root, &PropertyMap::new()) {
            Ok(()) => {
                info!(dataset = %root, "created repository root");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(Error::Command(e)),
        }
    }

    /// Flag a dataset for the reaper.
    ///
    /// Idempotent. Marking a dataset that no longer exists is not an error.
    pub fn mark_for_destruction(&self, dataset: &str) -> Result<()> {
        match self
            .backend
            .set_property(dataset, props::REAP, props::REAP_PENDING)
        {
            Ok(()) => {
                info!(dataset, "marked for destruction");
                Ok(())
            }
            Err(e) if e.is_does_not_exist() => Ok(()),
            Err(e) => Err(Error::Command(e)),
        }
    }

    /// Destroy a volume set now, or mark it for the reaper if something
    /// still depends on it. Returns whether it was destroyed.
    pub(crate) fn destroy_or_mark(&self, dataset: &str) -> Result<bool> {
        match self.backend.destroy(dataset, DestroyMode::recursive()) {
            Ok(()) => {
                info!(dataset, "destroyed volume set");
                Ok(true)
            }
            Err(e) if e.is_does_not_exist() => Ok(true),
            Err(e) => {
                warn!(dataset, error = %e, "cannot destroy volume set yet, deferring to reaper");
                self.mark_for_destruction(dataset)?;
                Ok(false)
            }
        }
    }
}
