//! storage::backend
//!
//! Copy-on-write filesystem primitives.
//!
//! # Architecture
//!
//! [`StorageBackend`] is the narrow set of operations the storage engine
//! needs from a snapshot/clone filesystem. Two adapters implement it:
//!
//! - [`ZfsBackend`](super::zfs::ZfsBackend) issues `zfs`/`mount` commands
//!   through a [`CommandExecutor`](super::exec::CommandExecutor) and parses
//!   their tab-separated output.
//! - [`MemoryBackend`](super::memory::MemoryBackend) keeps the dataset tree
//!   in memory with the same copy-on-write rules, for tests.
//!
//! Every method is blocking. Async callers run them on the blocking pool.
//!
//! # Naming
//!
//! Datasets are `/`-separated paths, snapshots are `<dataset>@<name>`.
//! Depth for listing follows the copy-on-write filesystem convention: a
//! snapshot of a dataset at depth `d` sits at depth `d + 1`.
//!
//! # Errors
//!
//! Backends report failures as [`CommandError`] with human readable output.
//! Missing objects mention "does not exist" and duplicates mention "already
//! exists"; the engine relies on nothing else.

use std::collections::BTreeMap;
use std::path::Path;

use super::exec::CommandError;

/// User properties attached to a dataset or snapshot.
pub type PropertyMap = BTreeMap<String, String>;

/// Kind of a listed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    Filesystem,
    Snapshot,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Filesystem => "filesystem",
            DatasetKind::Snapshot => "snapshot",
        }
    }
}

/// Which kinds a listing returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KindFilter {
    #[default]
    All,
    Filesystems,
    Snapshots,
}

impl KindFilter {
    pub fn accepts(&self, kind: DatasetKind) -> bool {
        match self {
            KindFilter::All => true,
            KindFilter::Filesystems => kind == DatasetKind::Filesystem,
            KindFilter::Snapshots => kind == DatasetKind::Snapshot,
        }
    }
}

/// Listing parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Maximum depth below the root; `None` means unlimited, `Some(0)`
    /// returns only the root itself.
    pub depth: Option<u32>,
    pub kind: KindFilter,
    /// User properties to fetch. Only locally set values are returned.
    pub properties: Vec<String>,
}

impl ListQuery {
    /// Only the named object.
    pub fn object() -> Self {
        Self {
            depth: Some(0),
            ..Default::default()
        }
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn recursive(mut self) -> Self {
        self.depth = None;
        self
    }

    pub fn kind(mut self, kind: KindFilter) -> Self {
        self.kind = kind;
        self
    }

    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(name.into());
        self
    }
}

/// Space accounting for a dataset or snapshot, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceUsage {
    /// Uncompressed data referenced.
    pub logical: u64,
    /// Compressed data referenced.
    pub referenced: u64,
    /// Space consumed exclusively by this object.
    pub used: u64,
}

/// One row of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetEntry {
    pub name: String,
    pub kind: DatasetKind,
    /// Creation time in seconds since the epoch.
    pub creation: Option<i64>,
    pub space: SpaceUsage,
    /// Snapshot a filesystem was cloned from.
    pub origin: Option<String>,
    /// Snapshot is pending deferred destruction.
    pub defer_destroy: bool,
    /// Requested user properties that are set locally.
    pub properties: PropertyMap,
}

impl DatasetEntry {
    pub fn new(name: impl Into<String>, kind: DatasetKind) -> Self {
        Self {
            name: name.into(),
            kind,
            creation: None,
            space: SpaceUsage::default(),
            origin: None,
            defer_destroy: false,
            properties: PropertyMap::new(),
        }
    }

    /// Dataset part of a snapshot name, or the whole name.
    pub fn dataset(&self) -> &str {
        self.name.split_once('@').map(|(d, _)| d).unwrap_or(&self.name)
    }

    /// Snapshot part of the name, if any.
    pub fn snapshot_name(&self) -> Option<&str> {
        self.name.split_once('@').map(|(_, s)| s)
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

/// How `destroy` treats dependents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestroyMode {
    /// Include descendants (and, for a snapshot, same-named snapshots of
    /// descendants).
    pub recursive: bool,
    /// For snapshots with clones: mark for destruction instead of failing.
    pub deferred: bool,
}

impl DestroyMode {
    pub fn single() -> Self {
        Self::default()
    }

    pub fn recursive() -> Self {
        Self {
            recursive: true,
            deferred: false,
        }
    }

    pub fn recursive_deferred() -> Self {
        Self {
            recursive: true,
            deferred: true,
        }
    }
}

/// Copy-on-write filesystem primitives.
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Create a filesystem whose parent must already exist.
    fn create(&self, dataset: &str, properties: &PropertyMap) -> Result<(), CommandError>;

    /// Snapshot `name` (`dataset@snap`), optionally including descendants.
    fn snapshot(
        &self,
        name: &str,
        recursive: bool,
        properties: &PropertyMap,
    ) -> Result<(), CommandError>;

    /// Create a writable clone of `snapshot` at `target`.
    fn clone_snapshot(
        &self,
        snapshot: &str,
        target: &str,
        properties: &PropertyMap,
    ) -> Result<(), CommandError>;

    fn destroy(&self, name: &str, mode: DestroyMode) -> Result<(), CommandError>;

    fn rename(&self, from: &str, to: &str) -> Result<(), CommandError>;

    /// List `root` and objects beneath it.
    fn list(&self, root: &str, query: &ListQuery) -> Result<Vec<DatasetEntry>, CommandError>;

    fn set_property(&self, name: &str, property: &str, value: &str) -> Result<(), CommandError>;

    /// Remove a locally set user property.
    fn clear_property(&self, name: &str, property: &str) -> Result<(), CommandError>;

    /// Mount a filesystem at `mountpoint`, creating the directory.
    fn mount(&self, dataset: &str, mountpoint: &Path) -> Result<(), CommandError>;

    /// Unmount whatever is mounted at `mountpoint`.
    fn unmount(&self, mountpoint: &Path) -> Result<(), CommandError>;

    fn is_mounted(&self, mountpoint: &Path) -> Result<bool, CommandError>;

    /// Remove an empty mountpoint directory. Missing directories are fine.
    fn remove_mountpoint(&self, mountpoint: &Path) -> Result<(), CommandError>;
}
