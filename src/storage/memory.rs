//! storage::memory
//!
//! In-memory copy-on-write backend for deterministic testing.
//!
//! # Design
//!
//! The memory backend keeps the whole dataset tree in a `BTreeMap` and
//! enforces the rules the engine depends on:
//!
//! - creating an existing object fails with "already exists"
//! - touching a missing object fails with "does not exist"
//! - a snapshot with clones cannot be destroyed; a deferred destroy marks it
//!   instead, and it disappears when its last clone is destroyed
//! - a filesystem with children, or whose subtree has clones outside it,
//!   cannot be destroyed
//! - mounted filesystems are busy
//!
//! Creation times come from a logical clock that ticks once per created
//! object, so listings ordered by creation are deterministic.
//!
//! # Example
//!
//! ```
//! use stratum::storage::backend::{DestroyMode, PropertyMap, StorageBackend};
//! use stratum::storage::memory::MemoryBackend;
//!
//! let backend = MemoryBackend::new("tank");
//! backend.create("tank/a", &PropertyMap::new()).unwrap();
//! backend.snapshot("tank/a@s1", false, &PropertyMap::new()).unwrap();
//! backend.clone_snapshot("tank/a@s1", "tank/b", &PropertyMap::new()).unwrap();
//!
//! // The snapshot is held by the clone, so it is only marked.
//! backend.destroy("tank/a@s1", DestroyMode::recursive_deferred()).unwrap();
//! assert!(backend.exists("tank/a@s1"));
//!
//! backend.destroy("tank/b", DestroyMode::single()).unwrap();
//! assert!(!backend.exists("tank/a@s1"));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::backend::{
    DatasetEntry, DatasetKind, DestroyMode, ListQuery, PropertyMap, SpaceUsage, StorageBackend,
};
use super::exec::CommandError;

/// First value of the logical clock: 2019-04-28T23:04:06Z.
pub const CLOCK_START: i64 = 1_556_492_646;

/// In-memory backend.
///
/// Thread-safe via internal `Arc<Mutex<...>>` wrapping; clones share state.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    mounts: BTreeMap<PathBuf, String>,
    clock: i64,
    fail_on: Vec<FailOn>,
}

#[derive(Debug, Clone)]
struct Node {
    kind: DatasetKind,
    creation: i64,
    space: SpaceUsage,
    origin: Option<String>,
    defer_destroy: bool,
    properties: PropertyMap,
}

/// A one-shot injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailOn {
    /// Backend method name, e.g. `"snapshot"` or `"mount"`.
    pub method: &'static str,
    /// Only fail when the object name contains this text.
    pub target: Option<String>,
    /// Output carried by the resulting [`CommandError`].
    pub output: String,
}

impl FailOn {
    pub fn new(method: &'static str, output: impl Into<String>) -> Self {
        Self {
            method,
            target: None,
            output: output.into(),
        }
    }

    pub fn on(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

fn err(command: impl Into<String>, output: impl Into<String>) -> CommandError {
    CommandError::new(command, Some(1), output)
}

fn missing(command: &str, name: &str) -> CommandError {
    err(command, format!("cannot open '{name}': dataset does not exist"))
}

fn parent_of(dataset: &str) -> Option<&str> {
    dataset.rsplit_once('/').map(|(p, _)| p)
}

/// Whether `name` is `root` itself or lives beneath it.
fn within(name: &str, root: &str) -> bool {
    name == root
        || name
            .strip_prefix(root)
            .map(|rest| rest.starts_with('/') || rest.starts_with('@'))
            .unwrap_or(false)
}

impl Inner {
    fn tick(&mut self) -> i64 {
        let now = self.clock;
        self.clock += 1;
        now
    }

    fn check_fail(&mut self, method: &str, name: &str) -> Result<(), CommandError> {
        let pos = self.fail_on.iter().position(|f| {
            f.method == method && f.target.as_deref().map_or(true, |t| name.contains(t))
        });
        match pos {
            Some(i) => {
                let f = self.fail_on.remove(i);
                Err(err(format!("{method} {name}"), f.output))
            }
            None => Ok(()),
        }
    }

    fn has_clones(&self, snapshot: &str) -> bool {
        self.nodes
            .values()
            .any(|n| n.origin.as_deref() == Some(snapshot))
    }

    fn is_busy(&self, root: &str) -> bool {
        self.mounts.values().any(|d| within(d, root))
    }

    fn insert(
        &mut self,
        name: &str,
        kind: DatasetKind,
        space: SpaceUsage,
        origin: Option<String>,
        properties: &PropertyMap,
    ) {
        let creation = self.tick();
        self.nodes.insert(
            name.to_string(),
            Node {
                kind,
                creation,
                space,
                origin,
                defer_destroy: false,
                properties: properties.clone(),
            },
        );
    }

    fn require_parent(&self, command: &str, dataset: &str) -> Result<(), CommandError> {
        match parent_of(dataset) {
            Some(parent) if self.nodes.contains_key(parent) => Ok(()),
            _ => Err(err(
                command,
                format!("cannot create '{dataset}': parent does not exist"),
            )),
        }
    }

    /// Remove a node, then drop its origin if that was waiting on it.
    fn remove(&mut self, name: &str) {
        let Some(node) = self.nodes.remove(name) else {
            return;
        };
        if let Some(origin) = node.origin {
            let release = self
                .nodes
                .get(&origin)
                .map(|o| o.defer_destroy)
                .unwrap_or(false)
                && !self.has_clones(&origin);
            if release {
                self.nodes.remove(&origin);
            }
        }
    }

    fn destroy_snapshots(&mut self, name: &str, mode: DestroyMode) -> Result<(), CommandError> {
        let command = format!("destroy {name}");
        let (dataset, snap) = name.split_once('@').unwrap_or((name, ""));
        let targets: Vec<String> = if mode.recursive {
            self.nodes
                .iter()
                .filter(|(n, node)| {
                    node.kind == DatasetKind::Snapshot
                        && n.split_once('@')
                            .map(|(d, s)| s == snap && within(d, dataset))
                            .unwrap_or(false)
                })
                .map(|(n, _)| n.clone())
                .collect()
        } else if self.nodes.contains_key(name) {
            vec![name.to_string()]
        } else {
            Vec::new()
        };

        if targets.is_empty() {
            return Err(err(
                command,
                format!("cannot destroy '{name}': snapshot does not exist"),
            ));
        }

        if !mode.deferred {
            if let Some(held) = targets.iter().find(|t| self.has_clones(t)) {
                return Err(err(
                    command,
                    format!("cannot destroy '{held}': snapshot has dependent clones"),
                ));
            }
        }

        for target in targets {
            if self.has_clones(&target) {
                if let Some(node) = self.nodes.get_mut(&target) {
                    node.defer_destroy = true;
                }
            } else {
                self.remove(&target);
            }
        }
        Ok(())
    }

    fn destroy_filesystem(&mut self, name: &str, mode: DestroyMode) -> Result<(), CommandError> {
        let command = format!("destroy {name}");
        let subtree: BTreeSet<String> = self
            .nodes
            .keys()
            .filter(|n| within(n, name))
            .cloned()
            .collect();

        if !mode.recursive && subtree.len() > 1 {
            return Err(err(
                command,
                format!("cannot destroy '{name}': filesystem has children"),
            ));
        }

        let external_clone = self.nodes.iter().any(|(n, node)| {
            !subtree.contains(n)
                && node
                    .origin
                    .as_ref()
                    .map(|o| subtree.contains(o))
                    .unwrap_or(false)
        });
        if external_clone {
            return Err(err(
                command,
                format!("cannot destroy '{name}': filesystem has dependent clones"),
            ));
        }

        if self.is_busy(name) {
            return Err(err(command, format!("cannot destroy '{name}': dataset is busy")));
        }

        // Children first so origins inside the subtree are released in order.
        for n in subtree.iter().rev() {
            self.remove(n);
        }
        Ok(())
    }
}

impl MemoryBackend {
    /// Create a backend containing only the pool root.
    pub fn new(pool: &str) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            pool.to_string(),
            Node {
                kind: DatasetKind::Filesystem,
                creation: CLOCK_START - 1,
                space: SpaceUsage::default(),
                origin: None,
                defer_destroy: false,
                properties: PropertyMap::new(),
            },
        );
        Self {
            inner: Arc::new(Mutex::new(Inner {
                nodes,
                mounts: BTreeMap::new(),
                clock: CLOCK_START,
                fail_on: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a one-shot failure.
    pub fn fail_on(&self, fail_on: FailOn) {
        self.state().fail_on.push(fail_on);
    }

    /// Whether a dataset or snapshot exists.
    pub fn exists(&self, name: &str) -> bool {
        self.state().nodes.contains_key(name)
    }

    /// All object names, sorted.
    pub fn dataset_names(&self) -> Vec<String> {
        self.state().nodes.keys().cloned().collect()
    }

    /// Current mounts as `(mountpoint, dataset)`.
    pub fn mounts(&self) -> Vec<(PathBuf, String)> {
        self.state()
            .mounts
            .iter()
            .map(|(p, d)| (p.clone(), d.clone()))
            .collect()
    }

    /// Override the space accounting of an object.
    pub fn set_space(&self, name: &str, space: SpaceUsage) -> Result<(), CommandError> {
        let mut state = self.state();
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| missing("set_space", name))?;
        node.space = space;
        Ok(())
    }

    /// Whether a snapshot is pending deferred destruction.
    pub fn is_deferred(&self, name: &str) -> bool {
        self.state()
            .nodes
            .get(name)
            .map(|n| n.defer_destroy)
            .unwrap_or(false)
    }
}

impl StorageBackend for MemoryBackend {
    fn create(&self, dataset: &str, properties: &PropertyMap) -> Result<(), CommandError> {
        let command = format!("create {dataset}");
        let mut state = self.state();
        state.check_fail("create", dataset)?;
        if dataset.contains('@') {
            return Err(err(
                command,
                format!("cannot create '{dataset}': invalid character '@' in name"),
            ));
        }
        if state.nodes.contains_key(dataset) {
            return Err(err(command, format!("cannot create '{dataset}': dataset already exists")));
        }
        state.require_parent(&command, dataset)?;
        state.insert(dataset, DatasetKind::Filesystem, SpaceUsage::default(), None, properties);
        Ok(())
    }

    fn snapshot(
        &self,
        name: &str,
        recursive: bool,
        properties: &PropertyMap,
    ) -> Result<(), CommandError> {
        let command = format!("snapshot {name}");
        let mut state = self.state();
        state.check_fail("snapshot", name)?;
        let Some((dataset, snap)) = name.split_once('@') else {
            return Err(err(
                command,
                format!("cannot create snapshot '{name}': missing '@' delimiter"),
            ));
        };
        match state.nodes.get(dataset) {
            Some(node) if node.kind == DatasetKind::Filesystem => {}
            _ => return Err(missing(&command, dataset)),
        }

        let sources: Vec<(String, SpaceUsage)> = state
            .nodes
            .iter()
            .filter(|(n, node)| {
                node.kind == DatasetKind::Filesystem
                    && (n.as_str() == dataset || (recursive && within(n, dataset)))
            })
            .map(|(n, node)| (n.clone(), node.space))
            .collect();

        for (source, _) in &sources {
            let target = format!("{source}@{snap}");
            if state.nodes.contains_key(&target) {
                return Err(err(
                    command,
                    format!("cannot create snapshot '{target}': dataset already exists"),
                ));
            }
        }

        for (source, space) in sources {
            let target = format!("{source}@{snap}");
            let space = SpaceUsage { used: 0, ..space };
            state.insert(&target, DatasetKind::Snapshot, space, None, properties);
        }
        Ok(())
    }

    fn clone_snapshot(
        &self,
        snapshot: &str,
        target: &str,
        properties: &PropertyMap,
    ) -> Result<(), CommandError> {
        let command = format!("clone {snapshot} {target}");
        let mut state = self.state();
        state.check_fail("clone", target)?;
        let space = match state.nodes.get(snapshot) {
            Some(node) if node.kind == DatasetKind::Snapshot => node.space,
            _ => return Err(missing(&command, snapshot)),
        };
        if state.nodes.contains_key(target) {
            return Err(err(command, format!("cannot create '{target}': dataset already exists")));
        }
        state.require_parent(&command, target)?;
        let space = SpaceUsage { used: 0, ..space };
        let origin = Some(snapshot.to_string());
        state.insert(target, DatasetKind::Filesystem, space, origin, properties);
        Ok(())
    }

    fn destroy(&self, name: &str, mode: DestroyMode) -> Result<(), CommandError> {
        let mut state = self.state();
        state.check_fail("destroy", name)?;
        if name.contains('@') {
            return state.destroy_snapshots(name, mode);
        }
        if !state.nodes.contains_key(name) {
            return Err(missing(&format!("destroy {name}"), name));
        }
        state.destroy_filesystem(name, mode)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), CommandError> {
        let command = format!("rename {from} {to}");
        let mut state = self.state();
        state.check_fail("rename", from)?;
        if !state.nodes.contains_key(from) {
            return Err(missing(&command, from));
        }
        if state.nodes.contains_key(to) {
            return Err(err(command, format!("cannot rename to '{to}': dataset already exists")));
        }
        state.require_parent(&command, to)?;

        let moved: Vec<String> = state
            .nodes
            .keys()
            .filter(|n| within(n, from))
            .cloned()
            .collect();
        let rewrite = |n: &str| format!("{to}{}", &n[from.len()..]);

        for old in moved {
            if let Some(node) = state.nodes.remove(&old) {
                state.nodes.insert(rewrite(&old), node);
            }
        }
        for node in state.nodes.values_mut() {
            if let Some(origin) = node.origin.as_mut() {
                if within(origin, from) {
                    *origin = rewrite(origin);
                }
            }
        }
        for dataset in state.mounts.values_mut() {
            if within(dataset, from) {
                *dataset = rewrite(dataset);
            }
        }
        Ok(())
    }

    fn list(&self, root: &str, query: &ListQuery) -> Result<Vec<DatasetEntry>, CommandError> {
        let mut state = self.state();
        state.check_fail("list", root)?;
        if !state.nodes.contains_key(root) {
            return Err(missing(&format!("list {root}"), root));
        }

        let depth_of = |name: &str| -> u32 {
            if name == root {
                return 0;
            }
            let rest = &name[root.len()..];
            if rest.starts_with('@') {
                return 1;
            }
            let (path, snap) = match rest.split_once('@') {
                Some((p, _)) => (p, true),
                None => (rest, false),
            };
            path.matches('/').count() as u32 + u32::from(snap)
        };

        let entries = state
            .nodes
            .iter()
            .filter(|(n, node)| {
                within(n, root)
                    && query.kind.accepts(node.kind)
                    && query.depth.map_or(true, |d| depth_of(n) <= d)
            })
            .map(|(n, node)| DatasetEntry {
                name: n.clone(),
                kind: node.kind,
                creation: Some(node.creation),
                space: node.space,
                origin: node.origin.clone(),
                defer_destroy: node.defer_destroy,
                properties: query
                    .properties
                    .iter()
                    .filter_map(|p| node.properties.get(p).map(|v| (p.clone(), v.clone())))
                    .collect(),
            })
            .collect();
        Ok(entries)
    }

    fn set_property(&self, name: &str, property: &str, value: &str) -> Result<(), CommandError> {
        let mut state = self.state();
        state.check_fail("set", name)?;
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| missing(&format!("set {property} {name}"), name))?;
        node.properties.insert(property.to_string(), value.to_string());
        Ok(())
    }

    fn clear_property(&self, name: &str, property: &str) -> Result<(), CommandError> {
        let mut state = self.state();
        state.check_fail("inherit", name)?;
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| missing(&format!("inherit {property} {name}"), name))?;
        node.properties.remove(property);
        Ok(())
    }

    fn mount(&self, dataset: &str, mountpoint: &Path) -> Result<(), CommandError> {
        let command = format!("mount {dataset} {}", mountpoint.display());
        let mut state = self.state();
        state.check_fail("mount", dataset)?;
        match state.nodes.get(dataset) {
            Some(node) if node.kind == DatasetKind::Filesystem => {}
            _ => return Err(missing(&command, dataset)),
        }
        if state.mounts.contains_key(mountpoint) {
            return Err(err(
                command,
                format!("mount: {}: mountpoint is busy", mountpoint.display()),
            ));
        }
        state.mounts.insert(mountpoint.to_path_buf(), dataset.to_string());
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> Result<(), CommandError> {
        let mut state = self.state();
        state.check_fail("unmount", &mountpoint.to_string_lossy())?;
        if state.mounts.remove(mountpoint).is_none() {
            return Err(err(
                format!("umount {}", mountpoint.display()),
                format!("umount: {}: not mounted", mountpoint.display()),
            ));
        }
        Ok(())
    }

    fn is_mounted(&self, mountpoint: &Path) -> Result<bool, CommandError> {
        Ok(self.state().mounts.contains_key(mountpoint))
    }

    fn remove_mountpoint(&self, mountpoint: &Path) -> Result<(), CommandError> {
        let state = self.state();
        if state.mounts.contains_key(mountpoint) {
            return Err(err(
                format!("rmdir {}", mountpoint.display()),
                format!("rmdir: {}: Device or resource busy", mountpoint.display()),
            ));
        }
        Ok(())
    }
}
