//! core::paths
//!
//! Centralized naming for datasets, snapshots and mountpoints.
//!
//! # Storage Layout
//!
//! Everything lives beneath `<pool>/repo`:
//!
//! ```text
//! <pool>/repo/<repo>                       repository (active pointer, metadata, remotes)
//! <pool>/repo/<repo>/<guid>                volume set
//! <pool>/repo/<repo>/<guid>@<commit>       commit (recursive snapshot)
//! <pool>/repo/<repo>/<guid>/<volume>       volume
//! <pool>/repo/<repo>/<guid>/<volume>@<c>   per-volume part of a commit
//! ```
//!
//! Mountpoints:
//! - `<mount_root>/<repo>/<volume>` for the active volume set
//! - `<mount_root>/<operation>/<volume>` for an operation's private clone
//!
//! **Hard rule:** no other module formats dataset names by hand.
//!
//! # Example
//!
//! ```
//! use stratum::core::paths::DatasetPaths;
//!
//! let paths = DatasetPaths::new("tank", "/mnt");
//! assert_eq!(paths.repository("foo"), "tank/repo/foo");
//! assert_eq!(paths.volume("foo", "guid", "v0"), "tank/repo/foo/guid/v0");
//! assert_eq!(paths.snapshot(&paths.volume_set("foo", "guid"), "c1"), "tank/repo/foo/guid@c1");
//! ```

use std::path::{Path, PathBuf};

/// Dataset and mountpoint naming for one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPaths {
    pool: String,
    mount_root: PathBuf,
}

/// Components of a dataset or snapshot name beneath a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName<'a> {
    pub repo: &'a str,
    pub volume_set: Option<&'a str>,
    pub volume: Option<&'a str>,
    pub snapshot: Option<&'a str>,
}

impl DatasetPaths {
    pub fn new(pool: impl Into<String>, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            pool: pool.into(),
            mount_root: mount_root.into(),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Parent of every repository dataset.
    pub fn repo_root(&self) -> String {
        format!("{}/repo", self.pool)
    }

    pub fn repository(&self, repo: &str) -> String {
        format!("{}/repo/{}", self.pool, repo)
    }

    pub fn volume_set(&self, repo: &str, guid: &str) -> String {
        format!("{}/repo/{}/{}", self.pool, repo, guid)
    }

    pub fn volume(&self, repo: &str, guid: &str, volume: &str) -> String {
        format!("{}/repo/{}/{}/{}", self.pool, repo, guid, volume)
    }

    pub fn snapshot(&self, dataset: &str, commit: &str) -> String {
        format!("{dataset}@{commit}")
    }

    /// Stable mountpoint of a volume in the active volume set.
    pub fn volume_mountpoint(&self, repo: &str, volume: &str) -> PathBuf {
        self.mount_root.join(repo).join(volume)
    }

    /// Directory holding a repository's stable mountpoints.
    pub fn repository_mountpoint(&self, repo: &str) -> PathBuf {
        self.mount_root.join(repo)
    }

    /// Mountpoint of a volume in an operation's private clone.
    pub fn operation_mountpoint(&self, operation: &str, volume: &str) -> PathBuf {
        self.mount_root.join(operation).join(volume)
    }

    /// Split a dataset or snapshot name into its components.
    ///
    /// Returns `None` for names outside `<pool>/repo/` or deeper than a volume.
    pub fn parse<'a>(&self, name: &'a str) -> Option<ParsedName<'a>> {
        let rest = name
            .strip_prefix(self.pool.as_str())?
            .strip_prefix("/repo/")?;
        let (path, snapshot) = match rest.split_once('@') {
            Some((p, s)) => (p, Some(s)),
            None => (rest, None),
        };
        let mut parts = path.split('/');
        let repo = parts.next().filter(|s| !s.is_empty())?;
        let volume_set = parts.next();
        let volume = parts.next();
        if parts.next().is_some() {
            return None;
        }
        Some(ParsedName {
            repo,
            volume_set,
            volume,
            snapshot,
        })
    }
}
