//! Private volume sets used by push and pull.
//!
//! An operation works in a volume set named after its id. A push clones the
//! commit being pushed; a pull clones the empty `initial` commit. Either way
//! the operation also gets a [`SCRATCH_VOLUME`] for staging.
//!
//! On success a pull snapshots its volume set as the new commit. Every other
//! outcome discards the volume set.

use std::path::PathBuf;

use serde_json::Value;
use tracing::{info, warn};

use super::{
    decode_metadata, encode_metadata, metadata_property, no_such_commit, CommandResultExt,
    StorageEngine, SCRATCH_VOLUME,
};
use crate::core::error::{Error, Result};
use crate::core::naming::{self, INITIAL_COMMIT, RESERVED_VOLUME_PREFIX};
use crate::core::types::{
    Commit, Properties, UtcTimestamp, Volume, MOUNTPOINT_CONFIG, TIMESTAMP_PROPERTY,
};
use crate::storage::backend::{DestroyMode, KindFilter, ListQuery, PropertyMap};
use crate::storage::props;

fn no_such_operation(repo: &str, id: &str) -> String {
    format!("no such operation '{id}' in repository '{repo}'")
}

impl StorageEngine {
    /// Clone `source` (or `initial`) into the operation's volume set.
    pub fn create_operation(&self, repo: &str, id: &str, source: Option<&str>) -> Result<()> {
        naming::validate_operation(id)?;
        let commit = source.unwrap_or(INITIAL_COMMIT);
        let guid = self
            .locate_commit(repo, commit)?
            .ok_or_else(|| Error::no_such(no_such_commit(repo, commit)))?;
        self.clone_volume_set(repo, &guid, commit, id)?;
        info!(
            repository = %repo,
            operation = %id,
            source = %commit,
            "created operation volume set"
        );
        Ok(())
    }

    pub fn operation_exists(&self, repo: &str, id: &str) -> Result<bool> {
        naming::validate_operation(id)?;
        let dataset = self.paths.volume_set(repo, id);
        match self.backend.list(&dataset, &ListQuery::object()) {
            Ok(entries) => Ok(!entries.is_empty()),
            Err(e) if e.is_does_not_exist() => Ok(false),
            Err(e) => Err(Error::Command(e)),
        }
    }

    /// Create the scratch volume. An existing one is reused.
    pub fn create_operation_scratch(&self, repo: &str, id: &str) -> Result<()> {
        let dataset = self.paths.volume(repo, id, SCRATCH_VOLUME);
        match self.backend.create(&dataset, &PropertyMap::new()) {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) if e.is_does_not_exist() => Err(Error::no_such(no_such_operation(repo, id))),
            Err(e) => Err(Error::Command(e)),
        }
    }

    /// User volumes of the operation's volume set.
    ///
    /// The `mountpoint` config of each volume is its private operation
    /// mountpoint.
    pub fn list_operation_volumes(&self, repo: &str, id: &str) -> Result<Vec<Volume>> {
        let dataset = self.paths.volume_set(repo, id);
        let query = ListQuery::default()
            .depth(1)
            .kind(KindFilter::Filesystems)
            .property(props::METADATA);
        let entries = self
            .backend
            .list(&dataset, &query)
            .or_no_such(|| no_such_operation(repo, id))?;

        entries
            .iter()
            .filter_map(|e| {
                let volume = self.paths.parse(&e.name)?.volume?;
                (!volume.starts_with(RESERVED_VOLUME_PREFIX)).then_some((volume, e))
            })
            .map(|(volume, e)| {
                let mut config = Properties::new();
                config.insert(
                    MOUNTPOINT_CONFIG.to_string(),
                    Value::from(
                        self.paths
                            .operation_mountpoint(id, volume)
                            .to_string_lossy()
                            .to_string(),
                    ),
                );
                Ok(Volume {
                    name: volume.to_string(),
                    config,
                    properties: decode_metadata(e)?,
                })
            })
            .collect()
    }

    /// Mount one of the operation's volumes under its private mountpoint.
    ///
    /// Already mounted volumes, e.g. left over from before a restart, are
    /// reused.
    pub fn mount_operation_volume(&self, repo: &str, id: &str, volume: &str) -> Result<PathBuf> {
        let mountpoint = self.paths.operation_mountpoint(id, volume);
        if self.backend.is_mounted(&mountpoint)? {
            return Ok(mountpoint);
        }
        self.backend
            .mount(&self.paths.volume(repo, id, volume), &mountpoint)
            .or_no_such(|| format!("no such volume '{volume}' in operation '{id}'"))?;
        Ok(mountpoint)
    }

    pub fn unmount_operation_volume(&self, id: &str, volume: &str) -> Result<()> {
        let mountpoint = self.paths.operation_mountpoint(id, volume);
        self.safe_unmount(&mountpoint)?;
        if let Err(e) = self.backend.remove_mountpoint(&mountpoint) {
            warn!(mountpoint = %mountpoint.display(), error = %e, "failed to remove mountpoint");
        }
        Ok(())
    }

    /// Turn a pull's volume set into commit `commit.id`.
    ///
    /// The scratch volume is dropped first so it never becomes part of the
    /// commit. The commit keeps the timestamp it had on the remote; one is
    /// stamped only if missing.
    pub fn commit_operation(&self, repo: &str, id: &str, commit: &Commit) -> Result<Commit> {
        naming::validate_commit(&commit.id)?;
        if self.locate_commit(repo, &commit.id)?.is_some() {
            return Err(Error::exists(format!(
                "commit '{}' already exists in repository '{repo}'",
                commit.id
            )));
        }

        let scratch = self.paths.volume(repo, id, SCRATCH_VOLUME);
        match self.backend.destroy(&scratch, DestroyMode::recursive()) {
            Ok(()) => {}
            Err(e) if e.is_does_not_exist() => {}
            Err(e) => return Err(Error::Command(e)),
        }

        let dataset = self.paths.volume_set(repo, id);
        let snapshot = self.paths.snapshot(&dataset, &commit.id);
        let mut properties = commit.properties.clone();
        self.backend
            .snapshot(&snapshot, true, &metadata_property(&properties)?)
            .or_no_such(|| no_such_operation(repo, id))?;

        if !properties.contains_key(TIMESTAMP_PROPERTY) {
            let creation = self
                .backend
                .list(&snapshot, &ListQuery::object())
                .map_err(Error::Command)?
                .first()
                .and_then(|e| e.creation)
                .and_then(UtcTimestamp::from_epoch_secs);
            if let Some(ts) = creation {
                properties.insert(TIMESTAMP_PROPERTY.to_string(), Value::from(ts.to_iso8601()));
                self.backend
                    .set_property(&snapshot, props::METADATA, &encode_metadata(&properties)?)
                    .map_err(Error::Command)?;
            }
        }

        info!(repository = %repo, operation = %id, commit = %commit.id, "committed operation");
        Ok(Commit::with_properties(&commit.id, properties))
    }

    /// Destroy the operation's volume set, or leave it to the reaper.
    pub fn discard_operation(&self, repo: &str, id: &str) -> Result<()> {
        let dataset = self.paths.volume_set(repo, id);
        if self.destroy_or_mark(&dataset)? {
            info!(repository = %repo, operation = %id, "discarded operation volume set");
        }
        Ok(())
    }
}
