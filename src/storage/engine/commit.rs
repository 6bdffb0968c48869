//! Commits, checkout and commit deletion.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    decode_metadata, encode_metadata, metadata_property, no_such_commit, no_such_repository,
    CommandResultExt, StorageEngine,
};
use crate::core::error::{Error, Result};
use crate::core::naming::{self, INITIAL_COMMIT, RESERVED_VOLUME_PREFIX};
use crate::core::tags::TagFilter;
use crate::core::types::{Commit, CommitStatus, Properties, UtcTimestamp, TIMESTAMP_PROPERTY};
use crate::storage::backend::{DatasetKind, DestroyMode, KindFilter, ListQuery, PropertyMap};
use crate::storage::props;

impl StorageEngine {
    /// Find the volume set holding commit `id`.
    ///
    /// Scans every commit-level snapshot in the repository, skipping those
    /// pending deferred destruction. Linear in the number of snapshots.
    pub fn locate_commit(&self, repo: &str, id: &str) -> Result<Option<String>> {
        naming::validate_repository(repo)?;
        naming::validate_commit_or_initial(id)?;
        let dataset = self.paths.repository(repo);
        let query = ListQuery::default().depth(2).kind(KindFilter::Snapshots);
        let entries = self
            .backend
            .list(&dataset, &query)
            .or_no_such(|| no_such_repository(repo))?;

        Ok(entries.iter().find_map(|e| {
            if e.defer_destroy {
                return None;
            }
            let parsed = self.paths.parse(&e.name)?;
            match (parsed.volume_set, parsed.volume, parsed.snapshot) {
                (Some(guid), None, Some(snap)) if snap == id => Some(guid.to_string()),
                _ => None,
            }
        }))
    }

    fn require_commit(&self, repo: &str, id: &str) -> Result<String> {
        self.locate_commit(repo, id)?
            .ok_or_else(|| Error::no_such(no_such_commit(repo, id)))
    }

    /// Stamp the snapshot's creation time into the commit metadata.
    fn stamp_timestamp(&self, snapshot: &str, properties: &mut Properties) -> Result<()> {
        let entries = self
            .backend
            .list(snapshot, &ListQuery::object())
            .map_err(Error::Command)?;
        let timestamp = entries
            .first()
            .and_then(|e| e.creation)
            .and_then(UtcTimestamp::from_epoch_secs)
            .ok_or_else(|| {
                Error::InvalidState(format!("snapshot '{snapshot}' has no creation time"))
            })?;
        properties.insert(
            TIMESTAMP_PROPERTY.to_string(),
            Value::from(timestamp.to_iso8601()),
        );
        self.backend
            .set_property(snapshot, props::METADATA, &encode_metadata(properties)?)
            .map_err(Error::Command)
    }

    /// Snapshot the active volume set as commit `commit.id`.
    ///
    /// The returned commit carries a `timestamp` property read back from the
    /// snapshot's creation time.
    ///
    /// # Errors
    ///
    /// - [`Error::ObjectExists`] if the id exists on any volume set
    /// - [`Error::NoSuchObject`] if the repository does not exist
    pub fn create_commit(&self, repo: &str, commit: &Commit) -> Result<Commit> {
        naming::validate_commit(&commit.id)?;
        let guid = self.active_volume_set(repo)?;
        if self.locate_commit(repo, &commit.id)?.is_some() {
            return Err(Error::exists(format!(
                "commit '{}' already exists in repository '{repo}'",
                commit.id
            )));
        }

        let snapshot = self
            .paths
            .snapshot(&self.paths.volume_set(repo, &guid), &commit.id);
        let mut properties = commit.properties.clone();
        self.backend
            .snapshot(&snapshot, true, &metadata_property(&properties)?)
            .or_exists(|| {
                format!("commit '{}' already exists in repository '{repo}'", commit.id)
            })?;
        self.stamp_timestamp(&snapshot, &mut properties)?;

        info!(repository = %repo, commit = %commit.id, volume_set = %guid, "created commit");
        Ok(Commit::with_properties(&commit.id, properties))
    }

    pub fn get_commit(&self, repo: &str, id: &str) -> Result<Commit> {
        naming::validate_commit(id)?;
        let guid = self.require_commit(repo, id)?;
        let snapshot = self.paths.snapshot(&self.paths.volume_set(repo, &guid), id);
        let entries = self
            .backend
            .list(&snapshot, &ListQuery::object().property(props::METADATA))
            .or_no_such(|| no_such_commit(repo, id))?;
        let entry = entries
            .first()
            .ok_or_else(|| Error::no_such(no_such_commit(repo, id)))?;
        Ok(Commit::with_properties(id, decode_metadata(entry)?))
    }

    /// All user commits in the repository, newest first.
    pub fn list_commits(&self, repo: &str, tags: &TagFilter) -> Result<Vec<Commit>> {
        naming::validate_repository(repo)?;
        let dataset = self.paths.repository(repo);
        let query = ListQuery::default()
            .depth(2)
            .kind(KindFilter::Snapshots)
            .property(props::METADATA);
        let mut entries = self
            .backend
            .list(&dataset, &query)
            .or_no_such(|| no_such_repository(repo))?;
        entries.sort_by(|a, b| b.creation.cmp(&a.creation));

        let mut seen = HashSet::new();
        let mut commits = Vec::new();
        for entry in &entries {
            if entry.defer_destroy {
                continue;
            }
            let Some(id) = self
                .paths
                .parse(&entry.name)
                .filter(|p| p.volume.is_none())
                .and_then(|p| p.snapshot)
            else {
                continue;
            };
            if id == INITIAL_COMMIT || !seen.insert(id.to_string()) {
                continue;
            }
            commits.push(Commit::with_properties(id, decode_metadata(entry)?));
        }
        Ok(tags.filter(commits))
    }

    /// Replace a commit's metadata.
    ///
    /// The stored timestamp is kept unless the new properties carry one.
    pub fn update_commit(&self, repo: &str, commit: &Commit) -> Result<Commit> {
        let existing = self.get_commit(repo, &commit.id)?;
        let guid = self.require_commit(repo, &commit.id)?;
        let mut properties = commit.properties.clone();
        if !properties.contains_key(TIMESTAMP_PROPERTY) {
            if let Some(ts) = existing.properties.get(TIMESTAMP_PROPERTY) {
                properties.insert(TIMESTAMP_PROPERTY.to_string(), ts.clone());
            }
        }
        let snapshot = self
            .paths
            .snapshot(&self.paths.volume_set(repo, &guid), &commit.id);
        self.backend
            .set_property(&snapshot, props::METADATA, &encode_metadata(&properties)?)
            .or_no_such(|| no_such_commit(repo, &commit.id))?;
        info!(repository = %repo, commit = %commit.id, "updated commit");
        Ok(Commit::with_properties(&commit.id, properties))
    }

    /// Sum the space of every per-volume snapshot making up the commit.
    pub fn get_commit_status(&self, repo: &str, id: &str) -> Result<CommitStatus> {
        naming::validate_commit(id)?;
        let guid = self.require_commit(repo, id)?;
        let dataset = self.paths.volume_set(repo, &guid);
        let query = ListQuery::default().kind(KindFilter::Snapshots);
        let entries = self
            .backend
            .list(&dataset, &query)
            .or_no_such(|| no_such_commit(repo, id))?;

        Ok(entries
            .iter()
            .filter(|e| e.dataset() != dataset && e.snapshot_name() == Some(id))
            .fold(CommitStatus::default(), |mut status, e| {
                status.logical_size += e.space.logical;
                status.actual_size += e.space.referenced;
                status.unique_size += e.space.used;
                status
            }))
    }

    /// Clone every user volume of `guid@commit` into a new volume set.
    pub(crate) fn clone_volume_set(
        &self,
        repo: &str,
        guid: &str,
        commit: &str,
        new_guid: &str,
    ) -> Result<()> {
        let source = self.paths.volume_set(repo, guid);
        let query = ListQuery::default()
            .depth(1)
            .kind(KindFilter::Filesystems)
            .property(props::METADATA);
        let volumes = self
            .backend
            .list(&source, &query)
            .or_no_such(|| no_such_commit(repo, commit))?;

        let target = self.paths.volume_set(repo, new_guid);
        let mut set_properties = PropertyMap::new();
        if commit != INITIAL_COMMIT {
            set_properties.insert(props::SOURCE.to_string(), commit.to_string());
        }
        self.backend
            .create(&target, &set_properties)
            .or_exists(|| {
                format!("volume set '{new_guid}' already exists in repository '{repo}'")
            })?;

        let cloned = volumes.iter().try_for_each(|entry| {
            let Some(volume) = self.paths.parse(&entry.name).and_then(|p| p.volume) else {
                return Ok(());
            };
            if volume.starts_with(RESERVED_VOLUME_PREFIX) {
                return Ok(());
            }
            let mut properties = PropertyMap::new();
            if let Some(metadata) = entry.property(props::METADATA) {
                properties.insert(props::METADATA.to_string(), metadata.to_string());
            }
            self.backend.clone_snapshot(
                &self.paths.snapshot(&entry.name, commit),
                &self.paths.volume(repo, new_guid, volume),
                &properties,
            )
        });

        if let Err(e) = cloned {
            if let Err(cleanup) = self.backend.destroy(&target, DestroyMode::recursive()) {
                warn!(dataset = %target, error = %cleanup, "failed to clean up partial clone");
            }
            return Err(Error::Command(e));
        }
        Ok(())
    }

    /// Clone the commit into a new volume set and make it active.
    ///
    /// The previously active volume set is left untouched.
    pub fn checkout_commit(&self, repo: &str, id: &str) -> Result<String> {
        naming::validate_commit(id)?;
        let guid = self.require_commit(repo, id)?;
        let new_guid = Uuid::new_v4().to_string();
        self.clone_volume_set(repo, &guid, id, &new_guid)?;
        self.set_active_volume_set(repo, &new_guid)?;
        info!(repository = %repo, commit = %id, volume_set = %new_guid, "checked out commit");
        Ok(new_guid)
    }

    /// Delete a commit.
    ///
    /// Snapshots still referenced by clones are destroyed deferred. A volume
    /// set left inactive with no commits is destroyed, or marked for the
    /// reaper if clones still depend on it.
    pub fn delete_commit(&self, repo: &str, id: &str) -> Result<()> {
        naming::validate_commit(id)?;
        let guid = self.require_commit(repo, id)?;
        let dataset = self.paths.volume_set(repo, &guid);
        self.backend
            .destroy(&self.paths.snapshot(&dataset, id), DestroyMode::recursive_deferred())
            .or_no_such(|| no_such_commit(repo, id))?;
        info!(repository = %repo, commit = %id, volume_set = %guid, "deleted commit");

        if self.active_volume_set(repo)? == guid {
            return Ok(());
        }

        let query = ListQuery::default().depth(1).kind(KindFilter::Snapshots);
        let remaining = self
            .backend
            .list(&dataset, &query)
            .map_err(Error::Command)?
            .iter()
            .filter(|e| {
                e.kind == DatasetKind::Snapshot && e.dataset() == dataset && !e.defer_destroy
            })
            .count();
        if remaining == 0 {
            self.destroy_or_mark(&dataset)?;
        }
        Ok(())
    }
}
