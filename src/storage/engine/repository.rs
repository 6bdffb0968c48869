//! Repository lifecycle and status.

use tracing::{info, warn};
use uuid::Uuid;

use super::{
    decode_metadata, metadata_property, no_such_repository, CommandResultExt, StorageEngine,
};
use crate::core::error::{Error, Result};
use crate::core::naming::{self, INITIAL_COMMIT, RESERVED_VOLUME_PREFIX};
use crate::core::types::{Repository, RepositoryStatus, VolumeStatus};
use crate::storage::backend::{DatasetKind, DestroyMode, KindFilter, ListQuery, PropertyMap};
use crate::storage::props;

impl StorageEngine {
    /// Create a repository with a seed volume set and its `initial` commit.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidName`] for a malformed name
    /// - [`Error::ObjectExists`] if the repository already exists
    pub fn create_repository(&self, repo: &Repository) -> Result<Repository> {
        naming::validate_repository(&repo.name)?;
        self.initialize()?;

        let dataset = self.paths.repository(&repo.name);
        let guid = Uuid::new_v4().to_string();

        let mut properties = metadata_property(&repo.properties)?;
        properties.insert(props::ACTIVE.to_string(), guid.clone());
        self.backend
            .create(&dataset, &properties)
            .or_exists(|| format!("repository '{}' already exists", repo.name))?;

        let seed = self.paths.volume_set(&repo.name, &guid);
        let seeded = self
            .backend
            .create(&seed, &PropertyMap::new())
            .and_then(|_| {
                self.backend.snapshot(
                    &self.paths.snapshot(&seed, INITIAL_COMMIT),
                    true,
                    &PropertyMap::new(),
                )
            });
        if let Err(e) = seeded {
            if let Err(cleanup) = self.backend.destroy(&dataset, DestroyMode::recursive()) {
                warn!(
                    dataset = %dataset,
                    error = %cleanup,
                    "failed to clean up partial repository"
                );
            }
            return Err(Error::Command(e));
        }

        info!(repository = %repo.name, volume_set = %guid, "created repository");
        Ok(repo.clone())
    }

    pub fn get_repository(&self, name: &str) -> Result<Repository> {
        naming::validate_repository(name)?;
        let dataset = self.paths.repository(name);
        let entries = self
            .backend
            .list(&dataset, &ListQuery::object().property(props::METADATA))
            .or_no_such(|| no_such_repository(name))?;
        let entry = entries
            .first()
            .ok_or_else(|| Error::no_such(no_such_repository(name)))?;
        Ok(Repository::with_properties(name, decode_metadata(entry)?))
    }

    pub fn list_repositories(&self) -> Result<Vec<Repository>> {
        let root = self.paths.repo_root();
        let query = ListQuery::default()
            .depth(1)
            .kind(KindFilter::Filesystems)
            .property(props::METADATA);
        let entries = match self.backend.list(&root, &query) {
            Ok(entries) => entries,
            Err(e) if e.is_does_not_exist() => return Ok(Vec::new()),
            Err(e) => return Err(Error::Command(e)),
        };

        entries
            .iter()
            .filter(|e| e.name != root)
            .filter_map(|e| self.paths.parse(&e.name).map(|p| (p.repo.to_string(), e)))
            .map(|(name, e)| Ok(Repository::with_properties(name, decode_metadata(e)?)))
            .collect()
    }

    /// Replace a repository's metadata, renaming it if `repo.name` differs.
    pub fn update_repository(&self, name: &str, repo: &Repository) -> Result<Repository> {
        naming::validate_repository(name)?;
        naming::validate_repository(&repo.name)?;
        self.get_repository(name)?;

        let mut dataset = self.paths.repository(name);
        if repo.name != name {
            let target = self.paths.repository(&repo.name);
            self.backend
                .rename(&dataset, &target)
                .or_exists(|| format!("repository '{}' already exists", repo.name))?;
            info!(from = %name, to = %repo.name, "renamed repository");
            dataset = target;
        }

        let json = super::encode_metadata(&repo.properties)?;
        self.backend
            .set_property(&dataset, props::METADATA, &json)
            .or_no_such(|| no_such_repository(&repo.name))?;
        Ok(repo.clone())
    }

    /// Destroy a repository and everything beneath it.
    pub fn delete_repository(&self, name: &str) -> Result<()> {
        let volumes = self.list_volumes(name)?;
        let dataset = self.paths.repository(name);
        self.backend
            .destroy(&dataset, DestroyMode::recursive())
            .or_no_such(|| no_such_repository(name))?;

        for volume in volumes {
            let mountpoint = self.paths.volume_mountpoint(name, &volume.name);
            if let Err(e) = self.backend.remove_mountpoint(&mountpoint) {
                warn!(
                    mountpoint = %mountpoint.display(),
                    error = %e,
                    "failed to remove mountpoint"
                );
            }
        }
        let mountpoint = self.paths.repository_mountpoint(name);
        if let Err(e) = self.backend.remove_mountpoint(&mountpoint) {
            warn!(mountpoint = %mountpoint.display(), error = %e, "failed to remove mountpoint");
        }

        info!(repository = %name, "deleted repository");
        Ok(())
    }

    /// GUID of the repository's active volume set.
    pub fn active_volume_set(&self, repo: &str) -> Result<String> {
        naming::validate_repository(repo)?;
        let dataset = self.paths.repository(repo);
        let entries = self
            .backend
            .list(&dataset, &ListQuery::object().property(props::ACTIVE))
            .or_no_such(|| no_such_repository(repo))?;
        entries
            .first()
            .and_then(|e| e.property(props::ACTIVE))
            .map(str::to_string)
            .ok_or_else(|| {
                Error::InvalidState(format!("repository '{repo}' has no active volume set"))
            })
    }

    pub(crate) fn set_active_volume_set(&self, repo: &str, guid: &str) -> Result<()> {
        self.backend
            .set_property(&self.paths.repository(repo), props::ACTIVE, guid)
            .or_no_such(|| no_such_repository(repo))?;
        info!(repository = %repo, volume_set = %guid, "activated volume set");
        Ok(())
    }

    /// Space accounting and provenance of the active volume set.
    pub fn get_repository_status(&self, repo: &str) -> Result<RepositoryStatus> {
        let guid = self.active_volume_set(repo)?;
        let dataset = self.paths.volume_set(repo, &guid);
        let query = ListQuery::default()
            .depth(2)
            .property(props::SOURCE)
            .property(props::METADATA);
        let entries = self
            .backend
            .list(&dataset, &query)
            .or_no_such(|| no_such_repository(repo))?;

        let mut status = RepositoryStatus::default();
        let mut newest: Option<(i64, String)> = None;

        for entry in &entries {
            if entry.name == dataset {
                status.source_commit = entry.property(props::SOURCE).map(str::to_string);
                continue;
            }
            let Some(parsed) = self.paths.parse(&entry.name) else {
                continue;
            };
            match (entry.kind, parsed.volume, parsed.snapshot) {
                (DatasetKind::Filesystem, Some(volume), None)
                    if !volume.starts_with(RESERVED_VOLUME_PREFIX) =>
                {
                    let ready = self
                        .backend
                        .is_mounted(&self.paths.volume_mountpoint(repo, volume))?;
                    status.logical_size += entry.space.logical;
                    status.actual_size += entry.space.referenced;
                    status.volumes.push(VolumeStatus {
                        name: volume.to_string(),
                        logical_size: entry.space.logical,
                        actual_size: entry.space.referenced,
                        ready,
                    });
                }
                (DatasetKind::Snapshot, None, Some(id))
                    if id != INITIAL_COMMIT && !entry.defer_destroy =>
                {
                    let creation = entry.creation.unwrap_or_default();
                    if newest.as_ref().map_or(true, |(t, _)| creation >= *t) {
                        newest = Some((creation, id.to_string()));
                    }
                }
                _ => {}
            }
        }

        status.last_commit = newest.map(|(_, id)| id);
        Ok(status)
    }
}
