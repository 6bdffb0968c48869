//! Volumes of the active volume set.

use serde_json::Value;
use tracing::{info, warn};

use super::{decode_metadata, metadata_property, CommandResultExt, StorageEngine};
use crate::core::error::{Error, Result};
use crate::core::naming::{self, INITIAL_COMMIT, RESERVED_VOLUME_PREFIX};
use crate::core::types::{Properties, Volume, VolumeStatus, MOUNTPOINT_CONFIG};
use crate::storage::backend::{DatasetEntry, DestroyMode, KindFilter, ListQuery, PropertyMap};
use crate::storage::props;

fn no_such_volume(repo: &str, name: &str) -> String {
    format!("no such volume '{name}' in repository '{repo}'")
}

/// Deleted volumes waiting for the reaper are no longer visible.
fn is_reaping(entry: &DatasetEntry) -> bool {
    entry.property(props::REAP) == Some(props::REAP_PENDING)
}

impl StorageEngine {
    fn volume_from_entry(&self, repo: &str, name: &str, entry: &DatasetEntry) -> Result<Volume> {
        let mut config = Properties::new();
        config.insert(
            MOUNTPOINT_CONFIG.to_string(),
            Value::from(
                self.paths
                    .volume_mountpoint(repo, name)
                    .to_string_lossy()
                    .to_string(),
            ),
        );
        Ok(Volume {
            name: name.to_string(),
            config,
            properties: decode_metadata(entry)?,
        })
    }

    /// Create a volume in the active volume set.
    ///
    /// The volume gets its own `initial` snapshot so it can seed workspaces.
    pub fn create_volume(
        &self,
        repo: &str,
        name: &str,
        properties: &Properties,
    ) -> Result<Volume> {
        naming::validate_volume(name)?;
        let guid = self.active_volume_set(repo)?;
        let dataset = self.paths.volume(repo, &guid, name);

        self.backend
            .create(&dataset, &metadata_property(properties)?)
            .or_exists(|| format!("volume '{name}' already exists in repository '{repo}'"))?;
        self.backend
            .snapshot(
                &self.paths.snapshot(&dataset, INITIAL_COMMIT),
                false,
                &PropertyMap::new(),
            )
            .map_err(Error::Command)?;

        info!(repository = %repo, volume = %name, "created volume");
        self.get_volume(repo, name)
    }

    pub fn get_volume(&self, repo: &str, name: &str) -> Result<Volume> {
        naming::validate_volume(name)?;
        let guid = self.active_volume_set(repo)?;
        let dataset = self.paths.volume(repo, &guid, name);
        let entries = self
            .backend
            .list(
                &dataset,
                &ListQuery::object()
                    .property(props::METADATA)
                    .property(props::REAP),
            )
            .or_no_such(|| no_such_volume(repo, name))?;
        let entry = entries
            .first()
            .filter(|e| !is_reaping(e))
            .ok_or_else(|| Error::no_such(no_such_volume(repo, name)))?;
        self.volume_from_entry(repo, name, entry)
    }

    /// User volumes of the active volume set. Reserved volumes are hidden.
    pub fn list_volumes(&self, repo: &str) -> Result<Vec<Volume>> {
        let guid = self.active_volume_set(repo)?;
        let dataset = self.paths.volume_set(repo, &guid);
        let query = ListQuery::default()
            .depth(1)
            .kind(KindFilter::Filesystems)
            .property(props::METADATA)
            .property(props::REAP);
        let entries = self
            .backend
            .list(&dataset, &query)
            .or_no_such(|| super::no_such_repository(repo))?;

        entries
            .iter()
            .filter(|e| !is_reaping(e))
            .filter_map(|e| {
                let volume = self.paths.parse(&e.name)?.volume?;
                (!volume.starts_with(RESERVED_VOLUME_PREFIX)).then_some((volume, e))
            })
            .map(|(volume, e)| self.volume_from_entry(repo, volume, e))
            .collect()
    }

    /// Destroy a volume and its mountpoint.
    ///
    /// A volume whose snapshots still seed clones elsewhere, e.g. the
    /// workspace of a pull, is hidden and left to the reaper.
    pub fn delete_volume(&self, repo: &str, name: &str) -> Result<()> {
        self.get_volume(repo, name)?;
        let guid = self.active_volume_set(repo)?;
        let dataset = self.paths.volume(repo, &guid, name);
        match self.backend.destroy(&dataset, DestroyMode::recursive()) {
            Ok(()) => {}
            Err(e) if e.is_does_not_exist() => {
                return Err(Error::no_such(no_such_volume(repo, name)));
            }
            Err(e) if e.is_dependent_clones() => {
                warn!(
                    dataset = %dataset,
                    error = %e,
                    "volume still has clones, deferring to reaper"
                );
                self.mark_for_destruction(&dataset)?;
            }
            Err(e) => return Err(Error::Command(e)),
        }

        let mountpoint = self.paths.volume_mountpoint(repo, name);
        if let Err(e) = self.backend.remove_mountpoint(&mountpoint) {
            warn!(mountpoint = %mountpoint.display(), error = %e, "failed to remove mountpoint");
        }
        info!(repository = %repo, volume = %name, "deleted volume");
        Ok(())
    }

    /// Mount a volume at its stable path, independent of the active GUID.
    pub fn mount_volume(&self, repo: &str, name: &str) -> Result<Volume> {
        let volume = self.get_volume(repo, name)?;
        let guid = self.active_volume_set(repo)?;
        let mountpoint = self.paths.volume_mountpoint(repo, name);
        self.backend
            .mount(&self.paths.volume(repo, &guid, name), &mountpoint)
            .map_err(Error::Command)?;
        info!(
            repository = %repo,
            volume = %name,
            mountpoint = %mountpoint.display(),
            "mounted volume"
        );
        Ok(volume)
    }

    /// Unmount a volume. Not being mounted is not an error.
    pub fn unmount_volume(&self, repo: &str, name: &str) -> Result<()> {
        naming::validate_volume(name)?;
        self.active_volume_set(repo)?;
        let mountpoint = self.paths.volume_mountpoint(repo, name);
        self.safe_unmount(&mountpoint)
    }

    pub fn get_volume_status(&self, repo: &str, name: &str) -> Result<VolumeStatus> {
        naming::validate_volume(name)?;
        let guid = self.active_volume_set(repo)?;
        let dataset = self.paths.volume(repo, &guid, name);
        let entries = self
            .backend
            .list(&dataset, &ListQuery::object())
            .or_no_such(|| no_such_volume(repo, name))?;
        let entry = entries
            .first()
            .ok_or_else(|| Error::no_such(no_such_volume(repo, name)))?;
        let ready = self
            .backend
            .is_mounted(&self.paths.volume_mountpoint(repo, name))?;
        Ok(VolumeStatus {
            name: name.to_string(),
            logical_size: entry.space.logical,
            actual_size: entry.space.referenced,
            ready,
        })
    }

    pub(crate) fn safe_unmount(&self, mountpoint: &std::path::Path) -> Result<()> {
        if !self.backend.is_mounted(mountpoint)? {
            return Ok(());
        }
        match self.backend.unmount(mountpoint) {
            Ok(()) => Ok(()),
            Err(e) if e.output.contains("not mounted") => Ok(()),
            Err(e) => Err(Error::Command(e)),
        }
    }
}
