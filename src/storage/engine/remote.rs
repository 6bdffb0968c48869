//! Remote definitions stored on the repository dataset.

use tracing::info;

use super::{no_such_repository, CommandResultExt, StorageEngine};
use crate::core::error::{Error, Result};
use crate::core::naming;
use crate::core::types::Remote;
use crate::storage::backend::ListQuery;
use crate::storage::props;

fn no_such_remote(repo: &str, name: &str) -> String {
    format!("no such remote '{name}' in repository '{repo}'")
}

fn remote_exists(repo: &str, name: &str) -> String {
    format!("remote '{name}' already exists in repository '{repo}'")
}

impl StorageEngine {
    pub fn list_remotes(&self, repo: &str) -> Result<Vec<Remote>> {
        naming::validate_repository(repo)?;
        let dataset = self.paths.repository(repo);
        let entries = self
            .backend
            .list(&dataset, &ListQuery::object().property(props::REMOTES))
            .or_no_such(|| no_such_repository(repo))?;
        match entries.first().and_then(|e| e.property(props::REMOTES)) {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                Error::InvalidState(format!(
                    "remotes for repository '{repo}' must be valid JSON: {e}"
                ))
            }),
        }
    }

    fn write_remotes(&self, repo: &str, remotes: &[Remote]) -> Result<()> {
        let json = serde_json::to_string(remotes)?;
        self.backend
            .set_property(&self.paths.repository(repo), props::REMOTES, &json)
            .or_no_such(|| no_such_repository(repo))
    }

    pub fn get_remote(&self, repo: &str, name: &str) -> Result<Remote> {
        naming::validate_remote(name)?;
        self.list_remotes(repo)?
            .into_iter()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::no_such(no_such_remote(repo, name)))
    }

    pub fn add_remote(&self, repo: &str, remote: &Remote) -> Result<Remote> {
        naming::validate_remote(&remote.name)?;
        let mut remotes = self.list_remotes(repo)?;
        if remotes.iter().any(|r| r.name == remote.name) {
            return Err(Error::exists(remote_exists(repo, &remote.name)));
        }
        remotes.push(remote.clone());
        self.write_remotes(repo, &remotes)?;
        info!(
            repository = %repo,
            remote = %remote.name,
            provider = %remote.provider,
            "added remote"
        );
        Ok(remote.clone())
    }

    /// Replace remote `name`, renaming it if `remote.name` differs.
    pub fn update_remote(&self, repo: &str, name: &str, remote: &Remote) -> Result<Remote> {
        naming::validate_remote(name)?;
        naming::validate_remote(&remote.name)?;
        let mut remotes = self.list_remotes(repo)?;
        if remote.name != name && remotes.iter().any(|r| r.name == remote.name) {
            return Err(Error::exists(remote_exists(repo, &remote.name)));
        }
        let slot = remotes
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::no_such(no_such_remote(repo, name)))?;
        *slot = remote.clone();
        self.write_remotes(repo, &remotes)?;
        info!(repository = %repo, remote = %name, "updated remote");
        Ok(remote.clone())
    }

    pub fn remove_remote(&self, repo: &str, name: &str) -> Result<()> {
        naming::validate_remote(name)?;
        let mut remotes = self.list_remotes(repo)?;
        let before = remotes.len();
        remotes.retain(|r| r.name != name);
        if remotes.len() == before {
            return Err(Error::no_such(no_such_remote(repo, name)));
        }
        self.write_remotes(repo, &remotes)?;
        info!(repository = %repo, remote = %name, "removed remote");
        Ok(())
    }
}
