//! remote::mock
//!
//! In-memory provider for deterministic testing.
//!
//! # Design
//!
//! The mock keeps a commit catalogue per remote name, records every call
//! made to it, and can be configured to fail a chosen method. Volume
//! transfers move no data but report a start/end phase per volume, so
//! progress streams look like those of a real provider.
//!
//! # Example
//!
//! ```
//! use stratum::core::types::{Commit, Remote, RemoteParameters};
//! use stratum::remote::mock::{MockProvider, MOCK_PROVIDER};
//! use stratum::remote::RemoteProvider;
//!
//! # tokio_test::block_on(async {
//! let provider = MockProvider::new().with_commit("origin", Commit::new("c1"));
//! let remote = Remote::new("origin", MOCK_PROVIDER);
//! let params = RemoteParameters::new(MOCK_PROVIDER);
//!
//! let commit = provider.get_commit(&remote, &params, "c1").await.unwrap();
//! assert_eq!(commit.id, "c1");
//! assert!(provider.get_commit(&remote, &params, "c2").await.is_err());
//! # });
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::traits::{OperationContext, ProviderState, RemoteProvider};
use crate::core::error::{Error, Result};
use crate::core::tags::TagFilter;
use crate::core::types::{Commit, Remote, RemoteParameters, Volume};
use crate::ops::record::ProgressEntry;

/// Discriminator of the mock provider.
pub const MOCK_PROVIDER: &str = "mock";

/// Mock provider. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    inner: Arc<Mutex<MockInner>>,
}

#[derive(Debug, Default)]
struct MockInner {
    /// Commits by remote name, then commit id.
    commits: HashMap<String, BTreeMap<String, Commit>>,
    fail_on: Option<FailOn>,
    calls: Vec<MockCall>,
}

/// Which method should fail, and with what message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOn {
    GetCommit(String),
    StartOperation(String),
    PullVolume(String),
    PushVolume(String),
    PushMetadata(String),
    EndOperation(String),
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ListCommits { remote: String },
    GetCommit { remote: String, commit: String },
    StartOperation { operation: String },
    PullVolume { volume: String },
    PushVolume { volume: String },
    PushMetadata { commit: String, is_update: bool },
    EndOperation { operation: String },
    FailOperation { operation: String },
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `remote` with a commit.
    pub fn with_commit(self, remote: &str, commit: Commit) -> Self {
        self.lock()
            .commits
            .entry(remote.to_string())
            .or_default()
            .insert(commit.id.clone(), commit);
        self
    }

    /// Fail the given method until [`clear_fail_on`](Self::clear_fail_on).
    pub fn fail_on(self, fail_on: FailOn) -> Self {
        self.lock().fail_on = Some(fail_on);
        self
    }

    pub fn clear_fail_on(&self) {
        self.lock().fail_on = None;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Commit as stored on `remote` (for test verification).
    pub fn commit(&self, remote: &str, id: &str) -> Option<Commit> {
        self.lock().commits.get(remote)?.get(id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: MockCall) {
        self.lock().calls.push(call);
    }

    fn check_fail(&self, method: fn(&FailOn) -> Option<&String>) -> Result<()> {
        match self.lock().fail_on.as_ref().and_then(method) {
            Some(message) => Err(Error::Remote(message.clone())),
            None => Ok(()),
        }
    }

    fn transfer(&self, ctx: &OperationContext, volume: &Volume, verb: &str) {
        ctx.add_progress(ProgressEntry::start(format!("{verb} {}", volume.description())));
        ctx.add_progress(ProgressEntry::end());
    }
}

#[async_trait]
impl RemoteProvider for MockProvider {
    fn name(&self) -> &'static str {
        MOCK_PROVIDER
    }

    async fn list_commits(
        &self,
        remote: &Remote,
        _params: &RemoteParameters,
        tags: &TagFilter,
    ) -> Result<Vec<Commit>> {
        self.record(MockCall::ListCommits {
            remote: remote.name.clone(),
        });
        let commits = self
            .lock()
            .commits
            .get(&remote.name)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        Ok(tags.filter(commits))
    }

    async fn get_commit(
        &self,
        remote: &Remote,
        _params: &RemoteParameters,
        commit_id: &str,
    ) -> Result<Commit> {
        self.record(MockCall::GetCommit {
            remote: remote.name.clone(),
            commit: commit_id.to_string(),
        });
        self.check_fail(|f| match f {
            FailOn::GetCommit(m) => Some(m),
            _ => None,
        })?;
        self.commit(&remote.name, commit_id).ok_or_else(|| {
            Error::no_such(format!(
                "no such commit '{commit_id}' in remote '{}'",
                remote.name
            ))
        })
    }

    async fn start_operation(&self, ctx: &OperationContext) -> Result<ProviderState> {
        self.record(MockCall::StartOperation {
            operation: ctx.operation.id.clone(),
        });
        self.check_fail(|f| match f {
            FailOn::StartOperation(m) => Some(m),
            _ => None,
        })?;
        Ok(Box::new(ctx.operation.id.clone()))
    }

    async fn end_operation(&self, ctx: &OperationContext, _state: &ProviderState) -> Result<()> {
        self.record(MockCall::EndOperation {
            operation: ctx.operation.id.clone(),
        });
        self.check_fail(|f| match f {
            FailOn::EndOperation(m) => Some(m),
            _ => None,
        })
    }

    async fn fail_operation(&self, ctx: &OperationContext, _state: &ProviderState) -> Result<()> {
        self.record(MockCall::FailOperation {
            operation: ctx.operation.id.clone(),
        });
        Ok(())
    }

    async fn pull_volume(
        &self,
        ctx: &OperationContext,
        _state: &ProviderState,
        volume: &Volume,
        _mountpoint: &Path,
        _scratch: &Path,
    ) -> Result<()> {
        self.record(MockCall::PullVolume {
            volume: volume.name.clone(),
        });
        self.check_fail(|f| match f {
            FailOn::PullVolume(m) => Some(m),
            _ => None,
        })?;
        self.transfer(ctx, volume, "Pulling");
        Ok(())
    }

    async fn push_volume(
        &self,
        ctx: &OperationContext,
        _state: &ProviderState,
        volume: &Volume,
        _mountpoint: &Path,
        _scratch: &Path,
    ) -> Result<()> {
        self.record(MockCall::PushVolume {
            volume: volume.name.clone(),
        });
        self.check_fail(|f| match f {
            FailOn::PushVolume(m) => Some(m),
            _ => None,
        })?;
        self.transfer(ctx, volume, "Pushing");
        Ok(())
    }

    async fn push_metadata(
        &self,
        ctx: &OperationContext,
        _state: &ProviderState,
        commit: &Commit,
        is_update: bool,
    ) -> Result<()> {
        self.record(MockCall::PushMetadata {
            commit: commit.id.clone(),
            is_update,
        });
        self.check_fail(|f| match f {
            FailOn::PushMetadata(m) => Some(m),
            _ => None,
        })?;

        let mut inner = self.lock();
        let catalogue = inner.commits.entry(ctx.remote.name.clone()).or_default();
        if is_update && !catalogue.contains_key(&commit.id) {
            return Err(Error::no_such(format!(
                "no such commit '{}' in remote '{}'",
                commit.id, ctx.remote.name
            )));
        }
        catalogue.insert(commit.id.clone(), commit.clone());
        Ok(())
    }
}
