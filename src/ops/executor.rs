//! ops::executor
//!
//! Runs one push or pull to completion.
//!
//! # Architecture
//!
//! An executor is spawned per operation and owns everything the operation
//! touches: its private volume set, the provider state and the
//! cancellation signal. It reports progress through a sink and never sees
//! the operation table.
//!
//! The sequence is:
//!
//! 1. make sure the workspace exists (idempotent, so resumed operations
//!    pick up where they left off)
//! 2. for a pull, fetch the commit from the remote
//! 3. start the provider
//! 4. transfer each volume, or for a metadata-only pull update the local
//!    commit
//! 5. for a push, send the commit metadata
//! 6. end the provider
//!
//! Whatever the outcome, the workspace is then finalized: a successful data
//! pull becomes the new commit; anything else is discarded and the reaper
//! is nudged. Only after finalization does the executor emit the terminal
//! progress entry, so an observer seeing `COMPLETE` can rely on the commit
//! being present.
//!
//! Cancellation is checked before every storage step and races every
//! provider call. A storage call that has started is allowed to finish.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::core::error::{Error, Result};
use crate::core::types::{Commit, Remote};
use crate::remote::{CancelSignal, OperationContext, ProgressSink, ProviderState, RemoteProvider};
use crate::storage::engine::SCRATCH_VOLUME;
use crate::storage::{Reaper, StorageEngine};

use super::record::{OperationRecord, OperationType, ProgressEntry};

/// Message emitted first by an operation resumed after a restart.
pub const RESUME_MESSAGE: &str = "Retrying operation after restart";

/// A single operation's background task.
pub(crate) struct Executor {
    record: OperationRecord,
    remote: Remote,
    provider: Arc<dyn RemoteProvider>,
    storage: StorageEngine,
    reaper: Option<Reaper>,
    progress: ProgressSink,
    cancel: CancelSignal,
    resumed: bool,
}

impl Executor {
    pub(crate) fn new(
        record: OperationRecord,
        remote: Remote,
        provider: Arc<dyn RemoteProvider>,
        storage: StorageEngine,
        reaper: Option<Reaper>,
        progress: ProgressSink,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            record,
            remote,
            provider,
            storage,
            reaper,
            progress,
            cancel,
            resumed: false,
        }
    }

    /// Mark the executor as resuming an operation interrupted by a restart.
    pub(crate) fn resumed(mut self, resumed: bool) -> Self {
        self.resumed = resumed;
        self
    }

    /// Whether a resumed pull already committed before the restart.
    ///
    /// A committed pull leaves the commit on the volume set named after the
    /// operation, so finding it there means finalization finished but the
    /// terminal state was never recorded.
    async fn already_committed(&self) -> Result<bool> {
        if !self.resumed || self.kind() != OperationType::Pull || self.record.metadata_only {
            return Ok(false);
        }
        let repo = self.repo().to_string();
        let id = self.id().to_string();
        let commit_id = self.record.operation.commit_id.clone();
        self.storage_uninterruptible(move |s| {
            Ok(s.locate_commit(&repo, &commit_id)?.as_deref() == Some(id.as_str()))
        })
        .await
    }

    fn repo(&self) -> &str {
        &self.record.repository
    }

    fn id(&self) -> &str {
        self.record.id()
    }

    fn kind(&self) -> OperationType {
        self.record.operation.kind
    }

    fn context(&self) -> OperationContext {
        OperationContext::new(
            self.repo(),
            self.record.operation.clone(),
            self.remote.clone(),
            self.record.params.clone(),
            self.record.metadata_only,
            self.progress.clone(),
            self.cancel.clone(),
        )
    }

    /// Run a storage call on the blocking pool after a cancellation check.
    async fn storage<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StorageEngine) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        self.storage_uninterruptible(f).await
    }

    /// Run a storage call on the blocking pool regardless of cancellation.
    async fn storage_uninterruptible<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StorageEngine) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || f(&storage))
            .await
            .map_err(|e| Error::Internal(format!("storage task failed: {e}")))?
    }

    /// Drive the operation to a terminal state.
    pub(crate) async fn run(self) {
        match self.already_committed().await {
            Ok(true) => {
                info!(
                    repository = %self.repo(),
                    operation = %self.id(),
                    "operation finished before restart"
                );
                (self.progress)(ProgressEntry::complete());
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    repository = %self.repo(),
                    operation = %self.id(),
                    error = %e,
                    "cannot tell whether operation committed before restart, running it again"
                );
            }
        }

        let ctx = self.context();
        let mut state: Option<ProviderState> = None;
        let mut commit: Option<Commit> = None;

        let outcome = self.execute(&ctx, &mut state, &mut commit).await;
        let finalized = self.finalize(outcome.is_ok(), commit).await;

        if outcome.is_err() || finalized.is_err() {
            if let Some(state) = &state {
                if let Err(e) = self.provider.fail_operation(&ctx, state).await {
                    warn!(operation = %self.id(), error = %e, "provider failed to clean up");
                }
            }
        }

        let terminal = match (&outcome, &finalized) {
            (Ok(()), Ok(())) => {
                info!(repository = %self.repo(), operation = %self.id(), "operation complete");
                ProgressEntry::complete()
            }
            (Err(Error::Interrupted), _) => {
                info!(repository = %self.repo(), operation = %self.id(), "operation aborted");
                ProgressEntry::abort()
            }
            (Err(e), _) | (Ok(()), Err(e)) => {
                error!(
                    repository = %self.repo(),
                    operation = %self.id(),
                    error = %e,
                    "operation failed"
                );
                ProgressEntry::failed(e.to_string())
            }
        };
        (self.progress)(terminal);
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        state: &mut Option<ProviderState>,
        commit: &mut Option<Commit>,
    ) -> Result<()> {
        let kind = self.kind();
        let commit_id = self.record.operation.commit_id.clone();

        if !self.record.metadata_only {
            self.prepare_workspace().await?;
        }

        if kind == OperationType::Pull {
            let fetched = self
                .provider
                .get_commit(&self.remote, &self.record.params, &commit_id);
            let fetched = ctx.cancellable(fetched).await?;
            *commit = Some(fetched);
        }

        let started = ctx.cancellable(self.provider.start_operation(ctx)).await?;
        let state = state.insert(started);

        if !self.record.metadata_only {
            self.sync_data(ctx, state).await?;
        } else if let (OperationType::Pull, Some(remote_commit)) = (kind, commit.as_ref()) {
            let repo = self.repo().to_string();
            let remote_commit = remote_commit.clone();
            self.storage(move |s| s.update_commit(&repo, &remote_commit))
                .await?;
        }

        if kind == OperationType::Push {
            let repo = self.repo().to_string();
            let local = self
                .storage(move |s| s.get_commit(&repo, &commit_id))
                .await?;
            ctx.cancellable(
                self.provider
                    .push_metadata(ctx, state, &local, self.record.metadata_only),
            )
            .await?;
        }

        ctx.cancellable(self.provider.end_operation(ctx, state)).await
    }

    /// Create the operation's volume set and scratch volume if missing.
    async fn prepare_workspace(&self) -> Result<()> {
        let repo = self.repo().to_string();
        let id = self.id().to_string();
        let source = match self.kind() {
            OperationType::Push => Some(self.record.operation.commit_id.clone()),
            OperationType::Pull => None,
        };

        self.storage(move |s| {
            if !s.operation_exists(&repo, &id)? {
                s.create_operation(&repo, &id, source.as_deref())?;
            }
            s.create_operation_scratch(&repo, &id)
        })
        .await
    }

    async fn mount(&self, volume: &str) -> Result<PathBuf> {
        let repo = self.repo().to_string();
        let id = self.id().to_string();
        let volume = volume.to_string();
        self.storage(move |s| s.mount_operation_volume(&repo, &id, &volume))
            .await
    }

    async fn unmount(&self, volume: &str) -> Result<()> {
        let id = self.id().to_string();
        let volume = volume.to_string();
        self.storage_uninterruptible(move |s| s.unmount_operation_volume(&id, &volume))
            .await
    }

    /// Mount scratch, then mount and transfer each volume in turn.
    ///
    /// Every mount is paired with an unmount, even on failure.
    async fn sync_data(&self, ctx: &OperationContext, state: &ProviderState) -> Result<()> {
        let repo = self.repo().to_string();
        let id = self.id().to_string();
        let volumes = self
            .storage(move |s| s.list_operation_volumes(&repo, &id))
            .await?;

        let scratch = self.mount(SCRATCH_VOLUME).await?;
        let mut result = Ok(());
        for volume in &volumes {
            result = self.sync_volume(ctx, state, volume, &scratch).await;
            if result.is_err() {
                break;
            }
        }
        let unmounted = self.unmount(SCRATCH_VOLUME).await;
        result.and(unmounted)
    }

    async fn sync_volume(
        &self,
        ctx: &OperationContext,
        state: &ProviderState,
        volume: &crate::core::types::Volume,
        scratch: &std::path::Path,
    ) -> Result<()> {
        let mountpoint = self.mount(&volume.name).await?;
        let transferred = match self.kind() {
            OperationType::Pull => {
                let pulled = self
                    .provider
                    .pull_volume(ctx, state, volume, &mountpoint, scratch);
                ctx.cancellable(pulled).await
            }
            OperationType::Push => {
                let pushed = self
                    .provider
                    .push_volume(ctx, state, volume, &mountpoint, scratch);
                ctx.cancellable(pushed).await
            }
        };
        let unmounted = self.unmount(&volume.name).await;
        transferred.and(unmounted)
    }

    /// Keep or discard the workspace.
    ///
    /// A pull whose commit step fails is discarded like any other failure.
    async fn finalize(&self, succeeded: bool, commit: Option<Commit>) -> Result<()> {
        if !succeeded || self.kind() != OperationType::Pull || self.record.metadata_only {
            return self.discard().await;
        }

        let committed = match commit {
            Some(commit) => {
                let repo = self.repo().to_string();
                let id = self.id().to_string();
                self.storage_uninterruptible(move |s| {
                    s.commit_operation(&repo, &id, &commit).map(|_| ())
                })
                .await
            }
            None => Err(Error::Internal(format!(
                "pull '{}' finished without a commit",
                self.id()
            ))),
        };
        if committed.is_err() {
            if let Err(e) = self.discard().await {
                warn!(operation = %self.id(), error = %e, "failed to discard workspace");
            }
        }
        committed
    }

    async fn discard(&self) -> Result<()> {
        let repo = self.repo().to_string();
        let id = self.id().to_string();
        let discarded = self
            .storage_uninterruptible(move |s| s.discard_operation(&repo, &id))
            .await;
        if let Some(reaper) = &self.reaper {
            reaper.signal();
        }
        discarded
    }
}
