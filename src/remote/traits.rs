//! remote::traits
//!
//! The contract every remote provider implements.
//!
//! # Design
//!
//! The trait is async because providers talk to the network. The operation
//! engine drives a provider through a fixed sequence for each operation:
//!
//! 1. [`start_operation`](RemoteProvider::start_operation) returns opaque
//!    per-operation state
//! 2. [`pull_volume`](RemoteProvider::pull_volume) or
//!    [`push_volume`](RemoteProvider::push_volume) once per volume, unless
//!    the operation is metadata-only
//! 3. [`push_metadata`](RemoteProvider::push_metadata) for pushes
//! 4. [`end_operation`](RemoteProvider::end_operation) on success, or
//!    [`fail_operation`](RemoteProvider::fail_operation) when the operation
//!    does not finish cleanly
//!
//! Providers report progress and observe cancellation through the
//! [`OperationContext`] they are handed.
//!
//! # Example
//!
//! ```
//! use stratum::core::tags::TagFilter;
//! use stratum::core::types::{Remote, RemoteParameters};
//! use stratum::remote::{NopProvider, RemoteProvider};
//!
//! # tokio_test::block_on(async {
//! let provider = NopProvider::new();
//! let remote = Remote::nop("origin");
//! let commits = provider
//!     .list_commits(&remote, &RemoteParameters::nop(), &TagFilter::default())
//!     .await
//!     .unwrap();
//! assert!(commits.is_empty());
//! # });
//! ```

use std::any::Any;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::core::error::{Error, Result};
use crate::core::tags::TagFilter;
use crate::core::types::{Commit, Remote, RemoteParameters, Volume};
use crate::ops::record::{Operation, OperationType, ProgressEntry};

/// Opaque state a provider carries from `start_operation` to later calls.
pub type ProviderState = Box<dyn Any + Send + Sync>;

/// Receiver for progress entries.
pub type ProgressSink = Arc<dyn Fn(ProgressEntry) + Send + Sync>;

/// Read side of an operation's cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A new flag and the sender that raises it.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that is never raised.
    pub fn never() -> Self {
        let (_, signal) = Self::channel();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Never resolves if the sender
    /// is dropped without raising the flag.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Everything a provider sees of the operation it is serving.
#[derive(Clone)]
pub struct OperationContext {
    pub repository: String,
    pub operation: Operation,
    pub remote: Remote,
    pub params: RemoteParameters,
    pub metadata_only: bool,
    progress: ProgressSink,
    cancel: CancelSignal,
}

impl OperationContext {
    pub fn new(
        repository: impl Into<String>,
        operation: Operation,
        remote: Remote,
        params: RemoteParameters,
        metadata_only: bool,
        progress: ProgressSink,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            repository: repository.into(),
            operation,
            remote,
            params,
            metadata_only,
            progress,
            cancel,
        }
    }

    /// Append an entry to the operation's progress stream.
    pub fn add_progress(&self, entry: ProgressEntry) {
        (self.progress)(entry);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with [`Error::Interrupted`] if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Run `fut`, abandoning it with [`Error::Interrupted`] on cancellation.
    pub async fn cancellable<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check_cancelled()?;
        tokio::select! {
            result = fut => result,
            _ = self.cancel.cancelled() => Err(Error::Interrupted),
        }
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("repository", &self.repository)
            .field("operation", &self.operation)
            .field("remote", &self.remote.name)
            .field("metadata_only", &self.metadata_only)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A remote storage provider.
///
/// Implementations must be `Send + Sync`; one provider instance serves all
/// operations of its kind concurrently.
#[async_trait]
pub trait RemoteProvider: Send + Sync + std::fmt::Debug {
    /// Discriminator matched against [`Remote::provider`].
    fn name(&self) -> &'static str;

    /// Commits on the remote matching `tags`.
    async fn list_commits(
        &self,
        remote: &Remote,
        params: &RemoteParameters,
        tags: &TagFilter,
    ) -> Result<Vec<Commit>>;

    /// One commit on the remote.
    ///
    /// # Errors
    ///
    /// - [`Error::NoSuchObject`] if the remote does not have it
    async fn get_commit(
        &self,
        remote: &Remote,
        params: &RemoteParameters,
        commit_id: &str,
    ) -> Result<Commit>;

    /// Check that an operation can start.
    ///
    /// A pull needs the commit on the remote. A full push needs it absent;
    /// a metadata-only push needs it present.
    async fn validate_operation(
        &self,
        remote: &Remote,
        params: &RemoteParameters,
        commit_id: &str,
        kind: OperationType,
        metadata_only: bool,
    ) -> Result<()> {
        let existing = self.get_commit(remote, params, commit_id).await;
        match (kind, existing) {
            (OperationType::Pull, result) => result.map(|_| ()),
            (OperationType::Push, Ok(_)) if metadata_only => Ok(()),
            (OperationType::Push, Ok(_)) => Err(Error::exists(format!(
                "commit '{commit_id}' already exists in remote '{}'",
                remote.name
            ))),
            (OperationType::Push, Err(e)) if e.is_no_such_object() && !metadata_only => Ok(()),
            (OperationType::Push, Err(e)) => Err(e),
        }
    }

    async fn start_operation(&self, ctx: &OperationContext) -> Result<ProviderState>;

    async fn end_operation(&self, _ctx: &OperationContext, _state: &ProviderState) -> Result<()> {
        Ok(())
    }

    async fn fail_operation(&self, _ctx: &OperationContext, _state: &ProviderState) -> Result<()> {
        Ok(())
    }

    /// Fill `mountpoint` with the remote copy of `volume`.
    async fn pull_volume(
        &self,
        ctx: &OperationContext,
        state: &ProviderState,
        volume: &Volume,
        mountpoint: &Path,
        scratch: &Path,
    ) -> Result<()>;

    /// Upload the contents of `mountpoint` as the remote copy of `volume`.
    async fn push_volume(
        &self,
        ctx: &OperationContext,
        state: &ProviderState,
        volume: &Volume,
        mountpoint: &Path,
        scratch: &Path,
    ) -> Result<()>;

    /// Record `commit` on the remote; `is_update` replaces existing metadata.
    async fn push_metadata(
        &self,
        ctx: &OperationContext,
        state: &ProviderState,
        commit: &Commit,
        is_update: bool,
    ) -> Result<()>;
}
