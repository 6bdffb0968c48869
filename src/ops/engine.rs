//! ops::engine
//!
//! Push and pull as managed background operations.
//!
//! # Architecture
//!
//! Each repository gets a supervisor task that exclusively owns that
//! repository's operation table. Every request (start, progress, query,
//! abort) is a message on the supervisor's channel, so the single-writer
//! check and the table updates happen in one place without locks.
//!
//! ```text
//!   OperationEngine ──request──▶ Supervisor(repo) ──spawn──▶ Executor(op)
//!          ▲                         ▲   │                      │
//!          └──────── reply ──────────┘   └── progress ◀─────────┘
//! ```
//!
//! Validation that needs storage or the network runs in the caller's task
//! before the start request is sent. Only the conflict check and the
//! record write happen inside the supervisor.
//!
//! # Persistence
//!
//! A record is written to the [`MetadataStore`] when an operation starts
//! and deleted when it reaches a terminal state. [`OperationEngine::load_state`]
//! resumes whatever records remain.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use stratum::core::paths::DatasetPaths;
//! use stratum::core::types::{Remote, RemoteParameters, Repository};
//! use stratum::ops::{MemoryStore, OperationEngine, ProgressType};
//! use stratum::remote::RemoteRegistry;
//! use stratum::storage::memory::MemoryBackend;
//! use stratum::storage::StorageEngine;
//!
//! # tokio_test::block_on(async {
//! let storage = StorageEngine::new(
//!     Arc::new(MemoryBackend::new("tank")),
//!     DatasetPaths::new("tank", "/mnt"),
//! );
//! storage.initialize().unwrap();
//! storage.create_repository(&Repository::new("foo")).unwrap();
//! storage.add_remote("foo", &Remote::nop("origin")).unwrap();
//!
//! let engine = OperationEngine::new(
//!     storage,
//!     RemoteRegistry::with_defaults(),
//!     Arc::new(MemoryStore::new()),
//!     None,
//! );
//! let op = engine
//!     .start_pull("foo", "origin", "c1", RemoteParameters::nop(), false)
//!     .await
//!     .unwrap();
//! engine.join("foo", &op.id).await.unwrap();
//!
//! let progress = engine.get_progress("foo", &op.id).await.unwrap();
//! assert_eq!(progress.last().unwrap().kind, ProgressType::Complete);
//! # });
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::error::{Error, Result};
use crate::core::naming;
use crate::core::types::{Remote, RemoteParameters};
use crate::remote::{CancelSignal, ProgressSink, RemoteProvider, RemoteRegistry};
use crate::storage::{Reaper, StorageEngine};

use super::executor::{Executor, RESUME_MESSAGE};
use super::record::{
    Operation, OperationRecord, OperationState, OperationType, ProgressEntry,
};
use super::store::{MetadataStore, StoreError};

fn no_such_operation(repo: &str, id: &str) -> String {
    format!("no such operation '{id}' in repository '{repo}'")
}

/// Run a blocking storage call off the async runtime.
async fn blocking<T, F>(storage: &StorageEngine, f: F) -> Result<T>
where
    F: FnOnce(&StorageEngine) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || f(&storage))
        .await
        .map_err(|e| Error::Internal(format!("storage task failed: {e}")))?
}

/// Run a blocking metadata store call off the async runtime.
async fn store_blocking<T, F>(store: &Arc<dyn MetadataStore>, f: F) -> Result<T>
where
    F: FnOnce(&dyn MetadataStore) -> std::result::Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| Error::Internal(format!("metadata store task failed: {e}")))?
        .map_err(Error::from)
}

/// Everything a supervisor needs to launch executors.
#[derive(Debug, Clone)]
struct Services {
    storage: StorageEngine,
    store: Arc<dyn MetadataStore>,
    reaper: Option<Reaper>,
}

enum Request {
    Start {
        record: OperationRecord,
        remote: Remote,
        provider: Arc<dyn RemoteProvider>,
        progress: ProgressSink,
        resumed: bool,
        reply: oneshot::Sender<Result<Operation>>,
    },
    Progress {
        id: String,
        entry: ProgressEntry,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Result<Operation>>,
    },
    List {
        reply: oneshot::Sender<Vec<Operation>>,
    },
    ReadProgress {
        id: String,
        reply: oneshot::Sender<Result<Vec<ProgressEntry>>>,
    },
    Abort {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Watch {
        id: String,
        reply: oneshot::Sender<Result<watch::Receiver<bool>>>,
    },
    Drain {
        reply: oneshot::Sender<Vec<watch::Receiver<bool>>>,
    },
}

struct Tracked {
    operation: Operation,
    progress: Vec<ProgressEntry>,
    /// Entries already returned to a caller.
    read: usize,
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

/// Owner of one repository's operation table.
struct Supervisor {
    repo: String,
    services: Services,
    ops: Vec<Tracked>,
    draining: bool,
}

impl Supervisor {
    fn new(repo: String, services: Services) -> Self {
        Self {
            repo,
            services,
            ops: Vec::new(),
            draining: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) {
        debug!(repository = %self.repo, "operation supervisor started");
        while let Some(request) = rx.recv().await {
            match request {
                Request::Start {
                    record,
                    remote,
                    provider,
                    progress,
                    resumed,
                    reply,
                } => {
                    let started = self.start(record, remote, provider, progress, resumed).await;
                    let _ = reply.send(started);
                }
                Request::Progress { id, entry } => self.append(&id, entry).await,
                Request::Get { id, reply } => {
                    let _ = reply.send(self.find(&id).map(|t| t.operation.clone()));
                }
                Request::List { reply } => {
                    let _ = reply.send(self.ops.iter().map(|t| t.operation.clone()).collect());
                }
                Request::ReadProgress { id, reply } => {
                    let _ = reply.send(self.read_progress(&id));
                }
                Request::Abort { id, reply } => {
                    let _ = reply.send(self.abort(&id));
                }
                Request::Watch { id, reply } => {
                    let _ = reply.send(self.find(&id).map(|t| t.done.clone()));
                }
                Request::Drain { reply } => {
                    let _ = reply.send(self.drain());
                }
            }
        }
        debug!(repository = %self.repo, "operation supervisor stopped");
    }

    fn find(&self, id: &str) -> Result<&Tracked> {
        self.ops
            .iter()
            .find(|t| t.operation.id == id)
            .ok_or_else(|| Error::no_such(no_such_operation(&self.repo, id)))
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut Tracked> {
        let repo = &self.repo;
        self.ops
            .iter_mut()
            .find(|t| t.operation.id == id)
            .ok_or_else(|| Error::no_such(no_such_operation(repo, id)))
    }

    async fn start(
        &mut self,
        record: OperationRecord,
        remote: Remote,
        provider: Arc<dyn RemoteProvider>,
        progress: ProgressSink,
        resumed: bool,
    ) -> Result<Operation> {
        if self.draining {
            return Err(Error::InvalidState("operation engine is shutting down".into()));
        }

        let commit_id = &record.operation.commit_id;
        if let Some(active) = self
            .ops
            .iter()
            .find(|t| !t.operation.state.is_terminal() && t.operation.commit_id == *commit_id)
        {
            return Err(Error::exists(format!(
                "operation '{}' is already in progress for commit '{commit_id}'",
                active.operation.id
            )));
        }

        let persisted = record.clone();
        store_blocking(&self.services.store, move |s| s.put(&persisted)).await?;

        let operation = record.operation.clone();
        let first = if resumed {
            ProgressEntry::message(RESUME_MESSAGE)
        } else {
            match operation.kind {
                OperationType::Pull => ProgressEntry::message(format!(
                    "Pulling {} from '{}'",
                    operation.commit_id, operation.remote
                )),
                OperationType::Push => ProgressEntry::message(format!(
                    "Pushing {} to '{}'",
                    operation.commit_id, operation.remote
                )),
            }
        };

        let (cancel_tx, cancel) = CancelSignal::channel();
        let (done_tx, done) = watch::channel(false);
        let executor = Executor::new(
            record,
            remote,
            provider,
            self.services.storage.clone(),
            self.services.reaper.clone(),
            progress,
            cancel,
        )
        .resumed(resumed);
        tokio::spawn(async move {
            executor.run().await;
            done_tx.send_replace(true);
        });

        info!(
            repository = %self.repo,
            operation = %operation.id,
            kind = %operation.kind,
            commit = %operation.commit_id,
            remote = %operation.remote,
            resumed,
            "operation started"
        );
        self.ops.push(Tracked {
            operation: operation.clone(),
            progress: vec![first],
            read: 0,
            cancel: cancel_tx,
            done,
        });
        Ok(operation)
    }

    async fn append(&mut self, id: &str, entry: ProgressEntry) {
        if self.find(id).is_err() {
            debug!(
                repository = %self.repo,
                operation = %id,
                "progress for untracked operation dropped"
            );
            return;
        }

        let terminal = entry.terminal_state();
        // Interrupted by shutdown: keep the record so the next start resumes it.
        let keep = self.draining && terminal == Some(OperationState::Aborted);
        if terminal.is_some() && !keep {
            let (repo, op) = (self.repo.clone(), id.to_string());
            let deleted = store_blocking(&self.services.store, move |s| s.delete(&repo, &op)).await;
            if let Err(e) = deleted {
                warn!(
                    repository = %self.repo,
                    operation = %id,
                    error = %e,
                    "failed to delete operation record"
                );
            }
        }

        if let Ok(tracked) = self.find_mut(id) {
            if let Some(state) = terminal {
                tracked.operation.state = state;
            }
            tracked.progress.push(entry);
        }
    }

    /// Entries since the last read. A terminal operation is evicted once read.
    fn read_progress(&mut self, id: &str) -> Result<Vec<ProgressEntry>> {
        let tracked = self.find_mut(id)?;
        let entries = tracked.progress[tracked.read..].to_vec();
        tracked.read = tracked.progress.len();

        if tracked.operation.state.is_terminal() {
            self.ops.retain(|t| t.operation.id != id);
            debug!(repository = %self.repo, operation = %id, "evicted finished operation");
        }
        Ok(entries)
    }

    fn abort(&mut self, id: &str) -> Result<()> {
        let repo = self.repo.clone();
        let tracked = self.find_mut(id)?;
        if !tracked.operation.state.is_terminal() {
            info!(repository = %repo, operation = %id, "aborting operation");
            tracked.cancel.send_replace(true);
        }
        Ok(())
    }

    fn drain(&mut self) -> Vec<watch::Receiver<bool>> {
        self.draining = true;
        self.ops
            .iter()
            .filter(|t| !t.operation.state.is_terminal())
            .map(|t| {
                t.cancel.send_replace(true);
                t.done.clone()
            })
            .collect()
    }
}

/// What a new operation acts on.
struct OperationTarget {
    repo: String,
    commit_id: String,
    params: RemoteParameters,
    metadata_only: bool,
}

impl OperationTarget {
    fn new(repo: &str, commit_id: &str, params: RemoteParameters, metadata_only: bool) -> Self {
        Self {
            repo: repo.to_string(),
            commit_id: commit_id.to_string(),
            params,
            metadata_only,
        }
    }
}

/// Wait for an executor's done flag.
async fn wait_done(mut done: watch::Receiver<bool>) {
    while !*done.borrow_and_update() {
        if done.changed().await.is_err() {
            return;
        }
    }
}

/// The operation engine.
///
/// Cheap to clone; clones share supervisors. Must be used from within a
/// Tokio runtime.
#[derive(Debug, Clone)]
pub struct OperationEngine {
    services: Services,
    providers: RemoteRegistry,
    supervisors: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Request>>>>,
}

impl OperationEngine {
    /// Create an engine. Finished operations nudge `reaper` if given.
    pub fn new(
        storage: StorageEngine,
        providers: RemoteRegistry,
        store: Arc<dyn MetadataStore>,
        reaper: Option<Reaper>,
    ) -> Self {
        Self {
            services: Services {
                storage,
                store,
                reaper,
            },
            providers,
            supervisors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.services.storage
    }

    fn supervisor(&self, repo: &str) -> mpsc::UnboundedSender<Request> {
        let mut supervisors = self
            .supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = supervisors.get(repo).filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(repo.to_string(), self.services.clone());
        tokio::spawn(supervisor.run(rx));
        supervisors.insert(repo.to_string(), tx.clone());
        tx
    }

    async fn request<T>(
        &self,
        repo: &str,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.supervisor(repo)
            .send(build(reply))
            .map_err(|_| Error::Internal(format!("supervisor for '{repo}' is gone")))?;
        rx.await
            .map_err(|_| Error::Internal(format!("supervisor for '{repo}' dropped a request")))
    }

    fn progress_sink(&self, repo: &str, id: &str) -> ProgressSink {
        let tx = self.supervisor(repo);
        let id = id.to_string();
        Arc::new(move |entry: ProgressEntry| {
            let _ = tx.send(Request::Progress {
                id: id.clone(),
                entry,
            });
        })
    }

    async fn require_repository(&self, repo: &str) -> Result<()> {
        naming::validate_repository(repo)?;
        let name = repo.to_string();
        blocking(&self.services.storage, move |s| s.get_repository(&name).map(|_| ())).await
    }

    /// Resolve `remote_name` and check `params` were written for its provider.
    async fn resolve_remote(
        &self,
        repo: &str,
        remote_name: &str,
        params: &RemoteParameters,
    ) -> Result<(Remote, Arc<dyn RemoteProvider>)> {
        let (r, n) = (repo.to_string(), remote_name.to_string());
        let remote = blocking(&self.services.storage, move |s| s.get_remote(&r, &n)).await?;
        if params.provider != remote.provider {
            return Err(Error::InvalidArgument(format!(
                "operation parameters type ({}) doesn't match type of remote '{}' ({})",
                params.provider, remote.name, remote.provider
            )));
        }
        let provider = self.providers.get(&remote.provider)?;
        Ok((remote, provider))
    }

    async fn local_commit_exists(&self, repo: &str, commit_id: &str) -> Result<bool> {
        let (r, c) = (repo.to_string(), commit_id.to_string());
        blocking(&self.services.storage, move |s| s.locate_commit(&r, &c))
            .await
            .map(|guid| guid.is_some())
    }

    async fn launch(
        &self,
        kind: OperationType,
        remote: Remote,
        provider: Arc<dyn RemoteProvider>,
        target: OperationTarget,
    ) -> Result<Operation> {
        let id = Uuid::new_v4().to_string();
        let repo = target.repo;
        let record = OperationRecord {
            repository: repo.clone(),
            operation: Operation {
                id: id.clone(),
                kind,
                state: OperationState::Running,
                remote: remote.name.clone(),
                commit_id: target.commit_id,
            },
            params: target.params,
            metadata_only: target.metadata_only,
        };
        let progress = self.progress_sink(&repo, &id);
        self.request(&repo, |reply| Request::Start {
            record,
            remote,
            provider,
            progress,
            resumed: false,
            reply,
        })
        .await?
    }

    /// Start pulling `commit_id` from `remote_name`.
    ///
    /// With `metadata_only`, the local commit must already exist and only its
    /// properties are refreshed from the remote.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidName`] for malformed names
    /// - [`Error::NoSuchObject`] if the repository or remote is missing, or
    ///   the remote does not have the commit
    /// - [`Error::InvalidArgument`] if `params` belong to another provider
    /// - [`Error::ObjectExists`] if the commit exists locally, or another
    ///   operation on it is running
    pub async fn start_pull(
        &self,
        repo: &str,
        remote_name: &str,
        commit_id: &str,
        params: RemoteParameters,
        metadata_only: bool,
    ) -> Result<Operation> {
        naming::validate_repository(repo)?;
        naming::validate_remote(remote_name)?;
        naming::validate_commit(commit_id)?;

        let (remote, provider) = self.resolve_remote(repo, remote_name, &params).await?;

        let exists = self.local_commit_exists(repo, commit_id).await?;
        if exists && !metadata_only {
            return Err(Error::exists(format!(
                "commit '{commit_id}' already exists in repository '{repo}'"
            )));
        }
        if !exists && metadata_only {
            return Err(Error::no_such(format!(
                "no such commit '{commit_id}' in repository '{repo}'"
            )));
        }

        provider
            .validate_operation(&remote, &params, commit_id, OperationType::Pull, metadata_only)
            .await?;

        let target = OperationTarget::new(repo, commit_id, params, metadata_only);
        self.launch(OperationType::Pull, remote, provider, target).await
    }

    /// Start pushing local commit `commit_id` to `remote_name`.
    ///
    /// With `metadata_only`, no volume data moves and the remote's copy of
    /// the commit metadata is replaced.
    ///
    /// # Errors
    ///
    /// - [`Error::NoSuchObject`] if the repository, remote or local commit is
    ///   missing
    /// - [`Error::InvalidArgument`] if `params` belong to another provider
    /// - [`Error::ObjectExists`] if the remote already has the commit, or
    ///   another operation on it is running
    pub async fn start_push(
        &self,
        repo: &str,
        remote_name: &str,
        commit_id: &str,
        params: RemoteParameters,
        metadata_only: bool,
    ) -> Result<Operation> {
        naming::validate_repository(repo)?;
        naming::validate_remote(remote_name)?;
        naming::validate_commit(commit_id)?;

        let (remote, provider) = self.resolve_remote(repo, remote_name, &params).await?;

        let (r, c) = (repo.to_string(), commit_id.to_string());
        blocking(&self.services.storage, move |s| s.get_commit(&r, &c)).await?;

        provider
            .validate_operation(&remote, &params, commit_id, OperationType::Push, metadata_only)
            .await?;

        let target = OperationTarget::new(repo, commit_id, params, metadata_only);
        self.launch(OperationType::Push, remote, provider, target).await
    }

    pub async fn get_operation(&self, repo: &str, id: &str) -> Result<Operation> {
        naming::validate_operation(id)?;
        self.require_repository(repo).await?;
        let id = id.to_string();
        self.request(repo, |reply| Request::Get { id, reply }).await?
    }

    /// Tracked operations of a repository, in start order.
    pub async fn list_operations(&self, repo: &str) -> Result<Vec<Operation>> {
        self.require_repository(repo).await?;
        self.request(repo, |reply| Request::List { reply }).await
    }

    /// Progress entries appended since the previous call.
    ///
    /// Reading a finished operation's progress evicts it: afterwards the
    /// operation is no longer tracked.
    pub async fn get_progress(&self, repo: &str, id: &str) -> Result<Vec<ProgressEntry>> {
        naming::validate_operation(id)?;
        self.require_repository(repo).await?;
        let id = id.to_string();
        self.request(repo, |reply| Request::ReadProgress { id, reply })
            .await?
    }

    /// Request cancellation. Aborting a finished operation has no effect.
    pub async fn abort_operation(&self, repo: &str, id: &str) -> Result<()> {
        naming::validate_operation(id)?;
        self.require_repository(repo).await?;
        let id = id.to_string();
        self.request(repo, |reply| Request::Abort { id, reply }).await?
    }

    /// Wait until the operation's background task has exited.
    pub async fn join(&self, repo: &str, id: &str) -> Result<()> {
        naming::validate_operation(id)?;
        let id = id.to_string();
        let done = self
            .request(repo, |reply| Request::Watch { id, reply })
            .await??;
        wait_done(done).await;
        Ok(())
    }

    /// Resume every operation left in the metadata store.
    ///
    /// Records whose repository or remote no longer exists are dropped.
    /// Returns the number of operations resumed.
    pub async fn load_state(&self) -> Result<usize> {
        let records = store_blocking(&self.services.store, |s| s.list(None)).await?;
        let mut resumed = 0;

        for record in records {
            let repo = record.repository.clone();
            let id = record.id().to_string();

            if record.operation.state.is_terminal() {
                let (r, i) = (repo.clone(), id.clone());
                store_blocking(&self.services.store, move |s| s.delete(&r, &i)).await?;
                continue;
            }

            let resolved = match self.require_repository(&repo).await {
                Ok(()) => {
                    self.resolve_remote(&repo, &record.operation.remote, &record.params)
                        .await
                }
                Err(e) => Err(e),
            };
            let (remote, provider) = match resolved {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(
                        repository = %repo,
                        operation = %id,
                        error = %e,
                        "dropping unresumable operation"
                    );
                    let (r, i) = (repo.clone(), id.clone());
                    store_blocking(&self.services.store, move |s| s.delete(&r, &i)).await?;
                    continue;
                }
            };

            let progress = self.progress_sink(&repo, &id);
            self.request(&repo, |reply| Request::Start {
                record,
                remote,
                provider,
                progress,
                resumed: true,
                reply,
            })
            .await??;
            resumed += 1;
        }

        if resumed > 0 {
            info!(count = resumed, "resumed operations after restart");
        }
        Ok(resumed)
    }

    /// Abort every running operation and wait for them to exit.
    ///
    /// Their records stay in the metadata store, so the next
    /// [`load_state`](Self::load_state) resumes them. No new operations are
    /// accepted afterwards.
    pub async fn shutdown(&self) {
        let supervisors: Vec<(String, mpsc::UnboundedSender<Request>)> = self
            .supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(repo, tx)| (repo.clone(), tx.clone()))
            .collect();

        let mut pending = Vec::new();
        for (repo, tx) in supervisors {
            let (reply, rx) = oneshot::channel();
            if tx.send(Request::Drain { reply }).is_err() {
                continue;
            }
            match rx.await {
                Ok(done) => pending.extend(done),
                Err(_) => warn!(repository = %repo, "supervisor exited during shutdown"),
            }
        }

        let count = pending.len();
        for done in pending {
            wait_done(done).await;
        }
        info!(interrupted = count, "operation engine stopped");
    }
}
