//! storage::reaper
//!
//! Background destruction of volume sets that could not be destroyed
//! immediately.
//!
//! # Architecture
//!
//! Deletion is two-phase. The storage engine tries to destroy a volume set;
//! if clones still depend on it, it marks the dataset with a pending-reap
//! property instead. The reaper sweeps all marked datasets and retries the
//! destroy. Failures are logged and left for the next sweep.
//!
//! The loop wakes on a fixed interval or as soon as [`Reaper::signal`] is
//! called.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stratum::core::paths::DatasetPaths;
//! use stratum::storage::engine::StorageEngine;
//! use stratum::storage::memory::MemoryBackend;
//! use stratum::storage::reaper::Reaper;
//!
//! let engine = StorageEngine::new(
//!     Arc::new(MemoryBackend::new("tank")),
//!     DatasetPaths::new("tank", "/mnt"),
//! );
//! let reaper = Reaper::new(engine, Duration::from_secs(60));
//! assert_eq!(reaper.reap(), 0);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{DestroyMode, KindFilter, ListQuery};
use super::engine::StorageEngine;
use super::props;

/// Sweeper for datasets marked for destruction.
///
/// Clones share the wake-up signal, so any clone can nudge a running loop.
#[derive(Debug, Clone)]
pub struct Reaper {
    engine: StorageEngine,
    interval: Duration,
    wake: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl Reaper {
    pub fn new(engine: StorageEngine, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            wake: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wake the loop for an immediate sweep.
    pub fn signal(&self) {
        self.wake.notify_one();
    }

    /// Ask the loop to exit after its current sweep.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Run one sweep. Returns the number of datasets destroyed.
    pub fn reap(&self) -> usize {
        let backend = self.engine.backend();
        let root = self.engine.paths().repo_root();
        let query = ListQuery::default()
            .recursive()
            .kind(KindFilter::Filesystems)
            .property(props::REAP);

        let entries = match backend.list(&root, &query) {
            Ok(entries) => entries,
            Err(e) if e.is_does_not_exist() => return 0,
            Err(e) => {
                warn!(error = %e, "reaper failed to list datasets");
                return 0;
            }
        };

        let mut reaped = 0;
        for entry in entries
            .iter()
            .filter(|e| e.property(props::REAP) == Some(props::REAP_PENDING))
        {
            match backend.destroy(&entry.name, DestroyMode::recursive()) {
                Ok(()) => {
                    info!(dataset = %entry.name, "reaped dataset");
                    reaped += 1;
                }
                // Already gone with a marked ancestor.
                Err(e) if e.is_does_not_exist() => {}
                Err(e) => {
                    warn!(
                        dataset = %entry.name,
                        error = %e,
                        "dataset not yet destroyable, will retry"
                    );
                }
            }
        }
        reaped
    }

    /// Sweep until [`stop`](Self::stop) is called.
    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "reaper started");
        while !self.stopped.load(Ordering::SeqCst) {
            let sweeper = self.clone();
            match tokio::task::spawn_blocking(move || sweeper.reap()).await {
                Ok(count) if count > 0 => debug!(count, "reaper sweep complete"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "reaper sweep panicked"),
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("reaper stopped");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(&self) -> JoinHandle<()> {
        tokio::spawn(self.clone().run())
    }
}
