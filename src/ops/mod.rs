//! ops
//!
//! Push and pull operations.
//!
//! # Modules
//!
//! - [`record`] - Operation, progress and persisted record types
//! - [`store`] - Persistence of running operations
//! - [`lock`] - Exclusive lock on the metadata directory
//! - [`executor`] - Background task for one operation
//! - [`engine`] - Per-repository supervisors and the public API
//!
//! # Lifecycle
//!
//! ```text
//!   start ──▶ RUNNING ──┬──▶ COMPLETE
//!                       ├──▶ FAILED
//!                       └──▶ ABORTED
//! ```
//!
//! The record is persisted before the background task starts and removed
//! when the task reports a terminal state.

pub mod engine;
pub mod executor;
pub mod lock;
pub mod record;
pub mod store;

pub use engine::OperationEngine;
pub use record::{
    Operation, OperationRecord, OperationState, OperationType, ProgressEntry, ProgressType,
};
pub use store::{FileStore, MemoryStore, MetadataStore, StoreError};
