//! storage
//!
//! Versioned storage on a copy-on-write filesystem.
//!
//! # Modules
//!
//! - [`exec`] - External command execution
//! - [`backend`] - Copy-on-write primitives trait
//! - [`zfs`] - Backend issuing `zfs` commands
//! - [`memory`] - In-memory backend for tests
//! - [`props`] - User property names
//! - [`engine`] - Repositories, volumes and commits on top of a backend
//! - [`reaper`] - Deferred destruction sweeper

pub mod backend;
pub mod engine;
pub mod exec;
pub mod memory;
pub mod props;
pub mod reaper;
pub mod zfs;

pub use backend::StorageBackend;
pub use engine::StorageEngine;
pub use reaper::Reaper;
