//! Stratum - version control for data volumes
//!
//! Stratum tracks repositories of volumes on a copy-on-write filesystem.
//! Commits are recursive snapshots, checkout clones a commit into a fresh
//! volume set, and commits move between hosts by push and pull through
//! pluggable remote providers.
//!
//! # Architecture
//!
//! - [`core`] - Domain types, naming rules, errors and configuration
//! - [`storage`] - Copy-on-write backends, the storage engine and the reaper
//! - [`remote`] - Remote provider contract and built-in providers
//! - [`ops`] - Background push/pull operations that survive restarts
//! - [`telemetry`] - Logging setup
//!
//! # Invariants
//!
//! 1. Commit ids are unique within a repository across all volume sets
//! 2. Checkout never modifies the previously active volume set
//! 3. At most one running operation targets a given commit
//! 4. Volume sets are destroyed only once nothing depends on them

pub mod core;
pub mod ops;
pub mod remote;
pub mod storage;
pub mod telemetry;
