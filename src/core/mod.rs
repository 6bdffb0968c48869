//! core
//!
//! Domain types, naming rules and configuration.
//!
//! # Modules
//!
//! - [`types`] - Repositories, volumes, commits, remotes and status types
//! - [`naming`] - Name validation
//! - [`tags`] - Commit tag filters
//! - [`paths`] - Dataset and mountpoint layout
//! - [`error`] - Error taxonomy
//! - [`config`] - Configuration schema and loading

pub mod config;
pub mod error;
pub mod naming;
pub mod paths;
pub mod tags;
pub mod types;
