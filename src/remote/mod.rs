//! remote
//!
//! Remote providers: where commits are pushed to and pulled from.
//!
//! # Modules
//!
//! - [`traits`] - The [`RemoteProvider`] contract and operation context
//! - [`factory`] - Provider lookup by discriminator
//! - [`nop`] - Provider that moves no data
//! - [`mock`] - In-memory provider for tests

pub mod factory;
pub mod mock;
pub mod nop;
pub mod traits;

pub use factory::RemoteRegistry;
pub use nop::NopProvider;
pub use traits::{CancelSignal, OperationContext, ProgressSink, ProviderState, RemoteProvider};

/// Discriminator of the no-op provider.
pub const NOP_PROVIDER: &str = "nop";
