//! remote::factory
//!
//! Provider lookup by discriminator.
//!
//! # Design
//!
//! The operation engine never names a concrete provider. It resolves the
//! discriminator stored on a [`Remote`](crate::core::types::Remote) through
//! a [`RemoteRegistry`], so new providers plug in without touching the
//! engine.
//!
//! # Example
//!
//! ```
//! use stratum::remote::{RemoteRegistry, NOP_PROVIDER};
//!
//! let registry = RemoteRegistry::with_defaults();
//! assert_eq!(registry.get(NOP_PROVIDER).unwrap().name(), NOP_PROVIDER);
//! assert!(registry.get("s3").is_err());
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use super::nop::NopProvider;
use super::traits::RemoteProvider;
use crate::core::error::{Error, Result};

/// Providers available to an engine, keyed by discriminator.
#[derive(Debug, Clone, Default)]
pub struct RemoteRegistry {
    providers: BTreeMap<&'static str, Arc<dyn RemoteProvider>>,
}

impl RemoteRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in provider.
    pub fn with_defaults() -> Self {
        Self::new().with(NopProvider::new())
    }

    /// Add a provider, replacing any with the same name.
    pub fn with(mut self, provider: impl RemoteProvider + 'static) -> Self {
        self.register(Arc::new(provider));
        self
    }

    pub fn register(&mut self, provider: Arc<dyn RemoteProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    /// Look up a provider.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if no provider has that name
    pub fn get(&self, name: &str) -> Result<Arc<dyn RemoteProvider>> {
        self.providers.get(name).cloned().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "unknown remote provider '{name}' (available: {})",
                self.names().join(", ")
            ))
        })
    }

    /// Registered discriminators, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.providers.keys().copied().collect()
    }
}
