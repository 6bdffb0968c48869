//! core::error
//!
//! Error taxonomy shared by the storage engine, the remote providers and
//! the operation engine.
//!
//! # Classification
//!
//! - [`Error::InvalidName`] - client input failed validation, nothing touched storage
//! - [`Error::NoSuchObject`] - a referenced object (repository, volume, commit,
//!   remote or operation) is absent
//! - [`Error::ObjectExists`] - duplicate create, or a conflicting in-flight operation
//! - [`Error::InvalidState`] - persisted metadata or an operation record could not be understood
//! - [`Error::Remote`] - a remote provider failed during a transfer
//! - [`Error::Command`] - any other failure from the external command layer, unchanged
//!
//! Only the storage engine translates [`CommandError`]s into the first three
//! classes. Everything it does not recognise propagates as [`Error::Command`].

use thiserror::Error;

use crate::ops::store::StoreError;
use crate::storage::exec::CommandError;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Name or identifier failed syntax validation.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Referenced object does not exist.
    #[error("{0}")]
    NoSuchObject(String),

    /// Object already exists, or conflicts with an in-flight operation.
    #[error("{0}")]
    ObjectExists(String),

    /// Persisted state is corrupt or unparsable.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The caller supplied arguments that cannot be combined.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A running operation observed cancellation.
    #[error("operation interrupted")]
    Interrupted,

    /// A remote provider failed; the message is the provider's own.
    #[error("{0}")]
    Remote(String),

    /// Unclassified failure from the external command layer.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Metadata store failure.
    #[error(transparent)]
    Store(StoreError),

    /// Background task could not be joined.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for [`Error::NoSuchObject`].
    pub fn no_such(message: impl Into<String>) -> Self {
        Error::NoSuchObject(message.into())
    }

    /// Shorthand for [`Error::ObjectExists`].
    pub fn exists(message: impl Into<String>) -> Self {
        Error::ObjectExists(message.into())
    }

    /// Whether this error means the referenced object is missing.
    pub fn is_no_such_object(&self) -> bool {
        matches!(self, Error::NoSuchObject(_))
    }

    /// Whether this error means the object already exists.
    pub fn is_object_exists(&self) -> bool {
        matches!(self, Error::ObjectExists(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidState(format!("metadata must be valid JSON: {e}"))
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corrupt { .. } => Error::InvalidState(e.to_string()),
            other => Error::Store(other),
        }
    }
}
