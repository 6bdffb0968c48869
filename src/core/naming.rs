//! core::naming
//!
//! Identifier validation.
//!
//! Every repository, volume, commit, remote and operation identifier goes
//! through [`validate`] before it reaches the storage layer, so malformed
//! input never turns into a dataset path.
//!
//! # Rules
//!
//! - Repository, commit and remote names: 1-63 characters from `[A-Za-z0-9.:_-]`
//! - Volume names: same alphabet, but a leading `_` is reserved for scratch volumes
//! - Commit ids: the reserved id `initial` is rejected
//! - Operation ids: a syntactically valid UUID
//!
//! # Example
//!
//! ```
//! use stratum::core::naming::{validate, NameKind};
//!
//! assert!(validate("my-repo", NameKind::Repository).is_ok());
//! assert!(validate("_scratch", NameKind::Volume).is_err());
//! assert!(validate("initial", NameKind::Commit).is_err());
//! ```

use uuid::Uuid;

use crate::core::error::{Error, Result};

/// Maximum identifier length.
pub const MAX_NAME_LEN: usize = 63;

/// Reserved commit id every volume set is seeded from.
pub const INITIAL_COMMIT: &str = "initial";

/// Reserved prefix for internal volumes.
pub const RESERVED_VOLUME_PREFIX: char = '_';

/// What kind of identifier is being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Repository,
    Volume,
    Commit,
    Remote,
    Operation,
}

impl NameKind {
    /// Human readable name used in error messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            NameKind::Repository => "repository",
            NameKind::Volume => "volume",
            NameKind::Commit => "commit",
            NameKind::Remote => "remote",
            NameKind::Operation => "operation",
        }
    }
}

impl std::fmt::Display for NameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '_' | '-')
}

/// Validate `name` as an identifier of the given kind.
///
/// # Errors
///
/// Returns [`Error::InvalidName`] describing the first rule that failed.
pub fn validate(name: &str, kind: NameKind) -> Result<()> {
    if kind == NameKind::Operation {
        return Uuid::parse_str(name).map(|_| ()).map_err(|_| {
            Error::InvalidName(format!("invalid operation id '{name}', must be a UUID"))
        });
    }

    if name.is_empty() {
        return Err(Error::InvalidName(format!("{kind} name cannot be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "invalid {kind} name, must be {MAX_NAME_LEN} characters or less"
        )));
    }
    if !name.chars().all(is_name_char) {
        return Err(Error::InvalidName(format!(
            "invalid {kind} name, can only contain alphanumeric characters, '-', ':', '.', or '_'"
        )));
    }

    match kind {
        NameKind::Volume if name.starts_with(RESERVED_VOLUME_PREFIX) => Err(Error::InvalidName(
            format!("volume names cannot start with '{RESERVED_VOLUME_PREFIX}'"),
        )),
        NameKind::Commit if name == INITIAL_COMMIT => Err(Error::InvalidName(format!(
            "commit id cannot be reserved id '{INITIAL_COMMIT}'"
        ))),
        _ => Ok(()),
    }
}

/// Validate a repository name.
pub fn validate_repository(name: &str) -> Result<()> {
    validate(name, NameKind::Repository)
}

/// Validate a volume name.
pub fn validate_volume(name: &str) -> Result<()> {
    validate(name, NameKind::Volume)
}

/// Validate a user-visible commit id.
pub fn validate_commit(id: &str) -> Result<()> {
    validate(id, NameKind::Commit)
}

/// Validate a commit id, accepting the reserved seed commit.
pub(crate) fn validate_commit_or_initial(id: &str) -> Result<()> {
    if id == INITIAL_COMMIT {
        Ok(())
    } else {
        validate_commit(id)
    }
}

/// Validate a remote name.
pub fn validate_remote(name: &str) -> Result<()> {
    validate(name, NameKind::Remote)
}

/// Validate an operation id.
pub fn validate_operation(id: &str) -> Result<()> {
    validate(id, NameKind::Operation)
}
