//! storage::props
//!
//! User property names attached to datasets.
//!
//! All properties live in the `io.stratum` namespace so they never collide
//! with native filesystem properties.

/// Caller metadata (JSON object) on repositories, volumes and commits.
pub const METADATA: &str = "io.stratum:metadata";

/// Active volume set GUID, on the repository dataset.
pub const ACTIVE: &str = "io.stratum:active";

/// Remote definitions (JSON array), on the repository dataset.
pub const REMOTES: &str = "io.stratum:remotes";

/// Commit a volume set was cloned from.
pub const SOURCE: &str = "io.stratum:source";

/// Pending destruction marker picked up by the reaper.
pub const REAP: &str = "io.stratum:reap";

/// Value written to [`REAP`].
pub const REAP_PENDING: &str = "pending";

/// Properties whose values must never be logged.
pub const SECRET: &[&str] = &[REMOTES];

/// Whether the value of `property` must be redacted.
pub fn is_secret(property: &str) -> bool {
    SECRET.contains(&property)
}
