//! core::types
//!
//! Shared data model.
//!
//! # Types
//!
//! - [`Repository`] - Named collection of volumes with a shared commit history
//! - [`Volume`] - Independently mountable filesystem inside a volume set
//! - [`Commit`] - Immutable recursive snapshot of every volume
//! - [`CommitStatus`], [`RepositoryStatus`], [`VolumeStatus`] - Space accounting
//! - [`Remote`], [`RemoteParameters`] - Provider-typed synchronization endpoints
//! - [`UtcTimestamp`] - RFC3339 timestamp
//!
//! Properties are opaque JSON maps owned by the caller. The one exception is
//! the commit `timestamp` property, which the storage engine fills in.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque key/value metadata attached to repositories, volumes and commits.
pub type Properties = serde_json::Map<String, Value>;

/// Commit property the storage engine stamps with the snapshot creation time.
pub const TIMESTAMP_PROPERTY: &str = "timestamp";

/// Volume config key holding the mountpoint.
pub const MOUNTPOINT_CONFIG: &str = "mountpoint";

/// A UTC timestamp.
///
/// # Example
///
/// ```
/// use stratum::core::types::UtcTimestamp;
///
/// let ts = UtcTimestamp::from_epoch_secs(1556492646).unwrap();
/// assert_eq!(ts.to_iso8601(), "2019-04-28T23:04:06Z");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtcTimestamp(DateTime<Utc>);

impl UtcTimestamp {
    /// Create a timestamp for the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create a timestamp from seconds since the Unix epoch.
    ///
    /// Returns `None` if the value is out of range.
    pub fn from_epoch_secs(secs: i64) -> Option<Self> {
        DateTime::from_timestamp(secs, 0).map(Self)
    }

    /// Get the underlying datetime.
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Format with second precision and a `Z` suffix.
    pub fn to_iso8601(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

impl std::fmt::Display for UtcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// A repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub properties: Properties,
}

impl Repository {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_properties(name: impl Into<String>, properties: Properties) -> Self {
        Self {
            name: name.into(),
            properties,
        }
    }
}

/// A volume within the repository's active volume set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    /// Mount and backing information, e.g. `mountpoint`.
    #[serde(default)]
    pub config: Properties,
    #[serde(default)]
    pub properties: Properties,
}

impl Volume {
    /// Mountpoint recorded in the volume config, if any.
    pub fn mountpoint(&self) -> Option<&str> {
        self.config.get(MOUNTPOINT_CONFIG).and_then(Value::as_str)
    }

    /// Description used in progress messages: the `path` property when set,
    /// otherwise the volume name.
    pub fn description(&self) -> &str {
        self.properties
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(&self.name)
    }
}

/// A commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    #[serde(default)]
    pub properties: Properties,
}

impl Commit {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_properties(id: impl Into<String>, properties: Properties) -> Self {
        Self {
            id: id.into(),
            properties,
        }
    }

    /// The authoritative creation timestamp, if stamped.
    pub fn timestamp(&self) -> Option<&str> {
        self.properties
            .get(TIMESTAMP_PROPERTY)
            .and_then(Value::as_str)
    }
}

/// Space accounting for one commit, summed across its volumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitStatus {
    /// Data referenced, independent of compression.
    pub logical_size: u64,
    /// Compressed data referenced, possibly shared with other commits.
    pub actual_size: u64,
    /// Space reclaimed if the commit were deleted.
    pub unique_size: u64,
}

/// Status of the repository's active volume set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStatus {
    /// Most recent commit on the active volume set.
    pub last_commit: Option<String>,
    /// Commit the active volume set was cloned from.
    pub source_commit: Option<String>,
    pub logical_size: u64,
    pub actual_size: u64,
    pub volumes: Vec<VolumeStatus>,
}

/// Status of one volume in the active volume set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    pub name: String,
    pub logical_size: u64,
    pub actual_size: u64,
    /// Whether the volume is currently mounted at its stable mountpoint.
    pub ready: bool,
}

/// A named, provider-typed remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    /// Provider discriminator, e.g. `nop`, `s3`, `ssh`.
    pub provider: String,
    #[serde(default)]
    pub properties: Properties,
}

impl Remote {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            properties: Properties::new(),
        }
    }

    /// A no-op remote.
    pub fn nop(name: impl Into<String>) -> Self {
        Self::new(name, crate::remote::NOP_PROVIDER)
    }
}

/// Per-operation parameters, typed by the same discriminator as [`Remote`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteParameters {
    pub provider: String,
    #[serde(default)]
    pub properties: Properties,
}

impl RemoteParameters {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            properties: Properties::new(),
        }
    }

    /// Parameters for the no-op provider.
    pub fn nop() -> Self {
        Self::new(crate::remote::NOP_PROVIDER)
    }

    /// Parameters for the no-op provider that wait `secs` seconds during transfer.
    pub fn nop_with_delay(secs: u64) -> Self {
        let mut params = Self::nop();
        params
            .properties
            .insert("delay".to_string(), Value::from(secs));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamp_formats_with_z_suffix() {
        let ts = UtcTimestamp::from_epoch_secs(0).unwrap();
        assert_eq!(ts.to_iso8601(), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn commit_timestamp_accessor() {
        let mut commit = Commit::new("hash");
        assert!(commit.timestamp().is_none());
        commit
            .properties
            .insert(TIMESTAMP_PROPERTY.into(), json!("2019-04-28T23:04:06Z"));
        assert_eq!(commit.timestamp(), Some("2019-04-28T23:04:06Z"));
    }

    #[test]
    fn volume_description_prefers_path() {
        let mut volume = Volume {
            name: "v0".into(),
            config: Properties::new(),
            properties: Properties::new(),
        };
        assert_eq!(volume.description(), "v0");
        volume.properties.insert("path".into(), json!("/var/lib/db"));
        assert_eq!(volume.description(), "/var/lib/db");
    }

    #[test]
    fn commit_status_serializes_camel_case() {
        let status = CommitStatus {
            logical_size: 1,
            actual_size: 2,
            unique_size: 3,
        };
        let value = serde_json::to_value(status).unwrap();
        assert_eq!(
            value,
            json!({"logicalSize": 1, "actualSize": 2, "uniqueSize": 3})
        );
    }

    #[test]
    fn nop_parameters_carry_delay() {
        let params = RemoteParameters::nop_with_delay(5);
        assert_eq!(params.provider, "nop");
        assert_eq!(params.properties["delay"], json!(5));
    }
}
