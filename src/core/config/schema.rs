//! core::config::schema
//!
//! Configuration schema types.
//!
//! # Example
//!
//! ```toml
//! pool = "stratum"
//! mount_root = "/var/lib/stratum/mnt"
//! metadata_dir = "/var/lib/stratum/meta"
//! command_timeout_secs = 60
//!
//! [reaper]
//! interval_secs = 60
//!
//! [log]
//! filter = "info"
//! format = "json"
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::core::naming;

/// Engine configuration file.
///
/// Every field is optional in the file; accessors on
/// [`Config`](super::Config) apply defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Copy-on-write pool name.
    pub pool: Option<String>,

    /// Directory under which volumes are mounted.
    pub mount_root: Option<PathBuf>,

    /// Directory holding the persisted operation records.
    pub metadata_dir: Option<PathBuf>,

    /// Timeout for a single storage command.
    pub command_timeout_secs: Option<u64>,

    /// Reaper settings.
    pub reaper: Option<ReaperConfig>,

    /// Logging settings.
    pub log: Option<LogConfig>,
}

impl EngineConfig {
    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(pool) = &self.pool {
            naming::validate_repository(pool)
                .map_err(|e| ConfigError::InvalidValue(format!("invalid pool name: {e}")))?;
        }

        if self.command_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue(
                "command_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if let Some(reaper) = &self.reaper {
            reaper.validate()?;
        }

        if let Some(log) = &self.log {
            log.validate()?;
        }

        Ok(())
    }
}

/// Reaper settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReaperConfig {
    /// Seconds between sweeps when nothing signals the reaper.
    pub interval_secs: Option<u64>,
}

impl ReaperConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == Some(0) {
            return Err(ConfigError::InvalidValue(
                "reaper.interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `tracing` env-filter directive, e.g. `info` or `stratum=debug`.
    pub filter: Option<String>,

    /// Output format.
    pub format: Option<LogFormat>,
}

impl LogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(filter) = &self.filter {
            if filter.trim().is_empty() {
                return Err(ConfigError::InvalidValue(
                    "log.filter cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn filter(&self) -> &str {
        self.filter.as_deref().unwrap_or("info")
    }

    pub fn format(&self) -> LogFormat {
        self.format.unwrap_or_default()
    }
}
