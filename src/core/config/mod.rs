//! core::config
//!
//! Configuration schema and loading.
//!
//! # Precedence
//!
//! Values are resolved in this order (later overrides earlier):
//! 1. Default values
//! 2. Config file
//!
//! # Config Locations
//!
//! Searched in order:
//! 1. An explicit path passed by the caller
//! 2. `$STRATUM_CONFIG` if set
//! 3. `$XDG_CONFIG_HOME/stratum/config.toml`
//! 4. `~/.stratum/config.toml`
//!
//! An explicit path that does not exist is an error; a missing file in the
//! other locations just means defaults.
//!
//! # Example
//!
//! ```no_run
//! use stratum::core::config::Config;
//!
//! let config = Config::load(None).unwrap();
//! println!("pool: {}", config.pool());
//! println!("mounts under: {}", config.mount_root().display());
//! ```

pub mod schema;

pub use schema::{EngineConfig, LogConfig, LogFormat, ReaperConfig};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Default pool name.
pub const DEFAULT_POOL: &str = "stratum";

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Loaded configuration with defaults applied through accessors.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Raw file contents.
    pub file: EngineConfig,
    /// Where the file was loaded from, if anywhere.
    path: Option<PathBuf>,
}

impl Config {
    /// Load configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read, parsed
    /// or validated, or if `explicit` names a file that does not exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            return Self::from_file(path);
        }

        match Self::find_config() {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Locate a config file in the standard locations.
    fn find_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("STRATUM_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        if let Ok(xdg_home) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_home).join("stratum/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        dirs::home_dir()
            .map(|home| home.join(".stratum/config.toml"))
            .filter(|path| path.exists())
    }

    /// Read, parse and validate one config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let file = Self::parse(&content).map_err(|message| ConfigError::ParseError {
            path: path.to_path_buf(),
            message,
        })?;
        file.validate()?;
        Ok(Self {
            file,
            path: Some(path.to_path_buf()),
        })
    }

    fn parse(content: &str) -> Result<EngineConfig, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Path the configuration was loaded from.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn pool(&self) -> &str {
        self.file.pool.as_deref().unwrap_or(DEFAULT_POOL)
    }

    pub fn mount_root(&self) -> PathBuf {
        self.file
            .mount_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/var/lib/{}/mnt", self.pool())))
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.file
            .metadata_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/var/lib/{}/meta", self.pool())))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.file.command_timeout_secs.unwrap_or(60))
    }

    pub fn reaper_interval(&self) -> Duration {
        let secs = self
            .file
            .reaper
            .as_ref()
            .and_then(|r| r.interval_secs)
            .unwrap_or(60);
        Duration::from_secs(secs)
    }

    pub fn log(&self) -> LogConfig {
        self.file.log.clone().unwrap_or_default()
    }
}
