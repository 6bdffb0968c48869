//! telemetry
//!
//! Tracing subscriber setup for the daemon.
//!
//! `RUST_LOG`, when set, overrides the configured filter. Output is either
//! human-readable text or one JSON object per event.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::core::config::schema::{LogConfig, LogFormat};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("cannot install log subscriber: {0}")]
    Install(String),
}

/// The filter to use: `RUST_LOG` if set, otherwise the configured one.
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(config.filter()).map_err(|e| TelemetryError::InvalidFilter {
        filter: config.filter().to_string(),
        message: e.to_string(),
    })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LogConfig) -> Result<(), TelemetryError> {
    let registry = tracing_subscriber::registry().with(env_filter(config)?);
    match config.format() {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    }
    .map_err(|e| TelemetryError::Install(e.to_string()))
}
