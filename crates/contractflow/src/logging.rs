//! Process-wide log subscriber setup.
//!
//! Library code logs through the `log` macros and opens `tracing` spans around
//! job execution and dependency calls. `init` installs a single subscriber that
//! receives both.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::schema::LoggingConfig;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;

    if config.json {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))?;
    } else {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))?;
    }

    tracing_log::LogTracer::init().map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))?;

    log::debug!(
        "Logging initialised (level={}, json={})",
        config.level,
        config.json
    );
    Ok(())
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| LoggingError::InvalidFilter {
        filter: config.level.clone(),
        reason: e.to_string(),
    })
}
