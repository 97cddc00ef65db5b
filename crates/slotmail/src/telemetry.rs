//! Logging initialization.
//!
//! `log` records from the storage layer are bridged into `tracing`, so one
//! subscriber sees both.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("A log bridge is already installed: {0}")]
    LogBridge(#[from] log::SetLoggerError),

    #[error("A global subscriber is already installed: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// `RUST_LOG` wins over the configured level.
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| TelemetryError::Filter {
        filter: config.level.clone(),
        reason: e.to_string(),
    })
}

/// Installs the global subscriber. Once a subscriber is installed, later
/// calls do nothing.
pub fn init(config: &LoggingConfig) -> Result<(), TelemetryError> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let filter = build_filter(config)?;

    tracing_log::LogTracer::init()?;

    let json_layer = config
        .json
        .then(|| fmt::layer().json().with_target(true).with_current_span(true));
    let plain_layer = (!config.json).then(|| fmt::layer().with_target(true));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(plain_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    tracing::debug!(level = %config.level, json = config.json, "Logging initialized");
    Ok(())
}
