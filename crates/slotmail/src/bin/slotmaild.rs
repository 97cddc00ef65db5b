//! Runs the scheduled-send loop until interrupted.
//!
//! Usage: `slotmaild [config.yaml]`. Without an argument the path is taken
//! from `SLOTMAIL_CONFIG`; without either, built-in defaults apply.

use std::path::PathBuf;
use std::process::ExitCode;

use slotmail::config::{load_config, validate_config, Config};
use slotmail::{telemetry, Engine};
use tokio::sync::watch;

const CONFIG_ENV_VAR: &str = "SLOTMAIL_CONFIG";

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
}

fn load() -> Result<Config, slotmail::ConfigError> {
    let config = match config_path() {
        Some(path) => load_config(&path)?,
        None => Config::default(),
    };
    validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("slotmaild: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = telemetry::init(&config.logging) {
        eprintln!("slotmaild: {}", e);
        return ExitCode::FAILURE;
    }

    tracing::info!("Starting slotmaild v{}", env!("CARGO_PKG_VERSION"));

    let engine = match Engine::from_config(&config) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    if !config.scheduler.enabled {
        tracing::warn!("Scheduler disabled in configuration, nothing to do");
        return ExitCode::SUCCESS;
    }

    let (stop_tx, mut stop_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    }) {
        tracing::error!(error = %e, "Failed to install Ctrl-C handler");
        return ExitCode::FAILURE;
    }

    let handle = engine.scheduler.start();

    while !*stop_rx.borrow() {
        if stop_rx.changed().await.is_err() {
            break;
        }
    }

    tracing::info!("Shutting down");
    engine.scheduler.stop();
    if let Err(e) = handle.await {
        tracing::error!(error = %e, "Scheduler task ended abnormally");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
