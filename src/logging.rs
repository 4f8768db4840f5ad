//! Tracing initialization.
//!
//! Structured, async-aware logging built on `tracing` and
//! `tracing-subscriber`. The level comes from the settings file and can be
//! overridden per-module with the standard `RUST_LOG` environment variable.

use crate::config::Settings;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the global subscriber from configuration.
///
/// Returns an error string if the configured level is invalid or a global
/// subscriber is already installed (tests install their own).
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    let level = parse_log_level(&settings.application.log_level)?;
    init_with_level(level)
}

/// Initialize with an explicit level.
pub fn init_with_level(level: Level) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| format!("failed to install tracing subscriber: {e}"))
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(format!(
            "Invalid log level '{other}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}
