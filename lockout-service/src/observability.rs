//! Structured logging

use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{Error, Result};

/// Install the JSON tracing subscriber
///
/// `service.log_level` accepts a plain level or a full `EnvFilter`
/// directive (`info,lockout_service=debug`). An unparsable value falls back
/// to `info`. Call once per process.
pub fn init_tracing(config: &Config) -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_current_span(false)
        .with_env_filter(build_filter(&config.service.log_level))
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::info!(service = %config.service.name, "Tracing initialized");
    Ok(())
}

fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
}
