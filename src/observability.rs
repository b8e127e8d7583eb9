//! Tracing setup
//!
//! `RUST_LOG` takes precedence over the configured filter.

use crate::config::{LogConfig, LogFormat};
use tracing_subscriber::EnvFilter;

/// Error returned when a global subscriber is already installed
#[derive(Debug)]
pub struct TracingInitError(String);

impl std::fmt::Display for TracingInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to install tracing subscriber: {}", self.0)
    }
}

impl std::error::Error for TracingInitError {}

fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global tracing subscriber
pub fn init_tracing(config: &LogConfig) -> Result<(), TracingInitError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true);

    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    result.map_err(|e| TracingInitError(e.to_string()))
}
