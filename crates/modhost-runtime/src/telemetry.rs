//! Tracing subscriber set-up.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::HostError;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over `config.filter`. Fails if a global subscriber is
/// already set.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), HostError> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| HostError::Telemetry(e.to_string()))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, HostError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| HostError::Telemetry(format!("invalid filter `{}`: {e}", config.filter))),
    }
}
