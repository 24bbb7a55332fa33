//! Structured logging setup for applications embedding the transport.
//!
//! The library only emits `tracing` events. Installing a subscriber is the
//! application's call; `init_logging` is the stock way to do it.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{constants, Result, TransportError};

/// Build the filter for `config`: `RUST_LOG` wins when set, otherwise the
/// configured level applies to this crate and `warn` to everything else.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    let default_directive = format!(
        "warn,{}={}",
        env!("CARGO_CRATE_NAME"),
        config.log_level.as_str().to_lowercase()
    );
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install a global fmt subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| {
        TransportError::LoggingError(format!("{}: {e}", constants::ERR_SUBSCRIBER_INSTALLED))
    })?;

    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}
