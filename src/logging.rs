//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level.

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber
///
/// Fails if a global subscriber has already been installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(&config.level)
            .map_err(|e| Error::Configuration(format!("Invalid log level {}: {}", config.level, e)))
    })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| Error::Configuration(format!("Failed to install subscriber: {}", e)))
}
