//! Tracing subscriber setup.

use ibftgate_core::LoggingConfig;
use tracing_subscriber::EnvFilter;

use crate::error::{ServerError, ServerResult};

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over the configured level. Fails if the level
/// does not parse or a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> ServerResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            ibftgate_core::Error::configuration_with_key(e.to_string(), "logging.level")
        })?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ServerError::lifecycle(format!("failed to install tracing subscriber: {e}")))
}
