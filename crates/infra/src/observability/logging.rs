//! Tracing subscriber setup

use regsync_domain::{LoggingConfig, RegSyncError};
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` when set, otherwise the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, RegSyncError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            RegSyncError::Config(format!("invalid log level '{}': {e}", config.level))
        }),
    }
}

/// Install the global `fmt` subscriber.
///
/// Returns a config error if a global subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), RegSyncError> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = if config.json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| RegSyncError::Config(format!("tracing already initialised: {e}")))
}
