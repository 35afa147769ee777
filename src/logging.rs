//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the application. [`init`] is a convenience for binaries and tests.
//!
//! Level policy used across the crate:
//!
//! | level   | used for                                                  |
//! |---------|-----------------------------------------------------------|
//! | `error` | protocol alerts, component panics, worker failures        |
//! | `warn`  | rejected operations, dropped mutations, malformed data    |
//! | `info`  | connection changes, exposure/sequence start and finish    |
//! | `debug` | state transitions, mutations sent                         |
//! | `trace` | per-property cache traffic                                |

use crate::config::LoggingConfig;
use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over `config.level`. Fails (without panicking)
/// when a global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = filter_for(config)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

/// Build the filter: `RUST_LOG` if set, otherwise the configured level.
pub fn filter_for(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| anyhow!("invalid log level '{}': {e}", config.level)),
    }
}
