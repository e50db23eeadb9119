// SPDX-License-Identifier: GPL-3.0-only

//! Log subscriber installation
//!
//! The core itself only emits `tracing` events; installing a subscriber is
//! the embedding application's choice. This helper wires up the common case:
//! an env-filtered fmt subscriber, optionally mirrored to a file.

use crate::config::LogConfig;
use crate::errors::{CoreError, CoreResult};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber from the given configuration.
///
/// `RUST_LOG` takes precedence over `config.default_filter`. Returns
/// `WrongState` if a subscriber is already installed.
pub fn init(config: &LogConfig) -> CoreResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter.clone()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true);

    let result = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.try_init(),
    };

    result.map_err(|e| CoreError::WrongState(format!("log subscriber already set: {e}")))
}
