// SPDX-License-Identifier: GPL-3.0-only

//! Init-time configuration for the capture core
//!
//! The core carries no process-wide mutable state; everything that used to be
//! a global toggle (log backend, field-service fallbacks) is a field of
//! [`CoreConfig`], constructed by the embedding application and passed in
//! when the core is created.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Logging configuration consumed by [`crate::logging::init`]
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive applied when `RUST_LOG` is not set (e.g. "info",
    /// "tofcam=debug")
    pub default_filter: String,
    /// Mirror log output to this file in addition to stderr
    pub log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: "warn".to_string(),
            log_file: None,
        }
    }
}

/// Behavior switches for the non-volatile storage layer
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Load `<serial>.zwetschge` from the working directory when the
    /// calibration block in flash carries a zero CRC.
    ///
    /// This is a field-service accommodation for modules whose flash was
    /// miswritten; production deployments should leave it disabled.
    pub filesystem_fallback: bool,
    /// Directory searched for `<serial>.zwetschge` and `<serial>.cal`
    /// override files when `filesystem_fallback` is enabled
    pub fallback_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            filesystem_fallback: false, // field-service only
            fallback_dir: PathBuf::from("."),
        }
    }
}

/// Capture pipeline tuning
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Buffer count requested from the bridge when a use case starts.
    /// The bridge may allocate fewer if the platform imposes a cap.
    pub preferred_buffer_count: usize,
    /// Interval, in delivered frame groups, between raw-frame-statistics
    /// events
    pub stats_interval: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            preferred_buffer_count: 4,
            stats_interval: 100,
        }
    }
}

/// Top-level configuration handed to the core at creation time
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub log: LogConfig,
    pub storage: StorageConfig,
    pub capture: CaptureConfig,
}
