// SPDX-License-Identifier: GPL-3.0-only

//! Error types shared by the capture core
//!
//! No panics cross the library boundary; every fallible operation returns
//! [`CoreResult`]. Low-level I/O failures are caught by the storage and
//! register layers, retried where a retry policy exists, and surfaced as
//! [`CoreError::Runtime`] otherwise.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the capture core
pub type CoreResult<T> = Result<T, CoreError>;

/// Error taxonomy of the capture core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Programming contract violation; never returned through a public API
    /// when the inputs are valid
    #[error("logic error: {0}")]
    Logic(String),

    /// Caller passed an out-of-range argument
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Storage access exceeds the configured image size
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// Feature not available for this imager or bridge combination
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Expected condition was not observed within the allotted polling
    #[error("timeout: {0}")]
    Timeout(String),

    /// Transient I/O failure; the caller may retry. The device may have
    /// accepted part of the operation before the error.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Device hardware has gone away; not recoverable without reopening
    #[error("device disconnected")]
    Disconnected,

    /// Lifecycle violation, e.g. starting the capture before initializing
    #[error("wrong state: {0}")]
    WrongState(String),

    /// A reconfiguration attempt failed, but the device has been recovered
    /// to its prior configuration. An idempotent retry is safe.
    #[error("reconfiguration failed, prior settings restored: {0}")]
    ValidButUnchanged(String),

    /// A required external configuration file is missing
    #[error("imager configuration not found: {}", .filename.display())]
    ImagerConfigNotFound { filename: PathBuf },

    /// Device not available for opening
    #[error("could not open device: {0}")]
    CouldNotOpen(String),

    /// Firmware rejected a vendor command and reported an error code
    #[error("firmware reported error {code:#06x} for request {request:#04x}")]
    FirmwareDetected { request: u8, code: u16 },
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Runtime(err.to_string())
    }
}

impl CoreError {
    /// True for errors where retrying the same operation can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Runtime(_) | CoreError::Timeout(_) | CoreError::ValidButUnchanged(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = CoreError::OutOfBounds("read beyond image size".to_string());
        assert!(err.to_string().contains("read beyond image size"));

        let err = CoreError::ImagerConfigNotFound {
            filename: PathBuf::from("0123-45-67.zwetschge"),
        };
        assert!(err.to_string().contains("0123-45-67.zwetschge"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::Runtime("usb glitch".into()).is_retryable());
        assert!(!CoreError::Disconnected.is_retryable());
        assert!(!CoreError::WrongState("not ready".into()).is_retryable());
    }
}
