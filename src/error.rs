//! Custom error types for the device workers.
//!
//! This module defines the primary error type, `DeviceError`, shared by every
//! device module. Using the `thiserror` crate, it provides a centralized and
//! consistent way to report what went wrong, from configuration and I/O issues
//! to vendor status codes returned by the instruments themselves.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while loading the settings file.
//! - **`Configuration`**: Semantic errors in otherwise well-formed settings.
//! - **`Io`** / **`Transport`**: Serial port and other transport failures.
//! - **`Timeout`**: A bounded wait on the hardware expired.
//! - **`Elliptec`** / **`Pco`** / **`Apt`**: Error codes reported by a device or SDK.
//! - **`Validation`**: A commanded value was rejected before reaching hardware
//!   (malformed ROI, non-boolean flip flag, out-of-range output).
//! - **`SerialNumberMismatch`**: The connected device is not the one named in
//!   the connection table.
//! - **`FeatureNotEnabled`**: Functionality compiled out via feature flags.
//!
//! By using `#[from]`, `DeviceError` can be created from underlying error types
//! with the `?` operator.

use crate::devices::elliptec::ElliptecError;
use crate::devices::pco::PcoError;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DeviceError>;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport not connected")]
    NotConnected,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Elliptec device {address:X} reported: {source}")]
    Elliptec {
        address: u8,
        #[source]
        source: ElliptecError,
    },

    #[error(transparent)]
    Pco(#[from] PcoError),

    #[error("APT protocol error: {0}")]
    Apt(String),

    #[error("Invalid value: {0}")]
    Validation(String),

    #[error(
        "Device with connection {connection} has serial number '{actual}' but is specified to have serial number '{expected}' in the connection table."
    )]
    SerialNumberMismatch {
        connection: String,
        actual: String,
        expected: String,
    },

    #[error("Shot file error: {0}")]
    ShotFile(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Feature '{0}' is enabled but not yet implemented. {1}")]
    FeatureIncomplete(String, String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DeviceError>),
}

impl From<figment::Error> for DeviceError {
    fn from(err: figment::Error) -> Self {
        DeviceError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeviceError::Instrument("synth failed".to_string());
        assert_eq!(err.to_string(), "Instrument error: synth failed");
    }

    #[test]
    fn test_serial_mismatch_names_both_serials() {
        let err = DeviceError::SerialNumberMismatch {
            connection: "3".into(),
            actual: "11400123".into(),
            expected: "12345678".into(),
        };
        let text = err.to_string();
        assert!(text.contains("'11400123'"));
        assert!(text.contains("'12345678'"));
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DeviceError::ShutdownFailed(vec![
            DeviceError::Instrument("camera close".into()),
            DeviceError::NotConnected,
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
