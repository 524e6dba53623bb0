//! Custom error types for the application.
//!
//! This module defines the primary error type, `RigError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of a polling rig:
//!
//! - **`Connection`**: the transport could not be established. Reported to
//!   the caller once; the device stays `Disconnected` and nothing retries.
//! - **`Timeout`**: no reply arrived within the retry budget. Polls treat
//!   this as "no data" and the connection state is preserved unless the
//!   transport itself dropped.
//! - **`DeviceAbsent`**: the sensor answered with the all-0xFF sentinel,
//!   meaning nothing is wired at that address. Treated as a disconnection.
//! - **`ProgramRange`**: a setpoint program was queried past its horizon.
//!   Fails the current control step only; the loop keeps running.
//! - **`Validation`**: malformed command arguments, rejected at the command
//!   boundary before anything is enqueued.
//!
//! `#[from]` conversions let the ambient I/O, CSV, and configuration errors
//! flow through with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

#[derive(Error, Debug)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not connect to '{device}': {reason}")]
    Connection { device: String, reason: String },

    #[error("Timed out waiting for a reply from '{0}'")]
    Timeout(String),

    #[error("Sensor reports not present (0xFF sentinel)")]
    DeviceAbsent,

    #[error("Malformed sensor reply: {0}")]
    MalformedReply(String),

    #[error("Setpoint program has no value at t = {0:.3} s")]
    ProgramRange(f64),

    #[error("Invalid command: {0}")]
    Validation(String),

    #[error("Device '{device}' does not support '{operation}'")]
    Unsupported { device: String, operation: String },

    #[error("Device '{0}' is not registered")]
    UnknownDevice(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl RigError {
    /// True for failures a poll reports as "no data" while keeping the
    /// device connected.
    pub fn is_transient(&self) -> bool {
        matches!(self, RigError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RigError::Connection {
            device: "MFC1".to_string(),
            reason: "port busy".to_string(),
        };
        assert_eq!(err.to_string(), "Could not connect to 'MFC1': port busy");
    }

    #[test]
    fn test_timeout_is_transient() {
        assert!(RigError::Timeout("SHT1".into()).is_transient());
        assert!(!RigError::DeviceAbsent.is_transient());
    }
}
