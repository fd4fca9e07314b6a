//! Custom error types for the crate.
//!
//! This module defines the primary error type, `FlyError`, used by every device,
//! signal and logic layer. Using the `thiserror` crate, it gives one consistent
//! way to report failures from configuration loading through to trajectory
//! execution on the (simulated) hardware.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: figment extraction failures and semantic validation errors.
//! - **`Io`**: file system problems, e.g. creating a directory for a file prefix.
//! - **`NotConnected` / `UnknownSignal` / `SignalType`**: transport problems; a
//!   signal was used before connecting, or a simulated signal was looked up with
//!   the wrong source or value type.
//! - **`Device`, `Trajectory`, `Detector`**: failures reported by the hardware
//!   layers, normally carrying the status message the device gave back.
//! - **`MotorStopped`**: a move was interrupted by `stop()`.
//! - **`Timeout`, `Cancelled`, `NotDone`**: outcomes of a [`Status`](crate::status::Status).
//! - **`InvalidState`**: lifecycle methods called out of order (e.g. `read()`
//!   before `trigger()`).
//!
//! `FlyError` is `Clone` so that a completed `Status` can hand the same outcome
//! to every waiter and callback.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type FlyResult<T> = std::result::Result<T, FlyError>;

/// Errors produced by bluefly devices and logic.
#[derive(Error, Debug, Clone)]
pub enum FlyError {
    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// A signal was used while its transport was disconnected.
    #[error("Signal {0} is not connected")]
    NotConnected(String),

    /// No simulated signal has been created for this source.
    #[error("No simulated signal registered for {0}")]
    UnknownSignal(String),

    /// A simulated signal was accessed with a value type it does not hold.
    #[error("Signal {signal} does not hold values of type {expected}")]
    SignalType {
        /// Source of the signal.
        signal: String,
        /// Requested Rust type name.
        expected: &'static str,
    },

    /// Generic device failure.
    #[error("Device error: {0}")]
    Device(String),

    /// A move was interrupted by a stop request.
    #[error("Motor was stopped")]
    MotorStopped,

    /// Trajectory build, append or execute reported a failure.
    #[error("Trajectory error: {0}")]
    Trajectory(String),

    /// Detector or file writer failure.
    #[error("Detector error: {0}")]
    Detector(String),

    /// Scan point generator misuse.
    #[error("Scan point error: {0}")]
    Points(String),

    /// An operation did not finish in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation behind a status was cancelled.
    #[error("Operation was cancelled")]
    Cancelled,

    /// The status has not completed yet.
    #[error("Status has not completed yet")]
    NotDone,

    /// A lifecycle method was called out of order.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// JSON or TOML (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for FlyError {
    fn from(err: std::io::Error) -> Self {
        FlyError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for FlyError {
    fn from(err: serde_json::Error) -> Self {
        FlyError::Serialization(err.to_string())
    }
}

impl From<figment::Error> for FlyError {
    fn from(err: figment::Error) -> Self {
        FlyError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FlyError::Trajectory("Build failed: bad axis".to_string());
        assert_eq!(err.to_string(), "Trajectory error: Build failed: bad axis");
        assert_eq!(FlyError::MotorStopped.to_string(), "Motor was stopped");
    }

    #[test]
    fn test_io_error_is_cloneable() {
        let err: FlyError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        let copy = err.clone();
        assert!(matches!(copy, FlyError::Io(_)));
        assert!(copy.to_string().contains("gone"));
    }
}
