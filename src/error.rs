//! Custom error types for the application.
//!
//! This module defines the primary error type, `CockpitError`, used by the
//! application-level APIs (configuration, depot, interfaces, experiments and
//! the GUI dispatcher). It is built with `thiserror` so every variant carries
//! a readable message and underlying errors convert with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while reading or merging the
//!   configuration sources.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine
//!   (duplicate device names, invalid log level, missing device keys).
//! - **`Io`**: Wraps `std::io::Error` for file access.
//! - **Registry errors** (`UnknownDeviceType`, `DuplicateDevice`,
//!   `DuplicateHandler`, `DeviceNotFound`, `HandlerNotFound`) raised by the
//!   depot while it is populated or queried.
//! - **`Device`**: A device or handler operation failed. Device drivers use
//!   `anyhow::Result` internally; the message is preserved here.
//! - **`Experiment`** / **`ExperimentRunning`**: Experiment execution errors.
//! - **`ShutdownFailed`**: Aggregates every error collected while tearing the
//!   devices down, so a single failing device does not hide the others.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, CockpitError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum CockpitError {
    /// Reading or merging a configuration source failed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The configuration parsed but is not valid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or stream I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A device definition names a type no factory knows.
    #[error("Unknown device type '{type_name}' for device '{device}'")]
    UnknownDeviceType {
        /// Device name from the configuration.
        device: String,
        /// Type string that was not recognised.
        type_name: String,
    },

    /// Two devices share the same name.
    #[error("Device '{0}' is already registered")]
    DuplicateDevice(String),

    /// Two handlers share the same name.
    #[error("Handler '{0}' is already registered")]
    DuplicateHandler(String),

    /// No device with this name exists in the depot.
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),

    /// No handler with this name exists in the depot.
    #[error("Handler '{0}' not found")]
    HandlerNotFound(String),

    /// A device operation failed.
    #[error("Device '{device}' error: {message}")]
    Device {
        /// Device or handler name.
        device: String,
        /// Error message from the driver.
        message: String,
    },

    /// The operation requires an enabled device.
    #[error("Device '{0}' is disabled")]
    DeviceDisabled(String),

    /// Waiting for an event or a device timed out.
    #[error("Timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    /// Experiment execution failed.
    #[error("Experiment error: {0}")]
    Experiment(String),

    /// An experiment is already running.
    #[error("An experiment is already running")]
    ExperimentRunning,

    /// A GUI command could not be understood or executed.
    #[error("GUI error: {0}")]
    Gui(String),

    /// Errors collected while shutting devices down.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<CockpitError>),
}

impl CockpitError {
    /// Wrap a driver-level `anyhow` error with the name of the device it came from.
    pub fn device(device: impl Into<String>, err: impl std::fmt::Display) -> Self {
        CockpitError::Device {
            device: device.into(),
            message: err.to_string(),
        }
    }

    /// Whether the application can keep running after this error.
    ///
    /// Device and GUI errors are reported to the user and the event loop
    /// carries on; configuration and shutdown errors are fatal.
    pub fn can_recover(&self) -> bool {
        !matches!(
            self,
            CockpitError::Config(_)
                | CockpitError::Configuration(_)
                | CockpitError::UnknownDeviceType { .. }
                | CockpitError::DuplicateDevice(_)
                | CockpitError::DuplicateHandler(_)
                | CockpitError::ShutdownFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_keeps_driver_message() {
        let err = CockpitError::device("camera", anyhow::anyhow!("sensor overheated"));
        assert_eq!(err.to_string(), "Device 'camera' error: sensor overheated");
        assert!(err.can_recover());
    }

    #[test]
    fn registry_errors_are_fatal() {
        assert!(!CockpitError::DuplicateHandler("x".into()).can_recover());
        assert!(!CockpitError::UnknownDeviceType {
            device: "d".into(),
            type_name: "warp_drive".into(),
        }
        .can_recover());
    }

    #[test]
    fn shutdown_failure_collects_errors() {
        let err = CockpitError::ShutdownFailed(vec![
            CockpitError::device("stage", "axis stuck"),
            CockpitError::DeviceNotFound("laser".into()),
        ]);
        match err {
            CockpitError::ShutdownFailed(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].to_string().contains("axis stuck"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
