/// Error types shared across the monitor.
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is present but its value cannot be used.
    #[error("Invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },

    /// Values parsed individually but do not make sense together.
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Failure reported by the sensor update callback.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The consumer has not finished registering the sensor yet.
    #[error("Sensor {0} is not registered yet")]
    NotRegistered(String),

    #[error("Sensor update failed: {0}")]
    Failed(String),
}

impl UpdateError {
    /// Registration races are expected right after a device is first seen
    pub fn is_benign(&self) -> bool {
        matches!(self, UpdateError::NotRegistered(_))
    }
}

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with {status}: {output}")]
    ExitStatus {
        command: String,
        status: String,
        output: String,
    },
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to spawn capture worker for hci{interface}: {source}")]
    Spawn {
        interface: u16,
        #[source]
        source: io::Error,
    },
}
