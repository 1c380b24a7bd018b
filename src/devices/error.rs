use thiserror::Error;

use crate::persistence::SettingsError;

/// Failures of the hardware behind a device.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Unable to open {target}: {reason}")]
    Open { target: String, reason: String },

    #[error("Unable to write to {target}: {reason}")]
    Write { target: String, reason: String },

    #[error("Backend task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Unsupported command '{0}'")]
    UnsupportedCommand(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Failed to persist device state: {0}")]
    Settings(#[from] SettingsError),
}
