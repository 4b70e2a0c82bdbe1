//! Error types for GATT central operations
//!
//! `CentralError` covers caller contract violations and setup failures, which
//! are returned synchronously. Runtime rejections (peer not connected, missing
//! characteristic, transport refusal) never surface here; they are reported
//! through the handler as a [`Failure`](crate::event::Failure).

use thiserror::Error;

/// Result type for central operations
pub type CentralResult<T> = Result<T, CentralError>;

/// Errors that can occur while setting up or driving the GATT central
#[derive(Error, Debug)]
pub enum CentralError {
    #[error("Invalid peer address: {0:?}")]
    InvalidAddress(String),

    #[error("Invalid UUID: {0:?}")]
    InvalidUuid(String),

    #[error("BLE adapter error: {0}")]
    AdapterError(String),

    #[error("BLE transport error: {0}")]
    Transport(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<btleplug::Error> for CentralError {
    fn from(err: btleplug::Error) -> Self {
        CentralError::Transport(err.to_string())
    }
}

impl From<uuid::Error> for CentralError {
    fn from(err: uuid::Error) -> Self {
        CentralError::InvalidUuid(err.to_string())
    }
}
