//! Error types for BLE drivers

use fitbridge_core::DisconnectReason;
use fitbridge_osc::OscError;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors raised by local and remote BLE drivers
#[derive(Error, Debug)]
pub enum BleDriverError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("BLE adapter error: {0}")]
    Adapter(String),

    #[error("Device not found: {address}")]
    DeviceNotFound { address: String },

    #[error("Device not connected: {address}")]
    NotConnected { address: String },

    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound { uuid: String },

    #[error("Descriptor not found: {uuid}")]
    DescriptorNotFound { uuid: String },

    #[error("GATT operation failed: {0}")]
    Operation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Malformed driver message: {0}")]
    Protocol(String),

    #[error("Driver transport error: {0}")]
    Transport(#[from] OscError),

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl BleDriverError {
    /// Disconnect reason a manager records when this error ends its connection
    pub fn reason(&self) -> DisconnectReason {
        match self {
            BleDriverError::AdapterNotAvailable => DisconnectReason::BleDisabled,
            BleDriverError::Adapter(_) | BleDriverError::Transport(_) => {
                DisconnectReason::PrepareError
            }
            BleDriverError::Timeout(_) => DisconnectReason::Timeout,
            _ => DisconnectReason::OperationError,
        }
    }
}

impl From<btleplug::Error> for BleDriverError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => BleDriverError::Operation("device not found".into()),
            btleplug::Error::NotConnected => BleDriverError::Operation("not connected".into()),
            btleplug::Error::TimedOut(d) => BleDriverError::Timeout(format!("{d:?}")),
            btleplug::Error::PermissionDenied => BleDriverError::AdapterNotAvailable,
            other => BleDriverError::Operation(other.to_string()),
        }
    }
}

/// Result type for BLE driver operations
pub type Result<T> = std::result::Result<T, BleDriverError>;
