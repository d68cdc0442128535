//! Error types for the fitbridge runtime

use fitbridge_ble::BleDriverError;
use fitbridge_core::state::MSG_DISCONNECT_FIRST;
use fitbridge_core::{ConfirmCode, DeviceState, FitError};
use fitbridge_osc::OscError;

/// Errors raised by device managers, the fleet coordinator and the service
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Core(#[from] FitError),

    #[error("Transport error: {0}")]
    Transport(#[from] OscError),

    #[error("Driver error: {0}")]
    Driver(#[from] BleDriverError),

    #[error("Unknown device type {0:?}")]
    UnknownDeviceType(String),

    #[error("No device manager {0}")]
    UnknownManager(String),

    #[error("Malformed request: {0}")]
    BadRequest(String),

    /// Fleet or manager busy
    #[error("{}", MSG_DISCONNECT_FIRST)]
    NotStopped,

    #[error("Manager is {state}, cannot {operation}")]
    InvalidState {
        state: DeviceState,
        operation: &'static str,
    },

    #[error("Connector error: {0}")]
    Connector(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Negative confirm received by a client
    #[error("{message}")]
    Rejected { code: ConfirmCode, message: String },
}

impl ServiceError {
    /// Confirm code a rejected command is answered with
    pub fn confirm_code(&self) -> ConfirmCode {
        match self {
            ServiceError::NotStopped | ServiceError::InvalidState { .. } => ConfirmCode::Failed2,
            ServiceError::Rejected { code, .. } => *code,
            _ => ConfirmCode::Failed1,
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        ServiceError::BadRequest(reason.into())
    }
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, ServiceError>;
