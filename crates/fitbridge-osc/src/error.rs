//! Error types for the OSC transport

use fitbridge_core::FitError;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors raised by the OSC codec and transport
#[derive(Error, Debug)]
pub enum OscError {
    #[error("Malformed packet: {0}")]
    Decode(String),

    #[error("Cannot encode message: {0}")]
    Encode(String),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport closed")]
    Closed,

    #[error("No reply to {address} before the deadline")]
    Timeout { address: String },

    #[error("Object codec error: {0}")]
    Object(#[from] FitError),
}

impl OscError {
    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        OscError::Decode(reason.into())
    }
}

/// Result type for OSC operations
pub type Result<T> = std::result::Result<T, OscError>;
