//! Error handling for the fitbridge CLI

use fitbridge_ble::BleDriverError;
use fitbridge_core::FitError;
use fitbridge_osc::OscError;
use fitbridge_runtime::ServiceError;
use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Database error: {0}")]
    Core(#[from] FitError),

    #[error("Transport error: {0}")]
    Transport(#[from] OscError),

    #[error("BLE driver error: {0}")]
    Driver(#[from] BleDriverError),

    #[error("{0}")]
    Service(#[from] ServiceError),

    /// Backend refused a control command; carries the operator toast
    #[error("{0}")]
    Rejected(String),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
