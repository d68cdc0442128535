//! Error types for the fitbridge core
//!
//! This module contains the error types used by the persistence layer, the
//! tagged-string codec and the derivators, and the `FitError` type that unifies
//! them.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors raised while mapping entities to and from storage rows
#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    #[error("Entity {class} has no id")]
    MissingId { class: &'static str },
    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("Alias {alias:?} must be non-empty and match [A-Za-z0-9_]+")]
    InvalidAlias { alias: String },
    #[error("Row for {table} was ignored by the database")]
    InsertIgnored { table: &'static str },
}

/// Errors raised by the tagged-string codec
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Missing tag prefix in {0:?}")]
    MissingTag(String),
    #[error("Unknown tagged class {module},{class}")]
    UnknownClass { module: String, class: String },
    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Core error type for fitbridge
#[derive(Debug, thiserror::Error)]
pub enum FitError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity error: {0}")]
    Entity(#[from] EntityError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl FitError {
    /// Create an entity field error
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        FitError::Entity(EntityError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        })
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, FitError>;
