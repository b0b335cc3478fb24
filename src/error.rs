//! Error types for the Tollgate service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Malformed or missing request fields, rejected before any store access
    #[error("Validation error: {0}")]
    Validation(String),

    /// The tenant's monthly check quota is exhausted
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Unknown or inactive caller credential
    #[error("Credential error: {0}")]
    Credential(String),

    /// Shared store failures
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Rule loading or lookup errors
    #[error("Rule error: {0}")]
    Rules(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Usage recording errors
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
