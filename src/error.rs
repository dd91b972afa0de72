//! Error types for Bulwark.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Bulwark operations.
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors that escaped the failure policy
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;
