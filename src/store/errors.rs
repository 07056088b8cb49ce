//! Shared store error types

use thiserror::Error;

/// Errors that can occur during shared store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store backend
    #[error("Store connection error: {0}")]
    ConnectionError(String),

    /// The backend rejected or failed a command
    #[error("Store backend error: {0}")]
    BackendError(String),

    /// A stored value could not be decoded
    #[error("Corrupted data in key '{key}': {reason}")]
    CorruptedData { key: String, reason: String },
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
