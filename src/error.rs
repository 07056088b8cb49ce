//! # Error Taxonomy
//!
//! Two layers of errors are surfaced to callers:
//!
//! - [`ToolkitError`] covers failures of the coordination machinery itself (fingerprinting,
//!   the shared store, admission, configuration). These always propagate immediately and are
//!   never retried by the outcome classifier.
//! - [`CallError`] is what a guarded call returns. It wraps `ToolkitError`, the underlying
//!   call's own error when no policy claimed it, and the terminal retry-exhausted outcome.
//!
//! Ignored outcomes are not errors; see [`crate::guard::Outcome::Ignored`].

use crate::config::ConfigurationError;
use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Failures of the coordination layer
#[derive(Debug, Error)]
pub enum ToolkitError {
    /// A call signature or result could not be put into canonical form
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The shared store could not be reached or rejected the operation
    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    /// Capacity was not obtained within the configured timeout
    #[error("Admission timed out for '{key}' after {waited:?}")]
    AdmissionTimeout { key: String, waited: Duration },

    /// Invalid configuration
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The blocking adapter could not build its runtime
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl ToolkitError {
    pub fn serialization(error: impl std::fmt::Display) -> Self {
        Self::Serialization(error.to_string())
    }

    /// Whether the caller may reasonably try the whole operation again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AdmissionTimeout { .. } | Self::StoreUnavailable(_)
        )
    }
}

impl From<StoreError> for ToolkitError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::CorruptedData { key, reason } => {
                Self::Serialization(format!("corrupted data in '{key}': {reason}"))
            }
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ToolkitError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

pub type ToolkitResult<T> = Result<T, ToolkitError>;

/// Error returned by a guarded call
#[derive(Debug, Error)]
pub enum CallError<T, E> {
    /// The coordination layer failed (store, admission, serialization)
    #[error(transparent)]
    Toolkit(#[from] ToolkitError),

    /// The underlying call failed and no retry/ignore policy matched
    #[error("Call failed: {0}")]
    Call(E),

    /// A retryable outcome persisted through every allowed attempt
    #[error("Retries exhausted after {attempts} attempts (last status: {last_status:?})")]
    RetryExhausted {
        attempts: u32,
        last_status: Option<u16>,
        last: Result<T, E>,
    },
}

impl<T, E> CallError<T, E> {
    /// The coordination-layer error, if that is what failed
    pub fn as_toolkit(&self) -> Option<&ToolkitError> {
        match self {
            Self::Toolkit(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn is_admission_timeout(&self) -> bool {
        matches!(self, Self::Toolkit(ToolkitError::AdmissionTimeout { .. }))
    }
}
