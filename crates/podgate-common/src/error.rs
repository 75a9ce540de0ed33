//! Storage error types

use thiserror::Error;

/// Errors raised by registry and manifest storage backends
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A record with the same key already exists
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend failure
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;
