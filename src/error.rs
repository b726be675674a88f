//! Error taxonomy for index operations.
//!
//! Every failure mode a caller may need to branch on gets its own
//! variant: configuration problems fail at entry time, provider failures
//! are retryable, cancellation is distinguished from real errors, and
//! corruption/version mismatch signals the rebuild path.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors produced by indexing, caching, and query operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Invalid configuration (chunk sizing, index name, missing provider).
    /// Raised at index creation or operation entry, never deferred.
    #[error("configuration error: {0}")]
    Config(String),

    /// The embedding provider failed or was unavailable. Not cached;
    /// callers may retry.
    #[error("embedding provider error: {0}")]
    Provider(String),

    /// A cancellation signal was observed at a suspension point.
    #[error("operation cancelled")]
    Cancelled,

    /// Persisted state disagrees with the manifest (schema or version
    /// mismatch). Recover by rebuilding with `delete_if_exists`.
    #[error("index corrupt or incompatible: {0}")]
    Corrupt(String),

    /// A vector's dimensionality does not match the index manifest.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IndexError {
    /// True when the error is a cooperative cancellation, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IndexError::Cancelled)
    }
}
