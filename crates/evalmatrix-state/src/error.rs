//! Error types for evalmatrix-state

use thiserror::Error;

/// Errors raised by result stores.
///
/// Every variant is run-fatal for the scheduler: resumability depends on the
/// store being trustworthy, so nothing here is swallowed into a cell outcome.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Composite cell key could not be parsed
    #[error("invalid cell key: {key}")]
    InvalidCellKey { key: String },

    /// Persisted document refers to a different run than requested
    #[error("run id mismatch: expected {expected}, found {found}")]
    RunMismatch { expected: String, found: String },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database connection error
    #[error("database connection failed: {0}")]
    Connection(String),

    /// Backend-specific error (query failures, schema setup)
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
