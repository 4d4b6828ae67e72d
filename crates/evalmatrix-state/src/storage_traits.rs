//! Storage trait definitions for evalmatrix
//!
//! `ResultStore` is the only shared mutable resource of a run. It is
//! async and backend-agnostic; an in-memory fake is provided in the
//! `fakes` module, a JSON-on-disk store in `fs_store`, and a SurrealDB
//! store in `surreal_store`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::outcome::PredictionOutcome;
use crate::result_set::{ResultSet, UpsertDisposition};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Identifier of a prediction run (the unit of resumability).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        RunId(s)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable, mergeable mapping from cell identity to outcome, per run.
///
/// Guarantees:
/// - `upsert` is atomic per cell and follows the resolution rule of
///   [`crate::outcome::prefer`]: a terminal outcome is never overwritten by
///   a non-terminal one and a success is never replaced by a failure.
/// - Terminal outcomes are durable once `upsert` returns.
/// - Non-terminal outcomes are durable after the next `flush` or `persist`.
/// - `persist` merges into what is stored; it never discards a success.
/// - `load` after `persist` returns an equal `ResultSet`.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Load the result set of a run, or `None` if nothing was stored.
    async fn load(&self, run_id: &RunId) -> StorageResult<Option<ResultSet>>;

    /// Apply one outcome to a run's result set.
    async fn upsert(
        &self,
        run_id: &RunId,
        outcome: PredictionOutcome,
    ) -> StorageResult<UpsertDisposition>;

    /// Merge `set` into the stored result set for `set.run_id()` and write it.
    async fn persist(&self, set: &ResultSet) -> StorageResult<()>;

    /// Make buffered non-terminal outcomes durable (checkpoint).
    async fn flush(&self, run_id: &RunId) -> StorageResult<()>;

    /// List all stored runs, ordered by id.
    async fn list_runs(&self) -> StorageResult<Vec<RunId>>;
}
