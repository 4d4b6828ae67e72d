//! evalmatrix-state: result storage for prediction runs
//!
//! This crate owns the durable side of a run: cell identity, per-cell
//! outcomes, result sets and the stores that persist them.
//!
//! ## Key Components
//!
//! - `CellKey`: deterministic (model, dataset, item) identity
//! - `PredictionOutcome`: the single record held per cell, with the
//!   resolution rule shared by upsert and merge
//! - `ResultSet`: per-run mapping from cell to outcome, plus provenance
//! - `ResultStore`: async store contract, implemented by
//!   `FsResultStore` (JSON snapshot plus journal), `SurrealResultStore` and the
//!   in-memory `fakes::MemoryResultStore`

mod cell;
mod error;
pub mod fakes;
mod fs_store;
mod migrations;
mod outcome;
mod result_set;
pub mod storage_traits;
mod surreal_store;

pub use cell::CellKey;
pub use error::StorageError;
pub use fs_store::FsResultStore;
pub use outcome::{prefer, CellError, ErrorClass, OutcomeStatus, PredictionOutcome, Preference};
pub use result_set::{Provenance, ResultSet, UpsertDisposition};
pub use storage_traits::{ResultStore, RunId, StorageResult};
pub use surreal_store::SurrealResultStore;
