//! Domain models for evalmatrix.
//!
//! - `ModelSpec`: validated description of one model backend
//! - `Dataset` / `DatasetItem`: ordered evaluation items with stable ids
//! - `EngineError`: configuration and run-fatal errors

pub mod dataset;
pub mod error;
pub mod model;

pub use dataset::{Dataset, DatasetFields, DatasetItem};
pub use error::{EngineError, Result};
pub use model::{InvocationConfig, Modality, ModelSpec, ModelSpecFields, ProviderKind, TaskType};
