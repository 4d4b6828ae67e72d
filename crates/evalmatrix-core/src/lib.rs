//! evalmatrix core library
//!
//! Builds the (model × dataset item) prediction matrix, drives every cell to
//! a terminal outcome through bounded, retrying, resumable execution, and
//! aggregates the result set into annotation records and per-model summaries.

pub mod adapter;
pub mod aggregator;
pub mod config;
pub mod domain;
pub mod manifest;
pub mod matrix;
pub mod metrics;
pub mod obs;
pub mod registry;
pub mod reporting;
pub mod scheduler;
pub mod telemetry;

pub use adapter::{
    AdapterError, AdapterFactory, AdapterSet, DefaultAdapterFactory, EchoAdapter, ModelAdapter,
    OpenAiAdapter, ScriptStep, ScriptedAdapter,
};

pub use aggregator::{
    aggregate, annotation_records, model_summaries, Aggregation, AnnotationRecord, FailureKind,
    ModelSummary,
};

pub use config::EngineConfig;

pub use domain::{
    Dataset, DatasetFields, DatasetItem, EngineError, InvocationConfig, Modality, ModelSpec,
    ModelSpecFields, ProviderKind, Result, TaskType,
};

pub use manifest::{DatasetEntry, RunManifest};

pub use matrix::{ExcludedPair, ItemCatalog, Matrix, MatrixBuilder};

pub use registry::ModelRegistry;

pub use reporting::{
    content_digest, read_annotation_jsonl, render_summary_md, write_annotation_jsonl,
    write_summary_json, write_summary_md, SummaryReport,
};

pub use scheduler::{CancelToken, CircuitBreaker, MatrixRunner, RetryPolicy, RunReport};

pub use telemetry::init_tracing;

pub use evalmatrix_state::{
    CellError, CellKey, ErrorClass, FsResultStore, OutcomeStatus, PredictionOutcome, Provenance,
    ResultSet, ResultStore, RunId, StorageError, SurrealResultStore,
};
