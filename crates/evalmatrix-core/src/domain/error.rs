//! Engine-level error taxonomy.

use evalmatrix_state::StorageError;

/// Errors produced while building or running a prediction matrix.
///
/// Per-cell provider failures never appear here: they are captured into
/// outcome records. Only configuration problems and storage failures
/// surface to the caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid model spec: {0}")]
    InvalidModelSpec(String),

    #[error("invalid dataset: {0}")]
    InvalidDataset(String),

    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    #[error("invalid run manifest: {0}")]
    InvalidManifest(String),

    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("duplicate model id: {0}")]
    DuplicateModel(String),

    #[error("duplicate dataset id: {0}")]
    DuplicateDataset(String),

    #[error("no adapter registered for model {0}")]
    MissingAdapter(String),

    #[error("failed to initialise adapter for {model_id}: {reason}")]
    AdapterInit { model_id: String, reason: String },

    #[error("run aborted: {0}")]
    Aborted(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::InvalidModelSpec("model_name cannot be empty".to_string());
        assert!(err.to_string().contains("invalid model spec"));

        let err = EngineError::UnknownVariant {
            kind: "task type",
            value: "poetry".to_string(),
        };
        assert_eq!(err.to_string(), "unknown task type: poetry");
    }

    #[test]
    fn test_storage_error_converts() {
        let err: EngineError = StorageError::Backend("disk full".to_string()).into();
        assert!(matches!(err, EngineError::Storage(_)));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_adapter_init_error() {
        let err = EngineError::AdapterInit {
            model_id: "openai/gpt-4".to_string(),
            reason: "OPENAI_API_KEY is not set".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("openai/gpt-4"));
        assert!(msg.contains("OPENAI_API_KEY"));
    }
}
