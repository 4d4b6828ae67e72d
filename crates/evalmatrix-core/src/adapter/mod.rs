//! Model adapter contract and adapter selection.
//!
//! An adapter issues exactly one prediction call per `execute` and returns
//! either an output payload or a classified [`AdapterError`]. Retries,
//! backoff and concurrency are the scheduler's job, never the adapter's.

pub mod echo;
pub mod openai;
pub mod scripted;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evalmatrix_state::{CellError, ErrorClass};

use crate::domain::{DatasetItem, EngineError, ModelSpec, ProviderKind, Result};
use crate::matrix::Matrix;

pub use echo::EchoAdapter;
pub use openai::OpenAiAdapter;
pub use scripted::{ScriptStep, ScriptedAdapter};

/// Classified failure of a single prediction call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Network failure, 5xx or timeout.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Explicit provider throttling, optionally with a retry-after hint.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Credential rejected; fatal to the model, not the run.
    #[error("authentication failure: {0}")]
    Auth(String),

    /// The item is malformed for this model.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Anything the adapter could not classify.
    #[error("unknown provider error: {0}")]
    Unknown(String),
}

impl AdapterError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        AdapterError::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            AdapterError::Transient(_) => ErrorClass::Transient,
            AdapterError::RateLimited { .. } => ErrorClass::RateLimited,
            AdapterError::Auth(_) => ErrorClass::Auth,
            AdapterError::InvalidInput(_) => ErrorClass::InvalidInput,
            AdapterError::Unknown(_) => ErrorClass::Unknown,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdapterError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AdapterError::Transient(m)
            | AdapterError::Auth(m)
            | AdapterError::InvalidInput(m)
            | AdapterError::Unknown(m) => m,
            AdapterError::RateLimited { message, .. } => message,
        }
    }

    /// Error classification as recorded on an outcome.
    pub fn to_cell_error(&self) -> CellError {
        CellError::new(self.class(), self.message())
            .with_retry_after_ms(self.retry_after().map(|d| d.as_millis() as u64))
    }
}

/// Uniform interface to one provider/model.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Issue a single prediction call for `item`.
    ///
    /// `timeout` is the per-call budget; the scheduler also enforces it.
    async fn execute(
        &self,
        item: &DatasetItem,
        timeout: Duration,
    ) -> std::result::Result<serde_json::Value, AdapterError>;
}

/// Creates adapters for model specs.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, spec: &ModelSpec) -> Result<Arc<dyn ModelAdapter>>;
}

/// Selects the built-in adapter matching the model's provider kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAdapterFactory;

impl AdapterFactory for DefaultAdapterFactory {
    fn create(&self, spec: &ModelSpec) -> Result<Arc<dyn ModelAdapter>> {
        let adapter: Arc<dyn ModelAdapter> = match spec.provider {
            ProviderKind::OpenAi => Arc::new(OpenAiAdapter::from_spec(spec)?),
            ProviderKind::Echo => Arc::new(EchoAdapter::new()),
            ProviderKind::Scripted => Arc::new(ScriptedAdapter::from_spec(spec)?),
        };
        Ok(adapter)
    }
}

/// Adapters keyed by model id, passed explicitly to the runner.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<String, Arc<dyn ModelAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter for every model using `factory`.
    pub fn from_specs<'a>(
        factory: &dyn AdapterFactory,
        specs: impl IntoIterator<Item = &'a ModelSpec>,
    ) -> Result<Self> {
        let mut set = Self::new();
        for spec in specs {
            set.insert(spec.id.clone(), factory.create(spec)?);
        }
        Ok(set)
    }

    /// Register (or replace) the adapter for `model_id`.
    pub fn insert(&mut self, model_id: impl Into<String>, adapter: Arc<dyn ModelAdapter>) {
        self.adapters.insert(model_id.into(), adapter);
    }

    pub fn with(mut self, model_id: impl Into<String>, adapter: Arc<dyn ModelAdapter>) -> Self {
        self.insert(model_id, adapter);
        self
    }

    pub fn get(&self, model_id: &str) -> Option<&Arc<dyn ModelAdapter>> {
        self.adapters.get(model_id)
    }

    /// Fail if any model of the matrix has no adapter.
    pub fn ensure_covers(&self, matrix: &Matrix) -> Result<()> {
        match matrix.model_ids().find(|id| !self.adapters.contains_key(*id)) {
            Some(missing) => Err(EngineError::MissingAdapter(missing.to_string())),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.adapters.keys().collect();
        ids.sort();
        f.debug_struct("AdapterSet").field("models", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Dataset, DatasetFields, Modality, ModelSpecFields, TaskType};
    use serde_json::json;

    #[test]
    fn test_error_classes() {
        assert_eq!(AdapterError::Transient("x".into()).class(), ErrorClass::Transient);
        assert_eq!(AdapterError::Auth("x".into()).class(), ErrorClass::Auth);
        assert_eq!(
            AdapterError::InvalidInput("x".into()).class(),
            ErrorClass::InvalidInput
        );
        assert_eq!(AdapterError::Unknown("x".into()).class(), ErrorClass::Unknown);
    }

    #[test]
    fn test_rate_limited_hint_reaches_cell_error() {
        let err = AdapterError::rate_limited("slow down", Some(Duration::from_secs(2)));
        let cell = err.to_cell_error();
        assert_eq!(cell.class, ErrorClass::RateLimited);
        assert_eq!(cell.message, "slow down");
        assert_eq!(cell.retry_after_ms, Some(2000));
    }

    #[test]
    fn test_default_factory_selects_by_provider() {
        let spec = ModelSpec::new(ModelSpecFields::new(
            ProviderKind::Echo,
            "mirror",
            [TaskType::Chat],
            [Modality::Text],
        ))
        .unwrap();
        let set = AdapterSet::from_specs(&DefaultAdapterFactory, [&spec]).unwrap();
        assert!(set.get("echo/mirror").is_some());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_ensure_covers_reports_missing_model() {
        let spec = ModelSpec::new(ModelSpecFields::new(
            ProviderKind::Echo,
            "mirror",
            [TaskType::Chat],
            [Modality::Text],
        ))
        .unwrap();
        let dataset = Dataset::new(
            DatasetFields::new("d", TaskType::Chat, Modality::Text),
            vec![DatasetItem::new("1", json!("hi"))],
        )
        .unwrap();
        let matrix = Matrix::builder().model(spec).dataset(dataset).build().unwrap();

        let err = AdapterSet::new().ensure_covers(&matrix).unwrap_err();
        assert!(matches!(err, EngineError::MissingAdapter(id) if id == "echo/mirror"));

        let set = AdapterSet::new().with("echo/mirror", Arc::new(EchoAdapter::new()));
        assert!(set.ensure_covers(&matrix).is_ok());
    }
}
