//! Model specifications: identity, capabilities and invocation settings.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{EngineError, Result};

/// Kind of task a model performs or a dataset evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    TextGeneration,
    Chat,
    Translation,
    Summarization,
    TextClassification,
    ImageClassification,
    ObjectDetection,
    ImageGeneration,
    SpeechToText,
    TextToSpeech,
    AudioClassification,
    VisualQa,
    ImageCaptioning,
}

impl TaskType {
    pub const ALL: [TaskType; 13] = [
        TaskType::TextGeneration,
        TaskType::Chat,
        TaskType::Translation,
        TaskType::Summarization,
        TaskType::TextClassification,
        TaskType::ImageClassification,
        TaskType::ObjectDetection,
        TaskType::ImageGeneration,
        TaskType::SpeechToText,
        TaskType::TextToSpeech,
        TaskType::AudioClassification,
        TaskType::VisualQa,
        TaskType::ImageCaptioning,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::TextGeneration => "text_generation",
            TaskType::Chat => "chat",
            TaskType::Translation => "translation",
            TaskType::Summarization => "summarization",
            TaskType::TextClassification => "text_classification",
            TaskType::ImageClassification => "image_classification",
            TaskType::ObjectDetection => "object_detection",
            TaskType::ImageGeneration => "image_generation",
            TaskType::SpeechToText => "speech_to_text",
            TaskType::TextToSpeech => "text_to_speech",
            TaskType::AudioClassification => "audio_classification",
            TaskType::VisualQa => "visual_qa",
            TaskType::ImageCaptioning => "image_captioning",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EngineError::UnknownVariant {
                kind: "task type",
                value: s.to_string(),
            })
    }
}

/// Input modality a model accepts or a dataset provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Image,
    Audio,
    Video,
    Multimodal,
}

impl Modality {
    pub const ALL: [Modality; 5] = [
        Modality::Text,
        Modality::Image,
        Modality::Audio,
        Modality::Video,
        Modality::Multimodal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Audio => "audio",
            Modality::Video => "video",
            Modality::Multimodal => "multimodal",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Modality::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| EngineError::UnknownVariant {
                kind: "modality",
                value: s.to_string(),
            })
    }
}

/// Which adapter implementation serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions over HTTP.
    #[serde(rename = "openai")]
    OpenAi,
    /// Offline adapter that returns the item input unchanged.
    #[serde(rename = "echo")]
    Echo,
    /// Deterministic replay of scripted responses.
    #[serde(rename = "scripted")]
    Scripted,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Echo => "echo",
            ProviderKind::Scripted => "scripted",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        [ProviderKind::OpenAi, ProviderKind::Echo, ProviderKind::Scripted]
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| EngineError::UnknownVariant {
                kind: "provider",
                value: s.to_string(),
            })
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrency() -> usize {
    4
}

/// How a model is called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationConfig {
    /// Provider endpoint; adapters fall back to their own default when absent.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the credential.
    #[serde(default)]
    pub credential_env: Option<String>,
    /// Hard per-call timeout (milliseconds).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum in-flight calls to this model.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            credential_env: None,
            timeout_ms: default_timeout_ms(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Input fields for constructing a [`ModelSpec`] (as written in a run manifest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpecFields {
    /// Explicit id; defaults to `"{provider}/{model_name}"`.
    #[serde(default)]
    pub id: Option<String>,
    pub provider: ProviderKind,
    pub model_name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub tasks: Vec<TaskType>,
    pub modalities: Vec<Modality>,
    #[serde(default)]
    pub invocation: InvocationConfig,
    /// Per-model override of the engine's max attempts.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Per-model override of the rate-limited ceiling.
    #[serde(default)]
    pub rate_limited_max_attempts: Option<u32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ModelSpecFields {
    /// Minimal fields for a model; the rest take their defaults.
    pub fn new(
        provider: ProviderKind,
        model_name: impl Into<String>,
        tasks: impl IntoIterator<Item = TaskType>,
        modalities: impl IntoIterator<Item = Modality>,
    ) -> Self {
        Self {
            id: None,
            provider,
            model_name: model_name.into(),
            version: None,
            tasks: tasks.into_iter().collect(),
            modalities: modalities.into_iter().collect(),
            invocation: InvocationConfig::default(),
            max_attempts: None,
            rate_limited_max_attempts: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Validated, immutable description of one model backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSpec {
    pub id: String,
    pub provider: ProviderKind,
    pub model_name: String,
    pub version: String,
    pub tasks: BTreeSet<TaskType>,
    pub modalities: BTreeSet<Modality>,
    pub invocation: InvocationConfig,
    pub max_attempts: Option<u32>,
    pub rate_limited_max_attempts: Option<u32>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ModelSpec {
    /// Validate `fields` and build the model spec.
    pub fn new(fields: ModelSpecFields) -> Result<Self> {
        if fields.model_name.trim().is_empty() {
            return Err(EngineError::InvalidModelSpec(
                "model_name cannot be empty".to_string(),
            ));
        }

        let id = match fields.id {
            Some(id) if id.trim().is_empty() => {
                return Err(EngineError::InvalidModelSpec("id cannot be empty".to_string()))
            }
            Some(id) => id,
            None => format!("{}/{}", fields.provider, fields.model_name),
        };

        if fields.tasks.is_empty() {
            return Err(EngineError::InvalidModelSpec(format!(
                "{id}: at least one task type is required"
            )));
        }
        if fields.modalities.is_empty() {
            return Err(EngineError::InvalidModelSpec(format!(
                "{id}: at least one modality is required"
            )));
        }
        if fields.invocation.timeout_ms == 0 {
            return Err(EngineError::InvalidModelSpec(format!(
                "{id}: timeout_ms must be positive"
            )));
        }
        if fields.invocation.max_concurrency == 0 {
            return Err(EngineError::InvalidModelSpec(format!(
                "{id}: max_concurrency must be at least 1"
            )));
        }
        if fields.max_attempts == Some(0) {
            return Err(EngineError::InvalidModelSpec(format!(
                "{id}: max_attempts must be at least 1"
            )));
        }
        if fields.rate_limited_max_attempts == Some(0) {
            return Err(EngineError::InvalidModelSpec(format!(
                "{id}: rate_limited_max_attempts must be at least 1"
            )));
        }

        Ok(Self {
            id,
            provider: fields.provider,
            model_name: fields.model_name,
            version: fields.version.unwrap_or_else(|| "unknown".to_string()),
            tasks: fields.tasks.into_iter().collect(),
            modalities: fields.modalities.into_iter().collect(),
            invocation: fields.invocation,
            max_attempts: fields.max_attempts,
            rate_limited_max_attempts: fields.rate_limited_max_attempts,
            metadata: fields.metadata,
        })
    }

    /// Whether this model can serve a dataset of the given task and modality.
    pub fn supports(&self, task: TaskType, modality: Modality) -> bool {
        self.tasks.contains(&task) && self.modalities.contains(&modality)
    }

    /// Hard per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.invocation.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> ModelSpecFields {
        ModelSpecFields::new(
            ProviderKind::OpenAi,
            "gpt-4",
            [TaskType::Chat, TaskType::TextGeneration],
            [Modality::Text],
        )
    }

    #[test]
    fn test_default_id_is_provider_prefixed() {
        let spec = ModelSpec::new(fields()).unwrap();
        assert_eq!(spec.id, "openai/gpt-4");
        assert_eq!(spec.version, "unknown");
        assert_eq!(spec.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_explicit_id_is_kept() {
        let mut f = fields();
        f.id = Some("gpt4-prod".to_string());
        assert_eq!(ModelSpec::new(f).unwrap().id, "gpt4-prod");
    }

    #[test]
    fn test_validation_rejects_bad_fields() {
        let mut f = fields();
        f.model_name = "  ".to_string();
        assert!(matches!(
            ModelSpec::new(f),
            Err(EngineError::InvalidModelSpec(_))
        ));

        let mut f = fields();
        f.tasks.clear();
        assert!(ModelSpec::new(f).is_err());

        let mut f = fields();
        f.modalities.clear();
        assert!(ModelSpec::new(f).is_err());

        let mut f = fields();
        f.invocation.max_concurrency = 0;
        assert!(ModelSpec::new(f).is_err());

        let mut f = fields();
        f.invocation.timeout_ms = 0;
        assert!(ModelSpec::new(f).is_err());

        let mut f = fields();
        f.max_attempts = Some(0);
        assert!(ModelSpec::new(f).is_err());

        let mut f = fields();
        f.rate_limited_max_attempts = Some(0);
        assert!(ModelSpec::new(f).is_err());
    }

    #[test]
    fn test_supports_requires_task_and_modality() {
        let spec = ModelSpec::new(fields()).unwrap();
        assert!(spec.supports(TaskType::Chat, Modality::Text));
        assert!(!spec.supports(TaskType::Chat, Modality::Image));
        assert!(!spec.supports(TaskType::ImageCaptioning, Modality::Text));
    }

    #[test]
    fn test_enum_string_forms() {
        assert_eq!("visual_qa".parse::<TaskType>().unwrap(), TaskType::VisualQa);
        assert_eq!("multimodal".parse::<Modality>().unwrap(), Modality::Multimodal);
        assert_eq!("openai".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert!("poetry".parse::<TaskType>().is_err());

        for task in TaskType::ALL {
            let json = serde_json::to_string(&task).unwrap();
            assert_eq!(json, format!("\"{}\"", task.as_str()));
        }
    }

    #[test]
    fn test_fields_deserialize_with_defaults() {
        let f: ModelSpecFields = toml::from_str(
            r#"
            provider = "echo"
            model_name = "mirror"
            tasks = ["chat"]
            modalities = ["text"]

            [invocation]
            max_concurrency = 2
            "#,
        )
        .unwrap();
        let spec = ModelSpec::new(f).unwrap();
        assert_eq!(spec.id, "echo/mirror");
        assert_eq!(spec.invocation.max_concurrency, 2);
        assert_eq!(spec.invocation.timeout_ms, 30_000);
        assert_eq!(spec.rate_limited_max_attempts, None);
    }
}
