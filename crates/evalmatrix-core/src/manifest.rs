//! TOML run manifest: engine settings, model specs and dataset files.
//!
//! ```toml
//! [engine]
//! max_attempts = 2
//!
//! [[models]]
//! provider = "openai"
//! model_name = "gpt-4o-mini"
//! tasks = ["chat"]
//! modalities = ["text"]
//! invocation = { credential_env = "OPENAI_API_KEY", max_concurrency = 2 }
//!
//! [[datasets]]
//! id = "smoke"
//! task = "chat"
//! modality = "text"
//! path = "data/smoke.jsonl"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::domain::{
    Dataset, DatasetFields, EngineError, Modality, ModelSpec, ModelSpecFields, Result, TaskType,
};
use crate::matrix::Matrix;
use crate::registry::ModelRegistry;

/// A dataset entry; `path` points at a JSONL file relative to the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    pub task: TaskType,
    pub modality: Modality,
    pub path: PathBuf,
}

impl DatasetEntry {
    pub fn fields(&self) -> DatasetFields {
        DatasetFields {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            description: self.description.clone(),
            task: self.task,
            modality: self.modality,
        }
    }
}

/// Everything needed to build and run a matrix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunManifest {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub models: Vec<ModelSpecFields>,
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl RunManifest {
    /// Parse a manifest; relative dataset paths resolve against `base_dir`.
    pub fn from_toml_str(content: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut manifest: RunManifest =
            toml::from_str(content).map_err(|e| EngineError::InvalidManifest(e.to_string()))?;
        manifest.base_dir = base_dir.into();
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidManifest(format!("cannot read {}: {e}", path.display()))
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::from_toml_str(&content, base_dir).map_err(|e| match e {
            EngineError::InvalidManifest(msg) => {
                EngineError::InvalidManifest(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Validated model specs, in manifest order.
    pub fn model_specs(&self) -> Result<Vec<ModelSpec>> {
        self.models.iter().cloned().map(ModelSpec::new).collect()
    }

    pub fn registry(&self) -> Result<ModelRegistry> {
        ModelRegistry::from_specs(self.model_specs()?)
    }

    pub fn dataset_path(&self, entry: &DatasetEntry) -> PathBuf {
        if entry.path.is_absolute() {
            entry.path.clone()
        } else {
            self.base_dir.join(&entry.path)
        }
    }

    pub fn load_datasets(&self) -> Result<Vec<Dataset>> {
        self.datasets
            .iter()
            .map(|entry| Dataset::load_jsonl(entry.fields(), &self.dataset_path(entry)))
            .collect()
    }

    /// Registry and datasets combined into the run's matrix.
    pub fn build_matrix(&self) -> Result<Matrix> {
        let registry = self.registry()?;
        Matrix::builder()
            .models(registry.iter().cloned())
            .datasets(self.load_datasets()?)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProviderKind;

    const MANIFEST: &str = r#"
[engine]
max_attempts = 2
global_concurrency = 4

[[models]]
provider = "echo"
model_name = "mirror"
tasks = ["chat"]
modalities = ["text"]

[[models]]
id = "vision"
provider = "scripted"
model_name = "captioner"
tasks = ["image_captioning"]
modalities = ["image"]
invocation = { max_concurrency = 1, timeout_ms = 500 }

[[datasets]]
id = "smoke"
task = "chat"
modality = "text"
path = "smoke.jsonl"
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = RunManifest::from_toml_str(MANIFEST, "/tmp/m").unwrap();
        assert_eq!(manifest.engine.max_attempts, 2);
        assert_eq!(manifest.engine.backoff_base_ms, 500);
        assert_eq!(manifest.models.len(), 2);
        assert_eq!(manifest.datasets[0].fields().name, "smoke");
        assert_eq!(
            manifest.dataset_path(&manifest.datasets[0]),
            PathBuf::from("/tmp/m/smoke.jsonl")
        );

        let registry = manifest.registry().unwrap();
        let vision = registry.get("vision").unwrap();
        assert_eq!(vision.provider, ProviderKind::Scripted);
        assert_eq!(vision.invocation.max_concurrency, 1);
        assert!(registry.get("echo/mirror").is_some());
    }

    #[test]
    fn test_invalid_manifest_is_rejected() {
        let err = RunManifest::from_toml_str("[[models]]\nprovider = \"nope\"", ".").unwrap_err();
        assert!(matches!(err, EngineError::InvalidManifest(_)));
    }

    #[test]
    fn test_missing_manifest_names_path() {
        let err = RunManifest::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }

    #[test]
    fn test_build_matrix_from_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("smoke.jsonl"),
            "{\"id\":\"1\",\"input\":\"hi\"}\n\n{\"id\":\"2\",\"input\":\"yo\",\"reference\":\"yo\"}\n",
        )
        .unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, MANIFEST).unwrap();

        let manifest = RunManifest::load(&path).unwrap();
        let matrix = manifest.build_matrix().unwrap();
        // Only the text model is compatible with the text dataset.
        assert_eq!(matrix.len(), 2);
        assert!(matrix.cells().iter().all(|c| c.model_id == "echo/mirror"));
        assert_eq!(matrix.excluded().len(), 1);
    }
}
