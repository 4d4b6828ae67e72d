//! Model registry: the explicit catalogue of model specs a run selects from.

use std::collections::BTreeMap;

use tracing::debug;

use crate::domain::{EngineError, Modality, ModelSpec, ProviderKind, Result, TaskType};

/// Registered model specs, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from specs, rejecting duplicate ids.
    pub fn from_specs(specs: impl IntoIterator<Item = ModelSpec>) -> Result<Self> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, spec: ModelSpec) -> Result<()> {
        if self.models.contains_key(&spec.id) {
            return Err(EngineError::DuplicateModel(spec.id));
        }
        debug!(model_id = %spec.id, provider = %spec.provider, "model registered");
        self.models.insert(spec.id.clone(), spec);
        Ok(())
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelSpec> {
        self.models.get(model_id)
    }

    /// Models filtered by provider and/or task.
    pub fn list(&self, provider: Option<ProviderKind>, task: Option<TaskType>) -> Vec<&ModelSpec> {
        self.models
            .values()
            .filter(|m| provider.map_or(true, |p| m.provider == p))
            .filter(|m| task.map_or(true, |t| m.tasks.contains(&t)))
            .collect()
    }

    /// Models able to serve a dataset of `task` and `modality`.
    pub fn find_models(&self, task: TaskType, modality: Modality) -> Vec<&ModelSpec> {
        self.models
            .values()
            .filter(|m| m.supports(task, modality))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
