//! Matrix builder: the cross-product of selected models and dataset items.
//!
//! Only compatible (model, dataset) pairs contribute cells: the model must
//! declare the dataset's task type and modality. Incompatible pairs are
//! recorded for diagnostics and never scheduled.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use evalmatrix_state::CellKey;
use tracing::debug;

use crate::domain::{Dataset, DatasetItem, EngineError, ModelSpec, Result};

/// A (model, dataset) pair left out of the matrix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExcludedPair {
    pub model_id: String,
    pub dataset_id: String,
}

/// Collects models and datasets for a run.
#[derive(Debug, Default)]
pub struct MatrixBuilder {
    models: Vec<ModelSpec>,
    datasets: Vec<Dataset>,
}

impl MatrixBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(mut self, spec: ModelSpec) -> Self {
        self.models.push(spec);
        self
    }

    pub fn models(mut self, specs: impl IntoIterator<Item = ModelSpec>) -> Self {
        self.models.extend(specs);
        self
    }

    pub fn dataset(mut self, dataset: Dataset) -> Self {
        self.datasets.push(dataset);
        self
    }

    pub fn datasets(mut self, datasets: impl IntoIterator<Item = Dataset>) -> Self {
        self.datasets.extend(datasets);
        self
    }

    /// Build the matrix. The cell set depends only on the selection, not on
    /// the order models and datasets were added.
    pub fn build(self) -> Result<Matrix> {
        let mut models = BTreeMap::new();
        for spec in self.models {
            if models.contains_key(&spec.id) {
                return Err(EngineError::DuplicateModel(spec.id));
            }
            models.insert(spec.id.clone(), Arc::new(spec));
        }

        let mut datasets = BTreeMap::new();
        for dataset in self.datasets {
            if datasets.contains_key(dataset.id()) {
                return Err(EngineError::DuplicateDataset(dataset.id().to_string()));
            }
            datasets.insert(dataset.id().to_string(), Arc::new(dataset));
        }

        let mut cells = BTreeSet::new();
        let mut excluded = Vec::new();
        for model in models.values() {
            for dataset in datasets.values() {
                if !model.supports(dataset.task(), dataset.modality()) {
                    excluded.push(ExcludedPair {
                        model_id: model.id.clone(),
                        dataset_id: dataset.id().to_string(),
                    });
                    continue;
                }
                for item in dataset.items() {
                    cells.insert(CellKey::new(&model.id, dataset.id(), &item.id));
                }
            }
        }

        debug!(
            models = models.len(),
            datasets = datasets.len(),
            cells = cells.len(),
            excluded = excluded.len(),
            "matrix built"
        );

        Ok(Matrix {
            models,
            datasets,
            cells: cells.into_iter().collect(),
            excluded,
        })
    }
}

/// The scheduled cells of a run, with their models and items indexed.
#[derive(Debug, Clone)]
pub struct Matrix {
    models: BTreeMap<String, Arc<ModelSpec>>,
    datasets: BTreeMap<String, Arc<Dataset>>,
    cells: Vec<CellKey>,
    excluded: Vec<ExcludedPair>,
}

impl Matrix {
    pub fn builder() -> MatrixBuilder {
        MatrixBuilder::new()
    }

    /// All cells, sorted by (model, dataset, item).
    pub fn cells(&self) -> &[CellKey] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn contains(&self, cell: &CellKey) -> bool {
        self.cells.binary_search(cell).is_ok()
    }

    pub fn model(&self, model_id: &str) -> Option<&Arc<ModelSpec>> {
        self.models.get(model_id)
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelSpec>> {
        self.models.values()
    }

    pub fn dataset(&self, dataset_id: &str) -> Option<&Arc<Dataset>> {
        self.datasets.get(dataset_id)
    }

    pub fn datasets(&self) -> impl Iterator<Item = &Arc<Dataset>> {
        self.datasets.values()
    }

    /// The item a cell refers to.
    pub fn item(&self, cell: &CellKey) -> Option<&DatasetItem> {
        self.datasets.get(&cell.dataset_id)?.item(&cell.item_id)
    }

    pub fn excluded(&self) -> &[ExcludedPair] {
        &self.excluded
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn dataset_ids(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// Number of cells scheduled for one model.
    pub fn cells_for_model(&self, model_id: &str) -> usize {
        self.cells.iter().filter(|c| c.model_id == model_id).count()
    }

    /// Item lookup table for aggregation.
    pub fn catalog(&self) -> ItemCatalog {
        ItemCatalog::from_datasets(self.datasets.values().map(Arc::as_ref))
    }
}

/// Lookup from (dataset id, item id) to item, used to join inputs into records.
#[derive(Debug, Clone, Default)]
pub struct ItemCatalog {
    items: BTreeMap<String, BTreeMap<String, DatasetItem>>,
}

impl ItemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_datasets<'a>(datasets: impl IntoIterator<Item = &'a Dataset>) -> Self {
        let mut catalog = Self::new();
        for dataset in datasets {
            catalog.add_dataset(dataset);
        }
        catalog
    }

    pub fn add_dataset(&mut self, dataset: &Dataset) {
        let entry = self.items.entry(dataset.id().to_string()).or_default();
        for item in dataset.items() {
            entry.insert(item.id.clone(), item.clone());
        }
    }

    pub fn get(&self, dataset_id: &str, item_id: &str) -> Option<&DatasetItem> {
        self.items.get(dataset_id)?.get(item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DatasetFields, Modality, ModelSpecFields, ProviderKind, TaskType};
    use serde_json::json;

    fn model(name: &str, tasks: &[TaskType], modality: Modality) -> ModelSpec {
        ModelSpec::new(ModelSpecFields::new(
            ProviderKind::Echo,
            name,
            tasks.iter().copied(),
            [modality],
        ))
        .unwrap()
    }

    fn dataset(id: &str, task: TaskType, modality: Modality, n: usize) -> Dataset {
        let items = (1..=n)
            .map(|i| DatasetItem::new(i.to_string(), json!(format!("{id}-{i}"))))
            .collect();
        Dataset::new(DatasetFields::new(id, task, modality), items).unwrap()
    }

    #[test]
    fn test_cross_product_of_compatible_pairs() {
        let matrix = Matrix::builder()
            .model(model("a", &[TaskType::Chat], Modality::Text))
            .model(model("b", &[TaskType::Chat, TaskType::ImageCaptioning], Modality::Text))
            .dataset(dataset("qa", TaskType::Chat, Modality::Text, 3))
            .dataset(dataset("captions", TaskType::ImageCaptioning, Modality::Image, 2))
            .build()
            .unwrap();

        assert_eq!(matrix.len(), 6);
        assert_eq!(matrix.cells_for_model("echo/a"), 3);
        // b declares the task but not the image modality
        assert_eq!(matrix.excluded().len(), 2);
        assert!(matrix
            .cells()
            .iter()
            .all(|c| c.dataset_id == "qa"));
    }

    #[test]
    fn test_order_independent() {
        let build = |flip: bool| {
            let mut models = vec![
                model("a", &[TaskType::Chat], Modality::Text),
                model("b", &[TaskType::Chat], Modality::Text),
            ];
            let mut datasets = vec![
                dataset("x", TaskType::Chat, Modality::Text, 2),
                dataset("y", TaskType::Chat, Modality::Text, 1),
            ];
            if flip {
                models.reverse();
                datasets.reverse();
            }
            Matrix::builder()
                .models(models)
                .datasets(datasets)
                .build()
                .unwrap()
        };
        assert_eq!(build(false).cells(), build(true).cells());
    }

    #[test]
    fn test_rejects_duplicates() {
        let err = Matrix::builder()
            .dataset(dataset("x", TaskType::Chat, Modality::Text, 1))
            .dataset(dataset("x", TaskType::Chat, Modality::Text, 2))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateDataset(_)));

        let err = Matrix::builder()
            .model(model("a", &[TaskType::Chat], Modality::Text))
            .model(model("a", &[TaskType::Chat], Modality::Text))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateModel(_)));
    }

    #[test]
    fn test_item_lookup_and_catalog() {
        let matrix = Matrix::builder()
            .model(model("a", &[TaskType::Chat], Modality::Text))
            .dataset(dataset("qa", TaskType::Chat, Modality::Text, 2))
            .build()
            .unwrap();
        let cell = CellKey::new("echo/a", "qa", "2");
        assert!(matrix.contains(&cell));
        assert_eq!(matrix.item(&cell).unwrap().input, json!("qa-2"));

        let catalog = matrix.catalog();
        assert_eq!(catalog.get("qa", "1").unwrap().input, json!("qa-1"));
        assert!(catalog.get("qa", "9").is_none());
        assert!(catalog.get("nope", "1").is_none());
    }
}
