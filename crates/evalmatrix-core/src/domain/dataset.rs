//! Datasets: ordered evaluation items with stable identity.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{EngineError, Result};
use super::model::{Modality, TaskType};

/// One evaluation item. Also the line format of dataset JSONL files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetItem {
    /// Stable within its dataset.
    pub id: String,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl DatasetItem {
    pub fn new(id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            input,
            reference: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_reference(mut self, reference: serde_json::Value) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Descriptive fields of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetFields {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub task: TaskType,
    pub modality: Modality,
}

impl DatasetFields {
    pub fn new(id: impl Into<String>, task: TaskType, modality: Modality) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            task,
            modality,
        }
    }
}

/// An immutable, validated, ordered collection of items.
#[derive(Debug, Clone)]
pub struct Dataset {
    fields: DatasetFields,
    items: Vec<DatasetItem>,
    index: HashMap<String, usize>,
}

impl Dataset {
    /// Validate and build a dataset. Item ids must be non-empty and unique.
    pub fn new(fields: DatasetFields, items: Vec<DatasetItem>) -> Result<Self> {
        if fields.id.trim().is_empty() {
            return Err(EngineError::InvalidDataset(
                "dataset id cannot be empty".to_string(),
            ));
        }

        let mut index = HashMap::with_capacity(items.len());
        for (pos, item) in items.iter().enumerate() {
            if item.id.is_empty() {
                return Err(EngineError::InvalidDataset(format!(
                    "{}: item at position {pos} has an empty id",
                    fields.id
                )));
            }
            if index.insert(item.id.clone(), pos).is_some() {
                return Err(EngineError::InvalidDataset(format!(
                    "{}: duplicate item id {}",
                    fields.id, item.id
                )));
            }
        }

        Ok(Self {
            fields,
            items,
            index,
        })
    }

    /// Load items from a JSON Lines file (one [`DatasetItem`] per line).
    ///
    /// Blank lines are skipped; a malformed line fails the whole load.
    pub fn load_jsonl(fields: DatasetFields, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut items = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let item: DatasetItem = serde_json::from_str(line).map_err(|e| {
                EngineError::InvalidDataset(format!("{}:{}: {e}", path.display(), idx + 1))
            })?;
            items.push(item);
        }
        Self::new(fields, items)
    }

    pub fn id(&self) -> &str {
        &self.fields.id
    }

    pub fn name(&self) -> &str {
        &self.fields.name
    }

    pub fn description(&self) -> &str {
        &self.fields.description
    }

    pub fn task(&self) -> TaskType {
        self.fields.task
    }

    pub fn modality(&self) -> Modality {
        self.fields.modality
    }

    pub fn fields(&self) -> &DatasetFields {
        &self.fields
    }

    /// Items in their declared order.
    pub fn items(&self) -> &[DatasetItem] {
        &self.items
    }

    pub fn item(&self, id: &str) -> Option<&DatasetItem> {
        self.index.get(id).map(|&pos| &self.items[pos])
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn fields() -> DatasetFields {
        DatasetFields::new("mmlu", TaskType::TextClassification, Modality::Text)
    }

    #[test]
    fn test_items_keep_order_and_index() {
        let ds = Dataset::new(
            fields(),
            vec![
                DatasetItem::new("q2", json!("b")),
                DatasetItem::new("q1", json!("a")),
            ],
        )
        .unwrap();
        let ids: Vec<&str> = ds.items().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["q2", "q1"]);
        assert_eq!(ds.item("q1").unwrap().input, json!("a"));
        assert!(ds.item("q3").is_none());
        assert_eq!(ds.name(), "mmlu");
    }

    #[test]
    fn test_rejects_duplicate_and_empty_ids() {
        let dup = Dataset::new(
            fields(),
            vec![
                DatasetItem::new("q1", json!(1)),
                DatasetItem::new("q1", json!(2)),
            ],
        );
        assert!(matches!(dup, Err(EngineError::InvalidDataset(msg)) if msg.contains("duplicate")));

        let empty = Dataset::new(fields(), vec![DatasetItem::new("", json!(1))]);
        assert!(empty.is_err());

        let no_id = Dataset::new(
            DatasetFields::new(" ", TaskType::Chat, Modality::Text),
            Vec::new(),
        );
        assert!(no_id.is_err());
    }

    #[test]
    fn test_load_jsonl() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"id": "1", "input": "2+2?", "reference": "4"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"id": "2", "input": {{"prompt": "capital of France?"}}, "metadata": {{"subject": "geo"}}}}"#
        )
        .unwrap();

        let ds = Dataset::load_jsonl(fields(), file.path()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.item("1").unwrap().reference, Some(json!("4")));
        assert_eq!(ds.item("2").unwrap().metadata["subject"], json!("geo"));
    }

    #[test]
    fn test_load_jsonl_reports_line_number() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"id": "1", "input": 1}}"#).unwrap();
        writeln!(file, "not json").unwrap();

        let err = Dataset::load_jsonl(fields(), file.path()).unwrap_err();
        assert!(err.to_string().contains(":2:"), "{err}");
    }
}
