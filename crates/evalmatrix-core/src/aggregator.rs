//! Pure aggregation of a result set into annotation records and per-model summaries.

use std::collections::BTreeMap;

use evalmatrix_state::{ErrorClass, OutcomeStatus, PredictionOutcome, ResultSet};
use serde::{Deserialize, Serialize};

use crate::matrix::ItemCatalog;

/// One successful prediction, joined with its input, ready for annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub model_id: String,
    pub dataset_id: String,
    pub item_id: String,
    /// Composite cell key (`model|dataset|item`).
    pub cell_key: String,
    /// Item input; `null` when the item is not in the catalog.
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<serde_json::Value>,
    pub output: serde_json::Value,
    pub attempts: u32,
    pub latency_ms: u64,
}

/// Why a terminal cell did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidInput,
    ExhaustedRetries,
    Auth,
}

impl FailureKind {
    /// Failure kind of a terminal, non-success outcome.
    pub fn of(outcome: &PredictionOutcome) -> Option<Self> {
        match outcome.status {
            OutcomeStatus::Success | OutcomeStatus::Failed => None,
            OutcomeStatus::InvalidInput => Some(FailureKind::InvalidInput),
            OutcomeStatus::PermanentlyFailed => {
                let auth = outcome
                    .error
                    .as_ref()
                    .is_some_and(|e| e.class == ErrorClass::Auth);
                Some(if auth {
                    FailureKind::Auth
                } else {
                    FailureKind::ExhaustedRetries
                })
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::ExhaustedRetries => "exhausted_retries",
            FailureKind::Auth => "auth",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary statistics for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub model_id: String,
    /// Cells of this model present in the set.
    pub total: usize,
    pub successes: usize,
    /// Cells still awaiting a retry.
    pub pending: usize,
    pub success_rate: f64,
    pub failure_kinds: BTreeMap<FailureKind, usize>,
    /// Mean latency of the last attempt, over outcomes with at least one attempt.
    pub mean_latency_ms: Option<f64>,
    /// Adapter calls across all cells.
    pub attempts: u64,
}

impl ModelSummary {
    fn empty(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            total: 0,
            successes: 0,
            pending: 0,
            success_rate: 0.0,
            failure_kinds: BTreeMap::new(),
            mean_latency_ms: None,
            attempts: 0,
        }
    }

    pub fn failures(&self) -> usize {
        self.failure_kinds.values().sum()
    }
}

/// Both aggregation products of one result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub records: Vec<AnnotationRecord>,
    pub summaries: Vec<ModelSummary>,
}

/// Success records sorted by dataset, then item, then model.
pub fn annotation_records(set: &ResultSet, catalog: &ItemCatalog) -> Vec<AnnotationRecord> {
    let mut records: Vec<AnnotationRecord> = set
        .outcomes()
        .filter(|o| o.is_success())
        .map(|o| {
            let item = catalog.get(&o.cell.dataset_id, &o.cell.item_id);
            AnnotationRecord {
                model_id: o.cell.model_id.clone(),
                dataset_id: o.cell.dataset_id.clone(),
                item_id: o.cell.item_id.clone(),
                cell_key: o.cell.composite(),
                input: item.map(|i| i.input.clone()).unwrap_or(serde_json::Value::Null),
                reference: item.and_then(|i| i.reference.clone()),
                output: o.output.clone().unwrap_or(serde_json::Value::Null),
                attempts: o.attempts,
                latency_ms: o.latency_ms,
            }
        })
        .collect();

    records.sort_by(|a, b| {
        (&a.dataset_id, &a.item_id, &a.model_id).cmp(&(&b.dataset_id, &b.item_id, &b.model_id))
    });
    records
}

/// Per-model statistics, sorted by model id.
pub fn model_summaries(set: &ResultSet) -> Vec<ModelSummary> {
    let mut by_model: BTreeMap<&str, (ModelSummary, u64, usize)> = BTreeMap::new();

    for outcome in set.outcomes() {
        let model_id = outcome.cell.model_id.as_str();
        let (summary, latency_sum, timed) = by_model
            .entry(model_id)
            .or_insert_with(|| (ModelSummary::empty(model_id), 0, 0));

        summary.total += 1;
        summary.attempts += u64::from(outcome.attempts);
        if outcome.attempts > 0 {
            *latency_sum += outcome.latency_ms;
            *timed += 1;
        }

        match outcome.status {
            OutcomeStatus::Success => summary.successes += 1,
            OutcomeStatus::Failed => summary.pending += 1,
            _ => {
                if let Some(kind) = FailureKind::of(outcome) {
                    *summary.failure_kinds.entry(kind).or_insert(0) += 1;
                }
            }
        }
    }

    by_model
        .into_values()
        .map(|(mut summary, latency_sum, timed)| {
            summary.success_rate = summary.successes as f64 / summary.total as f64;
            summary.mean_latency_ms = (timed > 0).then(|| latency_sum as f64 / timed as f64);
            summary
        })
        .collect()
}

pub fn aggregate(set: &ResultSet, catalog: &ItemCatalog) -> Aggregation {
    Aggregation {
        records: annotation_records(set, catalog),
        summaries: model_summaries(set),
    }
}
