//! Result sets: the per-run mapping from cell identity to outcome.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cell::{composite_map, CellKey};
use crate::outcome::{prefer, PredictionOutcome, Preference};
use crate::storage_traits::RunId;

/// Where a result set came from: the matrix definition and its timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub run_id: RunId,
    pub model_ids: BTreeSet<String>,
    pub dataset_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Provenance {
    pub fn new<M, D>(run_id: RunId, model_ids: M, dataset_ids: D) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let now = Utc::now();
        Self {
            run_id,
            model_ids: model_ids.into_iter().map(Into::into).collect(),
            dataset_ids: dataset_ids.into_iter().map(Into::into).collect(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Provenance for a run whose matrix definition is not yet known.
    pub fn empty(run_id: RunId) -> Self {
        Self::new(run_id, Vec::<String>::new(), Vec::<String>::new())
    }

    /// Widen this provenance to cover another matrix definition.
    pub fn absorb(&mut self, other: &Provenance) {
        self.model_ids.extend(other.model_ids.iter().cloned());
        self.dataset_ids.extend(other.dataset_ids.iter().cloned());
        self.created_at = self.created_at.min(other.created_at);
        self.updated_at = self.updated_at.max(other.updated_at);
    }
}

/// Result of applying an outcome to a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertDisposition {
    /// No previous outcome existed for the cell.
    Inserted,
    /// The previous outcome was overwritten.
    Replaced,
    /// The previous outcome was kept (e.g. terminal vs. placeholder).
    Ignored,
}

impl UpsertDisposition {
    pub fn applied(self) -> bool {
        !matches!(self, UpsertDisposition::Ignored)
    }
}

/// Mapping from cell identity to its single outcome, plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub provenance: Provenance,
    #[serde(with = "composite_map")]
    outcomes: BTreeMap<CellKey, PredictionOutcome>,
}

impl ResultSet {
    pub fn new(provenance: Provenance) -> Self {
        Self {
            provenance,
            outcomes: BTreeMap::new(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.provenance.run_id
    }

    /// Apply `outcome`, keeping whichever record wins the resolution rule.
    ///
    /// A terminal outcome is never overwritten by a non-terminal one, and a
    /// recorded success is never replaced by a failure.
    pub fn upsert(&mut self, outcome: PredictionOutcome) -> UpsertDisposition {
        let disposition = match self.outcomes.get(&outcome.cell) {
            None => UpsertDisposition::Inserted,
            Some(existing) => match prefer(existing, &outcome, Preference::Incoming) {
                Preference::Existing => return UpsertDisposition::Ignored,
                Preference::Incoming => UpsertDisposition::Replaced,
            },
        };
        self.provenance.updated_at = self.provenance.updated_at.max(outcome.last_attempt_at);
        self.outcomes.insert(outcome.cell.clone(), outcome);
        disposition
    }

    /// Whether [`ResultSet::upsert`] would apply `outcome`.
    pub fn accepts(&self, outcome: &PredictionOutcome) -> bool {
        self.outcomes.get(&outcome.cell).map_or(true, |existing| {
            prefer(existing, outcome, Preference::Incoming) == Preference::Incoming
        })
    }

    pub fn get(&self, cell: &CellKey) -> Option<&PredictionOutcome> {
        self.outcomes.get(cell)
    }

    /// `true` when the cell already holds a terminal outcome (skip on resume).
    pub fn is_terminal(&self, cell: &CellKey) -> bool {
        self.outcomes.get(cell).is_some_and(PredictionOutcome::is_terminal)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &PredictionOutcome> {
        self.outcomes.values()
    }

    pub fn cells(&self) -> impl Iterator<Item = &CellKey> {
        self.outcomes.keys()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn terminal_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_terminal()).count()
    }

    /// Merge two result sets for overlapping cells.
    ///
    /// Per cell present in either side the resolution rule of
    /// [`crate::outcome::prefer`] applies, with ties resolved to `a`.
    /// Provenance is the union of both matrix definitions; the run id is `a`'s.
    pub fn merge(a: &ResultSet, b: &ResultSet) -> ResultSet {
        let mut provenance = a.provenance.clone();
        provenance.absorb(&b.provenance);

        let mut outcomes = a.outcomes.clone();
        for (cell, theirs) in &b.outcomes {
            let keep_ours = outcomes.get(cell).is_some_and(|ours| {
                prefer(ours, theirs, Preference::Existing) == Preference::Existing
            });
            if !keep_ours {
                outcomes.insert(cell.clone(), theirs.clone());
            }
        }

        ResultSet {
            provenance,
            outcomes,
        }
    }

    /// Content view without timestamps: (cell, status, output, attempts).
    ///
    /// Two runs over the same matrix with the same adapter behaviour produce
    /// equal fingerprints even when their timing differs.
    pub fn fingerprint(&self) -> Vec<(CellKey, String, Option<serde_json::Value>, u32)> {
        self.outcomes
            .values()
            .map(|o| {
                (
                    o.cell.clone(),
                    o.status.as_str().to_string(),
                    o.output.clone(),
                    o.attempts,
                )
            })
            .collect()
    }
}
