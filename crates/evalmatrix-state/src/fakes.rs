//! In-memory fake for the result store trait (testing only)
//!
//! `MemoryResultStore` satisfies the `ResultStore` contract without any I/O.
//! It can be told to fail writes, to exercise the run-fatal storage path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::outcome::PredictionOutcome;
use crate::result_set::{Provenance, ResultSet, UpsertDisposition};
use crate::storage_traits::*;

/// In-memory result store backed by a `HashMap<RunId, ResultSet>`.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    runs: Mutex<HashMap<RunId, ResultSet>>,
    fail_writes: AtomicBool,
    upserts: AtomicUsize,
    flushes: AtomicUsize,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write return `StorageError::Backend`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `upsert` calls observed.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Number of `flush` calls observed.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn load(&self, run_id: &RunId) -> StorageResult<Option<ResultSet>> {
        let runs = self.runs.lock().unwrap();
        Ok(runs.get(run_id).cloned())
    }

    async fn upsert(
        &self,
        run_id: &RunId,
        outcome: PredictionOutcome,
    ) -> StorageResult<UpsertDisposition> {
        self.check_writable()?;
        let mut runs = self.runs.lock().unwrap();
        let set = runs
            .entry(run_id.clone())
            .or_insert_with(|| ResultSet::new(Provenance::empty(run_id.clone())));
        let disposition = set.upsert(outcome);
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(disposition)
    }

    async fn persist(&self, set: &ResultSet) -> StorageResult<()> {
        self.check_writable()?;
        let mut runs = self.runs.lock().unwrap();
        let merged = match runs.get(set.run_id()) {
            Some(stored) => ResultSet::merge(stored, set),
            None => set.clone(),
        };
        runs.insert(set.run_id().clone(), merged);
        Ok(())
    }

    async fn flush(&self, _run_id: &RunId) -> StorageResult<()> {
        self.check_writable()?;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunId>> {
        let runs = self.runs.lock().unwrap();
        let mut ids: Vec<RunId> = runs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
