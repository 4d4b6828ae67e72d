//! SurrealDB-backed result store
//!
//! Each run has one `result_sets` header row (provenance) and one
//! `cell_outcomes` row per cell. Rows are converted to and from the
//! `ResultSet` types at the boundary; outcome payloads are stored as JSON
//! text so the persisted form round-trips byte-for-byte.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cell::CellKey;
use crate::error::StorageError;
use crate::migrations;
use crate::outcome::{prefer, PredictionOutcome, Preference};
use crate::result_set::{Provenance, ResultSet, UpsertDisposition};
use crate::storage_traits::{ResultStore, RunId, StorageResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResultSetRow {
    run_id: String,
    provenance_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutcomeRow {
    run_id: String,
    cell_key: String,
    status: String,
    outcome_json: String,
}

impl OutcomeRow {
    fn from_outcome(run_id: &RunId, outcome: &PredictionOutcome) -> StorageResult<Self> {
        Ok(Self {
            run_id: run_id.to_string(),
            cell_key: outcome.cell.composite(),
            status: outcome.status.as_str().to_string(),
            outcome_json: serde_json::to_string(outcome)?,
        })
    }

    fn into_outcome(self) -> StorageResult<PredictionOutcome> {
        let outcome: PredictionOutcome = serde_json::from_str(&self.outcome_json)?;
        let key = CellKey::parse_composite(&self.cell_key)?;
        if key != outcome.cell {
            return Err(StorageError::InvalidCellKey { key: self.cell_key });
        }
        Ok(outcome)
    }
}

/// SurrealDB-backed implementation of [`ResultStore`].
///
/// All writes are serialized through one lock, which is the store's
/// per-key write discipline; every write is durable when it returns.
pub struct SurrealResultStore {
    db: Surreal<Any>,
    write_lock: Mutex<()>,
}

impl SurrealResultStore {
    /// Create an in-memory instance (`mem://`), mainly for tests.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://host`).
    ///
    /// Selects the `evalmatrix/results` namespace and database and runs the
    /// schema migrations.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Connection(format!("failed to connect to {url}: {e}")))?;

        db.use_ns("evalmatrix")
            .use_db("results")
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(url = %url, "SurrealResultStore connected");
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_header(&self, run_id: &RunId) -> StorageResult<Option<Provenance>> {
        let mut res = self
            .db
            .query("SELECT run_id, provenance_json FROM result_sets WHERE run_id = $rid")
            .bind(("rid", run_id.to_string()))
            .await?;
        let rows: Vec<ResultSetRow> = res.take(0)?;
        rows.into_iter()
            .next()
            .map(|row| serde_json::from_str(&row.provenance_json).map_err(StorageError::from))
            .transpose()
    }

    async fn fetch_outcome(
        &self,
        run_id: &RunId,
        cell: &CellKey,
    ) -> StorageResult<Option<PredictionOutcome>> {
        let mut res = self
            .db
            .query(
                "SELECT run_id, cell_key, status, outcome_json FROM cell_outcomes \
                 WHERE run_id = $rid AND cell_key = $key",
            )
            .bind(("rid", run_id.to_string()))
            .bind(("key", cell.composite()))
            .await?;
        let rows: Vec<OutcomeRow> = res.take(0)?;
        rows.into_iter().next().map(OutcomeRow::into_outcome).transpose()
    }

    async fn fetch_set(&self, run_id: &RunId) -> StorageResult<Option<ResultSet>> {
        let header = self.fetch_header(run_id).await?;

        let mut res = self
            .db
            .query("SELECT run_id, cell_key, status, outcome_json FROM cell_outcomes WHERE run_id = $rid")
            .bind(("rid", run_id.to_string()))
            .await?;
        let rows: Vec<OutcomeRow> = res.take(0)?;

        if header.is_none() && rows.is_empty() {
            return Ok(None);
        }

        let mut set = ResultSet::new(header.unwrap_or_else(|| Provenance::empty(run_id.clone())));
        for row in rows {
            set.upsert(row.into_outcome()?);
        }
        Ok(Some(set))
    }

    fn header_row(provenance: &Provenance) -> StorageResult<ResultSetRow> {
        Ok(ResultSetRow {
            run_id: provenance.run_id.to_string(),
            provenance_json: serde_json::to_string(provenance)?,
        })
    }
}

/// Replaces a run's header row; runs inside the caller's transaction.
const REPLACE_HEADER: &str = "DELETE result_sets WHERE run_id = $rid; \
                              CREATE result_sets CONTENT $header; ";

#[async_trait]
impl ResultStore for SurrealResultStore {
    async fn load(&self, run_id: &RunId) -> StorageResult<Option<ResultSet>> {
        self.fetch_set(run_id).await
    }

    async fn upsert(
        &self,
        run_id: &RunId,
        outcome: PredictionOutcome,
    ) -> StorageResult<UpsertDisposition> {
        let _guard = self.write_lock.lock().await;

        let disposition = match self.fetch_outcome(run_id, &outcome.cell).await? {
            None => UpsertDisposition::Inserted,
            Some(existing) => match prefer(&existing, &outcome, Preference::Incoming) {
                Preference::Existing => return Ok(UpsertDisposition::Ignored),
                Preference::Incoming => UpsertDisposition::Replaced,
            },
        };

        let mut provenance = self
            .fetch_header(run_id)
            .await?
            .unwrap_or_else(|| Provenance::empty(run_id.clone()));
        provenance.updated_at = provenance.updated_at.max(outcome.last_attempt_at);

        let row = OutcomeRow::from_outcome(run_id, &outcome)?;
        let header = Self::header_row(&provenance)?;
        let sql = format!(
            "BEGIN TRANSACTION; \
             DELETE cell_outcomes WHERE run_id = $rid AND cell_key = $key; \
             CREATE cell_outcomes CONTENT $row; \
             {REPLACE_HEADER}\
             COMMIT TRANSACTION;"
        );
        self.db
            .query(sql)
            .bind(("rid", row.run_id.clone()))
            .bind(("key", row.cell_key.clone()))
            .bind(("row", row))
            .bind(("header", header))
            .await?
            .check()?;

        debug!(run_id = %run_id, cell = %outcome.cell, status = %outcome.status, "outcome upserted");
        Ok(disposition)
    }

    async fn persist(&self, set: &ResultSet) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;

        let merged = match self.fetch_set(set.run_id()).await? {
            Some(stored) => ResultSet::merge(&stored, set),
            None => set.clone(),
        };

        let rows = merged
            .outcomes()
            .map(|o| OutcomeRow::from_outcome(merged.run_id(), o))
            .collect::<StorageResult<Vec<_>>>()?;

        let mut sql = String::from(
            "BEGIN TRANSACTION; DELETE cell_outcomes WHERE run_id = $rid; ",
        );
        if !rows.is_empty() {
            sql.push_str("INSERT INTO cell_outcomes $rows; ");
        }
        sql.push_str(REPLACE_HEADER);
        sql.push_str("COMMIT TRANSACTION;");

        self.db
            .query(sql)
            .bind(("rid", merged.run_id().to_string()))
            .bind(("rows", rows))
            .bind(("header", Self::header_row(&merged.provenance)?))
            .await?
            .check()?;

        debug!(run_id = %merged.run_id(), outcomes = merged.len(), "result set persisted");
        Ok(())
    }

    async fn flush(&self, _run_id: &RunId) -> StorageResult<()> {
        // Every write is already durable.
        Ok(())
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunId>> {
        let mut res = self
            .db
            .query("SELECT run_id, provenance_json FROM result_sets ORDER BY run_id")
            .await?;
        let rows: Vec<ResultSetRow> = res.take(0)?;
        Ok(rows.into_iter().map(|r| RunId(r.run_id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn upsert_advances_header_in_the_same_write() {
        let store = SurrealResultStore::in_memory().await.unwrap();
        let run = RunId::from("header");
        let later = Utc::now() + Duration::hours(1);
        let done = PredictionOutcome::success(CellKey::new("m", "d", "1"), json!("A"), 1, 5).at(later);

        store.upsert(&run, done.clone()).await.unwrap();

        let header = store.fetch_header(&run).await.unwrap().unwrap();
        assert_eq!(header.updated_at, later);
        let set = store.load(&run).await.unwrap().unwrap();
        assert_eq!(set.get(&done.cell), Some(&done));
        assert_eq!(set.provenance, header);
    }

    #[tokio::test]
    async fn persist_writes_rows_and_header_together() {
        let store = SurrealResultStore::in_memory().await.unwrap();
        let run = RunId::from("persisted");
        let mut set = ResultSet::new(Provenance::new(run.clone(), ["m"], ["d"]));
        set.upsert(PredictionOutcome::success(CellKey::new("m", "d", "1"), json!(1), 1, 2));

        store.persist(&set).await.unwrap();

        let header = store.fetch_header(&run).await.unwrap().unwrap();
        assert_eq!(header.model_ids, set.provenance.model_ids);
        assert_eq!(store.load(&run).await.unwrap().unwrap(), set);
        assert_eq!(store.list_runs().await.unwrap(), vec![run]);
    }
}
