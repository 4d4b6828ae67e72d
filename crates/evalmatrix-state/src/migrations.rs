//! SurrealDB schema for the result store
//!
//! Safe to call on every connection: all definitions use `IF NOT EXISTS`.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::storage_traits::StorageResult;

/// Initialize all evalmatrix tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing evalmatrix SurrealDB schema");
    init_result_sets_table(db).await?;
    init_cell_outcomes_table(db).await?;
    Ok(())
}

/// Initialize `result_sets` table (one header row per run)
///
/// Schema:
/// ```text
/// TABLE result_sets {
///   run_id:           STRING (unique)
///   provenance_json:  STRING (serialized Provenance)
/// }
/// ```
async fn init_result_sets_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing result_sets table");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS result_sets SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_result_sets_run_id ON TABLE result_sets COLUMNS run_id UNIQUE;
    "#;
    db.query(sql).await?.check()?;
    Ok(())
}

/// Initialize `cell_outcomes` table (one row per run and cell)
///
/// Schema:
/// ```text
/// TABLE cell_outcomes {
///   run_id:        STRING
///   cell_key:      STRING (composite `model|dataset|item`)
///   status:        STRING
///   outcome_json:  STRING (serialized PredictionOutcome)
/// }
/// ```
///
/// `(run_id, cell_key)` is unique: at most one outcome per cell.
async fn init_cell_outcomes_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing cell_outcomes table");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS cell_outcomes SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_cell_outcomes_run_cell ON TABLE cell_outcomes COLUMNS run_id, cell_key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_cell_outcomes_status ON TABLE cell_outcomes COLUMNS run_id, status;
    "#;
    db.query(sql).await?.check()?;
    Ok(())
}
