//! Contract tests shared by every `ResultStore` implementation.

use std::sync::Arc;

use chrono::Duration;
use evalmatrix_state::fakes::MemoryResultStore;
use evalmatrix_state::{
    CellError, CellKey, ErrorClass, FsResultStore, OutcomeStatus, PredictionOutcome, Provenance,
    ResultSet, ResultStore, RunId, SurrealResultStore, UpsertDisposition,
};
use serde_json::json;

fn key(model: &str, item: &str) -> CellKey {
    CellKey::new(model, "ds", item)
}

fn placeholder(cell: CellKey) -> PredictionOutcome {
    PredictionOutcome::failure(
        cell,
        OutcomeStatus::Failed,
        CellError::new(ErrorClass::Transient, "503 service unavailable"),
        1,
        20,
    )
}

async fn stores() -> Vec<(&'static str, Arc<dyn ResultStore>, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let fs = FsResultStore::new(dir.path()).unwrap();
    let surreal = SurrealResultStore::in_memory().await.unwrap();
    vec![
        ("memory", Arc::new(MemoryResultStore::new()), None),
        ("fs", Arc::new(fs), Some(dir)),
        ("surreal", Arc::new(surreal), None),
    ]
}

#[tokio::test]
async fn load_of_unknown_run_is_none() {
    for (name, store, _dir) in stores().await {
        let loaded = store.load(&RunId::from("missing")).await.unwrap();
        assert!(loaded.is_none(), "{name}");
    }
}

#[tokio::test]
async fn terminal_outcome_is_never_downgraded() {
    for (name, store, _dir) in stores().await {
        let run = RunId::from("run-1");
        let cell = key("m1", "1");
        let done = PredictionOutcome::success(cell.clone(), json!({"label": "B"}), 2, 40);

        assert_eq!(
            store.upsert(&run, placeholder(cell.clone())).await.unwrap(),
            UpsertDisposition::Inserted,
            "{name}"
        );
        assert_eq!(
            store.upsert(&run, done.clone()).await.unwrap(),
            UpsertDisposition::Replaced,
            "{name}"
        );
        let late = placeholder(cell.clone()).at(done.last_attempt_at + Duration::seconds(5));
        assert_eq!(
            store.upsert(&run, late).await.unwrap(),
            UpsertDisposition::Ignored,
            "{name}"
        );
        store.flush(&run).await.unwrap();

        let set = store.load(&run).await.unwrap().unwrap();
        assert_eq!(set.get(&cell), Some(&done), "{name}");
        assert_eq!(set.len(), 1, "{name}");
    }
}

#[tokio::test]
async fn persist_then_load_roundtrips() {
    for (name, store, _dir) in stores().await {
        let run = RunId::from("run-2");
        let mut set = ResultSet::new(Provenance::new(run.clone(), ["m1", "m2"], ["ds"]));
        set.upsert(PredictionOutcome::success(key("m1", "1"), json!("A"), 1, 10));
        set.upsert(PredictionOutcome::failure(
            key("m2", "1"),
            OutcomeStatus::InvalidInput,
            CellError::new(ErrorClass::InvalidInput, "image too large"),
            1,
            5,
        ));
        set.upsert(placeholder(key("m2", "2")));

        store.persist(&set).await.unwrap();
        let loaded = store.load(&run).await.unwrap().unwrap();
        assert_eq!(loaded, set, "{name}");
    }
}

#[tokio::test]
async fn persist_merges_with_stored_outcomes() {
    for (name, store, _dir) in stores().await {
        let run = RunId::from("run-3");
        let done = PredictionOutcome::success(key("m1", "1"), json!("ok"), 1, 10);
        store.upsert(&run, done.clone()).await.unwrap();

        let mut stale = ResultSet::new(Provenance::new(run.clone(), ["m1"], ["ds"]));
        stale.upsert(placeholder(key("m1", "1")).at(done.last_attempt_at + Duration::minutes(1)));
        stale.upsert(placeholder(key("m1", "2")));
        store.persist(&stale).await.unwrap();

        let loaded = store.load(&run).await.unwrap().unwrap();
        assert_eq!(loaded.get(&key("m1", "1")), Some(&done), "{name}");
        assert!(loaded.get(&key("m1", "2")).is_some(), "{name}");
        assert!(loaded.provenance.model_ids.contains("m1"), "{name}");
    }
}

#[tokio::test]
async fn runs_are_isolated_and_listed() {
    for (name, store, _dir) in stores().await {
        store
            .upsert(
                &RunId::from("b"),
                PredictionOutcome::success(key("m", "1"), json!(1), 1, 1),
            )
            .await
            .unwrap();
        store
            .upsert(
                &RunId::from("a"),
                PredictionOutcome::success(key("m", "2"), json!(2), 1, 1),
            )
            .await
            .unwrap();

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs, vec![RunId::from("a"), RunId::from("b")], "{name}");

        let a = store.load(&RunId::from("a")).await.unwrap().unwrap();
        assert!(a.get(&key("m", "1")).is_none(), "{name}");
    }
}

#[tokio::test]
async fn fs_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let run = RunId::from("durable");
    let done = PredictionOutcome::success(key("m1", "7"), json!("C"), 1, 3);
    {
        let store = FsResultStore::new(dir.path()).unwrap();
        store.upsert(&run, done.clone()).await.unwrap();
    }
    let reopened = FsResultStore::new(dir.path()).unwrap();
    let set = reopened.load(&run).await.unwrap().unwrap();
    assert_eq!(set.get(&key("m1", "7")), Some(&done));
}

#[tokio::test]
async fn memory_store_can_fail_writes() {
    let store = MemoryResultStore::new();
    store.fail_writes(true);
    let err = store
        .upsert(&RunId::from("r"), placeholder(key("m", "1")))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("injected"));
    assert_eq!(store.upsert_count(), 0);
}
