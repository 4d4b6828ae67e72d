//! Cancellation and resume against a shared store.

use std::sync::Arc;
use std::time::Duration;

use evalmatrix_core::{
    AdapterSet, CellKey, Dataset, DatasetFields, DatasetItem, EngineConfig, FsResultStore, Matrix,
    MatrixRunner, Modality, ModelSpec, ModelSpecFields, OutcomeStatus, ProviderKind, ResultStore,
    RunId, RunReport, ScriptStep, ScriptedAdapter, TaskType,
};
use evalmatrix_state::fakes::MemoryResultStore;
use serde_json::json;

fn matrix(items: usize) -> Matrix {
    let mut fields =
        ModelSpecFields::new(ProviderKind::Scripted, "m", [TaskType::Chat], [Modality::Text]);
    fields.id = Some("m".to_string());
    fields.invocation.max_concurrency = 1;
    let dataset = Dataset::new(
        DatasetFields::new("ds", TaskType::Chat, Modality::Text),
        (1..=items)
            .map(|i| DatasetItem::new(i.to_string(), json!({ "prompt": format!("p{i}") })))
            .collect(),
    )
    .unwrap();
    Matrix::builder()
        .model(ModelSpec::new(fields).unwrap())
        .dataset(dataset)
        .build()
        .unwrap()
}

fn runner(store: Arc<MemoryResultStore>, adapter: Arc<ScriptedAdapter>) -> Arc<MatrixRunner> {
    Arc::new(MatrixRunner::new(
        EngineConfig::default(),
        store,
        AdapterSet::new().with("m", adapter),
    ))
}

/// Start a run, cancel it after `after`, and return its report.
async fn run_then_cancel(
    runner: Arc<MatrixRunner>,
    matrix: Matrix,
    run_id: RunId,
    after: Duration,
) -> RunReport {
    let token = runner.cancel_token();
    let handle = tokio::spawn(async move { runner.run(&matrix, run_id).await });
    tokio::time::sleep(after).await;
    token.cancel();
    handle.await.unwrap().unwrap()
}

#[tokio::test(start_paused = true)]
async fn resume_after_cancel_matches_uninterrupted_run() {
    let matrix = matrix(6);
    let run_id = RunId::from("resume");

    let store = Arc::new(MemoryResultStore::new());
    let first = Arc::new(ScriptedAdapter::new().with_latency(Duration::from_millis(10)));
    let partial = run_then_cancel(
        runner(store.clone(), first.clone()),
        matrix.clone(),
        run_id.clone(),
        Duration::from_millis(25),
    )
    .await;

    assert!(partial.cancelled);
    assert!(!partial.is_complete());
    let done: Vec<CellKey> = matrix
        .cells()
        .iter()
        .filter(|c| partial.result_set.is_terminal(c))
        .cloned()
        .collect();
    assert!(!done.is_empty());
    assert!(done.len() < matrix.len());
    assert_eq!(partial.incomplete, matrix.len() - done.len());
    // Cells that never started have no record at all.
    for cell in matrix.cells() {
        if first.calls(&cell.item_id) == 0 {
            assert!(partial.result_set.get(cell).is_none());
        }
    }

    let second = Arc::new(ScriptedAdapter::new().with_latency(Duration::from_millis(10)));
    let resumed = runner(store.clone(), second.clone())
        .run(&matrix, run_id.clone())
        .await
        .unwrap();
    assert!(resumed.is_complete());
    assert_eq!(resumed.skipped, done.len());
    for cell in &done {
        assert_eq!(second.calls(&cell.item_id), 0, "{cell} re-executed");
    }

    let fresh = runner(
        Arc::new(MemoryResultStore::new()),
        Arc::new(ScriptedAdapter::new().with_latency(Duration::from_millis(10))),
    )
    .run(&matrix, run_id)
    .await
    .unwrap();
    assert_eq!(resumed.result_set.fingerprint(), fresh.result_set.fingerprint());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_backoff_keeps_placeholder() {
    let matrix = matrix(1);
    let run_id = RunId::from("backoff");
    let cell = CellKey::new("m", "ds", "1");
    let store = Arc::new(MemoryResultStore::new());

    let flaky = Arc::new(
        ScriptedAdapter::new().on("1", vec![ScriptStep::transient(), ScriptStep::ok(json!("late"))]),
    );
    // Default backoff waits at least 250ms before the second attempt.
    let partial = run_then_cancel(
        runner(store.clone(), flaky.clone()),
        matrix.clone(),
        run_id.clone(),
        Duration::from_millis(100),
    )
    .await;

    assert!(partial.cancelled);
    assert_eq!(partial.incomplete, 1);
    assert_eq!(flaky.calls("1"), 1);
    let placeholder = store.load(&run_id).await.unwrap().unwrap();
    let outcome = placeholder.get(&cell).unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.attempts, 1);

    let resumed = runner(store, Arc::new(ScriptedAdapter::new()))
        .run(&matrix, run_id)
        .await
        .unwrap();
    let outcome = resumed.result_set.get(&cell).unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Success);
    // Attempts restart at zero in the resuming invocation.
    assert_eq!(outcome.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_runner_starts_nothing() {
    let store = Arc::new(MemoryResultStore::new());
    let adapter = Arc::new(ScriptedAdapter::new());
    let runner = runner(store, adapter.clone());
    runner.cancel_token().cancel();

    let report = runner.run(&matrix(3), RunId::from("pre-cancelled")).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.incomplete, 3);
    assert_eq!(report.attempts, 0);
    assert_eq!(adapter.total_calls(), 0);
    assert!(report.result_set.is_empty());
}

#[tokio::test(start_paused = true)]
async fn checkpoint_writes_placeholder_while_cell_waits() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsResultStore::new(dir.path()).unwrap());
    let run_id = RunId::from("checkpointed");
    let cell = CellKey::new("m", "ds", "1");

    let throttled = Arc::new(ScriptedAdapter::new().on(
        "1",
        vec![
            ScriptStep::rate_limited(Some(Duration::from_secs(120))),
            ScriptStep::ok(json!("late")),
        ],
    ));
    let config = EngineConfig {
        checkpoint_interval_ms: 1_000,
        ..EngineConfig::default()
    };
    let runner = Arc::new(MatrixRunner::new(
        config,
        store.clone(),
        AdapterSet::new().with("m", throttled.clone()),
    ));
    let token = runner.cancel_token();
    let handle = {
        let runner = runner.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move { runner.run(&matrix(1), run_id).await })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    // Read the snapshot directly: only a checkpoint flush puts the placeholder there.
    let on_disk = FsResultStore::read_document(&store.run_path(&run_id)).unwrap();
    let placeholder = on_disk.get(&cell).expect("placeholder checkpointed");
    assert_eq!(placeholder.status, OutcomeStatus::Failed);
    assert_eq!(placeholder.attempts, 1);
    assert_eq!(throttled.calls("1"), 1);

    token.cancel();
    let report = handle.await.unwrap().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.incomplete, 1);
}
