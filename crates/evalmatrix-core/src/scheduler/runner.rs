//! Matrix runner: drives every cell to a terminal outcome.
//!
//! One task per pending cell, so a cell never has more than one attempt in
//! flight and its retries are strictly sequential. Each attempt holds a
//! per-model permit and then a global permit; both are released before a
//! backoff wait. Per-cell failures become outcome records; only store
//! failures abort the run.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evalmatrix_state::{
    CellError, CellKey, ErrorClass, OutcomeStatus, PredictionOutcome, Provenance, ResultSet,
    ResultStore, RunId,
};
use futures::FutureExt;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, Span};

use super::breaker::CircuitBreaker;
use super::policy::RetryPolicy;
use crate::adapter::{AdapterError, AdapterSet, ModelAdapter};
use crate::config::EngineConfig;
use crate::domain::{DatasetItem, EngineError, ModelSpec, Result};
use crate::matrix::Matrix;
use crate::metrics::METRICS;
use crate::obs;

/// Run-level cancellation signal.
///
/// Cancelling stops new attempts; attempts already in flight complete (or
/// time out) and are recorded. Once cancelled a token stays cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// What a run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    /// The run's result set as stored after the final flush.
    pub result_set: ResultSet,
    /// Cells that needed work in this invocation.
    pub scheduled: usize,
    /// Cells skipped because a terminal outcome was already stored.
    pub skipped: usize,
    /// Adapter calls made in this invocation.
    pub attempts: u64,
    /// Matrix cells without a terminal outcome (non-zero only when cancelled).
    pub incomplete: usize,
    pub cancelled: bool,
    pub duration: Duration,
    /// Highest concurrent attempts observed per model.
    pub peak_in_flight: BTreeMap<String, usize>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.incomplete == 0
    }
}

/// Executes a [`Matrix`] against an [`AdapterSet`], recording into a [`ResultStore`].
pub struct MatrixRunner {
    config: EngineConfig,
    store: Arc<dyn ResultStore>,
    adapters: AdapterSet,
    cancel: CancelToken,
}

impl MatrixRunner {
    pub fn new(config: EngineConfig, store: Arc<dyn ResultStore>, adapters: AdapterSet) -> Self {
        Self {
            config,
            store,
            adapters,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle for cancelling runs of this runner.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run (or resume) `run_id` over `matrix`.
    ///
    /// Cells whose stored outcome is terminal are skipped. Returns once every
    /// cell is terminal or the run was cancelled; returns `Err` only for
    /// invalid configuration or a store failure.
    pub async fn run(&self, matrix: &Matrix, run_id: RunId) -> Result<RunReport> {
        let span = obs::run_span(run_id.as_str());
        self.run_inner(matrix, run_id).instrument(span).await
    }

    async fn run_inner(&self, matrix: &Matrix, run_id: RunId) -> Result<RunReport> {
        self.config.validate()?;
        self.adapters.ensure_covers(matrix)?;
        let started = Instant::now();

        let provenance = Provenance::new(run_id.clone(), matrix.model_ids(), matrix.dataset_ids());
        let prior = self.store.load(&run_id).await?;
        self.store.persist(&ResultSet::new(provenance.clone())).await?;

        let mut pending = Vec::new();
        let mut skipped = 0usize;
        for cell in matrix.cells() {
            if prior.as_ref().is_some_and(|set| set.is_terminal(cell)) {
                skipped += 1;
            } else {
                pending.push(cell.clone());
            }
        }
        let scheduled = pending.len();
        METRICS.add_cells_scheduled(scheduled as u64);
        METRICS.add_cells_skipped(skipped as u64);
        obs::emit_run_started(run_id.as_str(), matrix.len(), skipped);

        let mut lanes = BTreeMap::new();
        for spec in matrix.models() {
            let adapter = self
                .adapters
                .get(&spec.id)
                .cloned()
                .ok_or_else(|| EngineError::MissingAdapter(spec.id.clone()))?;
            lanes.insert(
                spec.id.clone(),
                Arc::new(ModelLane::new(Arc::clone(spec), adapter, &self.config)),
            );
        }

        let ctx = Arc::new(RunContext {
            run_id: run_id.clone(),
            store: Arc::clone(&self.store),
            global: Arc::new(Semaphore::new(self.config.global_concurrency)),
            cancel: self.cancel.clone(),
            attempts: AtomicU64::new(0),
        });

        let mut tasks = JoinSet::new();
        for cell in pending {
            let lane = lanes
                .get(&cell.model_id)
                .cloned()
                .ok_or_else(|| EngineError::MissingAdapter(cell.model_id.clone()))?;
            let item = matrix
                .item(&cell)
                .cloned()
                .ok_or_else(|| EngineError::Aborted(format!("no dataset item for cell {cell}")))?;
            let ctx = Arc::clone(&ctx);
            tasks.spawn(drive_cell(ctx, lane, cell, item).instrument(Span::current()));
        }

        // Dropping `tasks` on an early return aborts the remaining cells.
        let period = self.config.checkpoint_interval();
        let mut checkpoint = tokio::time::interval_at(Instant::now() + period, period);
        checkpoint.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => {
                        obs::emit_storage_failure(run_id.as_str(), &err);
                        return Err(err);
                    }
                    Some(Err(join_err)) => {
                        return Err(EngineError::Aborted(format!("cell task failed: {join_err}")));
                    }
                },
                _ = checkpoint.tick() => {
                    if let Err(err) = self.store.flush(&run_id).await {
                        obs::emit_storage_failure(run_id.as_str(), &err);
                        return Err(err.into());
                    }
                    obs::emit_checkpoint(run_id.as_str());
                }
            }
        }

        if let Err(err) = self.store.flush(&run_id).await {
            obs::emit_storage_failure(run_id.as_str(), &err);
            return Err(err.into());
        }
        let result_set = self
            .store
            .load(&run_id)
            .await?
            .unwrap_or_else(|| ResultSet::new(provenance));

        let incomplete = matrix
            .cells()
            .iter()
            .filter(|cell| !result_set.is_terminal(cell))
            .count();
        let cancelled = self.cancel.is_cancelled();
        let duration = started.elapsed();
        let attempts = ctx.attempts.load(Ordering::Relaxed);

        if cancelled {
            obs::emit_run_cancelled(run_id.as_str(), incomplete);
        } else {
            obs::emit_run_finished(
                run_id.as_str(),
                duration.as_millis() as u64,
                attempts,
                incomplete,
            );
        }
        METRICS.flush();

        Ok(RunReport {
            run_id,
            result_set,
            scheduled,
            skipped,
            attempts,
            incomplete,
            cancelled,
            duration,
            peak_in_flight: lanes
                .iter()
                .map(|(id, lane)| (id.clone(), lane.peak_in_flight.load(Ordering::SeqCst)))
                .collect(),
        })
    }
}

/// Shared, read-mostly state of one run.
struct RunContext {
    run_id: RunId,
    store: Arc<dyn ResultStore>,
    global: Arc<Semaphore>,
    cancel: CancelToken,
    attempts: AtomicU64,
}

impl RunContext {
    async fn record(&self, outcome: PredictionOutcome) -> Result<()> {
        let terminal = outcome.is_terminal().then(|| {
            (outcome.cell.clone(), outcome.status, outcome.attempts)
        });
        self.store.upsert(&self.run_id, outcome).await?;

        if let Some((cell, status, attempts)) = terminal {
            if status == OutcomeStatus::Success {
                METRICS.inc_successes();
            } else {
                METRICS.inc_terminal_failures();
            }
            obs::emit_cell_terminal(&cell, status, attempts);
        }
        Ok(())
    }
}

/// Everything the runner keeps per model.
struct ModelLane {
    spec: Arc<ModelSpec>,
    adapter: Arc<dyn ModelAdapter>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    breaker: CircuitBreaker,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ModelLane {
    fn new(spec: Arc<ModelSpec>, adapter: Arc<dyn ModelAdapter>, config: &EngineConfig) -> Self {
        Self {
            policy: RetryPolicy::for_model(config, &spec),
            permits: Arc::new(Semaphore::new(spec.invocation.max_concurrency)),
            breaker: CircuitBreaker::default(),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            spec,
            adapter,
        }
    }

    /// One adapter call under the hard timeout. Panics become `Unknown`.
    async fn call(
        &self,
        item: &DatasetItem,
        timeout: Duration,
    ) -> std::result::Result<serde_json::Value, AdapterError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let call = AssertUnwindSafe(tokio::time::timeout(
            timeout,
            self.adapter.execute(item, timeout),
        ))
        .catch_unwind()
        .await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match call {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => Err(AdapterError::Transient(format!(
                "call timed out after {}ms",
                timeout.as_millis()
            ))),
            Err(panic) => Err(AdapterError::Unknown(format!(
                "adapter panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    fn disabled_outcome(&self, cell: CellKey, attempts: u32) -> PredictionOutcome {
        PredictionOutcome::failure(
            cell,
            OutcomeStatus::PermanentlyFailed,
            CellError::new(
                ErrorClass::Auth,
                format!("model {} disabled after authentication failure", self.spec.id),
            ),
            attempts,
            0,
        )
    }
}

async fn acquire(
    model: &Arc<Semaphore>,
    global: &Arc<Semaphore>,
) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
    let model_permit = Arc::clone(model)
        .acquire_owned()
        .await
        .map_err(|_| EngineError::Aborted("model limiter closed".to_string()))?;
    let global_permit = Arc::clone(global)
        .acquire_owned()
        .await
        .map_err(|_| EngineError::Aborted("global limiter closed".to_string()))?;
    Ok((model_permit, global_permit))
}

/// Drive one cell until it is terminal or the run is cancelled.
///
/// A resumed cell starts again at attempt 0; its stored placeholder is
/// replaced by the first outcome of this invocation.
async fn drive_cell(
    ctx: Arc<RunContext>,
    lane: Arc<ModelLane>,
    cell: CellKey,
    item: DatasetItem,
) -> Result<()> {
    let timeout = lane.spec.timeout();
    let mut attempts = 0u32;

    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        if lane.breaker.is_open() {
            return ctx.record(lane.disabled_outcome(cell, attempts)).await;
        }

        let permits = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Ok(()),
            permits = acquire(&lane.permits, &ctx.global) => permits?,
        };
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        if lane.breaker.is_open() {
            drop(permits);
            return ctx.record(lane.disabled_outcome(cell, attempts)).await;
        }

        attempts += 1;
        ctx.attempts.fetch_add(1, Ordering::Relaxed);
        METRICS.inc_attempts();
        obs::emit_cell_attempt(&cell, attempts);

        let started = Instant::now();
        let result = lane.call(&item, timeout).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        drop(permits);

        let err = match result {
            Ok(output) => {
                return ctx
                    .record(PredictionOutcome::success(cell, output, attempts, latency_ms))
                    .await;
            }
            Err(err) => err,
        };

        let class = err.class();
        let status = match class {
            ErrorClass::Auth => {
                if lane.breaker.record_auth_failure() {
                    obs::emit_model_disabled(&lane.spec.id, err.message());
                }
                OutcomeStatus::PermanentlyFailed
            }
            ErrorClass::InvalidInput => OutcomeStatus::InvalidInput,
            _ if lane.policy.should_retry(class, attempts) => OutcomeStatus::Failed,
            _ => OutcomeStatus::PermanentlyFailed,
        };

        let outcome =
            PredictionOutcome::failure(cell.clone(), status, err.to_cell_error(), attempts, latency_ms);
        ctx.record(outcome).await?;
        if status.is_terminal() {
            return Ok(());
        }

        let delay = lane.policy.backoff(&cell, attempts, err.retry_after());
        METRICS.inc_retries();
        obs::emit_retry_scheduled(&cell, attempts, class, delay.as_millis() as u64);

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
