//! Structured observability hooks for prediction runs.
//!
//! - run-scoped spans (`run_span` for async runs, `RunSpan` RAII guard)
//! - one emission function per lifecycle event
//!
//! Events are emitted at `info!` (retries and per-attempt events at `debug!`)
//! and filtered via `EVALMATRIX_LOG` / `RUST_LOG`.

use evalmatrix_state::{CellKey, ErrorClass, OutcomeStatus};
use tracing::{debug, info, warn};

/// Span tagging everything a run does with its `run_id`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("evalmatrix.run", run_id = %run_id)
}

/// RAII guard that enters a run-scoped span for synchronous work.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

pub fn emit_run_started(run_id: &str, cells: usize, skipped: usize) {
    info!(event = "run.started", run_id = %run_id, cells = cells, skipped = skipped);
}

pub fn emit_cell_attempt(cell: &CellKey, attempt: u32) {
    debug!(event = "cell.attempt", cell = %cell, attempt = attempt);
}

pub fn emit_retry_scheduled(cell: &CellKey, attempt: u32, class: ErrorClass, delay_ms: u64) {
    debug!(
        event = "cell.retry_scheduled",
        cell = %cell,
        attempt = attempt,
        class = %class,
        delay_ms = delay_ms,
    );
}

pub fn emit_cell_terminal(cell: &CellKey, status: OutcomeStatus, attempts: u32) {
    info!(event = "cell.terminal", cell = %cell, status = %status, attempts = attempts);
}

/// Warn level: a model was disabled by its authentication breaker.
pub fn emit_model_disabled(model_id: &str, reason: &str) {
    warn!(event = "model.disabled", model_id = %model_id, reason = %reason);
}

pub fn emit_checkpoint(run_id: &str) {
    debug!(event = "run.checkpoint", run_id = %run_id);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, attempts: u64, incomplete: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        attempts = attempts,
        incomplete = incomplete,
    );
}

pub fn emit_run_cancelled(run_id: &str, incomplete: usize) {
    warn!(event = "run.cancelled", run_id = %run_id, incomplete = incomplete);
}

/// Warn level: the store failed and the run was aborted.
pub fn emit_storage_failure(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.storage_failure", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id");
    }

    #[traced_test]
    #[test]
    fn test_terminal_event_carries_cell_and_status() {
        let cell = CellKey::new("openai/gpt-4", "mmlu", "q1");
        emit_cell_terminal(&cell, OutcomeStatus::InvalidInput, 1);
        assert!(logs_contain("cell.terminal"));
        assert!(logs_contain("openai/gpt-4|mmlu|q1"));
        assert!(logs_contain("invalid_input"));
    }

    #[traced_test]
    #[test]
    fn test_model_disabled_is_a_warning() {
        emit_model_disabled("openai/gpt-4", "401 invalid api key");
        assert!(logs_contain("WARN"));
        assert!(logs_contain("model.disabled"));
    }
}
