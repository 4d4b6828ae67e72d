//! Global atomic counters for evalmatrix runs.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single `tracing::info!`
//! event (the runner does this at the end of every run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    cells_scheduled: AtomicU64,
    cells_skipped: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    successes: AtomicU64,
    terminal_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cells_scheduled: AtomicU64::new(0),
            cells_skipped: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            terminal_failures: AtomicU64::new(0),
        }
    }

    pub fn add_cells_scheduled(&self, n: u64) {
        self.cells_scheduled.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_cells_skipped(&self, n: u64) {
        self.cells_skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_attempts(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "attempts", "counter incremented");
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries", "counter incremented");
    }

    pub fn inc_successes(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_terminal_failures(&self) {
        self.terminal_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            cells_scheduled = self.cells_scheduled(),
            cells_skipped = self.cells_skipped(),
            attempts = self.attempts(),
            retries = self.retries(),
            successes = self.successes(),
            terminal_failures = self.terminal_failures(),
        );
    }

    pub fn cells_scheduled(&self) -> u64 {
        self.cells_scheduled.load(Ordering::Relaxed)
    }

    pub fn cells_skipped(&self) -> u64 {
        self.cells_skipped.load(Ordering::Relaxed)
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn terminal_failures(&self) -> u64 {
        self.terminal_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.cells_scheduled.store(0, Ordering::Relaxed);
        self.cells_skipped.store(0, Ordering::Relaxed);
        self.attempts.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.terminal_failures.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.add_cells_scheduled(6);
        m.add_cells_skipped(2);
        m.inc_attempts();
        m.inc_attempts();
        m.inc_retries();
        m.inc_successes();
        m.inc_terminal_failures();
        assert_eq!(m.cells_scheduled(), 6);
        assert_eq!(m.cells_skipped(), 2);
        assert_eq!(m.attempts(), 2);
        assert_eq!(m.retries(), 1);
        assert_eq!(m.successes(), 1);
        assert_eq!(m.terminal_failures(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.add_cells_scheduled(3);
        m.inc_attempts();
        m.inc_successes();
        m.reset();
        assert_eq!(m.cells_scheduled(), 0);
        assert_eq!(m.attempts(), 0);
        assert_eq!(m.successes(), 0);
    }
}
