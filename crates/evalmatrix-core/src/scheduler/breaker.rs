//! Per-model circuit breaker for authentication failures.

use std::sync::atomic::{AtomicU32, Ordering};

/// Opens after `threshold` authentication failures and stays open for the
/// rest of the run. While open, no new attempts are issued for the model.
#[derive(Debug)]
pub struct CircuitBreaker {
    auth_failures: AtomicU32,
    threshold: u32,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(1)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            auth_failures: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    /// Returns `true` if the model is disabled.
    pub fn is_open(&self) -> bool {
        self.auth_failures.load(Ordering::Acquire) >= self.threshold
    }

    /// Record an authentication failure. Returns `true` exactly once: for
    /// the failure that opened the breaker.
    pub fn record_auth_failure(&self) -> bool {
        self.auth_failures.fetch_add(1, Ordering::AcqRel) + 1 == self.threshold
    }

    pub fn failure_count(&self) -> u32 {
        self.auth_failures.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_breaker_starts_closed() {
        let cb = CircuitBreaker::default();
        assert!(!cb.is_open());
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_breaker_opens_once() {
        let cb = CircuitBreaker::new(2);
        assert!(!cb.record_auth_failure());
        assert!(!cb.is_open());
        assert!(cb.record_auth_failure());
        assert!(cb.is_open());
        assert!(!cb.record_auth_failure());
        assert_eq!(cb.failure_count(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_failures_open_exactly_once() {
        let cb = Arc::new(CircuitBreaker::default());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cb = Arc::clone(&cb);
            handles.push(tokio::spawn(async move { cb.record_auth_failure() }));
        }
        let mut opened = 0;
        for h in handles {
            if h.await.unwrap() {
                opened += 1;
            }
        }
        assert_eq!(opened, 1);
        assert!(cb.is_open());
    }
}
