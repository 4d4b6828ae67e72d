//! Retry policy: attempt ceilings per error class and jittered backoff.

use std::time::Duration;

use evalmatrix_state::{CellKey, ErrorClass};
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::domain::ModelSpec;

/// Retry rules applied to every cell of one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub unknown_max_attempts: u32,
    pub rate_limited_max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            unknown_max_attempts: config.unknown_max_attempts,
            rate_limited_max_attempts: config.rate_limited_max_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Engine policy with the model's attempt overrides applied.
    pub fn for_model(config: &EngineConfig, spec: &ModelSpec) -> Self {
        let mut policy = Self::from_config(config);
        if let Some(max) = spec.max_attempts {
            policy.max_attempts = max;
        }
        if let Some(max) = spec.rate_limited_max_attempts {
            policy.rate_limited_max_attempts = max;
        }
        policy
    }

    /// Total calls allowed for a cell whose latest failure has `class`.
    pub fn attempt_cap(&self, class: ErrorClass) -> u32 {
        match class {
            ErrorClass::Transient => self.max_attempts,
            ErrorClass::Unknown => self.max_attempts.min(self.unknown_max_attempts),
            ErrorClass::RateLimited => self.max_attempts.max(self.rate_limited_max_attempts),
            ErrorClass::Auth | ErrorClass::InvalidInput => 1,
        }
    }

    /// Whether another attempt follows a failure of `class` after `attempts` calls.
    pub fn should_retry(&self, class: ErrorClass, attempts: u32) -> bool {
        class.is_retryable() && attempts < self.attempt_cap(class)
    }

    /// Delay before the next attempt, after attempt number `attempt` (1-based) failed.
    ///
    /// `d = min(base * 2^(attempt-1), max)`, then equal jitter `d/2 + frac * d/2`
    /// with `frac` derived from the cell key and attempt, so the schedule is
    /// reproducible. A rate-limit hint raises the delay to at least the hint.
    pub fn backoff(&self, cell: &CellKey, attempt: u32, hint: Option<Duration>) -> Duration {
        let base_ms = self.backoff_base.as_millis() as u64;
        let max_ms = self.backoff_max.as_millis() as u64;
        let exp = attempt.saturating_sub(1).min(63);
        let capped = base_ms
            .checked_mul(1u64 << exp)
            .unwrap_or(u64::MAX)
            .min(max_ms);

        let half = capped / 2;
        let jitter = ((capped - half) as f64 * jitter_fraction(cell, attempt)) as u64;
        let delay = Duration::from_millis(half + jitter);

        match hint {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }
}

/// Deterministic value in `[0, 1)` from SHA-256 of the cell key and attempt.
fn jitter_fraction(cell: &CellKey, attempt: u32) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(cell.composite().as_bytes());
    hasher.update(attempt.to_be_bytes());
    let digest = hasher.finalize();
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    // 53 significant bits fit an f64 exactly.
    (u64::from_be_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64
}
