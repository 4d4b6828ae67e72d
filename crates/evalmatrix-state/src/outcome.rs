//! Per-cell prediction outcomes and the resolution rule shared by upsert and merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cell::CellKey;

/// Status of a cell's outcome.
///
/// `Failed` is the only non-terminal status: the last attempt failed with a
/// retryable error and another attempt is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
    InvalidInput,
    PermanentlyFailed,
}

impl OutcomeStatus {
    /// Terminal statuses never change without explicit reprocessing.
    pub fn is_terminal(self) -> bool {
        !matches!(self, OutcomeStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::InvalidInput => "invalid_input",
            OutcomeStatus::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification assigned by an adapter to a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network, 5xx or timeout. Retryable.
    Transient,
    /// Explicit provider throttling. Retryable, honouring the hint.
    RateLimited,
    /// Credential rejected. Fatal to the owning model.
    Auth,
    /// Item is malformed for this model. Terminal for the cell.
    InvalidInput,
    /// Unclassified. Retryable under a stricter cap.
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::Transient | ErrorClass::RateLimited | ErrorClass::Unknown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Auth => "auth",
            ErrorClass::InvalidInput => "invalid_input",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error classification recorded on a non-success outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellError {
    pub class: ErrorClass,
    pub message: String,
    /// Retry-after hint supplied by a rate-limited provider (milliseconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl CellError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after_ms(mut self, retry_after_ms: Option<u64>) -> Self {
        self.retry_after_ms = retry_after_ms;
        self
    }
}

/// The single outcome record held for a cell.
///
/// Created on the first attempt and overwritten in place across retries;
/// `output` is present iff `status == Success`, `error` iff it is not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutcome {
    pub cell: CellKey,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CellError>,
    /// Number of adapter calls made for this cell so far.
    pub attempts: u32,
    /// Wall-clock duration of the last attempt.
    pub latency_ms: u64,
    pub last_attempt_at: DateTime<Utc>,
}

impl PredictionOutcome {
    pub fn success(
        cell: CellKey,
        output: serde_json::Value,
        attempts: u32,
        latency_ms: u64,
    ) -> Self {
        Self {
            cell,
            status: OutcomeStatus::Success,
            output: Some(output),
            error: None,
            attempts,
            latency_ms,
            last_attempt_at: Utc::now(),
        }
    }

    /// Build a non-success outcome. `status` must not be `Success`.
    pub fn failure(
        cell: CellKey,
        status: OutcomeStatus,
        error: CellError,
        attempts: u32,
        latency_ms: u64,
    ) -> Self {
        debug_assert!(status != OutcomeStatus::Success);
        Self {
            cell,
            status,
            output: None,
            error: Some(error),
            attempts,
            latency_ms,
            last_attempt_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// Override the attempt timestamp (used when replaying or importing records).
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.last_attempt_at = timestamp;
        self
    }
}

/// Which of two outcomes for the same cell survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    Existing,
    Incoming,
}

/// Resolve two outcomes recorded for the same cell.
///
/// 1. terminal beats non-terminal;
/// 2. a success beats any non-success terminal, regardless of timestamps;
/// 3. otherwise the later `last_attempt_at` wins;
/// 4. ties go to `tie`.
pub fn prefer(
    existing: &PredictionOutcome,
    incoming: &PredictionOutcome,
    tie: Preference,
) -> Preference {
    match (existing.is_terminal(), incoming.is_terminal()) {
        (true, false) => return Preference::Existing,
        (false, true) => return Preference::Incoming,
        _ => {}
    }

    match (existing.is_success(), incoming.is_success()) {
        (true, false) => return Preference::Existing,
        (false, true) => return Preference::Incoming,
        _ => {}
    }

    match existing.last_attempt_at.cmp(&incoming.last_attempt_at) {
        std::cmp::Ordering::Greater => Preference::Existing,
        std::cmp::Ordering::Less => Preference::Incoming,
        std::cmp::Ordering::Equal => tie,
    }
}
