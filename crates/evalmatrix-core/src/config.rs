//! Engine configuration with serde defaults and `EVALMATRIX_*` overrides.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{EngineError, Result};

/// Run-wide execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum in-flight adapter calls across all models.
    pub global_concurrency: usize,
    /// Attempt ceiling for transient failures (overridable per model).
    pub max_attempts: u32,
    /// Stricter ceiling for unclassified failures.
    pub unknown_max_attempts: u32,
    /// Ceiling for explicit provider throttling (overridable per model); never
    /// below `max_attempts`.
    pub rate_limited_max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How often buffered retry placeholders are flushed to the store.
    pub checkpoint_interval_ms: u64,
    /// Root directory for the filesystem store and run artifacts.
    pub results_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 8,
            max_attempts: 3,
            unknown_max_attempts: 2,
            rate_limited_max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            checkpoint_interval_ms: 30_000,
            results_dir: PathBuf::from(".evalmatrix"),
        }
    }
}

impl EngineConfig {
    /// Overlay `EVALMATRIX_*` environment variables onto `self`.
    pub fn with_env(self) -> Result<Self> {
        self.overlay(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with the environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Overlay values from an arbitrary lookup (environment in production).
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("EVALMATRIX_GLOBAL_CONCURRENCY") {
            self.global_concurrency = parse_var("EVALMATRIX_GLOBAL_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("EVALMATRIX_MAX_ATTEMPTS") {
            self.max_attempts = parse_var("EVALMATRIX_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("EVALMATRIX_UNKNOWN_MAX_ATTEMPTS") {
            self.unknown_max_attempts = parse_var("EVALMATRIX_UNKNOWN_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("EVALMATRIX_RATE_LIMITED_MAX_ATTEMPTS") {
            self.rate_limited_max_attempts =
                parse_var("EVALMATRIX_RATE_LIMITED_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("EVALMATRIX_BACKOFF_BASE_MS") {
            self.backoff_base_ms = parse_var("EVALMATRIX_BACKOFF_BASE_MS", &v)?;
        }
        if let Some(v) = get("EVALMATRIX_BACKOFF_MAX_MS") {
            self.backoff_max_ms = parse_var("EVALMATRIX_BACKOFF_MAX_MS", &v)?;
        }
        if let Some(v) = get("EVALMATRIX_CHECKPOINT_INTERVAL_MS") {
            self.checkpoint_interval_ms = parse_var("EVALMATRIX_CHECKPOINT_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("EVALMATRIX_RESULTS_DIR") {
            self.results_dir = PathBuf::from(v);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.global_concurrency == 0 {
            return Err(EngineError::InvalidConfig(
                "global_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.unknown_max_attempts == 0 || self.rate_limited_max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "attempt ceilings must be at least 1".to_string(),
            ));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(EngineError::InvalidConfig(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if self.checkpoint_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "checkpoint_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::InvalidConfig(format!("{key}: cannot parse {value:?}")))
}
