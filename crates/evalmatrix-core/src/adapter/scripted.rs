//! Deterministic replay adapter for tests and offline demos.
//!
//! Each item gets a list of steps; call `n` for an item plays step `n`, and
//! the last step repeats once the list is exhausted. Items without a script
//! play the default step, or echo their input when none is set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use evalmatrix_state::ErrorClass;
use serde::Deserialize;

use super::{AdapterError, ModelAdapter};
use crate::domain::{DatasetItem, EngineError, ModelSpec, Result};

/// One scripted reaction to a call.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Return this output.
    Respond(serde_json::Value),
    /// Fail with this error.
    Fail(AdapterError),
    /// Never complete; the caller's timeout fires.
    Hang,
    /// Panic inside the call.
    Panic(String),
}

impl ScriptStep {
    pub fn ok(output: serde_json::Value) -> Self {
        ScriptStep::Respond(output)
    }

    pub fn transient() -> Self {
        ScriptStep::Fail(AdapterError::Transient("503 service unavailable".to_string()))
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        ScriptStep::Fail(AdapterError::rate_limited("429 too many requests", retry_after))
    }

    pub fn auth() -> Self {
        ScriptStep::Fail(AdapterError::Auth("401 invalid api key".to_string()))
    }

    pub fn invalid_input(reason: &str) -> Self {
        ScriptStep::Fail(AdapterError::InvalidInput(reason.to_string()))
    }

    pub fn unknown() -> Self {
        ScriptStep::Fail(AdapterError::Unknown("unexpected response".to_string()))
    }
}

/// Replays scripted steps per item and records call statistics.
#[derive(Debug, Default)]
pub struct ScriptedAdapter {
    scripts: HashMap<String, Vec<ScriptStep>>,
    default_step: Option<ScriptStep>,
    latency: Duration,
    calls: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the calls for one item.
    pub fn on(mut self, item_id: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        self.scripts.insert(item_id.into(), steps);
        self
    }

    /// Step played for items without a script.
    pub fn otherwise(mut self, step: ScriptStep) -> Self {
        self.default_step = Some(step);
        self
    }

    /// Simulated latency added to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Build from a spec's metadata:
    ///
    /// ```toml
    /// [models.metadata]
    /// latency_ms = 5
    /// default = { kind = "ok", output = "fallback" }
    /// script = { "q1" = [{ kind = "error", class = "rate_limited", retry_after_ms = 100 }, { kind = "ok", output = "B" }] }
    /// ```
    pub fn from_spec(spec: &ModelSpec) -> Result<Self> {
        let invalid = |e: serde_json::Error| EngineError::AdapterInit {
            model_id: spec.id.clone(),
            reason: format!("invalid script: {e}"),
        };

        let mut adapter = Self::new();
        if let Some(script) = spec.metadata.get("script") {
            let script: HashMap<String, Vec<StepSpec>> =
                serde_json::from_value(script.clone()).map_err(invalid)?;
            for (item_id, steps) in script {
                adapter = adapter.on(item_id, steps.into_iter().map(ScriptStep::from).collect());
            }
        }
        if let Some(default) = spec.metadata.get("default") {
            let step: StepSpec = serde_json::from_value(default.clone()).map_err(invalid)?;
            adapter = adapter.otherwise(step.into());
        }
        if let Some(latency) = spec.metadata.get("latency_ms").and_then(|v| v.as_u64()) {
            adapter = adapter.with_latency(Duration::from_millis(latency));
        }
        Ok(adapter)
    }

    /// Calls made so far for one item.
    pub fn calls(&self, item_id: &str) -> u32 {
        self.lock_calls().get(item_id).copied().unwrap_or(0)
    }

    /// Calls made so far across all items.
    pub fn total_calls(&self) -> u32 {
        self.lock_calls().values().sum()
    }

    /// Highest number of concurrent calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_step(&self, item: &DatasetItem) -> ScriptStep {
        let call = {
            let mut calls = self.lock_calls();
            let count = calls.entry(item.id.clone()).or_insert(0);
            *count += 1;
            *count as usize
        };
        match self.scripts.get(&item.id) {
            Some(steps) if !steps.is_empty() => steps[(call - 1).min(steps.len() - 1)].clone(),
            _ => self
                .default_step
                .clone()
                .unwrap_or_else(|| ScriptStep::Respond(item.input.clone())),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelAdapter for ScriptedAdapter {
    async fn execute(
        &self,
        item: &DatasetItem,
        _timeout: Duration,
    ) -> std::result::Result<serde_json::Value, AdapterError> {
        let step = self.next_step(item);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match step {
            ScriptStep::Respond(output) => Ok(output),
            ScriptStep::Fail(err) => Err(err),
            ScriptStep::Hang => {
                std::future::pending::<()>().await;
                Err(AdapterError::Unknown("unreachable".to_string()))
            }
            ScriptStep::Panic(msg) => panic!("{msg}"),
        }
    }
}

/// Serialized form of a step inside model metadata.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StepSpec {
    Ok {
        output: serde_json::Value,
    },
    Error {
        class: ErrorClass,
        #[serde(default)]
        message: String,
        #[serde(default)]
        retry_after_ms: Option<u64>,
    },
    Hang,
}

impl From<StepSpec> for ScriptStep {
    fn from(spec: StepSpec) -> Self {
        match spec {
            StepSpec::Ok { output } => ScriptStep::Respond(output),
            StepSpec::Hang => ScriptStep::Hang,
            StepSpec::Error {
                class,
                message,
                retry_after_ms,
            } => {
                let message = if message.is_empty() {
                    format!("scripted {class} error")
                } else {
                    message
                };
                ScriptStep::Fail(match class {
                    ErrorClass::Transient => AdapterError::Transient(message),
                    ErrorClass::RateLimited => AdapterError::rate_limited(
                        message,
                        retry_after_ms.map(Duration::from_millis),
                    ),
                    ErrorClass::Auth => AdapterError::Auth(message),
                    ErrorClass::InvalidInput => AdapterError::InvalidInput(message),
                    ErrorClass::Unknown => AdapterError::Unknown(message),
                })
            }
        }
    }
}
