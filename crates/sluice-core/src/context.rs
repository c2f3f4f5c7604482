use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::circuit::{CircuitBreakers, CircuitKey};
use crate::config::ConnectionConfig;
use crate::error::{Result, SluiceError};
use crate::event::{EngineEvent, EventBus};
use crate::retry::RetryPolicy;
use crate::types::RunId;

/// A retry that happened while an adapter ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryNotice {
    pub attempt: u32,
    pub delay_ms: u64,
    pub error: String,
}

/// Everything an adapter may see or touch while executing one step.
pub struct AdapterContext {
    pub run_id: RunId,
    pub pipeline_code: String,
    pub step_key: String,
    pub dry_run: bool,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    secrets: Arc<HashMap<String, String>>,
    connections: Arc<HashMap<String, ConnectionConfig>>,
    breakers: Arc<CircuitBreakers>,
    events: Arc<EventBus>,
    state: Mutex<Option<Value>>,
    state_changed: Mutex<bool>,
    retries: Mutex<Vec<RetryNotice>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AdapterContext {
    pub fn new(
        run_id: RunId,
        pipeline_code: impl Into<String>,
        step_key: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            pipeline_code: pipeline_code.into(),
            step_key: step_key.into(),
            dry_run: false,
            batch_size: 100,
            retry: RetryPolicy::default(),
            secrets: Arc::new(HashMap::new()),
            connections: Arc::new(HashMap::new()),
            breakers: Arc::new(CircuitBreakers::default()),
            events: Arc::new(EventBus::default()),
            state: Mutex::new(None),
            state_changed: Mutex::new(false),
            retries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<HashMap<String, String>>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_connections(mut self, connections: Arc<HashMap<String, ConnectionConfig>>) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakers>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Seed the step's own adapter state from the run checkpoint.
    pub fn with_checkpoint(self, state: Option<Value>) -> Self {
        *lock(&self.state) = state;
        self
    }

    /// Resolve a secret: `env:NAME` reads the environment, anything else the
    /// configured secrets.
    pub fn secret(&self, name: &str) -> Result<String> {
        if let Some(var) = name.strip_prefix("env:") {
            return std::env::var(var)
                .map_err(|_| SluiceError::Config(format!("environment variable {var} is not set")));
        }
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| SluiceError::Config(format!("unknown secret: {name}")))
    }

    pub fn connection(&self, code: &str) -> Result<&ConnectionConfig> {
        self.connections
            .get(code)
            .ok_or_else(|| SluiceError::Config(format!("unknown connection: {code}")))
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The adapter state stored for this step, if any.
    pub fn checkpoint(&self) -> Option<Value> {
        lock(&self.state).clone()
    }

    pub fn set_checkpoint(&self, value: Value) {
        *lock(&self.state) = Some(value);
        *lock(&self.state_changed) = true;
    }

    /// The updated adapter state, if the adapter wrote one.
    pub fn take_checkpoint_update(&self) -> Option<Value> {
        let mut changed = lock(&self.state_changed);
        if !*changed {
            return None;
        }
        *changed = false;
        lock(&self.state).clone()
    }

    pub fn note_retry(&self, attempt: u32, error: &SluiceError, delay: Duration) {
        lock(&self.retries).push(RetryNotice {
            attempt,
            delay_ms: delay.as_millis() as u64,
            error: error.to_string(),
        });
    }

    pub fn take_retry_notices(&self) -> Vec<RetryNotice> {
        std::mem::take(&mut *lock(&self.retries))
    }

    /// Tracing span carrying the run and step identity.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "step",
            run_id = %self.run_id,
            pipeline = %self.pipeline_code,
            step_key = %self.step_key
        )
    }

    /// Run a remote call under the retry policy and the circuit breaker for
    /// `circuit`. Each attempt counts toward the breaker; a rejected attempt
    /// never invokes `op` and is not retried.
    pub async fn guarded_call<T, F, Fut>(&self, circuit: &CircuitKey, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry
            .run_with(
                |attempt| {
                    let call = self.breakers.try_acquire(circuit).map(|_| op(attempt));
                    async move {
                        let result = call?.await;
                        match &result {
                            Ok(_) => self.breakers.record_success(circuit),
                            Err(_) => {
                                if self.breakers.record_failure(circuit) {
                                    self.events.publish(EngineEvent::CircuitOpened {
                                        key: circuit.to_string(),
                                    });
                                }
                            }
                        }
                        result
                    }
                },
                SluiceError::is_retryable,
                |attempt, error, delay| self.note_retry(attempt, error, delay),
            )
            .await
    }
}
