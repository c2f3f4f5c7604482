use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Result, SluiceError};

/// Exponential backoff without jitter.
///
/// Attempt `n` (1-based) that fails sleeps `min(delay, max_delay)` before the
/// next attempt, where `delay` starts at `initial_delay` and is multiplied by
/// `multiplier` after every sleep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(30), 2.0)
    }
}

/// Per-step override read from a step's `retry` config block.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryOverride {
    retries: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
}

impl RetryPolicy {
    pub fn new(retries: u32, initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            retries,
            initial_delay,
            max_delay,
            multiplier: if multiplier.is_finite() && multiplier > 0.0 {
                multiplier
            } else {
                1.0
            },
        }
    }

    /// Execute exactly once.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Apply a step's `retry` block, if any, on top of this policy.
    pub fn overridden_by(&self, step_config: &serde_json::Value) -> Self {
        let Some(block) = step_config.get("retry") else {
            return *self;
        };
        let over: RetryOverride = match serde_json::from_value(block.clone()) {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed retry override");
                return *self;
            }
        };
        Self::new(
            over.retries.unwrap_or(self.retries),
            over.initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(self.initial_delay),
            over.max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(self.max_delay),
            over.multiplier.unwrap_or(self.multiplier),
        )
    }

    /// The sleeps taken between attempts if every attempt fails.
    pub fn delays(&self) -> Vec<Duration> {
        let mut delay = self.initial_delay;
        (0..self.retries)
            .map(|_| {
                let sleep = delay.min(self.max_delay);
                delay = self.grow(delay);
                sleep
            })
            .collect()
    }

    fn grow(&self, delay: Duration) -> Duration {
        let cap = self.max_delay.max(delay);
        let nanos = (delay.as_nanos() as f64 * self.multiplier).round();
        if !nanos.is_finite() || nanos >= cap.as_nanos() as f64 {
            return cap;
        }
        Duration::from_nanos(nanos as u64)
    }

    /// Run `op` with retries; every error except circuit-open is retried.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_with(op, SluiceError::is_retryable, |_, _, _| {}).await
    }

    /// Run `op` with retries.
    ///
    /// `op` receives the 1-based attempt number. `should_retry` vetoes a retry;
    /// `on_retry(attempt, error, sleep)` is called before each sleep. Once
    /// attempts are exhausted the last error is returned.
    pub async fn run_with<T, F, Fut, P, O>(
        &self,
        mut op: F,
        should_retry: P,
        mut on_retry: O,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&SluiceError) -> bool,
        O: FnMut(u32, &SluiceError, Duration),
    {
        let mut delay = self.initial_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt > self.retries || !should_retry(&e) {
                        return Err(e);
                    }
                    let sleep = delay.min(self.max_delay);
                    warn!(
                        attempt,
                        retries = self.retries,
                        backoff_ms = sleep.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    on_retry(attempt, &e, sleep);
                    tokio::time::sleep(sleep).await;
                    delay = self.grow(delay);
                }
            }
        }
    }
}
