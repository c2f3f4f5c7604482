//! Periodic auto-approval of TIMEOUT gates whose deadline has passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sluice_core::error::Result;
use sluice_core::event::EngineEvent;
use sluice_core::types::RunStatus;

use crate::engine::Engine;

pub struct GateTimeoutSweeper {
    engine: Arc<Engine>,
    interval: Duration,
    cancel: CancellationToken,
}

impl GateTimeoutSweeper {
    pub fn new(engine: Arc<Engine>, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            engine,
            interval: interval.max(Duration::from_millis(1)),
            cancel,
        }
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs_f64(), "Gate timeout sweep started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(0) => debug!("No expired gates"),
                        Ok(released) => info!(released, "Released expired gates"),
                        Err(e) => warn!(error = %e, "Gate timeout sweep failed"),
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("Gate timeout sweep stopped");
                    return;
                }
            }
        }
    }

    /// Release the expired TIMEOUT gates of every idle PAUSED run. The runs
    /// resume in the background, so a slow run never holds up the others.
    /// Returns the number of gates released.
    ///
    /// A failure on one run is logged and does not stop the sweep.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let paused = self.engine.list_runs(Some(RunStatus::Paused)).await?;
        let mut released = 0;

        for run in paused {
            if self.engine.is_active(&run.id) {
                continue;
            }
            let checkpoint = match self.engine.checkpoint(&run.id).await {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Unreadable checkpoint, skipping");
                    continue;
                }
            };
            let expired: Vec<_> = checkpoint
                .engine
                .gate_timeouts
                .iter()
                .filter(|(_, timeout)| timeout.is_expired(now))
                .map(|(key, timeout)| (key.clone(), *timeout))
                .collect();
            if expired.is_empty() {
                continue;
            }

            let keys: Vec<String> = expired.iter().map(|(k, _)| k.clone()).collect();
            let keys = match self.engine.release_gates(&run.id, &keys).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Could not release expired gates");
                    continue;
                }
            };
            for (step_key, timeout) in expired.into_iter().filter(|(k, _)| keys.contains(k)) {
                let actual_secs = (now - timeout.paused_at).num_milliseconds() as f64 / 1000.0;
                info!(
                    run_id = %run.id,
                    step_key = %step_key,
                    configured_secs = timeout.timeout_seconds,
                    actual_secs,
                    "Gate timed out, auto-approved"
                );
                self.engine.events().publish(EngineEvent::GateTimedOut {
                    run_id: run.id.clone(),
                    step_key,
                    configured_secs: timeout.timeout_seconds,
                    actual_secs,
                });
                released += 1;
            }
        }
        Ok(released)
    }
}
