use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sluice_core::config::ScheduleConfig;
use sluice_core::error::Result;
use sluice_core::event::EngineEvent;
use sluice_core::types::{Record, RunId};

use crate::engine::Engine;

struct ScheduledPipeline {
    name: String,
    schedule: Schedule,
    pipeline: String,
    seed: Option<PathBuf>,
}

/// Starts pipeline runs on cron schedules.
pub struct PipelineScheduler {
    jobs: Vec<ScheduledPipeline>,
    engine: Arc<Engine>,
    cancel: CancellationToken,
}

/// Read a seed batch: a JSON array of objects.
pub fn read_seed(path: &Path) -> Result<Vec<Record>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

impl PipelineScheduler {
    /// Register each schedule's pipeline file with the engine. Schedules with
    /// an invalid cron expression or an unloadable pipeline are skipped.
    pub fn new(schedules: &[ScheduleConfig], engine: Arc<Engine>, cancel: CancellationToken) -> Self {
        let mut jobs = Vec::new();

        for config in schedules {
            let schedule = match Schedule::from_str(&config.cron) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(
                        name = %config.name,
                        cron = %config.cron,
                        error = %e,
                        "Invalid cron expression, skipping schedule"
                    );
                    continue;
                }
            };
            let pipeline = match engine.load_pipeline(Path::new(&config.pipeline)) {
                Ok(code) => code,
                Err(e) => {
                    warn!(name = %config.name, path = %config.pipeline, error = %e, "Pipeline not loadable, skipping schedule");
                    continue;
                }
            };
            info!(name = %config.name, cron = %config.cron, pipeline = %pipeline, "Schedule registered");
            jobs.push(ScheduledPipeline {
                name: config.name.clone(),
                schedule,
                pipeline,
                seed: config.seed.as_ref().map(PathBuf::from),
            });
        }

        Self { jobs, engine, cancel }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Earliest upcoming fire time after `after`, with its schedule name.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<(DateTime<Utc>, &str)> {
        self.jobs
            .iter()
            .filter_map(|job| job.schedule.after(&after).next().map(|at| (at, job.name.as_str())))
            .min_by_key(|(at, _)| *at)
    }

    /// Start one run of the named schedule now.
    pub async fn fire(&self, name: &str) -> Result<Option<RunId>> {
        let Some(job) = self.jobs.iter().find(|j| j.name == name) else {
            return Ok(None);
        };
        let seed = match &job.seed {
            Some(path) => read_seed(path)?,
            None => vec![],
        };
        let run_id = self.engine.spawn_run(&job.pipeline, seed).await?;
        self.engine.events().publish(EngineEvent::ScheduleFired {
            schedule: job.name.clone(),
            run_id: run_id.clone(),
            at: Utc::now(),
        });
        Ok(Some(run_id))
    }

    /// Run the scheduler loop. Blocks until cancelled.
    pub async fn run(&self) {
        if self.jobs.is_empty() {
            info!("No schedules configured, scheduler idle");
            self.cancel.cancelled().await;
            return;
        }

        info!(count = self.jobs.len(), "Pipeline scheduler started");

        loop {
            let now = Utc::now();
            let Some((fire_at, name)) = self.next_fire(now) else {
                self.cancel.cancelled().await;
                return;
            };
            let delay = (fire_at - now).to_std().unwrap_or(Duration::from_secs(1));
            info!(
                schedule = %name,
                fire_at = %fire_at.format("%H:%M:%S"),
                delay_secs = delay.as_secs(),
                "Next schedule due"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    match self.fire(name).await {
                        Ok(Some(run_id)) => info!(schedule = %name, run_id = %run_id, "Schedule fired"),
                        Ok(None) => {}
                        Err(e) => error!(schedule = %name, error = %e, "Scheduled run failed to start"),
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("Pipeline scheduler shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sluice_adapters::AdapterRegistry;
    use sluice_core::types::RunStatus;
    use sluice_store::MemoryStore;
    use sluice_test_utils::temp_file;

    const PIPELINE: &str = r#"{
        "code": "nightly",
        "steps": [{ "key": "pull", "kind": "EXTRACT", "adapter": "inline" }]
    }"#;

    fn schedule(name: &str, cron: &str, pipeline: &Path, seed: Option<&Path>) -> ScheduleConfig {
        ScheduleConfig {
            name: name.into(),
            cron: cron.into(),
            pipeline: pipeline.display().to_string(),
            seed: seed.map(|p| p.display().to_string()),
        }
    }

    fn engine() -> Arc<Engine> {
        Engine::builder(Arc::new(MemoryStore::new()))
            .registry(AdapterRegistry::with_builtins())
            .build()
    }

    #[test]
    fn invalid_schedules_are_skipped() {
        let pipeline = temp_file(".json", PIPELINE);
        let schedules = vec![
            schedule("good", "0 0 2 * * *", pipeline.path(), None),
            schedule("bad_cron", "every night", pipeline.path(), None),
            schedule("bad_file", "0 0 2 * * *", Path::new("/nonexistent/p.json"), None),
        ];
        let engine = engine();

        let scheduler = PipelineScheduler::new(&schedules, engine.clone(), CancellationToken::new());

        assert_eq!(scheduler.len(), 1);
        assert!(engine.pipeline("nightly").is_ok());
    }

    #[test]
    fn next_fire_picks_earliest_schedule() {
        let pipeline = temp_file(".json", PIPELINE);
        let schedules = vec![
            schedule("late", "0 30 3 * * *", pipeline.path(), None),
            schedule("early", "0 15 1 * * *", pipeline.path(), None),
        ];
        let scheduler = PipelineScheduler::new(&schedules, engine(), CancellationToken::new());

        let after = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let (at, name) = scheduler.next_fire(after).unwrap();

        assert_eq!(name, "early");
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 5, 1, 1, 15, 0).unwrap());
    }

    #[tokio::test]
    async fn fire_starts_run_with_seed() {
        let pipeline = temp_file(".json", PIPELINE);
        let seed = temp_file(".json", r#"[{"id": 1}, {"id": 2}]"#);
        let engine = engine();
        let scheduler = PipelineScheduler::new(
            &[schedule("nightly", "0 0 2 * * *", pipeline.path(), Some(seed.path()))],
            engine.clone(),
            CancellationToken::new(),
        );
        let mut rx = engine.events().subscribe();

        let run_id = scheduler.fire("nightly").await.unwrap().unwrap();

        loop {
            if let EngineEvent::RunCompleted { run_id: done, .. } = rx.recv().await.unwrap() {
                assert_eq!(done, run_id);
                break;
            }
        }
        let run = engine.run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.seed.len(), 2);
        assert!(scheduler.fire("unknown").await.unwrap().is_none());
    }
}
