//! DAG scheduler: walks a pipeline in topological order, one step at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use sluice_core::checkpoint::{Checkpoint, StepOutput};
use sluice_core::circuit::CircuitBreakers;
use sluice_core::config::{AppConfig, ConnectionConfig};
use sluice_core::context::AdapterContext;
use sluice_core::error::{Result, SluiceError};
use sluice_core::event::{EngineEvent, EventBus};
use sluice_core::hooks::HookStage;
use sluice_core::pipeline::{PipelineDefinition, StepDefinition};
use sluice_core::retry::RetryPolicy;
use sluice_core::traits::{CheckpointStore, RunStore};
use sluice_core::types::{DeadLetter, Record, RunFailure, RunRecord, RunStatus, StepKind};

use crate::engine::ActiveRun;
use crate::executor::StepExecutor;
use crate::gate::{self, GateOutcome};
use crate::hooks::{HookContext, HookRunner};
use crate::notify::GateNotifier;

/// Per-run execution settings taken from the app config.
#[derive(Clone)]
pub struct RunSettings {
    pub dry_run: bool,
    pub batch_size: usize,
    /// Run time limit when the pipeline sets none; 0 means unlimited.
    pub max_run_secs: u64,
    pub retry: RetryPolicy,
    pub secrets: Arc<HashMap<String, String>>,
    pub connections: Arc<HashMap<String, ConnectionConfig>>,
}

impl RunSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            dry_run: config.engine.dry_run,
            batch_size: config.engine.batch_size,
            max_run_secs: config.engine.max_run_secs,
            retry: config.retry.policy(),
            secrets: Arc::new(config.secrets.clone()),
            connections: Arc::new(config.connections.clone()),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// How a pass over the graph ended.
#[derive(Debug)]
enum RunEnd {
    Completed,
    Paused,
    Failed(RunFailure),
    Cancelled,
    TimedOut(u64),
}

pub struct DagScheduler {
    pub(crate) executor: StepExecutor,
    pub(crate) hooks: Arc<HookRunner>,
    pub(crate) notifier: GateNotifier,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) runs: Arc<dyn RunStore>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) breakers: Arc<CircuitBreakers>,
    pub(crate) settings: RunSettings,
}

impl DagScheduler {
    fn context(&self, run: &RunRecord, step: &StepDefinition, state: Option<Value>) -> AdapterContext {
        AdapterContext::new(run.id.clone(), run.pipeline_code.clone(), step.key.clone())
            .with_dry_run(self.settings.dry_run)
            .with_batch_size(self.settings.batch_size)
            .with_retry(self.settings.retry.overridden_by(&step.config))
            .with_secrets(self.settings.secrets.clone())
            .with_connections(self.settings.connections.clone())
            .with_breakers(self.breakers.clone())
            .with_events(self.events.clone())
            .with_checkpoint(state)
    }

    async fn persist(&self, run: &RunRecord, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints.save(&run.id, &checkpoint.to_map()?).await?;
        self.runs.save_run(run).await
    }

    /// Drive `run` until it completes, pauses at a gate, fails, times out or
    /// is cancelled. Steps already completed in an earlier pass replay their
    /// stored output instead of running again.
    ///
    /// An `Err` means the run could not be driven at all (store failure,
    /// invalid definition); the run keeps its previous status. The claim is
    /// released once the settled run is saved.
    pub(crate) async fn drive(&self, run: &mut RunRecord, claim: ActiveRun) -> Result<RunStatus> {
        let cancel = claim.token();
        let def = run.definition.clone();
        def.validate()?;
        let order = def.execution_order()?;
        let mut checkpoint = Checkpoint::from_map(&self.checkpoints.load(&run.id).await?)?;
        let hook_ctx = HookContext::new(&run.id, &def.code);
        let fresh = run.status == RunStatus::Pending;

        run.error = None;
        run.transition(RunStatus::Running);
        self.runs.save_run(run).await?;

        if fresh {
            info!(run_id = %run.id, pipeline = %def.code, seed = run.seed.len(), "Run started");
            self.events.publish(EngineEvent::RunStarted {
                run_id: run.id.clone(),
                pipeline: def.code.clone(),
            });
            match self
                .hooks
                .run(HookStage::PipelineStarted, run.seed.clone(), &def.hooks, &hook_ctx)
                .await
            {
                // Stored so resumed passes feed roots the same batch
                Ok(seed) => run.seed = seed,
                Err(e) => {
                    let failure = RunFailure {
                        step_key: None,
                        message: e.to_string(),
                    };
                    return self
                        .finish(run, &def, claim, RunEnd::Failed(failure), vec![], &hook_ctx)
                        .await;
                }
            }
        } else {
            info!(
                run_id = %run.id,
                completed_steps = checkpoint.engine.step_outputs.len(),
                "Resuming run"
            );
        }

        let limit_secs = def
            .timeout_secs
            .or((self.settings.max_run_secs > 0).then_some(self.settings.max_run_secs));
        let deadline = limit_secs.map(|s| Instant::now() + Duration::from_secs(s));
        let mut stats = checkpoint.engine.stats.unwrap_or_default();
        let mut outputs: HashMap<&str, Vec<Record>> = HashMap::new();
        let mut end = None;

        for idx in order {
            let step = &def.steps[idx];
            let key = step.key.as_str();

            if cancel.is_cancelled() {
                end = Some(RunEnd::Cancelled);
                break;
            }
            if let (Some(deadline), Some(limit)) = (deadline, limit_secs) {
                if Instant::now() >= deadline {
                    end = Some(RunEnd::TimedOut(limit));
                    break;
                }
            }

            let preds = def.predecessors(key);
            if let Some(waiting_on) = preds.iter().find(|p| !outputs.contains_key(*p)) {
                debug!(run_id = %run.id, step_key = key, waiting_on, "Step blocked upstream");
                continue;
            }

            if let Some(done) = checkpoint.engine.step_outputs.get(key) {
                debug!(run_id = %run.id, step_key = key, records = done.records.len(), "Replaying completed step");
                outputs.insert(key, done.records.clone());
                continue;
            }

            // Barrier fan-in: predecessors' outputs in edge order
            let input: Vec<Record> = if preds.is_empty() {
                run.seed.clone()
            } else {
                preds
                    .iter()
                    .flat_map(|p| outputs.get(p).into_iter().flatten().cloned())
                    .collect()
            };

            if step.kind == StepKind::Gate {
                let config = step.gate.as_ref().ok_or_else(|| {
                    SluiceError::InvalidPipeline(format!("gate step '{key}' has no gate config"))
                })?;
                match gate::evaluate(key, config, input, &mut checkpoint.engine, Utc::now()) {
                    GateOutcome::Pass(records) | GateOutcome::Released { records, .. } => {
                        info!(run_id = %run.id, step_key = key, records = records.len(), "Gate open");
                        checkpoint.engine.step_outputs.insert(
                            key.to_string(),
                            StepOutput {
                                ok: records.len(),
                                fail: 0,
                                records: records.clone(),
                                completed_at: Utc::now(),
                            },
                        );
                        outputs.insert(key, records);
                    }
                    GateOutcome::Paused { fresh } => {
                        if let (true, Some(snapshot)) = (fresh, checkpoint.engine.gates.get(key)) {
                            info!(
                                run_id = %run.id,
                                step_key = key,
                                approval_type = config.approval_type.as_str(),
                                pending = snapshot.pending_record_count,
                                "Gate paused"
                            );
                            self.events.publish(EngineEvent::GatePaused {
                                run_id: run.id.clone(),
                                step_key: key.to_string(),
                                approval_type: config.approval_type,
                                pending: snapshot.pending_record_count,
                            });
                            let expires_at = checkpoint.engine.gate_timeouts.get(key).map(|t| t.expires_at);
                            let notice = self.notifier.notice(&run.id, &def.code, key, snapshot, expires_at);
                            self.notifier.notify(notice, config);
                        } else {
                            debug!(run_id = %run.id, step_key = key, "Gate still awaiting approval");
                        }
                    }
                }
                self.persist(run, &checkpoint).await?;
                continue;
            }

            self.events.publish(EngineEvent::StepStarted {
                run_id: run.id.clone(),
                step_key: key.to_string(),
                input: input.len(),
            });
            let ctx = self.context(run, step, checkpoint.adapter_state(key).cloned());
            let fallback = step.continue_on_error.then(|| input.clone());

            match self
                .executor
                .execute(&ctx, step, &def.hooks, &hook_ctx.for_step(key), input)
                .await
            {
                Ok(outcome) => {
                    stats.absorb(outcome.ok, outcome.fail);
                    if let Some(state) = outcome.state {
                        checkpoint.set_adapter_state(key, state)?;
                    }
                    self.runs.append_dead_letters(&outcome.dead_letters).await?;
                    self.events.publish(EngineEvent::StepCompleted {
                        run_id: run.id.clone(),
                        step_key: key.to_string(),
                        ok: outcome.ok,
                        fail: outcome.fail,
                    });
                    info!(run_id = %run.id, step_key = key, ok = outcome.ok, fail = outcome.fail, "Step completed");

                    if step.strict && outcome.fail > 0 {
                        end = Some(RunEnd::Failed(RunFailure {
                            step_key: Some(key.to_string()),
                            message: format!("{} record(s) failed in strict step", outcome.fail),
                        }));
                    } else {
                        checkpoint.engine.step_outputs.insert(
                            key.to_string(),
                            StepOutput {
                                ok: outcome.ok,
                                fail: outcome.fail,
                                records: outcome.records.clone(),
                                completed_at: Utc::now(),
                            },
                        );
                        outputs.insert(key, outcome.records);
                    }
                }
                Err(e) => match fallback {
                    Some(input) => {
                        warn!(run_id = %run.id, step_key = key, error = %e, "Step failed, continuing with empty batch");
                        let now = Utc::now();
                        let message = e.to_string();
                        let letters: Vec<DeadLetter> = input
                            .into_iter()
                            .map(|record| DeadLetter {
                                run_id: run.id.clone(),
                                step_key: key.to_string(),
                                message: message.clone(),
                                record,
                                stack: None,
                                created_at: now,
                            })
                            .collect();
                        stats.absorb(0, letters.len());
                        self.runs.append_dead_letters(&letters).await?;
                        self.events.publish(EngineEvent::StepCompleted {
                            run_id: run.id.clone(),
                            step_key: key.to_string(),
                            ok: 0,
                            fail: letters.len(),
                        });
                        checkpoint.engine.step_outputs.insert(
                            key.to_string(),
                            StepOutput {
                                ok: 0,
                                fail: letters.len(),
                                records: vec![],
                                completed_at: now,
                            },
                        );
                        outputs.insert(key, vec![]);
                    }
                    None => {
                        end = Some(RunEnd::Failed(RunFailure {
                            step_key: Some(key.to_string()),
                            message: e.to_string(),
                        }));
                    }
                },
            }

            checkpoint.engine.stats = Some(stats);
            run.stats = stats;
            run.updated_at = Utc::now();
            self.persist(run, &checkpoint).await?;
            if end.is_some() {
                break;
            }
        }

        let end = end.unwrap_or_else(|| {
            if checkpoint.engine.awaiting_gates().next().is_some() {
                RunEnd::Paused
            } else {
                RunEnd::Completed
            }
        });
        let leaves = leaf_output(&def, &mut outputs);
        self.finish(run, &def, claim, end, leaves, &hook_ctx).await
    }

    async fn finish(
        &self,
        run: &mut RunRecord,
        def: &PipelineDefinition,
        claim: ActiveRun,
        end: RunEnd,
        leaves: Vec<Record>,
        hook_ctx: &HookContext,
    ) -> Result<RunStatus> {
        let run_id = run.id.clone();
        let (status, event, terminal_stage) = match end {
            RunEnd::Completed => (
                RunStatus::Completed,
                EngineEvent::RunCompleted {
                    run_id,
                    success_count: run.stats.success_count,
                    error_count: run.stats.error_count,
                },
                Some(HookStage::PipelineCompleted),
            ),
            RunEnd::Paused => (RunStatus::Paused, EngineEvent::RunPaused { run_id }, None),
            RunEnd::Failed(failure) => {
                error!(
                    run_id = %run.id,
                    step_key = failure.step_key.as_deref().unwrap_or("-"),
                    error = %failure.message,
                    "Run failed"
                );
                let event = EngineEvent::RunFailed {
                    run_id,
                    step_key: failure.step_key.clone(),
                    error: failure.message.clone(),
                };
                run.error = Some(failure);
                (RunStatus::Failed, event, Some(HookStage::PipelineFailed))
            }
            RunEnd::Cancelled => (
                RunStatus::Cancelled,
                EngineEvent::RunCancelled { run_id },
                Some(HookStage::PipelineFailed),
            ),
            RunEnd::TimedOut(limit_secs) => {
                run.error = Some(RunFailure {
                    step_key: None,
                    message: format!("run exceeded its {limit_secs}s time limit"),
                });
                (
                    RunStatus::Timeout,
                    EngineEvent::RunTimedOut { run_id, limit_secs },
                    Some(HookStage::PipelineFailed),
                )
            }
        };

        run.transition(status);
        self.runs.save_run(run).await?;
        // Settled runs may be resumed or approved as soon as the event is out
        drop(claim);
        info!(
            run_id = %run.id,
            status = %status,
            success_count = run.stats.success_count,
            error_count = run.stats.error_count,
            "Run settled"
        );
        self.events.publish(event);

        if let Some(stage) = terminal_stage {
            self.hooks.observe(stage, leaves, &def.hooks, hook_ctx).await;
        }
        Ok(status)
    }
}

/// Output of steps without successors, in declaration order.
fn leaf_output(def: &PipelineDefinition, outputs: &mut HashMap<&str, Vec<Record>>) -> Vec<Record> {
    def.steps
        .iter()
        .filter(|s| def.successors(&s.key).is_empty())
        .filter_map(|s| outputs.remove(s.key.as_str()))
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use futures::FutureExt;
    use serde_json::json;
    use sluice_adapters::{AdapterRegistry, HandlerOutcome};
    use sluice_core::hooks::{HookAction, PipelineHooks};
    use sluice_core::pipeline::GateConfig;
    use sluice_store::MemoryStore;
    use sluice_test_utils::{numbered, record, FailingAdapter, RecordingAdapter, RejectingAdapter};

    fn engine(registry: AdapterRegistry) -> Arc<Engine> {
        Engine::builder(Arc::new(MemoryStore::new()))
            .registry(registry)
            .build()
    }

    fn step(key: &str, kind: StepKind, adapter: &str) -> StepDefinition {
        StepDefinition::new(key, kind, adapter)
    }

    #[tokio::test]
    async fn fan_out_clones_and_fan_in_concatenates_in_edge_order() {
        let left = RecordingAdapter::new(StepKind::Transform, "left");
        let right = RecordingAdapter::new(StepKind::Transform, "right");
        let join = RecordingAdapter::new(StepKind::Load, "join");
        let mut registry = AdapterRegistry::new();
        registry.register(left.clone());
        registry.register(right.clone());
        registry.register(join.clone());
        registry.register_handler(StepKind::Enrich, "mark", "marks records", |_, input| {
            async move {
                let records = input
                    .into_iter()
                    .map(|mut r| {
                        r.insert("right".into(), json!(true));
                        r
                    })
                    .collect();
                Ok(HandlerOutcome {
                    records: Some(records),
                    failed: vec![],
                })
            }
            .boxed()
        });

        let def = PipelineDefinition::new("fan")
            .with_step(step("a", StepKind::Transform, "left"))
            .with_step(step("b", StepKind::Transform, "right"))
            .with_step(step("b2", StepKind::Enrich, "mark"))
            .with_step(step("c", StepKind::Load, "join"))
            .with_edge("a", "b")
            .with_edge("b", "b2")
            .with_edge("b2", "c")
            .with_edge("a", "c");
        let engine = engine(registry);
        engine.register_pipeline(def).unwrap();

        let run = engine.start_run("fan", numbered(2)).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(left.calls(), 1);
        assert_eq!(right.calls(), 1);
        let batches = join.batches();
        assert_eq!(batches.len(), 1);
        // b2 is declared first among c's incoming edges
        assert_eq!(
            batches[0],
            vec![
                record(json!({"id": 0, "right": true})),
                record(json!({"id": 1, "right": true})),
                record(json!({"id": 0})),
                record(json!({"id": 1})),
            ]
        );
    }

    #[tokio::test]
    async fn strict_step_with_failures_fails_the_run() {
        let mut registry = AdapterRegistry::new();
        registry.register(RejectingAdapter::new(StepKind::Validate, "need_name", "name"));
        let sink = RecordingAdapter::new(StepKind::Load, "sink");
        registry.register(sink.clone());
        let def = PipelineDefinition::new("strict")
            .with_step(step("check", StepKind::Validate, "need_name").strict())
            .with_step(step("store", StepKind::Load, "sink"))
            .with_edge("check", "store");
        let engine = engine(registry);
        engine.register_pipeline(def).unwrap();

        let run = engine
            .start_run("strict", vec![record(json!({"name": "a"})), record(json!({"id": 2}))])
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.unwrap().step_key.as_deref(), Some("check"));
        assert_eq!(sink.calls(), 0);
        assert_eq!(engine.dead_letters(&run.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lenient_step_forwards_ok_records() {
        let mut registry = AdapterRegistry::new();
        registry.register(RejectingAdapter::new(StepKind::Validate, "need_name", "name"));
        let sink = RecordingAdapter::new(StepKind::Load, "sink");
        registry.register(sink.clone());
        let def = PipelineDefinition::new("lenient")
            .with_step(step("check", StepKind::Validate, "need_name"))
            .with_step(step("store", StepKind::Load, "sink"))
            .with_edge("check", "store");
        let engine = engine(registry);
        engine.register_pipeline(def).unwrap();

        let run = engine
            .start_run("lenient", vec![record(json!({"name": "a"})), record(json!({"id": 2}))])
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(sink.batches(), vec![vec![record(json!({"name": "a"}))]]);
        assert_eq!(run.stats.error_count, 1);
        assert_eq!(run.stats.success_count, 2);
    }

    #[tokio::test]
    async fn continue_on_error_yields_empty_batch_and_dead_letters() {
        let mut registry = AdapterRegistry::new();
        registry.register(FailingAdapter::always(StepKind::Enrich, "down"));
        let sink = RecordingAdapter::new(StepKind::Load, "sink");
        registry.register(sink.clone());
        let def = PipelineDefinition::new("soft")
            .with_step(step("lookup", StepKind::Enrich, "down").continue_on_error())
            .with_step(step("store", StepKind::Load, "sink"))
            .with_edge("lookup", "store");
        let engine = engine(registry);
        engine.register_pipeline(def).unwrap();

        let run = engine.start_run("soft", numbered(3)).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(sink.batches(), vec![Vec::<Record>::new()]);
        let letters = engine.dead_letters(&run.id).await.unwrap();
        assert_eq!(letters.len(), 3);
        assert!(letters.iter().all(|l| l.step_key == "lookup"));
    }

    #[tokio::test]
    async fn step_error_fails_run_with_causing_step() {
        let mut registry = AdapterRegistry::new();
        registry.register(FailingAdapter::always(StepKind::Load, "down"));
        let def = PipelineDefinition::new("hard").with_step(step("store", StepKind::Load, "down"));
        let engine = engine(registry);
        engine.register_pipeline(def).unwrap();
        let mut rx = engine.events().subscribe();

        let run = engine.start_run("hard", numbered(1)).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        let failure = run.error.unwrap();
        assert_eq!(failure.step_key.as_deref(), Some("store"));
        assert!(failure.message.contains("simulated outage"));
        let mut saw_failed = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::RunFailed { step_key, .. } = event {
                assert_eq!(step_key.as_deref(), Some("store"));
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn paused_gate_blocks_downstream_but_not_siblings() {
        let mut registry = AdapterRegistry::new();
        let gated = RecordingAdapter::new(StepKind::Load, "gated");
        let free = RecordingAdapter::new(StepKind::Sink, "free");
        registry.register(gated.clone());
        registry.register(free.clone());
        let def = PipelineDefinition::new("branch")
            .with_step(step("pull", StepKind::Extract, "inline"))
            .with_step(StepDefinition::gate("review", GateConfig::manual()))
            .with_step(step("store", StepKind::Load, "gated"))
            .with_step(step("notify", StepKind::Sink, "free"))
            .with_edge("pull", "review")
            .with_edge("review", "store")
            .with_edge("pull", "notify");
        let engine = engine(registry);
        engine.register_pipeline(def).unwrap();

        let run = engine.start_run("branch", numbered(2)).await.unwrap();

        assert_eq!(run.status, RunStatus::Paused);
        assert_eq!(gated.calls(), 0);
        assert_eq!(free.calls(), 1);
        let cp = engine.checkpoint(&run.id).await.unwrap();
        assert_eq!(cp.engine.gates["review"].pending_records, numbered(2));
    }

    #[tokio::test]
    async fn pipeline_hooks_shape_seed_and_observe_completion() {
        let sink = RecordingAdapter::new(StepKind::Load, "sink");
        let mut registry = AdapterRegistry::new();
        registry.register(sink.clone());
        let hooks = PipelineHooks::new()
            .with(
                HookStage::PipelineStarted,
                HookAction::Script {
                    code: "set seeded = true".into(),
                    args: Value::Null,
                    fail_on_error: true,
                },
            )
            .with(HookStage::PipelineCompleted, HookAction::Emit { event: "done".into() });
        let def = PipelineDefinition::new("hooked")
            .with_step(step("store", StepKind::Load, "sink"))
            .with_hooks(hooks);
        let engine = engine(registry);
        engine.register_pipeline(def).unwrap();
        let mut rx = engine.events().subscribe();

        engine.start_run("hooked", numbered(1)).await.unwrap();

        assert_eq!(sink.batches()[0], vec![record(json!({"id": 0, "seeded": true}))]);
        let mut emitted = None;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::HookEmitted { event, records, .. } = event {
                emitted = Some((event, records));
            }
        }
        assert_eq!(emitted, Some(("done".to_string(), 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_time_limit_is_checked_between_steps() {
        let mut registry = AdapterRegistry::new();
        registry.register_handler(StepKind::Transform, "slow", "sleeps", |_, _| {
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(HandlerOutcome::default())
            }
            .boxed()
        });
        let after = RecordingAdapter::new(StepKind::Load, "after");
        registry.register(after.clone());
        let def = PipelineDefinition::new("slow")
            .with_step(step("wait", StepKind::Transform, "slow"))
            .with_step(step("store", StepKind::Load, "after"))
            .with_edge("wait", "store")
            .with_timeout_secs(2);
        let engine = engine(registry);
        engine.register_pipeline(def).unwrap();

        let run = engine.start_run("slow", numbered(1)).await.unwrap();

        assert_eq!(run.status, RunStatus::Timeout);
        assert_eq!(after.calls(), 0);
    }
}
