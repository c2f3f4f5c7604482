use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use chrono::Utc;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use sluice_adapters::AdapterRegistry;
use sluice_core::checkpoint::{Checkpoint, GateApproval};
use sluice_core::circuit::CircuitBreakers;
use sluice_core::config::AppConfig;
use sluice_core::error::{Result, SluiceError};
use sluice_core::event::{EngineEvent, EventBus};
use sluice_core::pipeline::PipelineDefinition;
use sluice_core::traits::{AdapterDefinition, CheckpointStore, Mailer, RunStore};
use sluice_core::types::{DeadLetter, Record, RunId, RunRecord, RunStatus, StepKind};

use crate::executor::StepExecutor;
use crate::hooks::{HookRunner, InterceptorRegistry, PipelineLauncher};
use crate::notify::GateNotifier;
use crate::scheduler::{DagScheduler, RunSettings};

type ActiveRuns = Arc<Mutex<HashMap<RunId, CancellationToken>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Exclusive right to drive a run. Dropping it releases the run.
pub(crate) struct ActiveRun {
    runs: ActiveRuns,
    id: RunId,
    token: CancellationToken,
}

impl ActiveRun {
    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        lock(&self.runs).remove(&self.id);
    }
}

/// Result of approving a gate.
#[derive(Debug)]
pub enum ApprovalOutcome {
    /// The marker was written and the run driven to its next stop.
    Resumed(RunRecord),
    /// The gate was approved before; nothing changed.
    AlreadyApproved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The run is executing; it stops before its next step.
    Requested,
    /// The run was idle and is now CANCELLED.
    Cancelled,
}

fn invalid_state(run: &RunRecord, action: &str) -> SluiceError {
    SluiceError::InvalidRunState {
        run_id: run.id.to_string(),
        status: run.status.to_string(),
        action: action.to_string(),
    }
}

/// Pipeline engine: pipeline registry, run lifecycle and gate approvals.
pub struct Engine {
    pipelines: RwLock<BTreeMap<String, PipelineDefinition>>,
    scheduler: DagScheduler,
    runs: Arc<dyn RunStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<EventBus>,
    active: ActiveRuns,
}

pub struct EngineBuilder {
    runs: Arc<dyn RunStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: AppConfig,
    registry: Option<AdapterRegistry>,
    interceptors: InterceptorRegistry,
    mailer: Option<Arc<dyn Mailer>>,
    events: Option<Arc<EventBus>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to the built-in adapters.
    pub fn registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn interceptors(mut self, interceptors: InterceptorRegistry) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let EngineBuilder {
            runs,
            checkpoints,
            config,
            registry,
            interceptors,
            mailer,
            events,
        } = self;

        let events = events.unwrap_or_else(|| Arc::new(EventBus::default()));
        let registry = Arc::new(registry.unwrap_or_else(AdapterRegistry::with_builtins));
        let mut notifier = GateNotifier::new(&config.gate);
        if let Some(mailer) = mailer {
            notifier = notifier.with_mailer(mailer);
        }
        let breakers = Arc::new(CircuitBreakers::new(config.circuit.breaker()));
        let settings = RunSettings::from_config(&config);

        Arc::new_cyclic(move |weak: &Weak<Engine>| {
            let launcher: Weak<dyn PipelineLauncher> = weak.clone();
            let hooks = Arc::new(
                HookRunner::new(interceptors, events.clone())
                    .allow_private_webhooks(config.gate.allow_private_webhooks)
                    .with_launcher(launcher),
            );
            let scheduler = DagScheduler {
                executor: StepExecutor::new(registry, hooks.clone(), events.clone()),
                hooks,
                notifier,
                checkpoints: checkpoints.clone(),
                runs: runs.clone(),
                events: events.clone(),
                breakers,
                settings,
            };
            Engine {
                pipelines: RwLock::default(),
                scheduler,
                runs,
                checkpoints,
                events,
                active: ActiveRuns::default(),
            }
        })
    }
}

impl Engine {
    pub fn builder<S>(store: Arc<S>) -> EngineBuilder
    where
        S: CheckpointStore + RunStore,
    {
        EngineBuilder {
            runs: store.clone(),
            checkpoints: store,
            config: AppConfig::default(),
            registry: None,
            interceptors: InterceptorRegistry::new(),
            mailer: None,
            events: None,
        }
    }

    /// Validate and register a pipeline, replacing one with the same code.
    pub fn register_pipeline(&self, def: PipelineDefinition) -> Result<()> {
        def.validate()?;
        info!(pipeline = %def.code, steps = def.steps.len(), "Pipeline registered");
        self.pipelines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(def.code.clone(), def);
        Ok(())
    }

    /// Load a pipeline file and register it. Returns its code.
    pub fn load_pipeline(&self, path: &Path) -> Result<String> {
        let def = PipelineDefinition::load(path)?;
        let code = def.code.clone();
        self.register_pipeline(def)?;
        Ok(code)
    }

    pub fn pipeline(&self, code: &str) -> Result<PipelineDefinition> {
        self.pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(code)
            .cloned()
            .ok_or_else(|| SluiceError::PipelineNotFound(code.to_string()))
    }

    pub fn pipelines(&self) -> Vec<PipelineDefinition> {
        self.pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn adapters(&self) -> Vec<AdapterDefinition> {
        self.scheduler.executor.registry().definitions()
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        lock(&self.active).contains_key(run_id)
    }

    /// Claim a run, or hand back the token of whoever holds it.
    fn try_claim(&self, run_id: &RunId) -> std::result::Result<ActiveRun, CancellationToken> {
        let mut active = lock(&self.active);
        if let Some(token) = active.get(run_id) {
            return Err(token.clone());
        }
        let token = CancellationToken::new();
        active.insert(run_id.clone(), token.clone());
        Ok(ActiveRun {
            runs: self.active.clone(),
            id: run_id.clone(),
            token,
        })
    }

    fn claim(&self, run_id: &RunId, action: &str) -> Result<ActiveRun> {
        self.try_claim(run_id)
            .map_err(|_| SluiceError::InvalidRunState {
                run_id: run_id.to_string(),
                status: RunStatus::Running.to_string(),
                action: action.to_string(),
            })
    }

    async fn create_run(&self, def: PipelineDefinition, seed: Vec<Record>) -> Result<(RunRecord, ActiveRun)> {
        def.validate()?;
        let run = RunRecord::new(def, seed);
        let claim = self.claim(&run.id, "started")?;
        self.runs.save_run(&run).await?;
        Ok((run, claim))
    }

    async fn drive(&self, mut run: RunRecord, claim: ActiveRun) -> Result<RunRecord> {
        self.scheduler.drive(&mut run, claim).await?;
        Ok(run)
    }

    /// Start a registered pipeline and drive it to its first stop.
    pub async fn start_run(&self, code: &str, seed: Vec<Record>) -> Result<RunRecord> {
        let def = self.pipeline(code)?;
        self.run_definition(def, seed).await
    }

    /// Run an unregistered definition.
    pub async fn run_definition(&self, def: PipelineDefinition, seed: Vec<Record>) -> Result<RunRecord> {
        let (run, claim) = self.create_run(def, seed).await?;
        self.drive(run, claim).await
    }

    /// Start a registered pipeline in the background. The run is persisted
    /// as PENDING before this returns.
    pub async fn spawn_run(self: &Arc<Self>, code: &str, seed: Vec<Record>) -> Result<RunId> {
        let def = self.pipeline(code)?;
        let (run, claim) = self.create_run(def, seed).await?;
        let run_id = run.id.clone();
        self.spawn_drive(run, claim);
        Ok(run_id)
    }

    fn spawn_drive(self: &Arc<Self>, run: RunRecord, claim: ActiveRun) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let run_id = run.id.clone();
            match engine.drive(run, claim).await {
                Ok(run) => debug!(run_id = %run_id, status = %run.status, "Background drive settled"),
                Err(e) => error!(run_id = %run_id, error = %e, "Run aborted"),
            }
        });
    }

    /// Drive a stopped run again. PAUSED runs continue past approved gates;
    /// RUNNING runs nobody is driving (after a crash) pick up from their
    /// last checkpoint.
    pub async fn resume(&self, run_id: &RunId) -> Result<RunRecord> {
        let claim = self.claim(run_id, "resumed")?;
        let run = self.run(run_id).await?;
        if run.status.is_terminal() {
            return Err(invalid_state(&run, "resumed"));
        }
        self.drive(run, claim).await
    }

    /// Approve a paused gate and resume its run.
    pub async fn approve_gate(&self, run_id: &RunId, step_key: &str) -> Result<ApprovalOutcome> {
        let run = self.run(run_id).await?;
        let step = run
            .definition
            .step(step_key)
            .ok_or_else(|| SluiceError::StepNotFound(step_key.to_string()))?;
        let gate_missing = || SluiceError::GateNotFound {
            run_id: run_id.to_string(),
            step: step_key.to_string(),
        };
        if step.kind != StepKind::Gate {
            return Err(gate_missing());
        }

        let approved = |cp: &Checkpoint| {
            cp.engine.gate_approvals.contains_key(step_key) || cp.engine.step_outputs.contains_key(step_key)
        };
        if approved(&self.checkpoint(run_id).await?) {
            return Ok(ApprovalOutcome::AlreadyApproved);
        }
        if run.status.is_terminal() {
            return Err(invalid_state(&run, "approved"));
        }

        let claim = self.claim(run_id, "approved")?;
        let mut checkpoint = self.checkpoint(run_id).await?;
        if approved(&checkpoint) {
            return Ok(ApprovalOutcome::AlreadyApproved);
        }
        if !checkpoint.engine.gates.contains_key(step_key) {
            return Err(gate_missing());
        }
        checkpoint
            .engine
            .gate_approvals
            .insert(step_key.to_string(), GateApproval { approved_at: Utc::now() });
        self.checkpoints.save(run_id, &checkpoint.to_map()?).await?;
        info!(run_id = %run_id, step_key, "Gate approved");
        self.events.publish(EngineEvent::GateApproved {
            run_id: run_id.clone(),
            step_key: step_key.to_string(),
        });

        let run = self.run(run_id).await?;
        Ok(ApprovalOutcome::Resumed(self.drive(run, claim).await?))
    }

    /// Write approval markers for those of `step_keys` still awaiting
    /// approval and resume the run in the background. Returns the released
    /// keys once their markers are saved.
    pub async fn release_gates(self: &Arc<Self>, run_id: &RunId, step_keys: &[String]) -> Result<Vec<String>> {
        let claim = self.claim(run_id, "released")?;
        let run = self.run(run_id).await?;
        if run.status.is_terminal() {
            return Err(invalid_state(&run, "released"));
        }
        let mut checkpoint = self.checkpoint(run_id).await?;
        let released: Vec<String> = step_keys
            .iter()
            .filter(|k| checkpoint.engine.awaiting_gates().any(|g| g == k.as_str()))
            .cloned()
            .collect();
        if released.is_empty() {
            return Ok(released);
        }
        let now = Utc::now();
        for key in &released {
            checkpoint
                .engine
                .gate_approvals
                .insert(key.clone(), GateApproval { approved_at: now });
        }
        self.checkpoints.save(run_id, &checkpoint.to_map()?).await?;
        self.spawn_drive(run, claim);
        Ok(released)
    }

    /// Cancel a run. An executing run stops before its next step; an idle
    /// one is marked CANCELLED at once.
    pub async fn cancel(&self, run_id: &RunId) -> Result<CancelOutcome> {
        let claim = match self.try_claim(run_id) {
            Ok(claim) => claim,
            Err(token) => {
                token.cancel();
                info!(run_id = %run_id, "Cancellation requested");
                return Ok(CancelOutcome::Requested);
            }
        };
        let mut run = self.run(run_id).await?;
        if run.status.is_terminal() {
            return Err(invalid_state(&run, "cancelled"));
        }
        run.transition(RunStatus::Cancelled);
        self.runs.save_run(&run).await?;
        drop(claim);
        info!(run_id = %run_id, "Run cancelled");
        self.events.publish(EngineEvent::RunCancelled { run_id: run_id.clone() });
        Ok(CancelOutcome::Cancelled)
    }

    pub async fn run(&self, run_id: &RunId) -> Result<RunRecord> {
        self.runs
            .load_run(run_id)
            .await?
            .ok_or_else(|| SluiceError::RunNotFound(run_id.to_string()))
    }

    pub async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<RunRecord>> {
        self.runs.list_runs(status).await
    }

    pub async fn dead_letters(&self, run_id: &RunId) -> Result<Vec<DeadLetter>> {
        self.runs.dead_letters(run_id).await
    }

    pub async fn checkpoint(&self, run_id: &RunId) -> Result<Checkpoint> {
        Checkpoint::from_map(&self.checkpoints.load(run_id).await?)
    }
}

impl PipelineLauncher for Engine {
    fn launch(&self, pipeline: &str, seed: Vec<Record>) -> BoxFuture<'_, Result<RunId>> {
        let pipeline = pipeline.to_string();
        Box::pin(async move { Ok(self.start_run(&pipeline, seed).await?.id) })
    }
}
