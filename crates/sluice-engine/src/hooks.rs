//! Hook pipeline: runs the configured actions of a stage over a batch.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use sluice_core::error::{Result, SluiceError};
use sluice_core::event::{EngineEvent, EventBus};
use sluice_core::hooks::{HookAction, HookStage, LogLevel, PipelineHooks};
use sluice_core::types::{Record, RunId};

use crate::notify::check_webhook_target;
use crate::script::Script;

/// Where a hook stage is running.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub run_id: RunId,
    pub pipeline: String,
    pub step_key: Option<String>,
}

impl HookContext {
    pub fn new(run_id: &RunId, pipeline: &str) -> Self {
        Self {
            run_id: run_id.clone(),
            pipeline: pipeline.to_string(),
            step_key: None,
        }
    }

    pub fn for_step(&self, step_key: &str) -> Self {
        Self {
            step_key: Some(step_key.to_string()),
            ..self.clone()
        }
    }
}

/// In-process batch rewriter referenced by name from `interceptor` actions.
pub trait RecordInterceptor: Send + Sync + 'static {
    fn intercept<'a>(
        &'a self,
        records: Vec<Record>,
        ctx: &'a HookContext,
        args: &'a Value,
    ) -> BoxFuture<'a, Result<Vec<Record>>>;
}

struct FnInterceptor<F>(F);

impl<F> RecordInterceptor for FnInterceptor<F>
where
    F: Fn(Vec<Record>, &HookContext, &Value) -> Result<Vec<Record>> + Send + Sync + 'static,
{
    fn intercept<'a>(
        &'a self,
        records: Vec<Record>,
        ctx: &'a HookContext,
        args: &'a Value,
    ) -> BoxFuture<'a, Result<Vec<Record>>> {
        Box::pin(async move { (self.0)(records, ctx, args) })
    }
}

/// Named interceptors available to hook actions.
#[derive(Default)]
pub struct InterceptorRegistry {
    interceptors: HashMap<String, Arc<dyn RecordInterceptor>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, interceptor: impl RecordInterceptor) {
        self.interceptors.insert(name.into(), Arc::new(interceptor));
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Record>, &HookContext, &Value) -> Result<Vec<Record>> + Send + Sync + 'static,
    {
        self.register(name, FnInterceptor(f));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RecordInterceptor>> {
        self.interceptors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.interceptors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Starts another pipeline; implemented by the engine.
pub trait PipelineLauncher: Send + Sync + 'static {
    fn launch(&self, pipeline: &str, seed: Vec<Record>) -> BoxFuture<'_, Result<RunId>>;
}

/// Runs hook actions for a stage, in declaration order.
pub struct HookRunner {
    interceptors: InterceptorRegistry,
    events: Arc<EventBus>,
    allow_private_webhooks: bool,
    launcher: Option<Weak<dyn PipelineLauncher>>,
}

impl HookRunner {
    pub fn new(interceptors: InterceptorRegistry, events: Arc<EventBus>) -> Self {
        Self {
            interceptors,
            events,
            allow_private_webhooks: false,
            launcher: None,
        }
    }

    pub fn allow_private_webhooks(mut self, allow: bool) -> Self {
        self.allow_private_webhooks = allow;
        self
    }

    pub fn with_launcher(mut self, launcher: Weak<dyn PipelineLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Pull `records` through every action at `stage`. Interceptors and
    /// scripts may replace the batch; the other actions only observe it.
    pub async fn run(
        &self,
        stage: HookStage,
        mut records: Vec<Record>,
        hooks: &PipelineHooks,
        ctx: &HookContext,
    ) -> Result<Vec<Record>> {
        for action in hooks.actions(stage) {
            debug!(
                run_id = %ctx.run_id,
                stage = %stage,
                action = action.type_name(),
                records = records.len(),
                "Running hook action"
            );
            records = match action {
                HookAction::Interceptor { name, args } => {
                    let interceptor = self.interceptors.get(name).ok_or_else(|| SluiceError::Hook {
                        stage: stage.to_string(),
                        message: format!("unknown interceptor '{name}'"),
                    })?;
                    interceptor
                        .intercept(records, ctx, args)
                        .await
                        .map_err(|e| SluiceError::Hook {
                            stage: stage.to_string(),
                            message: format!("interceptor '{name}': {e}"),
                        })?
                }
                HookAction::Script {
                    code,
                    args,
                    fail_on_error,
                } => {
                    let result = Script::parse(code).and_then(|s| s.run(records.clone(), args));
                    match result {
                        Ok(out) => out,
                        Err(e) if *fail_on_error => {
                            return Err(SluiceError::Hook {
                                stage: stage.to_string(),
                                message: e.to_string(),
                            });
                        }
                        Err(e) => {
                            warn!(
                                run_id = %ctx.run_id,
                                stage = %stage,
                                error = %e,
                                "Script failed, batch left unchanged"
                            );
                            records
                        }
                    }
                }
                HookAction::Webhook { url } => {
                    self.post_webhook(url, stage, &records, ctx);
                    records
                }
                HookAction::Log { level, message } => {
                    log_batch(*level, message.as_deref(), stage, &records, ctx);
                    records
                }
                HookAction::Emit { event } => {
                    self.events.publish(EngineEvent::HookEmitted {
                        run_id: ctx.run_id.clone(),
                        event: event.clone(),
                        records: records.len(),
                    });
                    records
                }
                HookAction::TriggerPipeline { pipeline } => {
                    self.trigger(pipeline, &records, ctx);
                    records
                }
            };
        }
        Ok(records)
    }

    /// Like [`run`](Self::run) for stages that only observe: failures are
    /// logged and the batch is discarded.
    pub async fn observe(
        &self,
        stage: HookStage,
        records: Vec<Record>,
        hooks: &PipelineHooks,
        ctx: &HookContext,
    ) {
        if hooks.actions(stage).is_empty() {
            return;
        }
        if let Err(e) = self.run(stage, records, hooks, ctx).await {
            warn!(run_id = %ctx.run_id, stage = %stage, error = %e, "Hook failed");
        }
    }

    fn post_webhook(&self, url: &str, stage: HookStage, records: &[Record], ctx: &HookContext) {
        let body = json!({
            "stage": stage,
            "runId": ctx.run_id,
            "pipeline": ctx.pipeline,
            "stepKey": ctx.step_key,
            "recordCount": records.len(),
            "records": records,
        });
        let url = url.to_string();
        let allow_private = self.allow_private_webhooks;
        let run_id = ctx.run_id.clone();
        tokio::spawn(async move {
            let result = match check_webhook_target(&url, allow_private).await {
                Ok(target) => match target.client(reqwest::Client::builder()) {
                    Ok(pinned) => pinned
                        .post(target.url)
                        .json(&body)
                        .send()
                        .await
                        .and_then(|r| r.error_for_status())
                        .map(|_| ())
                        .map_err(|e| SluiceError::Http(e.to_string())),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(run_id = %run_id, url = %url, error = %e, "Hook webhook failed");
            }
        });
    }

    fn trigger(&self, pipeline: &str, records: &[Record], ctx: &HookContext) {
        let Some(launcher) = self.launcher.as_ref().and_then(Weak::upgrade) else {
            warn!(run_id = %ctx.run_id, pipeline, "No launcher available, trigger skipped");
            return;
        };
        let pipeline = pipeline.to_string();
        let seed = records.to_vec();
        let parent = ctx.run_id.clone();
        tokio::spawn(async move {
            match launcher.launch(&pipeline, seed).await {
                Ok(run_id) => info!(parent = %parent, run_id = %run_id, pipeline = %pipeline, "Triggered pipeline"),
                Err(e) => error!(parent = %parent, pipeline = %pipeline, error = %e, "Triggered pipeline failed"),
            }
        });
    }
}

fn log_batch(
    level: LogLevel,
    message: Option<&str>,
    stage: HookStage,
    records: &[Record],
    ctx: &HookContext,
) {
    let message = message.unwrap_or("Hook checkpoint");
    let step = ctx.step_key.as_deref().unwrap_or("-");
    let count = records.len();
    match level {
        LogLevel::Debug => debug!(run_id = %ctx.run_id, stage = %stage, step_key = step, records = count, "{message}"),
        LogLevel::Info => info!(run_id = %ctx.run_id, stage = %stage, step_key = step, records = count, "{message}"),
        LogLevel::Warn => warn!(run_id = %ctx.run_id, stage = %stage, step_key = step, records = count, "{message}"),
        LogLevel::Error => error!(run_id = %ctx.run_id, stage = %stage, step_key = step, records = count, "{message}"),
    }
}
