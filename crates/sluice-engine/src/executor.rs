use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn, Instrument};

use sluice_adapters::AdapterRegistry;
use sluice_core::context::AdapterContext;
use sluice_core::error::Result;
use sluice_core::event::{EngineEvent, EventBus};
use sluice_core::hooks::{HookStage, PipelineHooks};
use sluice_core::pipeline::StepDefinition;
use sluice_core::traits::ErrorCollector;
use sluice_core::types::{without_failed, DeadLetter, Record};

use crate::hooks::{HookContext, HookRunner};

/// What one non-gate step produced.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub ok: usize,
    pub fail: usize,
    /// Batch forwarded to successors, after the step's after-hooks.
    pub records: Vec<Record>,
    pub dead_letters: Vec<DeadLetter>,
    /// Adapter state written during the step.
    pub state: Option<Value>,
}

/// Drives a single step through its hooks and adapter.
pub struct StepExecutor {
    registry: Arc<AdapterRegistry>,
    hooks: Arc<HookRunner>,
    events: Arc<EventBus>,
}

impl StepExecutor {
    pub fn new(registry: Arc<AdapterRegistry>, hooks: Arc<HookRunner>, events: Arc<EventBus>) -> Self {
        Self {
            registry,
            hooks,
            events,
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Before-hooks, adapter, after-hooks, then the dead-letter and retry
    /// observers. An `Err` is step-fatal.
    pub async fn execute(
        &self,
        ctx: &AdapterContext,
        step: &StepDefinition,
        hooks: &PipelineHooks,
        hook_ctx: &HookContext,
        input: Vec<Record>,
    ) -> Result<StepOutcome> {
        let span = ctx.span();

        let input = match HookStage::before(step.kind) {
            Some(stage) => self.hooks.run(stage, input, hooks, hook_ctx).await?,
            None => input,
        };

        let adapter = self.registry.resolve(step.kind, &step.adapter);
        let collector = ErrorCollector::new();
        debug!(
            run_id = %ctx.run_id,
            step_key = %step.key,
            adapter = adapter.code(),
            input = input.len(),
            "Executing step"
        );
        let result = adapter
            .execute(ctx, step, input.clone(), &collector)
            .instrument(span)
            .await;

        self.report_retries(ctx, hooks, hook_ctx).await;

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                warn!(run_id = %ctx.run_id, step_key = %step.key, error = %e, "Step failed");
                let detail = json!({ "stepKey": step.key, "error": e.to_string() });
                let records = detail.as_object().cloned().into_iter().collect();
                self.hooks
                    .observe(HookStage::OnError, records, hooks, hook_ctx)
                    .await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let dead_letters: Vec<DeadLetter> = collector
            .take()
            .into_iter()
            .map(|e| DeadLetter {
                run_id: ctx.run_id.clone(),
                step_key: e.step_key,
                message: e.message,
                record: e.record,
                stack: e.stack,
                created_at: now,
            })
            .collect();

        // Records already handed to the error sink never travel on
        let output = match result.records {
            Some(records) => records,
            None => without_failed(input, dead_letters.iter().map(|l| &l.record)),
        };
        let records = match HookStage::after(step.kind) {
            Some(stage) => self.hooks.run(stage, output, hooks, hook_ctx).await?,
            None => output,
        };
        if !dead_letters.is_empty() {
            for letter in &dead_letters {
                self.events.publish(EngineEvent::RecordFailed {
                    run_id: ctx.run_id.clone(),
                    step_key: letter.step_key.clone(),
                    message: letter.message.clone(),
                });
            }
            let failed = dead_letters.iter().map(|l| l.record.clone()).collect();
            self.hooks
                .observe(HookStage::OnDeadLetter, failed, hooks, hook_ctx)
                .await;
        }

        Ok(StepOutcome {
            ok: result.ok,
            fail: result.fail,
            records,
            dead_letters,
            state: ctx.take_checkpoint_update(),
        })
    }

    /// Publish retry notices raised during the step and feed them to the
    /// retry hooks, one record per notice.
    async fn report_retries(&self, ctx: &AdapterContext, hooks: &PipelineHooks, hook_ctx: &HookContext) {
        let notices = ctx.take_retry_notices();
        if notices.is_empty() {
            return;
        }
        let mut records = Vec::with_capacity(notices.len());
        for notice in notices {
            self.events.publish(EngineEvent::StepRetry {
                run_id: ctx.run_id.clone(),
                step_key: ctx.step_key.clone(),
                attempt: notice.attempt,
                delay_ms: notice.delay_ms,
                error: notice.error.clone(),
            });
            if let Some(record) = serde_json::to_value(&notice)
                .ok()
                .and_then(|v| v.as_object().cloned())
            {
                records.push(record);
            }
        }
        self.hooks
            .observe(HookStage::OnRetry, records, hooks, hook_ctx)
            .await;
    }
}
