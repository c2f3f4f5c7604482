use std::sync::Mutex;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointMap;
use crate::context::AdapterContext;
use crate::error::Result;
use crate::pipeline::StepDefinition;
use crate::types::*;

/// Receives records that failed inside a step.
pub trait RecordErrorSink: Send + Sync {
    /// Called once per failed record.
    fn on_record_error(&self, step_key: &str, message: &str, record: &Record, stack: Option<&str>);
}

impl<F> RecordErrorSink for F
where
    F: Fn(&str, &str, &Record, Option<&str>) + Send + Sync,
{
    fn on_record_error(&self, step_key: &str, message: &str, record: &Record, stack: Option<&str>) {
        self(step_key, message, record, stack)
    }
}

/// A record-level failure captured during a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    pub step_key: String,
    pub message: String,
    pub record: Record,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Sink that keeps every reported failure.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Mutex<Vec<RecordError>>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<RecordError> {
        match self.errors.lock() {
            Ok(mut e) => std::mem::take(&mut *e),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl RecordErrorSink for ErrorCollector {
    fn on_record_error(&self, step_key: &str, message: &str, record: &Record, stack: Option<&str>) {
        let error = RecordError {
            step_key: step_key.to_string(),
            message: message.to_string(),
            record: record.clone(),
            stack: stack.map(str::to_string),
        };
        match self.errors.lock() {
            Ok(mut e) => e.push(error),
            Err(poisoned) => poisoned.into_inner().push(error),
        }
    }
}

/// Adapter metadata for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterDefinition {
    pub kind: StepKind,
    pub code: String,
    pub description: String,
    pub config_schema: serde_json::Value,
}

/// Step adapter: moves a batch of records through one external concern.
pub trait StepAdapter: Send + Sync + 'static {
    /// Step kind this adapter serves.
    fn kind(&self) -> StepKind;

    /// Adapter code referenced by step definitions.
    fn code(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the step `config` block.
    fn config_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    /// Process `input`. Failed records go to `errors`, once each.
    fn execute<'a>(
        &'a self,
        ctx: &'a AdapterContext,
        step: &'a StepDefinition,
        input: Vec<Record>,
        errors: &'a dyn RecordErrorSink,
    ) -> BoxFuture<'a, Result<StepResult>>;

    fn definition(&self) -> AdapterDefinition {
        AdapterDefinition {
            kind: self.kind(),
            code: self.code().to_string(),
            description: self.description().to_string(),
            config_schema: self.config_schema(),
        }
    }
}

/// Checkpoint store: persistence of per-run checkpoint maps.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Load the checkpoint map of a run (empty if none).
    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<CheckpointMap>>;

    /// Replace the checkpoint map of a run.
    fn save(&self, run_id: &RunId, entries: &CheckpointMap) -> BoxFuture<'_, Result<()>>;
}

/// Run store: run records and their dead letters.
pub trait RunStore: Send + Sync + 'static {
    fn save_run(&self, run: &RunRecord) -> BoxFuture<'_, Result<()>>;

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>>;

    /// Most recent first.
    fn list_runs(&self, status: Option<RunStatus>) -> BoxFuture<'_, Result<Vec<RunRecord>>>;

    fn append_dead_letters(&self, letters: &[DeadLetter]) -> BoxFuture<'_, Result<usize>>;

    fn dead_letters(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<DeadLetter>>>;
}

/// Outgoing email transport.
pub trait Mailer: Send + Sync + 'static {
    fn send(&self, to: &[String], subject: &str, body: &str) -> BoxFuture<'_, Result<()>>;
}
