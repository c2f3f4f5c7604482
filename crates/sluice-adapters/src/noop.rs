use futures::future::BoxFuture;
use tracing::warn;

use sluice_core::context::AdapterContext;
use sluice_core::error::Result;
use sluice_core::pipeline::StepDefinition;
use sluice_core::traits::{RecordErrorSink, StepAdapter};
use sluice_core::types::{Record, StepKind, StepResult};

/// Stand-in for an adapter code nobody registered: every record passes.
pub struct NoopAdapter {
    kind: StepKind,
    code: String,
}

impl NoopAdapter {
    pub fn new(kind: StepKind, code: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
        }
    }
}

impl StepAdapter for NoopAdapter {
    fn kind(&self) -> StepKind {
        self.kind
    }

    fn code(&self) -> &str {
        &self.code
    }

    fn description(&self) -> &str {
        "Passes records through unchanged"
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a AdapterContext,
        _step: &'a StepDefinition,
        input: Vec<Record>,
        _errors: &'a dyn RecordErrorSink,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            warn!(
                step_key = %ctx.step_key,
                kind = %self.kind,
                adapter = %self.code,
                "No adapter registered, passing records through"
            );
            Ok(StepResult::passthrough(input.len()))
        })
    }
}
