use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use sluice_core::context::AdapterContext;
use sluice_core::error::Result;
use sluice_core::expr::Condition;
use sluice_core::pipeline::StepDefinition;
use sluice_core::traits::{RecordErrorSink, StepAdapter};
use sluice_core::types::{Record, StepKind, StepResult};

/// Keeps the records matching `where`; the rest leave the batch quietly.
pub struct FilterRoute;

#[derive(Deserialize)]
struct FilterConfig {
    #[serde(rename = "where")]
    condition: String,
}

impl StepAdapter for FilterRoute {
    fn kind(&self) -> StepKind {
        StepKind::Route
    }

    fn code(&self) -> &str {
        "filter"
    }

    fn description(&self) -> &str {
        "Route only the records matching a condition."
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "where": { "type": "string", "description": "e.g. status == \"active\"" }
            },
            "required": ["where"]
        })
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a AdapterContext,
        step: &'a StepDefinition,
        input: Vec<Record>,
        _errors: &'a dyn RecordErrorSink,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            let config: FilterConfig = step.config_as()?;
            let condition = Condition::parse(&config.condition)?;
            let before = input.len();
            let kept: Vec<Record> = input.into_iter().filter(|r| condition.matches(r)).collect();
            debug!(step_key = %ctx.step_key, before, kept = kept.len(), "Filtered batch");
            Ok(StepResult::with_records(kept, 0))
        })
    }
}
