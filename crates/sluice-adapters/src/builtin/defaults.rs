use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use sluice_core::context::AdapterContext;
use sluice_core::error::Result;
use sluice_core::pipeline::StepDefinition;
use sluice_core::traits::{RecordErrorSink, StepAdapter};
use sluice_core::types::{Record, StepKind, StepResult};

/// Fills missing fields from a map of default values.
pub struct DefaultsEnrich;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DefaultsConfig {
    #[serde(default)]
    values: Record,
    /// Also replace fields that are present but null.
    #[serde(default = "default_fill_nulls")]
    fill_nulls: bool,
}

fn default_fill_nulls() -> bool {
    true
}

impl StepAdapter for DefaultsEnrich {
    fn kind(&self) -> StepKind {
        StepKind::Enrich
    }

    fn code(&self) -> &str {
        "defaults"
    }

    fn description(&self) -> &str {
        "Fill missing fields with configured default values."
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "values": { "type": "object" },
                "fillNulls": { "type": "boolean" }
            }
        })
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a AdapterContext,
        step: &'a StepDefinition,
        input: Vec<Record>,
        _errors: &'a dyn RecordErrorSink,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            let config: DefaultsConfig = step.config_as()?;
            let out = input
                .into_iter()
                .map(|mut record| {
                    for (field, value) in &config.values {
                        let missing = match record.get(field) {
                            None => true,
                            Some(Value::Null) => config.fill_nulls,
                            Some(_) => false,
                        };
                        if missing {
                            record.insert(field.clone(), value.clone());
                        }
                    }
                    record
                })
                .collect();
            Ok(StepResult::with_records(out, 0))
        })
    }
}
