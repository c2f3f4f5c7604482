use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use sluice_core::context::AdapterContext;
use sluice_core::error::Result;
use sluice_core::pipeline::StepDefinition;
use sluice_core::traits::{RecordErrorSink, StepAdapter};
use sluice_core::types::{Record, StepKind, StepResult};

/// Emits the input batch followed by the records listed in the config.
pub struct InlineExtract;

#[derive(Deserialize, Default)]
struct InlineConfig {
    #[serde(default)]
    records: Vec<Value>,
}

impl StepAdapter for InlineExtract {
    fn kind(&self) -> StepKind {
        StepKind::Extract
    }

    fn code(&self) -> &str {
        "inline"
    }

    fn description(&self) -> &str {
        "Emit records declared inline in the step config."
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "records": { "type": "array", "items": { "type": "object" } }
            }
        })
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a AdapterContext,
        step: &'a StepDefinition,
        input: Vec<Record>,
        errors: &'a dyn RecordErrorSink,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            let config: InlineConfig = step.config_as()?;
            let mut out = input;
            let mut fail = 0;
            for value in config.records {
                match value {
                    Value::Object(record) => out.push(record),
                    other => {
                        let mut wrapped = Record::new();
                        wrapped.insert("value".into(), other);
                        errors.on_record_error(&ctx.step_key, "inline record is not an object", &wrapped, None);
                        fail += 1;
                    }
                }
            }
            Ok(StepResult::with_records(out, fail))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::traits::ErrorCollector;
    use sluice_core::types::RunId;

    #[tokio::test]
    async fn appends_config_records_to_input() {
        let ctx = AdapterContext::new(RunId::from_string("r"), "p", "seed");
        let step = StepDefinition::new("seed", StepKind::Extract, "inline")
            .with_config(json!({"records": [{"id": 2}, 5]}));
        let input = vec![json!({"id": 1}).as_object().cloned().unwrap()];
        let sink = ErrorCollector::new();

        let result = InlineExtract.execute(&ctx, &step, input, &sink).await.unwrap();
        let records = result.records.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["id"], json!(2));
        assert_eq!(result.fail, 1);
        assert_eq!(sink.take()[0].record["value"], json!(5));
    }
}
