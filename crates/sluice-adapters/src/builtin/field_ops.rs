use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use sluice_core::context::AdapterContext;
use sluice_core::error::Result;
use sluice_core::pipeline::StepDefinition;
use sluice_core::traits::{RecordErrorSink, StepAdapter};
use sluice_core::types::{Record, StepKind, StepResult};

/// Applies an ordered list of field operations to every record.
pub struct FieldOpsTransform;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum FieldOp {
    Set { field: String, value: Value },
    Rename { from: String, to: String },
    Remove { field: String },
    Copy { from: String, to: String },
}

#[derive(Deserialize, Default)]
struct FieldOpsConfig {
    #[serde(default)]
    ops: Vec<FieldOp>,
}

fn apply(ops: &[FieldOp], mut record: Record) -> Record {
    for op in ops {
        match op {
            FieldOp::Set { field, value } => {
                record.insert(field.clone(), value.clone());
            }
            FieldOp::Rename { from, to } => {
                if record.contains_key(from) {
                    record = record
                        .into_iter()
                        .map(|(k, v)| if &k == from { (to.clone(), v) } else { (k, v) })
                        .collect();
                }
            }
            FieldOp::Remove { field } => {
                record.retain(|k, _| k != field);
            }
            FieldOp::Copy { from, to } => {
                if let Some(v) = record.get(from).cloned() {
                    record.insert(to.clone(), v);
                }
            }
        }
    }
    record
}

impl StepAdapter for FieldOpsTransform {
    fn kind(&self) -> StepKind {
        StepKind::Transform
    }

    fn code(&self) -> &str {
        "field_ops"
    }

    fn description(&self) -> &str {
        "Set, rename, remove or copy fields on each record, in order."
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ops": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "op": { "enum": ["set", "rename", "remove", "copy"] }
                        },
                        "required": ["op"]
                    }
                }
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
            let config: FieldOpsConfig = step.config_as()?;
            let out: Vec<Record> = input.into_iter().map(|r| apply(&config.ops, r)).collect();
            Ok(StepResult::with_records(out, 0))
        })
    }
}
