use std::collections::BTreeMap;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use sluice_core::context::AdapterContext;
use sluice_core::error::{Result, SluiceError};
use sluice_core::expr::lookup;
use sluice_core::pipeline::StepDefinition;
use sluice_core::traits::{RecordErrorSink, StepAdapter};
use sluice_core::types::{Record, StepKind, StepResult};

/// Checks each record against declarative rules; failing records are
/// reported and dropped from the batch.
pub struct RulesValidate;

#[derive(Deserialize, Default)]
struct RulesConfig {
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    patterns: BTreeMap<String, String>,
    #[serde(default)]
    types: BTreeMap<String, String>,
}

fn type_matches(expected: &str, value: &Value) -> Option<bool> {
    Some(match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => return None,
    })
}

fn violations(config: &RulesConfig, patterns: &[(String, Regex)], record: &Record) -> Vec<String> {
    let mut found = vec![];
    for field in &config.required {
        if lookup(record, field).map_or(true, Value::is_null) {
            found.push(format!("{field} is required"));
        }
    }
    for (field, re) in patterns {
        if let Some(value) = lookup(record, field) {
            match value.as_str() {
                Some(s) if re.is_match(s) => {}
                _ => found.push(format!("{field} does not match {}", re.as_str())),
            }
        }
    }
    for (field, expected) in &config.types {
        if let Some(value) = lookup(record, field) {
            if type_matches(expected, value) == Some(false) {
                found.push(format!("{field} is not {expected}"));
            }
        }
    }
    found
}

impl StepAdapter for RulesValidate {
    fn kind(&self) -> StepKind {
        StepKind::Validate
    }

    fn code(&self) -> &str {
        "rules"
    }

    fn description(&self) -> &str {
        "Validate required fields, regex patterns and JSON types."
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "required": { "type": "array", "items": { "type": "string" } },
                "patterns": { "type": "object", "additionalProperties": { "type": "string" } },
                "types": {
                    "type": "object",
                    "additionalProperties": {
                        "enum": ["string", "number", "integer", "boolean", "array", "object", "null"]
                    }
                }
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
            let config: RulesConfig = step.config_as()?;
            for expected in config.types.values() {
                if type_matches(expected, &Value::Null).is_none() {
                    return Err(SluiceError::InvalidPipeline(format!(
                        "step '{}': unknown type '{expected}'",
                        step.key
                    )));
                }
            }
            let patterns = config
                .patterns
                .iter()
                .map(|(field, pattern)| {
                    Regex::new(pattern)
                        .map(|re| (field.clone(), re))
                        .map_err(|e| {
                            SluiceError::InvalidPipeline(format!(
                                "step '{}': bad pattern for {field}: {e}",
                                step.key
                            ))
                        })
                })
                .collect::<Result<Vec<_>>>()?;

            let mut valid = Vec::with_capacity(input.len());
            let mut fail = 0;
            for record in input {
                let problems = violations(&config, &patterns, &record);
                if problems.is_empty() {
                    valid.push(record);
                } else {
                    errors.on_record_error(&ctx.step_key, &problems.join("; "), &record, None);
                    fail += 1;
                }
            }
            Ok(StepResult::with_records(valid, fail))
        })
    }
}
