use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use sluice_core::context::AdapterContext;
use sluice_core::error::{Result, SluiceError};
use sluice_core::pipeline::StepDefinition;
use sluice_core::projection::FieldProjection;
use sluice_core::traits::{RecordErrorSink, StepAdapter};
use sluice_core::types::{Record, StepKind, StepResult};

/// Appends projected records to a JSON Lines file.
pub struct JsonlExport;

#[derive(Deserialize)]
struct JsonlConfig {
    path: String,
    #[serde(default = "default_append")]
    append: bool,
}

fn default_append() -> bool {
    true
}

impl StepAdapter for JsonlExport {
    fn kind(&self) -> StepKind {
        StepKind::Export
    }

    fn code(&self) -> &str {
        "jsonl"
    }

    fn description(&self) -> &str {
        "Write records to a JSON Lines file, one object per line."
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "append": { "type": "boolean" },
                "fields": { "type": "array", "items": { "type": "string" } },
                "exclude": { "type": "array", "items": { "type": "string" } },
                "rename": { "type": "object" }
            },
            "required": ["path"]
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
            let config: JsonlConfig = step.config_as()?;
            let projection = FieldProjection::from_config(&step.config)?;

            if ctx.dry_run {
                debug!(step_key = %ctx.step_key, path = %config.path, "Dry run, skipping export");
                return Ok(StepResult::passthrough(input.len()));
            }

            let mut body = String::new();
            for record in projection.apply_all(&input) {
                body.push_str(&serde_json::to_string(&record)?);
                body.push('\n');
            }

            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(config.append)
                .truncate(!config.append)
                .open(&config.path)
                .await
                .map_err(|e| SluiceError::adapter(&ctx.step_key, format!("{}: {e}", config.path)))?;
            file.write_all(body.as_bytes()).await?;
            file.flush().await?;

            info!(step_key = %ctx.step_key, path = %config.path, records = input.len(), "Exported records");
            Ok(StepResult::passthrough(input.len()))
        })
    }
}
