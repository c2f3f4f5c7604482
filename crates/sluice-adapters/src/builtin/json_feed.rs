use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use sluice_core::context::AdapterContext;
use sluice_core::error::{Result, SluiceError};
use sluice_core::pipeline::StepDefinition;
use sluice_core::projection::FieldProjection;
use sluice_core::traits::{RecordErrorSink, StepAdapter};
use sluice_core::types::{Record, StepKind, StepResult};

/// Publishes the batch as a JSON feed document, replacing the previous one.
pub struct JsonFeed;

#[derive(Deserialize)]
struct FeedConfig {
    path: String,
    #[serde(default)]
    title: Option<String>,
}

impl StepAdapter for JsonFeed {
    fn kind(&self) -> StepKind {
        StepKind::Feed
    }

    fn code(&self) -> &str {
        "json_feed"
    }

    fn description(&self) -> &str {
        "Write a {generatedAt, count, items} JSON feed document."
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "title": { "type": "string" },
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
            let config: FeedConfig = step.config_as()?;
            let projection = FieldProjection::from_config(&step.config)?;
            let items = projection.apply_all(&input);

            let mut doc = json!({
                "generatedAt": Utc::now().to_rfc3339(),
                "count": items.len(),
                "items": items,
            });
            if let Some(title) = &config.title {
                doc["title"] = json!(title);
            }

            if ctx.dry_run {
                debug!(step_key = %ctx.step_key, path = %config.path, "Dry run, skipping feed write");
                return Ok(StepResult::passthrough(input.len()));
            }

            let body = serde_json::to_vec_pretty(&doc)?;
            tokio::fs::write(&config.path, body)
                .await
                .map_err(|e| SluiceError::adapter(&ctx.step_key, format!("{}: {e}", config.path)))?;
            info!(step_key = %ctx.step_key, path = %config.path, items = input.len(), "Feed written");
            Ok(StepResult::passthrough(input.len()))
        })
    }
}
