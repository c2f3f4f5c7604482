use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use sluice_core::circuit::CircuitKey;
use sluice_core::context::AdapterContext;
use sluice_core::error::{Result, SluiceError};
use sluice_core::pipeline::StepDefinition;
use sluice_core::projection::FieldProjection;
use sluice_core::traits::{RecordErrorSink, StepAdapter};
use sluice_core::types::{Record, StepKind, StepResult};

use super::{http_client, resolve_endpoint};
use crate::batch::deliver_in_chunks;

/// POSTs projected records in chunks to an HTTP endpoint.
pub struct WebhookSink {
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new() -> Self {
        Self {
            client: http_client(),
        }
    }
}

impl Default for WebhookSink {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WebhookConfig {
    url: Option<String>,
    connection: Option<String>,
    path: Option<String>,
    token_secret: Option<String>,
    batch_size: Option<usize>,
}

impl StepAdapter for WebhookSink {
    fn kind(&self) -> StepKind {
        StepKind::Sink
    }

    fn code(&self) -> &str {
        "webhook"
    }

    fn description(&self) -> &str {
        "POST records to an HTTP endpoint in batches, with retry and circuit breaking."
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "connection": { "type": "string" },
                "path": { "type": "string" },
                "tokenSecret": { "type": "string" },
                "batchSize": { "type": "integer", "minimum": 1 },
                "fields": { "type": "array", "items": { "type": "string" } },
                "exclude": { "type": "array", "items": { "type": "string" } },
                "rename": { "type": "object" }
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
            let config: WebhookConfig = step.config_as()?;
            let projection = FieldProjection::from_config(&step.config)?;
            let endpoint = resolve_endpoint(
                ctx,
                config.url.as_deref(),
                config.connection.as_deref(),
                config.path.as_deref(),
                config.token_secret.as_deref(),
            )?;

            if ctx.dry_run {
                debug!(step_key = %ctx.step_key, url = %endpoint.url, "Dry run, skipping delivery");
                return Ok(StepResult::passthrough(input.len()));
            }

            let projected = projection.apply_all(&input);
            let circuit = CircuitKey::for_url(self.code(), &endpoint.url);
            let batch_size = config.batch_size.unwrap_or(ctx.batch_size);

            let report = deliver_in_chunks(ctx, &circuit, &projected, batch_size, errors, |chunk| {
                let body = json!({
                    "pipeline": ctx.pipeline_code,
                    "runId": ctx.run_id,
                    "step": ctx.step_key,
                    "records": chunk,
                });
                let req = endpoint.apply(self.client.post(&endpoint.url)).json(&body);
                async move {
                    let resp = req
                        .send()
                        .await
                        .map_err(|e| SluiceError::Http(e.to_string()))?;
                    let status = resp.status();
                    if status.is_success() {
                        Ok(())
                    } else {
                        Err(SluiceError::Http(format!("POST returned {status}")))
                    }
                }
            })
            .await;

            info!(
                step_key = %ctx.step_key,
                ok = report.ok,
                fail = report.fail,
                "Webhook delivery finished"
            );
            // Downstream steps see the unprojected records that made it out
            Ok(StepResult::with_records(report.delivered(input), report.fail))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use sluice_core::retry::RetryPolicy;
    use sluice_core::traits::ErrorCollector;
    use sluice_core::types::RunId;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<Value>>>;

    async fn receiver(State(seen): State<Seen>, Json(body): Json<Value>) -> StatusCode {
        let mut seen = seen.lock().unwrap();
        seen.push(body);
        // Reject the second delivery
        if seen.len() == 2 {
            StatusCode::BAD_GATEWAY
        } else {
            StatusCode::OK
        }
    }

    #[tokio::test]
    async fn posts_projected_chunks_and_reports_failed_chunk() {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route("/ingest", post(receiver))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let ctx = AdapterContext::new(RunId::from_string("r"), "p", "push")
            .with_retry(RetryPolicy::none());
        let step = StepDefinition::new("push", StepKind::Sink, "webhook").with_config(json!({
            "url": format!("http://{addr}/ingest"),
            "batchSize": 2,
            "fields": ["id"]
        }));
        let input: Vec<Record> = (0..5)
            .map(|i| json!({"id": i, "pii": "x"}).as_object().cloned().unwrap())
            .collect();
        let sink = ErrorCollector::new();

        let result = WebhookSink::new()
            .execute(&ctx, &step, input, &sink)
            .await
            .unwrap();

        assert_eq!((result.ok, result.fail), (3, 2));
        let forwarded: Vec<Value> = result
            .records
            .unwrap()
            .into_iter()
            .map(Value::Object)
            .collect();
        assert_eq!(
            forwarded,
            vec![
                json!({"id": 0, "pii": "x"}),
                json!({"id": 1, "pii": "x"}),
                json!({"id": 4, "pii": "x"}),
            ]
        );
        assert_eq!(sink.len(), 2);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0]["records"], json!([{"id": 0}, {"id": 1}]));
        assert_eq!(seen[0]["step"], json!("push"));
    }
}
