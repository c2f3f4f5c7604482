use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use sluice_core::circuit::CircuitKey;
use sluice_core::context::AdapterContext;
use sluice_core::error::{Result, SluiceError};
use sluice_core::expr::lookup;
use sluice_core::pipeline::StepDefinition;
use sluice_core::traits::{RecordErrorSink, StepAdapter};
use sluice_core::types::{Record, StepKind, StepResult};

use super::{http_client, resolve_endpoint};

/// Fetches a JSON document over HTTP and emits the array found at `itemsPath`.
pub struct HttpJsonExtract {
    client: reqwest::Client,
}

impl HttpJsonExtract {
    pub fn new() -> Self {
        Self {
            client: http_client(),
        }
    }
}

impl Default for HttpJsonExtract {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct HttpJsonConfig {
    url: Option<String>,
    connection: Option<String>,
    path: Option<String>,
    items_path: Option<String>,
    token_secret: Option<String>,
}

impl StepAdapter for HttpJsonExtract {
    fn kind(&self) -> StepKind {
        StepKind::Extract
    }

    fn code(&self) -> &str {
        "http_json"
    }

    fn description(&self) -> &str {
        "GET a JSON endpoint and emit the records at itemsPath."
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "connection": { "type": "string" },
                "path": { "type": "string" },
                "itemsPath": { "type": "string", "description": "Dotted path to the array (default: document root)" },
                "tokenSecret": { "type": "string" }
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
            let config: HttpJsonConfig = step.config_as()?;
            let endpoint = resolve_endpoint(
                ctx,
                config.url.as_deref(),
                config.connection.as_deref(),
                config.path.as_deref(),
                config.token_secret.as_deref(),
            )?;
            let circuit = CircuitKey::for_url(self.code(), &endpoint.url);

            debug!(step_key = %ctx.step_key, url = %endpoint.url, "Fetching records");
            let document: Value = ctx
                .guarded_call(&circuit, |_| {
                    let req = endpoint.apply(self.client.get(&endpoint.url));
                    async move {
                        let resp = req
                            .send()
                            .await
                            .map_err(|e| SluiceError::Http(e.to_string()))?;
                        let status = resp.status();
                        if !status.is_success() {
                            return Err(SluiceError::Http(format!("GET returned {status}")));
                        }
                        resp.json::<Value>()
                            .await
                            .map_err(|e| SluiceError::Http(format!("invalid JSON body: {e}")))
                    }
                })
                .await
                .map_err(|e| match e {
                    SluiceError::CircuitOpen { .. } => e,
                    other => SluiceError::adapter(&ctx.step_key, other.to_string()),
                })?;

            let items = match config.items_path.as_deref() {
                Some(path) => document
                    .as_object()
                    .and_then(|root| lookup(root, path))
                    .cloned()
                    .unwrap_or(Value::Null),
                None => document,
            };
            let Value::Array(items) = items else {
                return Err(SluiceError::adapter(
                    &ctx.step_key,
                    "response does not contain an array at itemsPath",
                ));
            };

            let mut out = input;
            let mut fail = 0;
            let fetched = items.len();
            for item in items {
                match item {
                    Value::Object(record) => out.push(record),
                    other => {
                        let mut wrapped = Record::new();
                        wrapped.insert("value".into(), other);
                        errors.on_record_error(&ctx.step_key, "item is not an object", &wrapped, None);
                        fail += 1;
                    }
                }
            }

            ctx.set_checkpoint(json!({
                "lastFetchedAt": Utc::now().to_rfc3339(),
                "lastCount": fetched,
            }));
            info!(step_key = %ctx.step_key, fetched, "Fetched records");
            Ok(StepResult::with_records(out, fail))
        })
    }
}
