use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use sluice_core::context::AdapterContext;
use sluice_core::error::Result;
use sluice_core::pipeline::StepDefinition;
use sluice_core::traits::{RecordErrorSink, StepAdapter};
use sluice_core::types::{Record, StepKind, StepResult};

/// Named in-memory tables, shared between the loader and whoever reads them.
#[derive(Clone, Default)]
pub struct MemoryTables {
    inner: Arc<RwLock<HashMap<String, Vec<Record>>>>,
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        match self.inner.read() {
            Ok(map) => map.get(table).cloned().unwrap_or_default(),
            Err(poisoned) => poisoned.into_inner().get(table).cloned().unwrap_or_default(),
        }
    }

    pub fn len(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    fn write(&self, table: &str, records: Vec<Record>, key_field: &str, upsert: bool) {
        let mut map = match self.inner.write() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        let rows = map.entry(table.to_string()).or_default();
        for record in records {
            if upsert {
                let key = record.get(key_field);
                if let Some(existing) = rows.iter_mut().find(|r| r.get(key_field) == key) {
                    *existing = record;
                    continue;
                }
            }
            rows.push(record);
        }
    }
}

/// Loads records into a [`MemoryTables`] table, keyed by `keyField`.
pub struct MemoryLoad {
    tables: MemoryTables,
}

impl MemoryLoad {
    pub fn new(tables: MemoryTables) -> Self {
        Self { tables }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoryConfig {
    #[serde(default = "default_table")]
    table: String,
    #[serde(default = "default_key_field")]
    key_field: String,
    #[serde(default)]
    upsert: bool,
}

fn default_table() -> String {
    "default".to_string()
}

fn default_key_field() -> String {
    "id".to_string()
}

impl StepAdapter for MemoryLoad {
    fn kind(&self) -> StepKind {
        StepKind::Load
    }

    fn code(&self) -> &str {
        "memory"
    }

    fn description(&self) -> &str {
        "Load records into a named in-memory table."
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "table": { "type": "string" },
                "keyField": { "type": "string", "description": "Field every record must carry (default: id)" },
                "upsert": { "type": "boolean" }
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
            let config: MemoryConfig = step.config_as()?;
            let mut loaded = Vec::with_capacity(input.len());
            let mut fail = 0;
            for record in input {
                match record.get(&config.key_field) {
                    Some(v) if !v.is_null() => loaded.push(record),
                    _ => {
                        let message = format!("missing key field '{}'", config.key_field);
                        errors.on_record_error(&ctx.step_key, &message, &record, None);
                        fail += 1;
                    }
                }
            }

            if ctx.dry_run {
                debug!(step_key = %ctx.step_key, table = %config.table, "Dry run, skipping load");
            } else {
                self.tables
                    .write(&config.table, loaded.clone(), &config.key_field, config.upsert);
            }
            Ok(StepResult::with_records(loaded, fail))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::traits::ErrorCollector;
    use sluice_core::types::RunId;

    fn batch() -> Vec<Record> {
        (0..10)
            .map(|i| {
                let v = if i % 3 == 1 {
                    json!({ "name": format!("n{i}") })
                } else {
                    json!({ "id": i, "name": format!("n{i}") })
                };
                v.as_object().cloned().unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn partial_failure_counts_and_reports() {
        let tables = MemoryTables::new();
        let adapter = MemoryLoad::new(tables.clone());
        let ctx = AdapterContext::new(RunId::from_string("r"), "p", "store");
        let step = StepDefinition::new("store", StepKind::Load, "memory")
            .with_config(json!({"table": "customers"}));
        let sink = ErrorCollector::new();

        let result = adapter.execute(&ctx, &step, batch(), &sink).await.unwrap();

        assert_eq!((result.ok, result.fail), (7, 3));
        let errors = sink.take();
        assert_eq!(errors.len(), 3);
        let names: std::collections::HashSet<_> =
            errors.iter().map(|e| e.record["name"].clone()).collect();
        assert_eq!(names.len(), 3);
        assert_eq!(tables.len("customers"), 7);
    }

    #[tokio::test]
    async fn upsert_replaces_by_key() {
        let tables = MemoryTables::new();
        let adapter = MemoryLoad::new(tables.clone());
        let ctx = AdapterContext::new(RunId::from_string("r"), "p", "store");
        let step = StepDefinition::new("store", StepKind::Load, "memory")
            .with_config(json!({"table": "t", "upsert": true}));
        let rec = |name: &str| json!({"id": 1, "name": name}).as_object().cloned().unwrap();

        adapter.execute(&ctx, &step, vec![rec("a")], &ErrorCollector::new()).await.unwrap();
        adapter.execute(&ctx, &step, vec![rec("b")], &ErrorCollector::new()).await.unwrap();

        let rows = tables.rows("t");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("b"));
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let tables = MemoryTables::new();
        let adapter = MemoryLoad::new(tables.clone());
        let ctx = AdapterContext::new(RunId::from_string("r"), "p", "store").with_dry_run(true);
        let step = StepDefinition::new("store", StepKind::Load, "memory");
        let result = adapter
            .execute(&ctx, &step, batch(), &ErrorCollector::new())
            .await
            .unwrap();
        assert_eq!(result.ok, 7);
        assert_eq!(tables.len("default"), 0);
    }
}
