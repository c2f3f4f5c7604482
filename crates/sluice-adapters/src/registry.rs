use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use sluice_core::context::AdapterContext;
use sluice_core::error::Result;
use sluice_core::pipeline::StepDefinition;
use sluice_core::traits::{AdapterDefinition, RecordErrorSink, StepAdapter};
use sluice_core::types::{without_failed, Record, StepKind, StepResult};

use crate::builtin::memory::MemoryTables;
use crate::noop::NoopAdapter;

/// What a closure handler hands back: the output batch (or `None` to forward
/// the input less the rejected records) and the records it rejected.
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    pub records: Option<Vec<Record>>,
    pub failed: Vec<(Record, String)>,
}

type Handler =
    dyn Fn(StepDefinition, Vec<Record>) -> BoxFuture<'static, Result<HandlerOutcome>> + Send + Sync;

/// Adapter backed by a plain async closure.
struct HandlerAdapter {
    definition: AdapterDefinition,
    handler: Box<Handler>,
}

impl StepAdapter for HandlerAdapter {
    fn kind(&self) -> StepKind {
        self.definition.kind
    }

    fn code(&self) -> &str {
        &self.definition.code
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn config_schema(&self) -> serde_json::Value {
        self.definition.config_schema.clone()
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a AdapterContext,
        step: &'a StepDefinition,
        input: Vec<Record>,
        errors: &'a dyn RecordErrorSink,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            let outcome = (self.handler)(step.clone(), input.clone()).await?;
            for (record, message) in &outcome.failed {
                errors.on_record_error(&ctx.step_key, message, record, None);
            }
            let fail = outcome.failed.len();
            let records = match outcome.records {
                Some(records) => records,
                None => without_failed(input, outcome.failed.iter().map(|(r, _)| r)),
            };
            Ok(StepResult::with_records(records, fail))
        })
    }
}

/// Registry of step adapters keyed by `(kind, code)`.
pub struct AdapterRegistry {
    adapters: BTreeMap<(StepKind, String), Arc<dyn StepAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: BTreeMap::new(),
        }
    }

    /// Register an adapter, replacing any previous one with the same key.
    pub fn register(&mut self, adapter: impl StepAdapter) {
        let key = (adapter.kind(), adapter.code().to_string());
        self.adapters.insert(key, Arc::new(adapter));
    }

    /// Register an async closure as an adapter.
    pub fn register_handler<F>(
        &mut self,
        kind: StepKind,
        code: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) where
        F: Fn(StepDefinition, Vec<Record>) -> BoxFuture<'static, Result<HandlerOutcome>>
            + Send
            + Sync
            + 'static,
    {
        let definition = AdapterDefinition {
            kind,
            code: code.into(),
            description: description.into(),
            config_schema: serde_json::json!({ "type": "object" }),
        };
        self.register(HandlerAdapter {
            definition,
            handler: Box::new(handler),
        });
    }

    pub fn unregister(&mut self, kind: StepKind, code: &str) -> bool {
        self.adapters.remove(&(kind, code.to_string())).is_some()
    }

    pub fn get(&self, kind: StepKind, code: &str) -> Option<Arc<dyn StepAdapter>> {
        self.adapters.get(&(kind, code.to_string())).cloned()
    }

    /// Like `get`, but an unknown code resolves to a pass-through adapter.
    pub fn resolve(&self, kind: StepKind, code: &str) -> Arc<dyn StepAdapter> {
        self.get(kind, code)
            .unwrap_or_else(|| Arc::new(NoopAdapter::new(kind, code)))
    }

    pub fn contains(&self, kind: StepKind, code: &str) -> bool {
        self.adapters.contains_key(&(kind, code.to_string()))
    }

    pub fn list(&self) -> Vec<(StepKind, &str)> {
        self.adapters
            .keys()
            .map(|(kind, code)| (*kind, code.as_str()))
            .collect()
    }

    pub fn definitions(&self) -> Vec<AdapterDefinition> {
        self.adapters.values().map(|a| a.definition()).collect()
    }

    /// Create a registry with all built-in adapters registered.
    pub fn with_builtins() -> Self {
        Self::with_builtins_sharing(MemoryTables::default())
    }

    /// Built-ins, with the `memory` loader writing into `tables`.
    pub fn with_builtins_sharing(tables: MemoryTables) -> Self {
        use crate::builtin::*;

        let mut registry = Self::new();

        // Extract
        registry.register(inline::InlineExtract);
        registry.register(http_json::HttpJsonExtract::new());

        // Shape and check
        registry.register(field_ops::FieldOpsTransform);
        registry.register(rules::RulesValidate);
        registry.register(defaults::DefaultsEnrich);
        registry.register(filter::FilterRoute);

        // Outputs
        registry.register(memory::MemoryLoad::new(tables));
        registry.register(jsonl::JsonlExport);
        registry.register(json_feed::JsonFeed);
        registry.register(webhook::WebhookSink::new());

        registry
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::traits::ErrorCollector;
    use sluice_core::types::RunId;

    fn ctx() -> AdapterContext {
        AdapterContext::new(RunId::from_string("r"), "p", "s")
    }

    fn rec(v: serde_json::Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn builtins_cover_every_output_kind() {
        let registry = AdapterRegistry::with_builtins();
        assert!(registry.contains(StepKind::Extract, "inline"));
        assert!(registry.contains(StepKind::Extract, "http_json"));
        assert!(registry.contains(StepKind::Transform, "field_ops"));
        assert!(registry.contains(StepKind::Validate, "rules"));
        assert!(registry.contains(StepKind::Enrich, "defaults"));
        assert!(registry.contains(StepKind::Route, "filter"));
        assert!(registry.contains(StepKind::Load, "memory"));
        assert!(registry.contains(StepKind::Export, "jsonl"));
        assert!(registry.contains(StepKind::Feed, "json_feed"));
        assert!(registry.contains(StepKind::Sink, "webhook"));
        assert_eq!(registry.definitions().len(), 10);
    }

    #[test]
    fn same_code_under_different_kinds_is_distinct() {
        let registry = AdapterRegistry::with_builtins();
        assert!(registry.get(StepKind::Load, "inline").is_none());
    }

    #[tokio::test]
    async fn unknown_code_resolves_to_passthrough() {
        let registry = AdapterRegistry::new();
        let adapter = registry.resolve(StepKind::Enrich, "geo_lookup");
        assert_eq!(adapter.code(), "geo_lookup");

        let step = StepDefinition::new("s", StepKind::Enrich, "geo_lookup");
        let sink = ErrorCollector::new();
        let result = adapter
            .execute(&ctx(), &step, vec![rec(json!({"a": 1}))], &sink)
            .await
            .unwrap();
        assert_eq!(result, StepResult::passthrough(1));
    }

    #[tokio::test]
    async fn handler_failures_reach_the_sink() {
        let mut registry = AdapterRegistry::new();
        registry.register_handler(StepKind::Load, "crm", "CRM loader", |_step, input| {
            Box::pin(async move {
                let (good, bad): (Vec<Record>, Vec<Record>) =
                    input.into_iter().partition(|r| r.contains_key("id"));
                Ok(HandlerOutcome {
                    records: Some(good),
                    failed: bad.into_iter().map(|r| (r, "missing id".into())).collect(),
                })
            })
        });

        let adapter = registry.get(StepKind::Load, "crm").unwrap();
        let step = StepDefinition::new("s", StepKind::Load, "crm");
        let sink = ErrorCollector::new();
        let result = adapter
            .execute(
                &ctx(),
                &step,
                vec![rec(json!({"id": 1})), rec(json!({"name": "x"}))],
                &sink,
            )
            .await
            .unwrap();
        assert_eq!((result.ok, result.fail), (1, 1));
        assert_eq!(sink.take()[0].message, "missing id");
    }

    #[test]
    fn unregister_removes_adapter() {
        let mut registry = AdapterRegistry::with_builtins();
        assert!(registry.unregister(StepKind::Sink, "webhook"));
        assert!(!registry.unregister(StepKind::Sink, "webhook"));
        assert_eq!(registry.list().len(), 9);
    }
}
