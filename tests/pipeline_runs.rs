use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use sluice_adapters::{AdapterRegistry, MemoryTables};
use sluice_core::types::{Record, RunStatus};
use sluice_engine::{ApprovalOutcome, Engine, GateTimeoutSweeper, InterceptorRegistry};
use sluice_store::SqliteStore;
use sluice_test_utils::temp_file;

fn engine_at(db: &Path, tables: &MemoryTables, interceptors: InterceptorRegistry) -> Arc<Engine> {
    let store = SqliteStore::open(db).expect("open store");
    Engine::builder(Arc::new(store))
        .registry(AdapterRegistry::with_builtins_sharing(tables.clone()))
        .interceptors(interceptors)
        .build()
}

const CUSTOMERS: &str = r#"{
    "code": "customers",
    "steps": [
        { "key": "pull", "kind": "EXTRACT", "adapter": "inline", "config": { "records": [
            { "id": 1, "name": "Ada", "email": "ada@example.com" },
            { "id": 2, "name": "Bob" },
            { "id": 3, "email": "nobody@example.com" }
        ] } },
        { "key": "shape", "kind": "TRANSFORM", "adapter": "field_ops", "config": { "ops": [
            { "op": "set", "field": "source", "value": "crm" }
        ] } },
        { "key": "check", "kind": "VALIDATE", "adapter": "rules", "config": { "required": ["name"] } },
        { "key": "review", "kind": "GATE", "gate": { "approvalType": "THRESHOLD", "thresholdPercent": 10 } },
        { "key": "store", "kind": "LOAD", "adapter": "memory", "config": { "table": "customers" } }
    ],
    "edges": [
        { "from": "pull", "to": "shape" },
        { "from": "shape", "to": "check" },
        { "from": "check", "to": "review" },
        { "from": "review", "to": "store" }
    ],
    "hooks": {
        "afterTransform": [{ "type": "script", "code": "set touched = true" }]
    }
}"#;

#[tokio::test]
async fn paused_run_survives_restart_and_completes_on_approval() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sluice.db");
    let pipeline = temp_file(".json", CUSTOMERS);
    let tables = MemoryTables::new();

    let engine = engine_at(&db, &tables, InterceptorRegistry::new());
    let code = engine.load_pipeline(pipeline.path()).unwrap();
    let run = engine.start_run(&code, vec![]).await.unwrap();

    // 1 failure in 9 counted records is above the 10% threshold
    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.stats.success_count, 8);
    assert_eq!(run.stats.error_count, 1);
    assert_eq!(tables.len("customers"), 0);
    drop(engine);

    let engine = engine_at(&db, &tables, InterceptorRegistry::new());
    let outcome = engine.approve_gate(&run.id, "review").await.unwrap();

    let ApprovalOutcome::Resumed(run) = outcome else {
        panic!("expected the run to resume");
    };
    assert_eq!(run.status, RunStatus::Completed);
    let rows = tables.rows("customers");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["touched"] == json!(true) && r["source"] == "crm"));

    let letters = engine.dead_letters(&run.id).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].step_key, "check");
    assert_eq!(letters[0].record["id"], 3);
}

#[tokio::test]
async fn fan_out_feeds_every_branch() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = temp_file(
        ".json",
        r#"{
            "code": "split",
            "steps": [
                { "key": "pull", "kind": "EXTRACT", "adapter": "inline", "config": { "records": [
                    { "id": 1, "country": "DE" },
                    { "id": 2, "country": "FR" },
                    { "id": 3, "country": "DE" }
                ] } },
                { "key": "german", "kind": "ROUTE", "adapter": "filter", "config": { "where": "country == \"DE\"" } },
                { "key": "store_de", "kind": "LOAD", "adapter": "memory", "config": { "table": "de" } },
                { "key": "store_all", "kind": "LOAD", "adapter": "memory", "config": { "table": "all" } }
            ],
            "edges": [
                { "from": "pull", "to": "german" },
                { "from": "german", "to": "store_de" },
                { "from": "pull", "to": "store_all" }
            ]
        }"#,
    );
    let tables = MemoryTables::new();
    let engine = engine_at(&dir.path().join("sluice.db"), &tables, InterceptorRegistry::new());
    let code = engine.load_pipeline(pipeline.path()).unwrap();

    let run = engine.start_run(&code, vec![]).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(tables.len("de"), 2);
    assert_eq!(tables.len("all"), 3);
    assert_eq!(run.stats.error_count, 0);
}

#[tokio::test]
async fn interceptor_hooks_declared_in_json_run_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = temp_file(
        ".json",
        r#"{
            "code": "dedupe",
            "steps": [
                { "key": "pull", "kind": "EXTRACT", "adapter": "inline", "config": { "records": [
                    { "id": 1 }, { "id": 1 }, { "id": 2 }
                ] } },
                { "key": "store", "kind": "LOAD", "adapter": "memory", "config": { "table": "out" } }
            ],
            "edges": [{ "from": "pull", "to": "store" }],
            "hooks": {
                "afterExtract": [
                    { "type": "interceptor", "name": "dedupe" },
                    { "type": "script", "code": "set seen = true" }
                ]
            }
        }"#,
    );
    let mut interceptors = InterceptorRegistry::new();
    interceptors.register_fn("dedupe", |records, _ctx, _args| {
        let mut seen = Vec::new();
        let mut out: Vec<Record> = Vec::new();
        for record in records {
            let id = record.get("id").cloned();
            if !seen.contains(&id) {
                seen.push(id);
                out.push(record);
            }
        }
        Ok(out)
    });
    let tables = MemoryTables::new();
    let engine = engine_at(&dir.path().join("sluice.db"), &tables, interceptors);
    let code = engine.load_pipeline(pipeline.path()).unwrap();

    engine.start_run(&code, vec![]).await.unwrap();

    let rows = tables.rows("out");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["seen"] == json!(true)));
}

#[tokio::test]
async fn timeout_gate_is_released_by_sweep_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sluice.db");
    let pipeline = temp_file(
        ".toml",
        r#"
code = "timed"

[[steps]]
key = "pull"
kind = "EXTRACT"
adapter = "inline"
config = { records = [{ id = 1 }, { id = 2 }] }

[[steps]]
key = "hold"
kind = "GATE"
gate = { approvalType = "TIMEOUT", timeoutSeconds = 60 }

[[steps]]
key = "store"
kind = "LOAD"
adapter = "memory"
config = { table = "timed" }

[[edges]]
from = "pull"
to = "hold"

[[edges]]
from = "hold"
to = "store"
"#,
    );
    let tables = MemoryTables::new();

    let engine = engine_at(&db, &tables, InterceptorRegistry::new());
    let code = engine.load_pipeline(pipeline.path()).unwrap();
    let run = engine.start_run(&code, vec![]).await.unwrap();
    assert_eq!(run.status, RunStatus::Paused);
    drop(engine);

    let engine = engine_at(&db, &tables, InterceptorRegistry::new());
    let mut rx = engine.events().subscribe();
    let sweeper = GateTimeoutSweeper::new(engine.clone(), Duration::from_secs(30), CancellationToken::new());
    let later = chrono::Utc::now() + chrono::Duration::seconds(120);

    assert_eq!(sweeper.sweep_once(later).await.unwrap(), 1);

    // the released run resumes in the background
    let status = loop {
        if let Some(status) = rx.recv().await.unwrap().final_status() {
            break status;
        }
    };
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(engine.run(&run.id).await.unwrap().status, RunStatus::Completed);
    assert_eq!(tables.len("timed"), 2);
    let checkpoint = engine.checkpoint(&run.id).await.unwrap();
    assert!(checkpoint.engine.gates.is_empty());
    assert!(checkpoint.engine.gate_timeouts.is_empty());
}
