use std::io::Write;

use sluice_core::config::AppConfig;
use sluice_core::error::SluiceError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_run_secs = 900
batch_size = 250
pipelines = ["pipelines/orders.json"]

[retry]
retries = 5
initial_delay_ms = 100
max_delay_ms = 1000
multiplier = 3.0

[circuit]
failure_threshold = 2
reset_secs = 15

[gate]
sweep_interval_secs = 5
preview_records = 3
allow_private_webhooks = true

[store]
path = "/var/lib/sluice/sluice.db"

[gateway]
bind = "0.0.0.0:9999"
token = "test-token"

[secrets]
crm_token = "abc"

[connections.crm]
url = "https://crm.example.com/api"
token_secret = "crm_token"

[[schedules]]
name = "nightly-orders"
cron = "0 0 2 * * *"
pipeline = "pipelines/orders.json"
seed = "seeds/orders.json"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_run_secs, 900);
    assert_eq!(config.engine.batch_size, 250);
    assert_eq!(config.engine.pipelines, vec!["pipelines/orders.json"]);
    assert_eq!(config.retry.retries, 5);
    assert_eq!(config.retry.policy().retries, 5);
    assert_eq!(config.circuit.breaker().failure_threshold, 2);
    assert_eq!(config.gate.preview_records, 3);
    assert!(config.gate.allow_private_webhooks);
    assert_eq!(
        config.store.db_path(),
        std::path::PathBuf::from("/var/lib/sluice/sluice.db")
    );
    assert_eq!(config.gateway.bind, "0.0.0.0:9999");
    assert_eq!(config.gateway.token.as_deref(), Some("test-token"));
    assert_eq!(config.secrets["crm_token"], "abc");
    assert_eq!(
        config.connections["crm"].url.as_deref(),
        Some("https://crm.example.com/api")
    );

    assert_eq!(config.schedules.len(), 1);
    let schedule = &config.schedules[0];
    assert_eq!(schedule.name, "nightly-orders");
    assert_eq!(schedule.seed.as_deref(), Some("seeds/orders.json"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("SLUICE_TEST_CRM_TOKEN", "expanded-token-value");

    let toml_content = r#"
[secrets]
crm_token = "${SLUICE_TEST_CRM_TOKEN}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.secrets["crm_token"], "expanded-token-value");

    std::env::remove_var("SLUICE_TEST_CRM_TOKEN");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[engine]
dry_run = true
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert!(config.engine.dry_run);
    assert_eq!(config.engine.max_run_secs, 0);
    assert_eq!(config.engine.batch_size, 100);
    assert_eq!(config.retry.initial_delay_ms, 500);
    assert_eq!(config.gate.sweep_interval_secs, 30);
    assert!(!config.gate.allow_private_webhooks);
    assert!(config.gateway.token.is_none());
    assert!(config.connections.is_empty());
    assert!(config.schedules.is_empty());
}

#[test]
fn test_missing_and_malformed_files_are_reported() {
    let missing = AppConfig::load(std::path::Path::new("/nonexistent/sluice.toml"));
    assert!(matches!(missing, Err(SluiceError::ConfigNotFound(_))));

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nbatch_size = ").expect("write toml");
    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(SluiceError::Config(_))
    ));
}
