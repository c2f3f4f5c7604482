use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit::CircuitConfig;
use crate::error::{Result, SluiceError};
use crate::retry::RetryPolicy;

/// Top-level Sluice configuration (`sluice.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
    #[serde(default)]
    pub gate: GateSettings,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Named secrets available to adapters.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    /// Named connections available to adapters.
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default run time limit in seconds. 0 = unlimited.
    #[serde(default)]
    pub max_run_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub dry_run: bool,
    /// Pipeline files registered at startup, addressable by `triggerPipeline`.
    #[serde(default)]
    pub pipelines: Vec<String>,
}

fn default_batch_size() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_run_secs: 0,
            batch_size: default_batch_size(),
            dry_run: false,
            pipelines: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retries,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.multiplier,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_secs")]
    pub reset_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_secs() -> u64 {
    60
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_secs: default_reset_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn breaker(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold.max(1),
            reset_timeout: Duration::from_secs(self.reset_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSettings {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Records included in notification previews.
    #[serde(default = "default_preview_records")]
    pub preview_records: usize,
    /// Permit webhook targets on loopback or private networks.
    #[serde(default)]
    pub allow_private_webhooks: bool,
    #[serde(default = "default_notify_timeout_secs")]
    pub notify_timeout_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_preview_records() -> usize {
    5
}

fn default_notify_timeout_secs() -> u64 {
    10
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            preview_records: default_preview_records(),
            allow_private_webhooks: false,
            notify_timeout_secs: default_notify_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "~/.sluice/sluice.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// Resolve the database path (expand ~).
    pub fn db_path(&self) -> PathBuf {
        if let Some(rest) = self.path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on every route but health. Unset = open.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:18790".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Name of a secret sent as a bearer token.
    #[serde(default)]
    pub token_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    /// Cron expression (seconds field included).
    pub cron: String,
    /// Path to the pipeline definition file.
    pub pipeline: String,
    /// Optional JSON file holding the seed batch.
    #[serde(default)]
    pub seed: Option<String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SluiceError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| SluiceError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay literal
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_set_variables() {
        std::env::set_var("TEST_SLUICE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_SLUICE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
    }

    #[test]
    fn keeps_unset_variables() {
        let result = expand_env_vars("key = \"${SLUICE_SURELY_UNSET_VAR}\"");
        assert_eq!(result, "key = \"${SLUICE_SURELY_UNSET_VAR}\"");
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.batch_size, 100);
        assert_eq!(config.retry.retries, 3);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.gate.sweep_interval_secs, 30);
        assert_eq!(config.gateway.bind, "127.0.0.1:18790");
        assert!(config.schedules.is_empty());
    }

    #[test]
    fn retry_section_builds_policy() {
        let config: AppConfig = toml::from_str(
            r#"
            [retry]
            retries = 2
            initial_delay_ms = 100
            max_delay_ms = 1000
            multiplier = 3.0
            "#,
        )
        .unwrap();
        let policy = config.retry.policy();
        assert_eq!(policy.retries, 2);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.multiplier, 3.0);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = AppConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, SluiceError::ConfigNotFound(_)));
    }
}
