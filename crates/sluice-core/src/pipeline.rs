use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};
use crate::hooks::PipelineHooks;
use crate::types::StepKind;

/// A pipeline: a directed acyclic graph of typed steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    /// Stable code used to look the pipeline up.
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
    /// Wall-clock limit for a run; falls back to `engine.max_run_secs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "PipelineHooks::is_empty")]
    pub hooks: PipelineHooks,
}

/// One step of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub key: String,
    pub kind: StepKind,
    /// Adapter code, resolved against the registry under `kind`.
    #[serde(default)]
    pub adapter: String,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Any failed record fails the run.
    #[serde(default)]
    pub strict: bool,
    /// A step-fatal error yields an empty batch instead of failing the run.
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalType {
    Manual,
    Threshold,
    Timeout,
}

impl ApprovalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Threshold => "THRESHOLD",
            Self::Timeout => "TIMEOUT",
        }
    }
}

/// Configuration of a human-approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateConfig {
    pub approval_type: ApprovalType,
    /// THRESHOLD: continue while the error rate stays below this percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_percent: Option<f64>,
    /// TIMEOUT: auto-approve after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub email: Vec<String>,
}

impl GateConfig {
    pub fn manual() -> Self {
        Self {
            approval_type: ApprovalType::Manual,
            threshold_percent: None,
            timeout_seconds: None,
            webhook_url: None,
            email: vec![],
        }
    }

    pub fn threshold(percent: f64) -> Self {
        Self {
            approval_type: ApprovalType::Threshold,
            threshold_percent: Some(percent),
            ..Self::manual()
        }
    }

    pub fn timeout(seconds: u64) -> Self {
        Self {
            approval_type: ApprovalType::Timeout,
            timeout_seconds: Some(seconds),
            ..Self::manual()
        }
    }

    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn with_email(mut self, to: impl Into<String>) -> Self {
        self.email.push(to.into());
        self
    }
}

impl EdgeDefinition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl StepDefinition {
    pub fn new(key: impl Into<String>, kind: StepKind, adapter: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind,
            adapter: adapter.into(),
            config: serde_json::Value::Null,
            strict: false,
            continue_on_error: false,
            gate: None,
        }
    }

    /// Create a GATE step.
    pub fn gate(key: impl Into<String>, gate: GateConfig) -> Self {
        let mut step = Self::new(key, StepKind::Gate, "");
        step.gate = Some(gate);
        step
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// Read one config field, `None` when absent or of the wrong shape.
    pub fn setting<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Deserialize the whole config block; a missing block is an empty object.
    pub fn config_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = match &self.config {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(value).map_err(|e| {
            SluiceError::InvalidPipeline(format!("step '{}' config: {e}", self.key))
        })
    }
}

impl PipelineDefinition {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: None,
            steps: vec![],
            edges: vec![],
            timeout_secs: None,
            hooks: PipelineHooks::default(),
        }
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(EdgeDefinition::new(from, to));
        self
    }

    pub fn with_hooks(mut self, hooks: PipelineHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Load a definition from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::from_str(&content).map_err(|e| SluiceError::InvalidPipeline(e.to_string()))
        } else {
            Ok(serde_json::from_str(&content)?)
        }
    }

    pub fn step(&self, key: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.key == key)
    }

    /// Keys of the steps feeding `key`, in edge declaration order.
    pub fn predecessors(&self, key: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == key)
            .map(|e| e.from.as_str())
            .collect()
    }

    /// Keys of the steps fed by `key`, in edge declaration order.
    pub fn successors(&self, key: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == key)
            .map(|e| e.to.as_str())
            .collect()
    }

    /// Check structural soundness: keys, edges, gate configs, acyclicity.
    pub fn validate(&self) -> Result<()> {
        if self.code.trim().is_empty() {
            return Err(SluiceError::InvalidPipeline("pipeline code is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(SluiceError::InvalidPipeline(format!(
                "pipeline '{}' has no steps",
                self.code
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.key.trim().is_empty() {
                return Err(SluiceError::InvalidPipeline("step key is empty".into()));
            }
            if step.key.starts_with("__") {
                return Err(SluiceError::InvalidPipeline(format!(
                    "step key '{}' uses the reserved '__' prefix",
                    step.key
                )));
            }
            if !seen.insert(step.key.as_str()) {
                return Err(SluiceError::InvalidPipeline(format!(
                    "duplicate step key '{}'",
                    step.key
                )));
            }
            match (step.kind, &step.gate) {
                (StepKind::Gate, None) => {
                    return Err(SluiceError::InvalidPipeline(format!(
                        "gate step '{}' has no gate config",
                        step.key
                    )));
                }
                (StepKind::Gate, Some(gate)) => validate_gate(&step.key, gate)?,
                _ => {}
            }
        }

        let mut pairs = HashSet::new();
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !seen.contains(end.as_str()) {
                    return Err(SluiceError::StepNotFound(end.clone()));
                }
            }
            if edge.from == edge.to {
                return Err(SluiceError::CycleDetected {
                    step: edge.from.clone(),
                });
            }
            if !pairs.insert((edge.from.as_str(), edge.to.as_str())) {
                return Err(SluiceError::InvalidPipeline(format!(
                    "duplicate edge '{}' -> '{}'",
                    edge.from, edge.to
                )));
            }
        }

        self.execution_order().map(|_| ())
    }

    /// Topological order of step indices (Kahn's algorithm).
    ///
    /// Ties are broken by step declaration order, so the order is stable
    /// for a given definition.
    pub fn execution_order(&self) -> Result<Vec<usize>> {
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.steps.len()];
        let mut outgoing: Vec<Vec<usize>> = vec![vec![]; self.steps.len()];
        for edge in &self.edges {
            let from = *index
                .get(edge.from.as_str())
                .ok_or_else(|| SluiceError::StepNotFound(edge.from.clone()))?;
            let to = *index
                .get(edge.to.as_str())
                .ok_or_else(|| SluiceError::StepNotFound(edge.to.clone()))?;
            outgoing[from].push(to);
            in_degree[to] += 1;
        }

        let mut ready: BTreeSet<usize> = (0..self.steps.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &next in &outgoing[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != self.steps.len() {
            let stuck = (0..self.steps.len())
                .find(|i| in_degree[*i] > 0)
                .map(|i| self.steps[i].key.clone())
                .unwrap_or_default();
            return Err(SluiceError::CycleDetected { step: stuck });
        }
        Ok(order)
    }
}

fn validate_gate(key: &str, gate: &GateConfig) -> Result<()> {
    match gate.approval_type {
        ApprovalType::Timeout if gate.timeout_seconds.is_none() => {
            Err(SluiceError::InvalidPipeline(format!(
                "TIMEOUT gate '{key}' needs timeoutSeconds"
            )))
        }
        ApprovalType::Threshold
            if gate
                .threshold_percent
                .is_some_and(|p| !(0.0..=100.0).contains(&p)) =>
        {
            Err(SluiceError::InvalidPipeline(format!(
                "THRESHOLD gate '{key}' thresholdPercent must be within 0..=100"
            )))
        }
        _ => Ok(()),
    }
}
