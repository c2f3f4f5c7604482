//! Run checkpoint model.
//!
//! In memory a checkpoint is a tagged structure: engine bookkeeping on one
//! side, per-step adapter state on the other. Stores see a flat map of
//! string keys, where engine entries carry reserved `__` prefixes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, SluiceError};
use crate::pipeline::ApprovalType;
use crate::types::{PipelineStats, Record};

pub const GATE_PREFIX: &str = "__gate:";
pub const GATE_TIMEOUT_PREFIX: &str = "__gateTimeout:";
pub const GATE_APPROVED_PREFIX: &str = "__gateApproved:";
pub const PIPELINE_STATS_KEY: &str = "__pipelineStats";
pub const STEP_OUTPUT_PREFIX: &str = "__stepOutput:";
const RESERVED_PREFIX: &str = "__";

/// Flat checkpoint representation exchanged with a checkpoint store.
pub type CheckpointMap = BTreeMap<String, Value>;

/// Snapshot taken when a gate pauses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateCheckpoint {
    pub approval_type: ApprovalType,
    pub pending_record_count: usize,
    pub pending_records: Vec<Record>,
    pub paused_at: DateTime<Utc>,
}

/// Auto-approval deadline of a TIMEOUT gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateTimeout {
    pub expires_at: DateTime<Utc>,
    pub timeout_seconds: u64,
    pub paused_at: DateTime<Utc>,
}

impl GateTimeout {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Approval marker, consumed when the scheduler revisits the gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateApproval {
    pub approved_at: DateTime<Utc>,
}

/// Output of a completed step, replayed on resume instead of re-running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    pub ok: usize,
    pub fail: usize,
    pub records: Vec<Record>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineState {
    pub gates: BTreeMap<String, GateCheckpoint>,
    pub gate_timeouts: BTreeMap<String, GateTimeout>,
    pub gate_approvals: BTreeMap<String, GateApproval>,
    pub stats: Option<PipelineStats>,
    pub step_outputs: BTreeMap<String, StepOutput>,
}

impl EngineState {
    /// Gates holding a snapshot and waiting for approval.
    pub fn awaiting_gates(&self) -> impl Iterator<Item = &str> {
        self.gates
            .keys()
            .filter(|k| !self.gate_approvals.contains_key(*k))
            .map(String::as_str)
    }

    /// Drop every trace of a gate once its batch has been forwarded.
    pub fn clear_gate(&mut self, step_key: &str) {
        self.gates.remove(step_key);
        self.gate_timeouts.remove(step_key);
        self.gate_approvals.remove(step_key);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    pub engine: EngineState,
    pub adapters: BTreeMap<String, Value>,
}

impl Checkpoint {
    /// Rebuild the tagged form from a store map.
    ///
    /// Unknown reserved keys are skipped with a warning.
    pub fn from_map(map: &CheckpointMap) -> Result<Self> {
        let mut cp = Self::default();
        for (key, value) in map {
            if let Some(step) = key.strip_prefix(GATE_PREFIX) {
                cp.engine
                    .gates
                    .insert(step.to_string(), serde_json::from_value(value.clone())?);
            } else if let Some(step) = key.strip_prefix(GATE_TIMEOUT_PREFIX) {
                cp.engine
                    .gate_timeouts
                    .insert(step.to_string(), serde_json::from_value(value.clone())?);
            } else if let Some(step) = key.strip_prefix(GATE_APPROVED_PREFIX) {
                cp.engine
                    .gate_approvals
                    .insert(step.to_string(), serde_json::from_value(value.clone())?);
            } else if let Some(step) = key.strip_prefix(STEP_OUTPUT_PREFIX) {
                cp.engine
                    .step_outputs
                    .insert(step.to_string(), serde_json::from_value(value.clone())?);
            } else if key == PIPELINE_STATS_KEY {
                cp.engine.stats = Some(serde_json::from_value(value.clone())?);
            } else if key.starts_with(RESERVED_PREFIX) {
                warn!(key = %key, "Skipping unknown reserved checkpoint entry");
            } else {
                cp.adapters.insert(key.clone(), value.clone());
            }
        }
        Ok(cp)
    }

    /// Flatten into the prefixed key map a checkpoint store persists.
    pub fn to_map(&self) -> Result<CheckpointMap> {
        let mut map = CheckpointMap::new();
        for (step, gate) in &self.engine.gates {
            map.insert(format!("{GATE_PREFIX}{step}"), serde_json::to_value(gate)?);
        }
        for (step, timeout) in &self.engine.gate_timeouts {
            map.insert(
                format!("{GATE_TIMEOUT_PREFIX}{step}"),
                serde_json::to_value(timeout)?,
            );
        }
        for (step, approval) in &self.engine.gate_approvals {
            map.insert(
                format!("{GATE_APPROVED_PREFIX}{step}"),
                serde_json::to_value(approval)?,
            );
        }
        for (step, output) in &self.engine.step_outputs {
            map.insert(
                format!("{STEP_OUTPUT_PREFIX}{step}"),
                serde_json::to_value(output)?,
            );
        }
        if let Some(stats) = &self.engine.stats {
            map.insert(PIPELINE_STATS_KEY.to_string(), serde_json::to_value(stats)?);
        }
        for (step, value) in &self.adapters {
            map.insert(step.clone(), value.clone());
        }
        Ok(map)
    }

    pub fn adapter_state(&self, step_key: &str) -> Option<&Value> {
        self.adapters.get(step_key)
    }

    /// Store adapter state for a step. Reserved keys are rejected.
    pub fn set_adapter_state(&mut self, step_key: &str, value: Value) -> Result<()> {
        if step_key.starts_with(RESERVED_PREFIX) {
            return Err(SluiceError::InvalidPipeline(format!(
                "adapter checkpoint key '{step_key}' uses the reserved '__' prefix"
            )));
        }
        self.adapters.insert(step_key.to_string(), value);
        Ok(())
    }
}
