use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SluiceError;
use crate::pipeline::PipelineDefinition;

/// A single record: field name to JSON value, in insertion order.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a pipeline run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "TIMEOUT" => Ok(Self::Timeout),
            other => Err(SluiceError::Config(format!("unknown run status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    Extract,
    Transform,
    Validate,
    Enrich,
    Route,
    Load,
    Export,
    Feed,
    Sink,
    Gate,
}

impl StepKind {
    pub const ALL: [StepKind; 10] = [
        Self::Extract,
        Self::Transform,
        Self::Validate,
        Self::Enrich,
        Self::Route,
        Self::Load,
        Self::Export,
        Self::Feed,
        Self::Sink,
        Self::Gate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "EXTRACT",
            Self::Transform => "TRANSFORM",
            Self::Validate => "VALIDATE",
            Self::Enrich => "ENRICH",
            Self::Route => "ROUTE",
            Self::Load => "LOAD",
            Self::Export => "EXPORT",
            Self::Feed => "FEED",
            Self::Sink => "SINK",
            Self::Gate => "GATE",
        }
    }

    /// Kinds that write to an outside system rather than transform in place.
    pub fn is_output(&self) -> bool {
        matches!(self, Self::Load | Self::Export | Self::Feed | Self::Sink)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == upper)
            .ok_or_else(|| SluiceError::Config(format!("unknown step kind: {s}")))
    }
}

/// Outcome of one adapter invocation.
///
/// `records: None` forwards the input batch less the records reported as
/// failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub ok: usize,
    pub fail: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<Record>>,
}

impl StepResult {
    pub fn passthrough(ok: usize) -> Self {
        Self {
            ok,
            fail: 0,
            records: None,
        }
    }

    pub fn with_records(records: Vec<Record>, fail: usize) -> Self {
        Self {
            ok: records.len(),
            fail,
            records: Some(records),
        }
    }
}

/// `input` less one occurrence of each record in `failed`.
pub fn without_failed<'a>(input: Vec<Record>, failed: impl IntoIterator<Item = &'a Record>) -> Vec<Record> {
    let mut failed: Vec<&Record> = failed.into_iter().collect();
    if failed.is_empty() {
        return input;
    }
    input
        .into_iter()
        .filter(|record| match failed.iter().position(|f| *f == record) {
            Some(i) => {
                failed.swap_remove(i);
                false
            }
            None => true,
        })
        .collect()
}

/// A record that failed processing, persisted per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub run_id: RunId,
    pub step_key: String,
    pub message: String,
    pub record: Record,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Success and error counts accumulated over completed steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub success_count: u64,
    pub error_count: u64,
}

impl PipelineStats {
    pub fn absorb(&mut self, ok: usize, fail: usize) {
        self.success_count += ok as u64;
        self.error_count += fail as u64;
    }

    pub fn total(&self) -> u64 {
        self.success_count + self.error_count
    }

    /// Error rate in `[0, 1]`, or `None` if nothing has been counted.
    pub fn error_rate(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.error_count as f64 / total as f64),
        }
    }
}

/// Run-level failure with the step that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_key: Option<String>,
    pub message: String,
}

/// A pipeline run as persisted by the run store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: RunId,
    pub pipeline_code: String,
    pub definition: PipelineDefinition,
    #[serde(default)]
    pub seed: Vec<Record>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
    #[serde(default)]
    pub stats: PipelineStats,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(definition: PipelineDefinition, seed: Vec<Record>) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            pipeline_code: definition.code.clone(),
            definition,
            seed,
            status: RunStatus::Pending,
            error: None,
            stats: PipelineStats::default(),
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to `status`, stamping `finished_at` for terminal states.
    pub fn transition(&mut self, status: RunStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.finished_at = Some(now);
        }
    }
}
