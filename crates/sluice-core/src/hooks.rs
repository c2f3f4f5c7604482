use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::StepKind;

/// Lifecycle points at which hook actions run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookStage {
    BeforeExtract,
    AfterExtract,
    BeforeTransform,
    AfterTransform,
    BeforeValidate,
    AfterValidate,
    BeforeEnrich,
    AfterEnrich,
    BeforeRoute,
    AfterRoute,
    BeforeLoad,
    AfterLoad,
    PipelineStarted,
    PipelineCompleted,
    PipelineFailed,
    OnError,
    OnRetry,
    OnDeadLetter,
}

impl HookStage {
    pub const ALL: [HookStage; 18] = [
        Self::BeforeExtract,
        Self::AfterExtract,
        Self::BeforeTransform,
        Self::AfterTransform,
        Self::BeforeValidate,
        Self::AfterValidate,
        Self::BeforeEnrich,
        Self::AfterEnrich,
        Self::BeforeRoute,
        Self::AfterRoute,
        Self::BeforeLoad,
        Self::AfterLoad,
        Self::PipelineStarted,
        Self::PipelineCompleted,
        Self::PipelineFailed,
        Self::OnError,
        Self::OnRetry,
        Self::OnDeadLetter,
    ];

    /// Stage run before a step of `kind`. EXPORT, FEED and SINK share the load stages.
    pub fn before(kind: StepKind) -> Option<Self> {
        match kind {
            StepKind::Extract => Some(Self::BeforeExtract),
            StepKind::Transform => Some(Self::BeforeTransform),
            StepKind::Validate => Some(Self::BeforeValidate),
            StepKind::Enrich => Some(Self::BeforeEnrich),
            StepKind::Route => Some(Self::BeforeRoute),
            StepKind::Load | StepKind::Export | StepKind::Feed | StepKind::Sink => {
                Some(Self::BeforeLoad)
            }
            StepKind::Gate => None,
        }
    }

    pub fn after(kind: StepKind) -> Option<Self> {
        match kind {
            StepKind::Extract => Some(Self::AfterExtract),
            StepKind::Transform => Some(Self::AfterTransform),
            StepKind::Validate => Some(Self::AfterValidate),
            StepKind::Enrich => Some(Self::AfterEnrich),
            StepKind::Route => Some(Self::AfterRoute),
            StepKind::Load | StepKind::Export | StepKind::Feed | StepKind::Sink => {
                Some(Self::AfterLoad)
            }
            StepKind::Gate => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeExtract => "beforeExtract",
            Self::AfterExtract => "afterExtract",
            Self::BeforeTransform => "beforeTransform",
            Self::AfterTransform => "afterTransform",
            Self::BeforeValidate => "beforeValidate",
            Self::AfterValidate => "afterValidate",
            Self::BeforeEnrich => "beforeEnrich",
            Self::AfterEnrich => "afterEnrich",
            Self::BeforeRoute => "beforeRoute",
            Self::AfterRoute => "afterRoute",
            Self::BeforeLoad => "beforeLoad",
            Self::AfterLoad => "afterLoad",
            Self::PipelineStarted => "pipelineStarted",
            Self::PipelineCompleted => "pipelineCompleted",
            Self::PipelineFailed => "pipelineFailed",
            Self::OnError => "onError",
            Self::OnRetry => "onRetry",
            Self::OnDeadLetter => "onDeadLetter",
        }
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// One configured action at a hook stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HookAction {
    /// A named in-process interceptor.
    Interceptor {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    /// A line-oriented record script.
    #[serde(rename_all = "camelCase")]
    Script {
        code: String,
        #[serde(default)]
        args: serde_json::Value,
        #[serde(default = "default_fail_on_error")]
        fail_on_error: bool,
    },
    /// POST the batch summary to a URL.
    Webhook { url: String },
    Log {
        #[serde(default)]
        level: LogLevel,
        #[serde(default)]
        message: Option<String>,
    },
    /// Publish a named event on the bus.
    Emit { event: String },
    /// Start another registered pipeline with the current batch as seed.
    TriggerPipeline { pipeline: String },
}

fn default_fail_on_error() -> bool {
    true
}

impl HookAction {
    /// Whether the action may replace the batch it receives.
    pub fn rewrites_batch(&self) -> bool {
        matches!(self, Self::Interceptor { .. } | Self::Script { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Interceptor { .. } => "interceptor",
            Self::Script { .. } => "script",
            Self::Webhook { .. } => "webhook",
            Self::Log { .. } => "log",
            Self::Emit { .. } => "emit",
            Self::TriggerPipeline { .. } => "triggerPipeline",
        }
    }
}

/// Hook actions per stage, run in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineHooks(BTreeMap<HookStage, Vec<HookAction>>);

impl PipelineHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: HookStage, action: HookAction) -> Self {
        self.add(stage, action);
        self
    }

    pub fn add(&mut self, stage: HookStage, action: HookAction) {
        self.0.entry(stage).or_default().push(action);
    }

    pub fn actions(&self, stage: HookStage) -> &[HookAction] {
        self.0.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eighteen_stages() {
        assert_eq!(HookStage::ALL.len(), 18);
        let names: std::collections::HashSet<_> =
            HookStage::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(names.len(), 18);
    }

    #[test]
    fn output_kinds_share_load_stages() {
        for kind in [StepKind::Load, StepKind::Export, StepKind::Feed, StepKind::Sink] {
            assert_eq!(HookStage::before(kind), Some(HookStage::BeforeLoad));
            assert_eq!(HookStage::after(kind), Some(HookStage::AfterLoad));
        }
        assert_eq!(HookStage::before(StepKind::Gate), None);
    }

    #[test]
    fn parses_tagged_actions() {
        let hooks: PipelineHooks = serde_json::from_value(json!({
            "afterExtract": [
                {"type": "script", "code": "set a = true"},
                {"type": "interceptor", "name": "dedupe"},
                {"type": "triggerPipeline", "pipeline": "audit"}
            ],
            "onDeadLetter": [{"type": "log", "level": "warn"}]
        }))
        .unwrap();

        let after = hooks.actions(HookStage::AfterExtract);
        assert_eq!(after.len(), 3);
        assert!(matches!(
            &after[0],
            HookAction::Script { fail_on_error: true, .. }
        ));
        assert!(after[1].rewrites_batch());
        assert!(!after[2].rewrites_batch());
        assert!(hooks.actions(HookStage::BeforeLoad).is_empty());
        assert!(matches!(
            hooks.actions(HookStage::OnDeadLetter)[0],
            HookAction::Log { level: LogLevel::Warn, .. }
        ));
    }

    #[test]
    fn script_fail_on_error_can_be_disabled() {
        let action: HookAction = serde_json::from_value(json!({
            "type": "script",
            "code": "fail nope",
            "failOnError": false
        }))
        .unwrap();
        assert!(matches!(action, HookAction::Script { fail_on_error: false, .. }));
    }
}
