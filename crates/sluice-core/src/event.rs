use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pipeline::ApprovalType;
use crate::types::{RunId, RunStatus};

/// Domain events published while pipelines run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    RunStarted {
        run_id: RunId,
        pipeline: String,
    },
    StepStarted {
        run_id: RunId,
        step_key: String,
        input: usize,
    },
    StepCompleted {
        run_id: RunId,
        step_key: String,
        ok: usize,
        fail: usize,
    },
    StepRetry {
        run_id: RunId,
        step_key: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    RecordFailed {
        run_id: RunId,
        step_key: String,
        message: String,
    },
    CircuitOpened {
        key: String,
    },
    GatePaused {
        run_id: RunId,
        step_key: String,
        approval_type: ApprovalType,
        pending: usize,
    },
    GateApproved {
        run_id: RunId,
        step_key: String,
    },
    /// A TIMEOUT gate was auto-approved by the sweep.
    GateTimedOut {
        run_id: RunId,
        step_key: String,
        configured_secs: u64,
        actual_secs: f64,
    },
    RunPaused {
        run_id: RunId,
    },
    RunCompleted {
        run_id: RunId,
        success_count: u64,
        error_count: u64,
    },
    RunFailed {
        run_id: RunId,
        step_key: Option<String>,
        error: String,
    },
    RunCancelled {
        run_id: RunId,
    },
    RunTimedOut {
        run_id: RunId,
        limit_secs: u64,
    },
    /// Published by an `emit` hook action.
    HookEmitted {
        run_id: RunId,
        event: String,
        records: usize,
    },
    ScheduleFired {
        schedule: String,
        run_id: RunId,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepRetry { run_id, .. }
            | Self::RecordFailed { run_id, .. }
            | Self::GatePaused { run_id, .. }
            | Self::GateApproved { run_id, .. }
            | Self::GateTimedOut { run_id, .. }
            | Self::RunPaused { run_id }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id }
            | Self::RunTimedOut { run_id, .. }
            | Self::HookEmitted { run_id, .. }
            | Self::ScheduleFired { run_id, .. } => Some(run_id),
            Self::CircuitOpened { .. } => None,
        }
    }

    /// The run status this event settles a run into, if any.
    pub fn final_status(&self) -> Option<RunStatus> {
        match self {
            Self::RunPaused { .. } => Some(RunStatus::Paused),
            Self::RunCompleted { .. } => Some(RunStatus::Completed),
            Self::RunFailed { .. } => Some(RunStatus::Failed),
            Self::RunCancelled { .. } => Some(RunStatus::Cancelled),
            Self::RunTimedOut { .. } => Some(RunStatus::Timeout),
            _ => None,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let run_id = RunId::from_string("r1");
        bus.publish(EngineEvent::RunPaused {
            run_id: run_id.clone(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), Some(&run_id));
        assert_eq!(event.final_status(), Some(RunStatus::Paused));
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::CircuitOpened { key: "x".into() });
    }

    #[test]
    fn serializes_with_type_tag() {
        let value = serde_json::to_value(EngineEvent::GateApproved {
            run_id: RunId::from_string("r"),
            step_key: "g".into(),
        })
        .unwrap();
        assert_eq!(value["type"], "gateApproved");
        assert_eq!(value["step_key"], "g");
    }

    #[test]
    fn emitted_event_name_sits_beside_the_tag() {
        let value = serde_json::to_value(EngineEvent::HookEmitted {
            run_id: RunId::from_string("r"),
            event: "done".into(),
            records: 3,
        })
        .unwrap();
        assert_eq!(value["type"], "hookEmitted");
        assert_eq!(value["event"], "done");
        assert_eq!(value["records"], 3);
    }
}
