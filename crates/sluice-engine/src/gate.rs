//! Gate state machine.
//!
//! A gate is AWAITING while its snapshot sits in the checkpoint without an
//! approval marker. Approval writes the marker; the next pass over the gate
//! forwards the snapshot and clears every trace of the gate.

use chrono::{DateTime, Duration, Utc};

use sluice_core::checkpoint::{EngineState, GateCheckpoint, GateTimeout};
use sluice_core::pipeline::{ApprovalType, GateConfig};
use sluice_core::types::{PipelineStats, Record};

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// The gate did not need to stop this batch.
    Pass(Vec<Record>),
    /// A paused gate let its snapshot through, by approval or by a rule
    /// that now allows it.
    Released { records: Vec<Record>, approved: bool },
    /// The batch is held. `fresh` is true when this visit took the snapshot.
    Paused { fresh: bool },
}

/// Whether accumulated stats let a THRESHOLD gate continue.
///
/// No threshold means always continue; no counted records means pause.
pub fn threshold_allows(config: &GateConfig, stats: Option<&PipelineStats>) -> bool {
    let Some(percent) = config.threshold_percent else {
        return true;
    };
    match stats.and_then(PipelineStats::error_rate) {
        Some(rate) => rate < percent / 100.0,
        None => false,
    }
}

/// Decide what a gate does with `input`, updating the engine state in place.
pub fn evaluate(
    step_key: &str,
    config: &GateConfig,
    input: Vec<Record>,
    state: &mut EngineState,
    now: DateTime<Utc>,
) -> GateOutcome {
    if state.gate_approvals.contains_key(step_key) {
        let records = state
            .gates
            .get(step_key)
            .map(|g| g.pending_records.clone())
            .unwrap_or(input);
        state.clear_gate(step_key);
        return GateOutcome::Released {
            records,
            approved: true,
        };
    }

    if let Some(snapshot) = state.gates.get(step_key) {
        let release = match config.approval_type {
            ApprovalType::Manual => false,
            ApprovalType::Threshold => threshold_allows(config, state.stats.as_ref()),
            ApprovalType::Timeout => state
                .gate_timeouts
                .get(step_key)
                .is_some_and(|t| t.is_expired(now)),
        };
        if !release {
            return GateOutcome::Paused { fresh: false };
        }
        let records = snapshot.pending_records.clone();
        state.clear_gate(step_key);
        return GateOutcome::Released {
            records,
            approved: false,
        };
    }

    let pause = match config.approval_type {
        ApprovalType::Manual | ApprovalType::Timeout => true,
        ApprovalType::Threshold => !threshold_allows(config, state.stats.as_ref()),
    };
    if !pause {
        return GateOutcome::Pass(input);
    }

    if config.approval_type == ApprovalType::Timeout {
        let timeout_seconds = config.timeout_seconds.unwrap_or_default();
        state.gate_timeouts.insert(
            step_key.to_string(),
            GateTimeout {
                expires_at: now + Duration::seconds(timeout_seconds as i64),
                timeout_seconds,
                paused_at: now,
            },
        );
    }
    state.gates.insert(
        step_key.to_string(),
        GateCheckpoint {
            approval_type: config.approval_type,
            pending_record_count: input.len(),
            pending_records: input,
            paused_at: now,
        },
    );
    GateOutcome::Paused { fresh: true }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::checkpoint::GateApproval;
    use sluice_test_utils::numbered;

    fn stats(ok: u64, err: u64) -> Option<PipelineStats> {
        Some(PipelineStats {
            success_count: ok,
            error_count: err,
        })
    }

    #[test]
    fn threshold_compares_error_rate() {
        let s = stats(98, 2);
        assert!(threshold_allows(&GateConfig::threshold(5.0), s.as_ref()));
        assert!(!threshold_allows(&GateConfig::threshold(1.0), s.as_ref()));
        // Exactly at the threshold is not below it
        assert!(!threshold_allows(&GateConfig::threshold(2.0), s.as_ref()));
    }

    #[test]
    fn threshold_without_stats_pauses() {
        let config = GateConfig::threshold(5.0);
        assert!(!threshold_allows(&config, None));
        assert!(!threshold_allows(&config, stats(0, 0).as_ref()));
        let unset = GateConfig {
            threshold_percent: None,
            ..GateConfig::threshold(5.0)
        };
        assert!(threshold_allows(&unset, None));
    }

    #[test]
    fn threshold_gate_continues_or_pauses() {
        let mut state = EngineState {
            stats: stats(98, 2),
            ..EngineState::default()
        };
        let now = Utc::now();
        assert_eq!(
            evaluate("g", &GateConfig::threshold(5.0), numbered(3), &mut state, now),
            GateOutcome::Pass(numbered(3))
        );
        assert_eq!(
            evaluate("g", &GateConfig::threshold(1.0), numbered(3), &mut state, now),
            GateOutcome::Paused { fresh: true }
        );
        assert_eq!(state.gates["g"].pending_record_count, 3);
    }

    #[test]
    fn timeout_gate_records_deadline() {
        let mut state = EngineState::default();
        let now = Utc::now();
        let outcome = evaluate("g", &GateConfig::timeout(60), numbered(2), &mut state, now);
        assert_eq!(outcome, GateOutcome::Paused { fresh: true });
        let timeout = state.gate_timeouts["g"];
        assert_eq!(timeout.expires_at, now + Duration::seconds(60));
        assert_eq!(timeout.timeout_seconds, 60);
    }

    #[test]
    fn revisit_keeps_snapshot_and_deadline() {
        let mut state = EngineState::default();
        let first = Utc::now();
        evaluate("g", &GateConfig::timeout(60), numbered(2), &mut state, first);

        let later = first + Duration::seconds(10);
        let outcome = evaluate("g", &GateConfig::timeout(60), numbered(5), &mut state, later);
        assert_eq!(outcome, GateOutcome::Paused { fresh: false });
        assert_eq!(state.gates["g"].pending_record_count, 2);
        assert_eq!(state.gate_timeouts["g"].paused_at, first);

        let expired = first + Duration::seconds(61);
        let outcome = evaluate("g", &GateConfig::timeout(60), numbered(5), &mut state, expired);
        assert_eq!(
            outcome,
            GateOutcome::Released {
                records: numbered(2),
                approved: false
            }
        );
        assert!(state.gates.is_empty() && state.gate_timeouts.is_empty());
    }

    #[test]
    fn manual_gate_waits_for_marker() {
        let mut state = EngineState::default();
        let now = Utc::now();
        evaluate("g", &GateConfig::manual(), numbered(4), &mut state, now);
        assert_eq!(
            evaluate("g", &GateConfig::manual(), vec![], &mut state, now),
            GateOutcome::Paused { fresh: false }
        );

        state
            .gate_approvals
            .insert("g".into(), GateApproval { approved_at: now });
        assert_eq!(
            evaluate("g", &GateConfig::manual(), vec![], &mut state, now),
            GateOutcome::Released {
                records: numbered(4),
                approved: true
            }
        );
        assert!(state.gate_approvals.is_empty());
        assert!(state.awaiting_gates().next().is_none());
    }
}
