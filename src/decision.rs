//! Decision points (spec.md §3 "Decision", §4.7 "Decision Protocol")

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which gate kind produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Agent-in-the-loop.
    Ail,
    /// Human-in-the-loop.
    Hil,
}

/// Resolution of a decision gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Proceed to the next layer.
    Continue,
    /// Abort the workflow.
    Abort,
    /// HIL approval granted.
    Approve,
    /// HIL approval denied.
    Reject,
    /// Replan succeeded and changed the plan.
    ReplanSuccess,
    /// Replan was rejected (rate limit exceeded).
    ReplanRejected,
    /// Replan failed (planner unavailable).
    ReplanFailed,
    /// Replan returned an unchanged DAG.
    ReplanNoChanges,
    /// No command arrived before the gate's timeout elapsed.
    Timeout,
}

/// A single append-only decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// AIL or HIL.
    pub kind: DecisionKind,
    /// When the decision was recorded.
    pub timestamp: DateTime<Utc>,
    /// Human-oriented description of what was being decided.
    pub description: String,
    /// The resolved outcome.
    pub outcome: DecisionOutcome,
    /// Arbitrary metadata (e.g. escalation correlation id, replan requirement).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Decision {
    /// Build a decision record, stamping the current time.
    pub fn new(
        kind: DecisionKind,
        description: impl Into<String>,
        outcome: DecisionOutcome,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            description: description.into(),
            outcome,
            metadata,
        }
    }
}
