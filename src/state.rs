//! Workflow state and its pure reducers (spec.md §4.5)
//!
//! Mutation is exclusively through [`apply`], called by the scheduler (the
//! single writer). Readers obtain a deep-structural clone via
//! [`WorkflowState::snapshot`], never a live reference.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ExecutorError, ExecutorResult};
use crate::ids::WorkflowId;
use crate::result::TaskResult;
use crate::decision::Decision;

/// Append-only workflow state (spec.md §3 "WorkflowState").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Workflow this state belongs to.
    pub workflow_id: WorkflowId,
    /// Index of the layer currently being (or about to be) executed.
    pub current_layer: usize,
    /// Task results in completion order.
    pub task_results: Vec<TaskResult>,
    /// Decisions in the order they were recorded.
    pub decisions: Vec<Decision>,
    /// Arbitrary derived context (e.g. agent-supplied replan context).
    pub context: HashMap<String, serde_json::Value>,
}

impl WorkflowState {
    /// A fresh state for a new workflow run.
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            current_layer: 0,
            task_results: Vec::new(),
            decisions: Vec::new(),
            context: HashMap::new(),
        }
    }

    /// Deep-structural snapshot for readers.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Look up the result for `task_id`, if it has completed.
    pub fn result_for(&self, task_id: &str) -> Option<&TaskResult> {
        self.task_results.iter().find(|r| r.task_id == task_id)
    }

    /// Count of successful task results.
    pub fn successful_count(&self) -> usize {
        self.task_results
            .iter()
            .filter(|r| r.status == crate::result::TaskStatus::Success)
            .count()
    }

    /// Count of hard-failed task results.
    pub fn failed_count(&self) -> usize {
        self.task_results
            .iter()
            .filter(|r| r.status == crate::result::TaskStatus::Error)
            .count()
    }

    /// Most recently completed tool identifier, used by speculation
    /// validation (spec.md §4.9).
    pub fn last_completed_tool(&self, dag: &crate::dag::Dag) -> Option<String> {
        self.task_results
            .iter()
            .rev()
            .find(|r| r.status == crate::result::TaskStatus::Success)
            .and_then(|r| dag.get(&r.task_id))
            .and_then(|t| t.tool.clone())
    }
}

/// A pure, additive change to be folded into a [`WorkflowState`].
#[derive(Debug, Clone, Default)]
pub struct StateDelta {
    /// Newly completed task results (must not re-key an existing task).
    pub new_results: Vec<TaskResult>,
    /// Newly recorded decisions.
    pub new_decisions: Vec<Decision>,
    /// Replacement layer index, if advancing.
    pub layer_index: Option<usize>,
    /// Context keys to add or overwrite.
    pub context_updates: HashMap<String, serde_json::Value>,
}

impl StateDelta {
    /// A delta containing just one task result.
    pub fn single_result(result: TaskResult) -> Self {
        Self {
            new_results: vec![result],
            ..Default::default()
        }
    }

    /// A delta containing just one decision.
    pub fn single_decision(decision: Decision) -> Self {
        Self {
            new_decisions: vec![decision],
            ..Default::default()
        }
    }
}

/// Fold `delta` into `state`, returning the new state.
///
/// Invariants enforced (spec.md §4.5): task results are keyed by task id and
/// never overwritten; decisions are append-only; the current-layer index is
/// monotonically non-decreasing (replans keep it unchanged but expand the
/// layer vector elsewhere, never through this reducer).
pub fn apply(state: &WorkflowState, delta: StateDelta) -> ExecutorResult<WorkflowState> {
    let mut next = state.clone();

    for result in delta.new_results {
        if next.result_for(&result.task_id).is_some() {
            return Err(ExecutorError::Internal(format!(
                "task {} already has a recorded result",
                result.task_id
            )));
        }
        next.task_results.push(result);
    }

    next.decisions.extend(delta.new_decisions);

    if let Some(layer_index) = delta.layer_index {
        if layer_index < next.current_layer {
            return Err(ExecutorError::Internal(format!(
                "layer index may not move backwards: {} -> {}",
                next.current_layer, layer_index
            )));
        }
        next.current_layer = layer_index;
    }

    next.context.extend(delta.context_updates);

    Ok(next)
}

/// Identity check helper for tests/invariant monitors: the number of
/// recorded task results never decreases across an `apply` call.
pub fn is_monotonic(before: &WorkflowState, after: &WorkflowState) -> bool {
    after.task_results.len() >= before.task_results.len()
        && after.decisions.len() >= before.decisions.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{DecisionKind, DecisionOutcome};
    use std::time::Duration;

    #[test]
    fn apply_is_additive_and_monotonic() {
        let state = WorkflowState::new(WorkflowId::new());
        let delta = StateDelta::single_result(TaskResult::success(
            "A".to_string(),
            serde_json::json!({"ok": true}),
            Duration::from_millis(5),
        ));
        let next = apply(&state, delta).unwrap();
        assert!(is_monotonic(&state, &next));
        assert_eq!(next.task_results.len(), 1);
        assert_eq!(next.current_layer, 0);
    }

    #[test]
    fn duplicate_task_result_is_rejected() {
        let state = WorkflowState::new(WorkflowId::new());
        let delta = StateDelta::single_result(TaskResult::success(
            "A".to_string(),
            serde_json::json!(null),
            Duration::from_millis(1),
        ));
        let state = apply(&state, delta.clone()).unwrap();
        assert!(apply(&state, delta).is_err());
    }

    #[test]
    fn decisions_append_only() {
        let state = WorkflowState::new(WorkflowId::new());
        let d1 = StateDelta::single_decision(Decision::new(
            DecisionKind::Ail,
            "proceed?",
            DecisionOutcome::Continue,
            HashMap::new(),
        ));
        let state = apply(&state, d1).unwrap();
        assert_eq!(state.decisions.len(), 1);
    }

    #[test]
    fn layer_index_cannot_move_backwards() {
        let state = WorkflowState::new(WorkflowId::new());
        let delta = StateDelta {
            layer_index: Some(2),
            ..Default::default()
        };
        let state = apply(&state, delta).unwrap();
        let regress = StateDelta {
            layer_index: Some(1),
            ..Default::default()
        };
        assert!(apply(&state, regress).is_err());
    }
}
