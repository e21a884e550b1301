//! AIL / HIL decision gates (spec.md §4.7).
//!
//! Grounded on the teacher's `services/timer.rs` bounded-wait idiom and
//! `case.rs`'s state-transition methods, generalized into a gate procedure
//! that emits `decision_required`, blocks on the command queue with a
//! kind-specific timeout, and folds the resolution into an appended
//! [`Decision`].

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandKind, CommandQueue};
use crate::dag::Dag;
use crate::decision::{Decision, DecisionKind, DecisionOutcome};
use crate::event::{EventPayload, EventStream, ExecutionEvent};
use crate::ids::WorkflowId;
use crate::interfaces::Planner;
use crate::replanner::{ReplanOutcome, ReplannerBridge};
use crate::result::TaskResult;
use crate::state::WorkflowState;
use crate::task::Task;

/// AIL timeout (spec.md §5): silent agent defaults to continue.
pub const AIL_TIMEOUT: Duration = Duration::from_secs(60);
/// HIL timeout (spec.md §5): silent human defaults to abort.
pub const HIL_TIMEOUT: Duration = Duration::from_secs(300);
/// Permission-escalation wait (spec.md §5), used by the dispatcher's own
/// HIL-shaped gate rather than this module's per-layer gates.
pub const PERMISSION_ESCALATION_TIMEOUT: Duration = Duration::from_secs(300);

/// AIL trigger configuration (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AilMode {
    PerLayer,
    OnError,
    Manual,
    Off,
}

/// HIL trigger configuration (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HilMode {
    Always,
    CriticalOnly,
    Never,
}

/// Whether an AIL gate should run after this layer.
pub fn ail_should_trigger(mode: AilMode, layer_had_hard_error: bool) -> bool {
    match mode {
        AilMode::PerLayer => true,
        AilMode::OnError => layer_had_hard_error,
        AilMode::Manual | AilMode::Off => false,
    }
}

/// Whether a HIL gate should run after this layer. `critical_only` fires
/// when the layer contains at least one side-effecting task (spec.md §4.7).
pub fn hil_should_trigger(mode: HilMode, layer_tasks: &[Task]) -> bool {
    match mode {
        HilMode::Always => true,
        HilMode::CriticalOnly => layer_tasks.iter().any(|t| t.side_effects),
        HilMode::Never => false,
    }
}

/// What the scheduler should do after a gate resolves.
#[derive(Debug)]
pub enum GateOutcome {
    Continue,
    Abort(String),
    Replan(Dag),
}

/// Deterministic, template-driven HIL summary (spec.md §4.7). No model
/// invocation is permitted here.
pub fn build_hil_summary(
    state: &WorkflowState,
    layer_index: usize,
    current_layer_tasks: &[Task],
    next_layer_tasks: Option<&[Task]>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("layer: {}\n", layer_index));
    out.push_str(&format!(
        "successful_tasks: {} failed_tasks: {}\n",
        state.successful_count(),
        state.failed_count()
    ));

    out.push_str("recent_outcomes:\n");
    for result in state.task_results.iter().rev().take(3) {
        out.push_str(&format!(
            "  - {} [{:?}] ({} ms)\n",
            result.task_id,
            result.status,
            result.duration.as_millis()
        ));
    }

    out.push_str("current_layer:\n");
    for task in current_layer_tasks {
        let status = state
            .result_for(&task.id)
            .map(|r| format!("{:?}", r.status))
            .unwrap_or_else(|| "pending".to_string());
        out.push_str(&format!(
            "  - id={} tool={:?} dependencies={} status={}\n",
            task.id,
            task.tool,
            task.dependencies.len(),
            status
        ));
    }

    if let Some(next_tasks) = next_layer_tasks {
        out.push_str("next_layer_preview:\n");
        for task in next_tasks.iter().take(5) {
            out.push_str(&format!("  - id={} tool={:?}\n", task.id, task.tool));
        }
    }

    out
}

/// Run an AIL gate: emit, wait, and apply the outcome (including an inline
/// replan round-trip, since `replan_dag` is only legal during an AIL gate).
#[allow(clippy::too_many_arguments)]
pub async fn run_ail_gate(
    queue: &CommandQueue,
    stream: &EventStream,
    workflow_id: WorkflowId,
    description: String,
    replanner: &ReplannerBridge,
    planner: &dyn Planner,
    current_dag: &Dag,
    completed_results: &[TaskResult],
) -> (Decision, GateOutcome) {
    stream
        .publish(ExecutionEvent::new(
            workflow_id,
            EventPayload::DecisionRequired {
                kind: DecisionKind::Ail,
                description: description.clone(),
                summary: None,
            },
        ))
        .await;

    let command = queue
        .wait_for_decision(
            &[CommandKind::Continue, CommandKind::Abort, CommandKind::ReplanDag],
            AIL_TIMEOUT,
        )
        .await;

    match command {
        None => (
            Decision::new(DecisionKind::Ail, description, DecisionOutcome::Timeout, HashMap::new()),
            GateOutcome::Continue,
        ),
        Some(Command::Continue { .. }) => (
            Decision::new(DecisionKind::Ail, description, DecisionOutcome::Continue, HashMap::new()),
            GateOutcome::Continue,
        ),
        Some(Command::Abort { reason }) => {
            let message = reason.unwrap_or_else(|| "aborted by agent".to_string());
            let mut metadata = HashMap::new();
            metadata.insert("reason".to_string(), serde_json::json!(message.clone()));
            (
                Decision::new(DecisionKind::Ail, description, DecisionOutcome::Abort, metadata),
                GateOutcome::Abort(message),
            )
        }
        Some(Command::ReplanDag {
            requirement,
            context,
            ..
        }) => {
            let outcome = replanner
                .replan(planner, current_dag, completed_results, &requirement, &context)
                .await;
            let mut metadata = HashMap::new();
            metadata.insert("requirement".to_string(), serde_json::json!(requirement));
            match outcome {
                ReplanOutcome::Success(new_dag) => (
                    Decision::new(
                        DecisionKind::Ail,
                        description,
                        DecisionOutcome::ReplanSuccess,
                        metadata,
                    ),
                    GateOutcome::Replan(new_dag),
                ),
                ReplanOutcome::Rejected => (
                    Decision::new(
                        DecisionKind::Ail,
                        description,
                        DecisionOutcome::ReplanRejected,
                        metadata,
                    ),
                    GateOutcome::Continue,
                ),
                ReplanOutcome::Failed(reason) => {
                    metadata.insert("error".to_string(), serde_json::json!(reason));
                    (
                        Decision::new(
                            DecisionKind::Ail,
                            description,
                            DecisionOutcome::ReplanFailed,
                            metadata,
                        ),
                        GateOutcome::Continue,
                    )
                }
                ReplanOutcome::NoChanges => (
                    Decision::new(
                        DecisionKind::Ail,
                        description,
                        DecisionOutcome::ReplanNoChanges,
                        metadata,
                    ),
                    GateOutcome::Continue,
                ),
            }
        }
        // The queue only dispenses the kinds requested above; any other
        // variant would indicate a filtering bug upstream. Fail safe by
        // treating it as a no-op continue rather than panicking.
        Some(_) => (
            Decision::new(DecisionKind::Ail, description, DecisionOutcome::Continue, HashMap::new()),
            GateOutcome::Continue,
        ),
    }
}

/// Run a HIL gate: emit with a rendered summary, wait, and apply the
/// outcome. Silent timeout defaults to abort (spec.md §9).
pub async fn run_hil_gate(
    queue: &CommandQueue,
    stream: &EventStream,
    workflow_id: WorkflowId,
    description: String,
    summary: String,
) -> (Decision, GateOutcome) {
    stream
        .publish(ExecutionEvent::new(
            workflow_id,
            EventPayload::DecisionRequired {
                kind: DecisionKind::Hil,
                description: description.clone(),
                summary: Some(summary),
            },
        ))
        .await;

    let command = queue
        .wait_for_decision(&[CommandKind::ApprovalResponse, CommandKind::Abort], HIL_TIMEOUT)
        .await;

    match command {
        None => (
            Decision::new(DecisionKind::Hil, description.clone(), DecisionOutcome::Timeout, HashMap::new()),
            GateOutcome::Abort(format!("HIL decision \"{description}\" timed out")),
        ),
        Some(Command::Abort { reason }) => {
            let message = reason.unwrap_or_else(|| "aborted by reviewer".to_string());
            (
                Decision::new(DecisionKind::Hil, description, DecisionOutcome::Abort, HashMap::new()),
                GateOutcome::Abort(message),
            )
        }
        Some(Command::ApprovalResponse {
            approved: true, ..
        }) => (
            Decision::new(DecisionKind::Hil, description, DecisionOutcome::Approve, HashMap::new()),
            GateOutcome::Continue,
        ),
        Some(Command::ApprovalResponse {
            approved: false,
            reason,
        }) => {
            let message = reason.unwrap_or_else(|| "HIL approval rejected".to_string());
            (
                Decision::new(DecisionKind::Hil, description, DecisionOutcome::Reject, HashMap::new()),
                GateOutcome::Abort(message),
            )
        }
        Some(_) => (
            Decision::new(DecisionKind::Hil, description.clone(), DecisionOutcome::Timeout, HashMap::new()),
            GateOutcome::Abort(format!("HIL decision \"{description}\" timed out")),
        ),
    }
}
