//! End-to-end scenarios from spec.md §8 ("End-to-end scenarios (literal)")
//! that need the full executor wired up against scripted collaborators
//! rather than a single module in isolation.

use std::collections::HashMap;
use std::sync::Arc;

use dagctl::config::{AilConfig, AilDecisionPoint, HilConfig};
use dagctl::decision_protocol::HilMode;
use dagctl::testing::{
    FakeCapabilityStore, FakePlanner, FakeToolExecutor, FixedPredictor, InMemoryCheckpointer,
    ScriptedSandbox,
};
use dagctl::{Collaborators, Command, Config, Dag, DagExecutor, PermissionSet, SandboxConfig, Task, TaskType};

fn remote_task(id: &str, deps: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        task_type: TaskType::RemoteTool,
        tool: Some(id.to_string()),
        arguments: HashMap::new(),
        dependencies: deps.iter().map(|s| s.to_string()).collect(),
        code: None,
        capability_id: None,
        side_effects: false,
        sandbox: None,
    }
}

fn collaborators(tool_executor: Arc<FakeToolExecutor>) -> Collaborators {
    Collaborators {
        tool_executor,
        sandbox: Arc::new(ScriptedSandbox::always_succeeds(serde_json::Value::Null)),
        capability_store: Arc::new(FakeCapabilityStore::new()),
        planner: Arc::new(FakePlanner::new(|dag, _, _, _| Ok(dag.clone()))),
        checkpointer: Arc::new(InMemoryCheckpointer::new()),
        predictor: Arc::new(FixedPredictor::none()),
    }
}

/// Scenario 4: DAG = [A, B(dep A)], AIL per_layer enabled, agent sends
/// `replan_dag` after A. Planner returns A, B, C(dep A). Expected a
/// `decision_required(AIL)` after layer 0, a new layer plan including C, a
/// `replan_success` decision in state, final total tasks = 3.
#[tokio::test]
async fn replan_after_layer_zero_adds_a_third_task() {
    let dag = Dag::new(vec![remote_task("A", &[]), remote_task("B", &["A"])]);

    let collaborators = Collaborators {
        tool_executor: Arc::new(FakeToolExecutor::new()),
        sandbox: Arc::new(ScriptedSandbox::always_succeeds(serde_json::Value::Null)),
        capability_store: Arc::new(FakeCapabilityStore::new()),
        planner: Arc::new(FakePlanner::new(|dag, _, _, _| {
            Ok(dag.with_additional_tasks(vec![remote_task("C", &["A"])]))
        })),
        checkpointer: Arc::new(InMemoryCheckpointer::new()),
        predictor: Arc::new(FixedPredictor::none()),
    };

    let config = Config {
        ail: AilConfig {
            enabled: true,
            decision_points: AilDecisionPoint::PerLayer,
        },
        ..Config::default()
    };

    let executor = DagExecutor::new(collaborators, config).unwrap();
    let handle = executor.execute(dag, None).await;

    let mut ail_decision_required_count = 0;
    let mut replanned = false;
    while let Some(event) = handle.events.recv().await {
        if let dagctl::EventPayload::DecisionRequired { kind, .. } = &event.payload {
            if matches!(kind, dagctl::decision::DecisionKind::Ail) {
                ail_decision_required_count += 1;
                if !replanned {
                    replanned = true;
                    handle.enqueue_command(Command::ReplanDag {
                        requirement: "add a verification step".to_string(),
                        context: HashMap::new(),
                        reason: None,
                    });
                } else {
                    handle.enqueue_command(Command::Continue { reason: None });
                }
            }
        }
    }

    assert_eq!(ail_decision_required_count, 2);
    let state = handle.join().await.unwrap();
    assert_eq!(state.successful_count(), 3);
    assert!(state
        .decisions
        .iter()
        .any(|d| d.outcome == dagctl::DecisionOutcome::ReplanSuccess));
}

/// Scenario 5: DAG = [A(code, minimal permissions doing network read)].
/// Sandbox returns permission-denied. HIL escalation emitted; approver
/// sends `permission_escalation_response{approved:true, set: network}`.
/// Expected: A retried with the widened set, succeeds; one
/// `decision_required(HIL)` and one `task_complete` for A.
#[tokio::test]
async fn permission_escalation_retries_with_widened_grant_and_succeeds() {
    let sandbox = Arc::new(ScriptedSandbox::denies_then_succeeds(
        1,
        "network",
        serde_json::json!({"fetched": true}),
    ));

    let task = Task {
        id: "A".to_string(),
        task_type: TaskType::SandboxedCode,
        tool: None,
        arguments: HashMap::new(),
        dependencies: vec![],
        code: Some("fetch('https://example.com')".to_string()),
        capability_id: None,
        side_effects: true,
        sandbox: Some(SandboxConfig {
            permission_set: PermissionSet::minimal(),
            ..Default::default()
        }),
    };
    let dag = Dag::new(vec![task]);

    let collaborators = Collaborators {
        tool_executor: Arc::new(FakeToolExecutor::new()),
        sandbox,
        capability_store: Arc::new(FakeCapabilityStore::new()),
        planner: Arc::new(FakePlanner::new(|dag, _, _, _| Ok(dag.clone()))),
        checkpointer: Arc::new(InMemoryCheckpointer::new()),
        predictor: Arc::new(FixedPredictor::none()),
    };

    let executor = DagExecutor::new(collaborators, Config::default()).unwrap();
    let handle = executor.execute(dag, None).await;

    let mut decision_required_count = 0;
    let mut task_complete_count = 0;
    while let Some(event) = handle.events.recv().await {
        match &event.payload {
            dagctl::EventPayload::DecisionRequired { kind, .. }
                if matches!(kind, dagctl::decision::DecisionKind::Hil) =>
            {
                decision_required_count += 1;
                handle.enqueue_command(Command::PermissionEscalationResponse {
                    approved: true,
                    widened_permissions: vec!["network".to_string()],
                    reason: None,
                });
            }
            dagctl::EventPayload::TaskComplete { .. } => task_complete_count += 1,
            _ => {}
        }
    }

    assert_eq!(decision_required_count, 1);
    assert_eq!(task_complete_count, 1);
    let state = handle.join().await.unwrap();
    assert_eq!(state.successful_count(), 1);
}

/// Scenario 6: a two-layer workflow interrupted after the layer-0
/// checkpoint; `resume(dag, ckpt_id)` invoked. Expected: the resumed event
/// stream begins with a fresh `workflow_start`, skips all layer-0 events,
/// emits layer-1 events only; final state contains results for both layers.
#[tokio::test]
async fn resume_from_layer_zero_checkpoint_skips_completed_layer() {
    let dag = Dag::new(vec![remote_task("A", &[]), remote_task("B", &["A"])]);
    let checkpointer = Arc::new(InMemoryCheckpointer::new());

    let collaborators = Collaborators {
        tool_executor: Arc::new(FakeToolExecutor::new()),
        sandbox: Arc::new(ScriptedSandbox::always_succeeds(serde_json::Value::Null)),
        capability_store: Arc::new(FakeCapabilityStore::new()),
        planner: Arc::new(FakePlanner::new(|dag, _, _, _| Ok(dag.clone()))),
        checkpointer: checkpointer.clone(),
        predictor: Arc::new(FixedPredictor::none()),
    };

    let executor = DagExecutor::new(collaborators, Config::default()).unwrap();
    let handle = executor.execute(dag.clone(), None).await;
    while handle.events.recv().await.is_some() {}
    let full_run_state = handle.join().await.unwrap();
    assert_eq!(full_run_state.successful_count(), 2);

    // Find the checkpoint saved at layer 0 (the first of the two layers).
    let layer_zero_checkpoint_id = checkpointer
        .checkpoint_id_for_layer(0)
        .expect("layer 0 checkpoint was saved");

    let resumed_tool_executor = Arc::new(FakeToolExecutor::new());
    let resumed_collaborators = Collaborators {
        tool_executor: resumed_tool_executor,
        sandbox: Arc::new(ScriptedSandbox::always_succeeds(serde_json::Value::Null)),
        capability_store: Arc::new(FakeCapabilityStore::new()),
        planner: Arc::new(FakePlanner::new(|dag, _, _, _| Ok(dag.clone()))),
        checkpointer: checkpointer.clone(),
        predictor: Arc::new(FixedPredictor::none()),
    };
    let resumed_executor = DagExecutor::new(resumed_collaborators, Config::default()).unwrap();
    let resumed_handle = resumed_executor
        .resume(dag, layer_zero_checkpoint_id)
        .await
        .unwrap();

    let mut payload_kinds = Vec::new();
    while let Some(event) = resumed_handle.events.recv().await {
        payload_kinds.push(match &event.payload {
            dagctl::EventPayload::WorkflowStart => "workflow_start",
            dagctl::EventPayload::LayerStart { .. } => "layer_start",
            dagctl::EventPayload::TaskStart { .. } => "task_start",
            dagctl::EventPayload::TaskComplete { .. } => "task_complete",
            dagctl::EventPayload::StateUpdated { .. } => "state_updated",
            dagctl::EventPayload::Checkpoint { .. } => "checkpoint",
            dagctl::EventPayload::WorkflowComplete { .. } => "workflow_complete",
            _ => "other",
        });
    }

    assert_eq!(payload_kinds.first(), Some(&"workflow_start"));
    // Only one layer's worth of per-task events: layer 0 is skipped.
    assert_eq!(
        payload_kinds.iter().filter(|k| **k == "task_start").count(),
        1
    );
    assert_eq!(
        payload_kinds.iter().filter(|k| **k == "layer_start").count(),
        1
    );

    let resumed_state = resumed_handle.join().await.unwrap();
    assert_eq!(resumed_state.successful_count(), 2);
    assert!(resumed_state.result_for("A").is_some());
    assert!(resumed_state.result_for("B").is_some());
}

/// Boundary behavior (spec.md §8): a HIL gate configured `critical_only`
/// does not fire when no task in the layer carries side effects.
#[tokio::test]
async fn hil_critical_only_does_not_gate_a_side_effect_free_layer() {
    let dag = Dag::new(vec![remote_task("A", &[])]);
    let collaborators = collaborators(Arc::new(FakeToolExecutor::new()));
    let config = Config {
        hil: HilConfig {
            enabled: true,
            approval_required: HilMode::CriticalOnly,
        },
        ..Config::default()
    };
    let executor = DagExecutor::new(collaborators, config).unwrap();
    let handle = executor.execute(dag, None).await;

    let mut saw_decision_required = false;
    while let Some(event) = handle.events.recv().await {
        if matches!(event.payload, dagctl::EventPayload::DecisionRequired { .. }) {
            saw_decision_required = true;
        }
    }
    assert!(!saw_decision_required);
    let state = handle.join().await.unwrap();
    assert_eq!(state.successful_count(), 1);
}
