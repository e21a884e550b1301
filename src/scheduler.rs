//! The top-level driver: composes the scheduler, dispatcher, event stream,
//! command queue, checkpoint manager, decision protocol, replanner, and
//! speculative executor into one run loop (spec.md §4.1, §6).
//!
//! Grounded on the teacher's `executor.rs` `WorkflowEngine`: the same
//! `Arc`-of-collaborators composition, `new()` wiring, and background-task
//! execution model, generalized from pattern-step replay to DAG-layer
//! dispatch and given a richer external-interface surface (spec.md §6).

use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};

use crate::command::{Command, CommandKind, CommandQueue};
use crate::config::Config;
use crate::dag::{topological_layers, Dag};
use crate::decision_protocol::{
    ail_should_trigger, build_hil_summary, hil_should_trigger, run_ail_gate, run_hil_gate,
    GateOutcome,
};
use crate::dispatcher::TaskDispatcher;
use crate::error::{ExecutorError, ExecutorResult};
use crate::event::{EventPayload, EventReceiver, EventStream, ExecutionEvent, StreamStats};
use crate::ids::{CheckpointId, WorkflowId};
use crate::interfaces::{CapabilityStore, Checkpointer, Planner, Predictor, SandboxRuntime, ToolExecutor};
use crate::replanner::ReplannerBridge;
use crate::result::TaskStatus;
use crate::speculation::SpeculativeExecutor;
use crate::state::{self, StateDelta, WorkflowState};
use crate::task::Task;

/// The external collaborators the executor consumes (spec.md §6).
pub struct Collaborators {
    pub tool_executor: Arc<dyn ToolExecutor>,
    pub sandbox: Arc<dyn SandboxRuntime>,
    pub capability_store: Arc<dyn CapabilityStore>,
    pub planner: Arc<dyn Planner>,
    pub checkpointer: Arc<dyn Checkpointer>,
    pub predictor: Arc<dyn Predictor>,
}

/// Handle to a running (or completed) workflow, returned by
/// [`DagExecutor::execute`] / [`DagExecutor::resume`]. Rust has no native
/// async-generator return type, so the "event stream + final state" of
/// spec.md §6 is expressed as an already-subscribed [`EventReceiver`] plus a
/// one-shot completion future, both usable immediately without losing
/// events emitted before the caller gets around to awaiting completion.
pub struct ExecutionHandle {
    pub events: EventReceiver,
    command_queue: Arc<CommandQueue>,
    state: Arc<RwLock<WorkflowState>>,
    stream: Arc<EventStream>,
    completion: oneshot::Receiver<ExecutorResult<WorkflowState>>,
}

impl ExecutionHandle {
    /// `enqueue_command` (spec.md §6).
    pub fn enqueue_command(&self, command: Command) {
        self.command_queue.enqueue(command);
    }

    /// `get_state_snapshot` (spec.md §6): a deep-structural snapshot, never
    /// a live reference (spec.md §4.5).
    pub async fn get_state_snapshot(&self) -> WorkflowState {
        self.state.read().await.snapshot()
    }

    /// `get_stream_stats` (spec.md §6).
    pub async fn get_stream_stats(&self) -> StreamStats {
        self.stream.stats().await
    }

    /// Await the workflow's terminal result.
    pub async fn join(self) -> ExecutorResult<WorkflowState> {
        self.completion
            .await
            .unwrap_or_else(|_| Err(ExecutorError::Internal("executor task was dropped".into())))
    }
}

/// Drives one or more workflow runs against a fixed set of collaborators
/// and a fixed configuration (spec.md §4.1 "Drive loop").
pub struct DagExecutor {
    collaborators: Arc<Collaborators>,
    config: Config,
}

impl DagExecutor {
    pub fn new(collaborators: Collaborators, config: Config) -> ExecutorResult<Self> {
        config.validate()?;
        Ok(Self {
            collaborators: Arc::new(collaborators),
            config,
        })
    }

    /// `execute(dag, workflow_id?)` (spec.md §6).
    pub async fn execute(&self, dag: Dag, workflow_id: Option<WorkflowId>) -> ExecutionHandle {
        let workflow_id = workflow_id.unwrap_or_default();
        let state = WorkflowState::new(workflow_id);
        self.spawn_run(dag, workflow_id, state, None).await
    }

    /// `resume(dag, checkpoint_id)` (spec.md §4.6, §6).
    pub async fn resume(&self, dag: Dag, checkpoint_id: CheckpointId) -> ExecutorResult<ExecutionHandle> {
        let checkpoint = self.collaborators.checkpointer.load(&checkpoint_id).await?;
        Ok(self
            .spawn_run(
                dag,
                checkpoint.workflow_id,
                checkpoint.state,
                Some(checkpoint.layer_index),
            )
            .await)
    }

    async fn spawn_run(
        &self,
        dag: Dag,
        workflow_id: WorkflowId,
        initial_state: WorkflowState,
        resume_from_layer: Option<usize>,
    ) -> ExecutionHandle {
        let event_stream = Arc::new(EventStream::new(self.config.event_stream.max_buffer));
        let events = event_stream.subscribe().await;
        let command_queue = Arc::new(CommandQueue::new());
        let shared_state = Arc::new(RwLock::new(initial_state.clone()));
        let (completion_tx, completion_rx) = oneshot::channel();

        let collaborators = self.collaborators.clone();
        let config = self.config.clone();
        let run_stream = event_stream.clone();
        let run_queue = command_queue.clone();
        let run_state = shared_state.clone();

        tokio::spawn(async move {
            let result = run_workflow(
                dag,
                workflow_id,
                resume_from_layer,
                initial_state,
                collaborators,
                config,
                run_queue,
                run_stream.clone(),
                run_state,
            )
            .await;
            run_stream.close().await;
            let _ = completion_tx.send(result);
        });

        ExecutionHandle {
            events,
            command_queue,
            state: shared_state,
            stream: event_stream,
            completion: completion_rx,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_workflow(
    mut dag: Dag,
    workflow_id: WorkflowId,
    resume_from_layer: Option<usize>,
    mut state: WorkflowState,
    collaborators: Arc<Collaborators>,
    config: Config,
    command_queue: Arc<CommandQueue>,
    event_stream: Arc<EventStream>,
    shared_state: Arc<RwLock<WorkflowState>>,
) -> ExecutorResult<WorkflowState> {
    let mut layer_plan = topological_layers(&dag)?;

    tracing::info!(
        %workflow_id,
        task_count = dag.len(),
        layer_count = layer_plan.len(),
        resumed = resume_from_layer.is_some(),
        "workflow starting"
    );

    event_stream
        .publish(ExecutionEvent::new(workflow_id, EventPayload::WorkflowStart))
        .await;

    let dispatcher = TaskDispatcher {
        tool_executor: collaborators.tool_executor.clone(),
        sandbox: collaborators.sandbox.clone(),
        capability_store: collaborators.capability_store.clone(),
        speculative_executor: Arc::new(SpeculativeExecutor::new(
            config.speculation.confidence_threshold,
            config.speculation.max_concurrent,
        )),
        command_queue: command_queue.clone(),
        event_stream: event_stream.clone(),
    };
    let replanner = ReplannerBridge::new(config.max_replans);

    let mut layer_index = resume_from_layer.map(|l| l + 1).unwrap_or(0);
    let mut last_completed_tool = state.last_completed_tool(&dag);

    while layer_index < layer_plan.len() {
        let layer_task_ids = layer_plan
            .get(layer_index)
            .cloned()
            .ok_or_else(|| ExecutorError::Internal("layer index out of range".to_string()))?;

        tracing::debug!(%workflow_id, layer_index, task_count = layer_task_ids.len(), "layer starting");

        event_stream
            .publish(ExecutionEvent::new(
                workflow_id,
                EventPayload::LayerStart {
                    layer_index,
                    task_ids: layer_task_ids.clone(),
                },
            ))
            .await;

        let sweep = command_queue.drain_matching(&CommandKind::NON_DECISION);
        if sweep.iter().any(|c| matches!(c, Command::Abort { .. })) {
            let reason = sweep
                .into_iter()
                .find_map(|c| match c {
                    Command::Abort { reason } => Some(reason.unwrap_or_default()),
                    _ => None,
                })
                .unwrap_or_default();
            tracing::warn!(%workflow_id, layer_index, %reason, "workflow aborted by command before layer dispatch");
            dispatcher.speculative_executor.clear();
            return Err(ExecutorError::Aborted(reason));
        }

        let layer_tasks: Vec<Task> = layer_task_ids
            .iter()
            .filter_map(|id| dag.get(id).cloned())
            .collect();

        if config.speculation.enabled {
            if let Some(next_layer_ids) = layer_plan.get(layer_index + 1).cloned() {
                let predictor = collaborators.predictor.clone();
                let tool_executor = collaborators.tool_executor.clone();
                let speculative_executor = dispatcher.speculative_executor.clone();
                let stream_for_speculation = event_stream.clone();
                let completed_so_far = state.task_results.clone();
                let predecessor = last_completed_tool.clone();
                tokio::spawn(async move {
                    speculative_executor
                        .start(
                            predictor,
                            tool_executor,
                            stream_for_speculation,
                            workflow_id,
                            completed_so_far,
                            next_layer_ids,
                            predecessor,
                        )
                        .await;
                });
            }
        }

        let (results, escalation_decisions) = dispatcher
            .dispatch_layer(workflow_id, layer_tasks.clone(), &state, last_completed_tool.clone())
            .await;

        let layer_had_hard_error = results.iter().any(|r| r.status == TaskStatus::Error);

        state = state::apply(
            &state,
            StateDelta {
                new_results: results,
                new_decisions: escalation_decisions,
                layer_index: Some(layer_index),
                ..Default::default()
            },
        )?;
        *shared_state.write().await = state.snapshot();

        event_stream
            .publish(ExecutionEvent::new(
                workflow_id,
                EventPayload::StateUpdated {
                    layer_index,
                    successful_tasks: state.successful_count(),
                    failed_tasks: state.failed_count(),
                },
            ))
            .await;

        last_completed_tool = state.last_completed_tool(&dag);

        if config.abort_on_hard_error && layer_had_hard_error {
            tracing::warn!(%workflow_id, layer_index, "aborting: hard task error with abort_on_hard_error enabled");
            dispatcher.speculative_executor.clear();
            return Err(ExecutorError::Aborted(format!(
                "hard task error in layer {layer_index}, abort_on_hard_error is enabled"
            )));
        }

        match collaborators
            .checkpointer
            .save(workflow_id, layer_index, &state)
            .await
        {
            Ok(checkpoint_id) => {
                tracing::debug!(%workflow_id, layer_index, %checkpoint_id, "checkpoint saved");
                event_stream
                    .publish(ExecutionEvent::new(
                        workflow_id,
                        EventPayload::Checkpoint {
                            checkpoint_id: checkpoint_id.to_string(),
                            layer_index,
                            failed: false,
                        },
                    ))
                    .await;
            }
            Err(error) => {
                tracing::warn!(%workflow_id, layer_index, %error, "checkpoint save failed; continuing with degraded durability");
                event_stream
                    .publish(ExecutionEvent::new(
                        workflow_id,
                        EventPayload::Checkpoint {
                            checkpoint_id: CheckpointId::failed_placeholder(),
                            layer_index,
                            failed: true,
                        },
                    ))
                    .await;
            }
        }

        if ail_should_trigger(config.ail.effective_mode(), layer_had_hard_error) {
            let (decision, outcome) = run_ail_gate(
                &command_queue,
                &event_stream,
                workflow_id,
                format!("layer {layer_index} complete, awaiting agent decision"),
                &replanner,
                collaborators.planner.as_ref(),
                &dag,
                &state.task_results,
            )
            .await;
            state = state::apply(&state, StateDelta::single_decision(decision))?;
            *shared_state.write().await = state.snapshot();

            match outcome {
                GateOutcome::Continue => {}
                GateOutcome::Abort(reason) => {
                    tracing::warn!(%workflow_id, layer_index, %reason, "workflow aborted at AIL gate");
                    dispatcher.speculative_executor.clear();
                    return Err(ExecutorError::DecisionAborted(reason));
                }
                GateOutcome::Replan(new_dag) => {
                    tracing::info!(%workflow_id, layer_index, new_task_count = new_dag.len(), "plan replaced by replanner bridge");
                    dag = new_dag;
                    layer_plan = topological_layers(&dag)?;
                }
            }
        }

        if hil_should_trigger(config.hil.effective_mode(), &layer_tasks) {
            let next_layer_tasks: Option<Vec<Task>> = layer_plan.get(layer_index + 1).map(|ids| {
                ids.iter().filter_map(|id| dag.get(id).cloned()).collect()
            });
            let summary = build_hil_summary(
                &state,
                layer_index,
                &layer_tasks,
                next_layer_tasks.as_deref(),
            );
            let (decision, outcome) = run_hil_gate(
                &command_queue,
                &event_stream,
                workflow_id,
                format!("layer {layer_index} requires human approval"),
                summary,
            )
            .await;
            state = state::apply(&state, StateDelta::single_decision(decision))?;
            *shared_state.write().await = state.snapshot();

            if let GateOutcome::Abort(reason) = outcome {
                tracing::warn!(%workflow_id, layer_index, %reason, "workflow aborted at HIL gate");
                dispatcher.speculative_executor.clear();
                return Err(ExecutorError::DecisionAborted(reason));
            }
        }

        layer_index += 1;
    }

    dispatcher.speculative_executor.clear();

    tracing::info!(
        %workflow_id,
        successful_tasks = state.successful_count(),
        failed_tasks = state.failed_count(),
        total_tasks = dag.len(),
        "workflow complete"
    );

    event_stream
        .publish(ExecutionEvent::new(
            workflow_id,
            EventPayload::WorkflowComplete {
                successful_tasks: state.successful_count(),
                failed_tasks: state.failed_count(),
                total_tasks: dag.len(),
            },
        ))
        .await;

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{CapabilityRecord, PredictionCandidate, SandboxError};
    use crate::task::{PermissionSet, TaskType};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct EchoTool;
    #[async_trait]
    impl ToolExecutor for EchoTool {
        async fn invoke(
            &self,
            tool_id: &str,
            _arguments: &HashMap<String, serde_json::Value>,
        ) -> Result<serde_json::Value, String> {
            Ok(serde_json::json!({ "tool": tool_id }))
        }
    }

    struct NeverSandbox;
    #[async_trait]
    impl SandboxRuntime for NeverSandbox {
        async fn execute(
            &self,
            _code: &str,
            _context: &serde_json::Value,
            _permission_set: &PermissionSet,
        ) -> Result<serde_json::Value, SandboxError> {
            Ok(serde_json::Value::Null)
        }
    }

    struct NoCapabilities;
    #[async_trait]
    impl CapabilityStore for NoCapabilities {
        async fn find(&self, capability_id: &str) -> ExecutorResult<CapabilityRecord> {
            Err(ExecutorError::CapabilityNotFound(capability_id.to_string()))
        }
        async fn update_permission_set(
            &self,
            _capability_id: &str,
            _new_set: PermissionSet,
        ) -> ExecutorResult<()> {
            Ok(())
        }
    }

    struct NoPlanner;
    #[async_trait]
    impl Planner for NoPlanner {
        async fn replan(
            &self,
            _current_dag: &Dag,
            _completed_results: &[crate::result::TaskResult],
            _new_requirement: &str,
            _context: &HashMap<String, serde_json::Value>,
        ) -> ExecutorResult<Dag> {
            Err(ExecutorError::PlannerUnavailable("not wired in this test".to_string()))
        }
    }

    struct NoPredictor;
    #[async_trait]
    impl Predictor for NoPredictor {
        async fn predict(
            &self,
            _completed_results: &[crate::result::TaskResult],
            _upcoming_layer: &[String],
        ) -> Vec<PredictionCandidate> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct InMemoryCheckpointer {
        saved: StdMutex<HashMap<String, (WorkflowId, usize, WorkflowState)>>,
    }

    #[async_trait]
    impl Checkpointer for InMemoryCheckpointer {
        async fn save(
            &self,
            workflow_id: WorkflowId,
            layer_index: usize,
            state: &WorkflowState,
        ) -> ExecutorResult<CheckpointId> {
            let id = CheckpointId::new();
            self.saved
                .lock()
                .unwrap()
                .insert(id.to_string(), (workflow_id, layer_index, state.clone()));
            Ok(id)
        }

        async fn load(&self, checkpoint_id: &CheckpointId) -> ExecutorResult<crate::interfaces::Checkpoint> {
            let guard = self.saved.lock().unwrap();
            let (workflow_id, layer_index, state) = guard
                .get(&checkpoint_id.to_string())
                .cloned()
                .ok_or_else(|| ExecutorError::CheckpointNotFound(checkpoint_id.to_string()))?;
            Ok(crate::interfaces::Checkpoint {
                checkpoint_id: *checkpoint_id,
                workflow_id,
                layer_index,
                state,
                created_at: chrono::Utc::now(),
            })
        }
    }

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            task_type: TaskType::RemoteTool,
            tool: Some("noop".to_string()),
            arguments: HashMap::new(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            code: None,
            capability_id: None,
            side_effects: false,
            sandbox: None,
        }
    }

    fn executor() -> DagExecutor {
        DagExecutor::new(
            Collaborators {
                tool_executor: Arc::new(EchoTool),
                sandbox: Arc::new(NeverSandbox),
                capability_store: Arc::new(NoCapabilities),
                planner: Arc::new(NoPlanner),
                checkpointer: Arc::new(InMemoryCheckpointer::default()),
                predictor: Arc::new(NoPredictor),
            },
            Config::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn single_task_workflow_emits_the_documented_event_sequence() {
        let dag = Dag::new(vec![task("A", &[])]);
        let handle = executor().execute(dag, None).await;

        let mut payload_kinds = Vec::new();
        while let Some(event) = handle.events.recv().await {
            payload_kinds.push(event_kind(&event.payload));
        }

        assert_eq!(
            payload_kinds,
            vec![
                "workflow_start",
                "layer_start",
                "task_start",
                "task_complete",
                "state_updated",
                "checkpoint",
                "workflow_complete",
            ]
        );

        let state = handle.join().await.unwrap();
        assert_eq!(state.successful_count(), 1);
    }

    #[tokio::test]
    async fn diamond_workflow_completes_with_four_successful_tasks() {
        let dag = Dag::new(vec![
            task("A", &[]),
            task("B", &["A"]),
            task("C", &["A"]),
            task("D", &["B", "C"]),
        ]);
        let handle = executor().execute(dag, None).await;
        while handle.events.recv().await.is_some() {}
        let state = handle.join().await.unwrap();
        assert_eq!(state.successful_count(), 4);
    }

    #[tokio::test]
    async fn abort_enqueued_before_any_layer_aborts_without_dispatch() {
        let dag = Dag::new(vec![task("A", &[])]);
        let executor = executor();
        let handle = executor.execute(dag, None).await;
        handle.enqueue_command(Command::Abort {
            reason: Some("stop now".to_string()),
        });

        let first = handle.events.recv().await.unwrap();
        assert_eq!(event_kind(&first.payload), "workflow_start");
        let second = handle.events.recv().await.unwrap();
        assert_eq!(event_kind(&second.payload), "layer_start");
        assert!(handle.events.recv().await.is_none());

        let result = handle.join().await;
        assert!(matches!(result, Err(ExecutorError::Aborted(_))));
    }

    fn event_kind(payload: &EventPayload) -> &'static str {
        match payload {
            EventPayload::WorkflowStart => "workflow_start",
            EventPayload::LayerStart { .. } => "layer_start",
            EventPayload::TaskStart { .. } => "task_start",
            EventPayload::TaskComplete { .. } => "task_complete",
            EventPayload::TaskWarning { .. } => "task_warning",
            EventPayload::TaskError { .. } => "task_error",
            EventPayload::StateUpdated { .. } => "state_updated",
            EventPayload::Checkpoint { .. } => "checkpoint",
            EventPayload::DecisionRequired { .. } => "decision_required",
            EventPayload::SpeculationStart { .. } => "speculation_start",
            EventPayload::WorkflowComplete { .. } => "workflow_complete",
        }
    }
}
