//! The task dispatcher: per-type execution, dependency resolution, failure
//! classification, and permission escalation (spec.md §4.2).
//!
//! No direct teacher counterpart — `knhk-workflow-engine` dispatches
//! pre-declared pattern steps, not heterogeneous remote/sandboxed/learned
//! tasks with sandbox permission escalation — so this module is built from
//! spec.md §4.2 directly, reusing the teacher's `Arc`-of-collaborators
//! composition style (`orchestrator.rs`) and the retry ladder from
//! [`crate::retry`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::command::{Command, CommandKind, CommandQueue};
use crate::decision::{Decision, DecisionKind, DecisionOutcome};
use crate::decision_protocol::PERMISSION_ESCALATION_TIMEOUT;
use crate::event::{EventPayload, EventStream, ExecutionEvent};
use crate::ids::WorkflowId;
use crate::interfaces::{CapabilityStore, SandboxError, SandboxRuntime, ToolExecutor};
use crate::result::TaskResult;
use crate::retry::retry_with_backoff;
use crate::speculation::SpeculativeExecutor;
use crate::state::WorkflowState;
use crate::task::{PermissionSet, Task, TaskType};

/// Collaborators the dispatcher needs to run a layer (spec.md §6).
pub struct TaskDispatcher {
    pub tool_executor: Arc<dyn ToolExecutor>,
    pub sandbox: Arc<dyn SandboxRuntime>,
    pub capability_store: Arc<dyn CapabilityStore>,
    pub speculative_executor: Arc<SpeculativeExecutor>,
    pub command_queue: Arc<CommandQueue>,
    pub event_stream: Arc<EventStream>,
}

impl TaskDispatcher {
    /// Execute every task of `layer` concurrently and return one outcome per
    /// task, in request order, plus any decisions recorded along the way
    /// (permission escalations). One task's failure never cancels siblings
    /// (spec.md §4.2).
    pub async fn dispatch_layer(
        &self,
        workflow_id: WorkflowId,
        tasks: Vec<Task>,
        state: &WorkflowState,
        last_completed_tool: Option<String>,
    ) -> (Vec<TaskResult>, Vec<Decision>) {
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let dependencies = resolve_dependencies(&task, state);
            let tool_executor = self.tool_executor.clone();
            let sandbox = self.sandbox.clone();
            let capability_store = self.capability_store.clone();
            let speculative_executor = self.speculative_executor.clone();
            let command_queue = self.command_queue.clone();
            let event_stream = self.event_stream.clone();
            let last_completed_tool = last_completed_tool.clone();

            handles.push(tokio::spawn(async move {
                event_stream
                    .publish(ExecutionEvent::new(
                        workflow_id,
                        EventPayload::TaskStart {
                            task_id: task.id.clone(),
                        },
                    ))
                    .await;

                match dependencies {
                    Err(blocked_on) => {
                        let message = format!("dependency {blocked_on} did not complete successfully");
                        event_stream
                            .publish(ExecutionEvent::new(
                                workflow_id,
                                EventPayload::TaskError {
                                    task_id: task.id.clone(),
                                    message: message.clone(),
                                },
                            ))
                            .await;
                        (
                            TaskResult::error(task.id, message, Duration::ZERO),
                            Vec::new(),
                        )
                    }
                    Ok(dependency_outputs) => {
                        dispatch_one(
                            DispatchDeps {
                                tool_executor,
                                sandbox,
                                capability_store,
                                speculative_executor,
                                command_queue,
                                event_stream,
                            },
                            workflow_id,
                            task,
                            dependency_outputs,
                            last_completed_tool,
                        )
                        .await
                    }
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut decisions = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((result, mut task_decisions)) => {
                    decisions.append(&mut task_decisions);
                    results.push(result);
                }
                Err(join_error) => results.push(TaskResult::error(
                    "unknown".to_string(),
                    format!("task panicked: {join_error}"),
                    Duration::ZERO,
                )),
            }
        }
        (results, decisions)
    }
}

/// Dependency outputs keyed by dependency task id, built before a task
/// dispatches (spec.md §4.2 "Dependency resolution").
fn resolve_dependencies(
    task: &Task,
    state: &WorkflowState,
) -> Result<HashMap<String, Value>, String> {
    let mut outputs = HashMap::new();
    for dependency in &task.dependencies {
        match state.result_for(dependency) {
            Some(result) if !result.blocks_dependents() => {
                outputs.insert(
                    dependency.clone(),
                    result.output.clone().unwrap_or(Value::Null),
                );
            }
            _ => return Err(dependency.clone()),
        }
    }
    Ok(outputs)
}

struct DispatchDeps {
    tool_executor: Arc<dyn ToolExecutor>,
    sandbox: Arc<dyn SandboxRuntime>,
    capability_store: Arc<dyn CapabilityStore>,
    speculative_executor: Arc<SpeculativeExecutor>,
    command_queue: Arc<CommandQueue>,
    event_stream: Arc<EventStream>,
}

fn merged_context(task: &Task, dependency_outputs: &HashMap<String, Value>) -> Value {
    serde_json::json!({
        "arguments": task.arguments,
        "dependencies": dependency_outputs,
    })
}

async fn dispatch_one(
    deps: DispatchDeps,
    workflow_id: WorkflowId,
    task: Task,
    dependency_outputs: HashMap<String, Value>,
    last_completed_tool: Option<String>,
) -> (TaskResult, Vec<Decision>) {
    let started = Instant::now();
    let mut decisions = Vec::new();

    let outcome = match task.task_type {
        TaskType::RemoteTool => {
            dispatch_remote_tool(&deps, &task, last_completed_tool.as_deref()).await
        }
        TaskType::SandboxedCode => {
            dispatch_sandboxed_code(&deps, workflow_id, &task, &dependency_outputs, &mut decisions)
                .await
        }
        TaskType::LearnedCapability => {
            dispatch_learned_capability(
                &deps,
                workflow_id,
                &task,
                &dependency_outputs,
                &mut decisions,
            )
            .await
        }
    };

    let duration = started.elapsed();
    tracing::debug!(task_id = %task.id, task_type = ?task.task_type, duration_ms = duration.as_millis() as u64, "task dispatch finished");
    let result = match outcome {
        TaskOutcome::Success(value) => {
            deps.event_stream
                .publish(ExecutionEvent::new(
                    workflow_id,
                    EventPayload::TaskComplete {
                        task_id: task.id.clone(),
                        duration_ms: duration.as_millis() as u64,
                    },
                ))
                .await;
            TaskResult::success(task.id, value, duration)
        }
        TaskOutcome::FailedSafe(message) => {
            deps.event_stream
                .publish(ExecutionEvent::new(
                    workflow_id,
                    EventPayload::TaskWarning {
                        task_id: task.id.clone(),
                        message: message.clone(),
                    },
                ))
                .await;
            TaskResult::failed_safe(task.id, message, duration)
        }
        TaskOutcome::Error(message) => {
            deps.event_stream
                .publish(ExecutionEvent::new(
                    workflow_id,
                    EventPayload::TaskError {
                        task_id: task.id.clone(),
                        message: message.clone(),
                    },
                ))
                .await;
            TaskResult::error(task.id, message, duration)
        }
    };

    (result, decisions)
}

enum TaskOutcome {
    Success(Value),
    FailedSafe(String),
    Error(String),
}

async fn dispatch_remote_tool(
    deps: &DispatchDeps,
    task: &Task,
    last_completed_tool: Option<&str>,
) -> TaskOutcome {
    let Some(tool_id) = task.tool.as_deref() else {
        return TaskOutcome::Error("remote_tool task is missing a tool reference".to_string());
    };

    if let Some(cached) = deps
        .speculative_executor
        .consume(tool_id, last_completed_tool)
    {
        return TaskOutcome::Success(cached);
    }

    match deps.tool_executor.invoke(tool_id, &task.arguments).await {
        Ok(value) => TaskOutcome::Success(value),
        Err(reason) => TaskOutcome::Error(reason),
    }
}

async fn dispatch_sandboxed_code(
    deps: &DispatchDeps,
    workflow_id: WorkflowId,
    task: &Task,
    dependency_outputs: &HashMap<String, Value>,
    decisions: &mut Vec<Decision>,
) -> TaskOutcome {
    let Some(code) = task.code.as_deref() else {
        return TaskOutcome::Error("sandboxed_code task has no code body".to_string());
    };
    let sandbox_config = task.sandbox.clone().unwrap_or_default();
    let context = merged_context(task, dependency_outputs);

    if task.is_safe_to_fail() {
        let code = code.to_string();
        let permission_set = sandbox_config.permission_set.clone();
        let sandbox = deps.sandbox.clone();
        let context_for_retry = context.clone();
        let outcome: Result<Value, SandboxError> = retry_with_backoff(|_attempt| {
            let sandbox = sandbox.clone();
            let code = code.clone();
            let permission_set = permission_set.clone();
            let context = context_for_retry.clone();
            async move { sandbox.execute(&code, &context, &permission_set).await }
        })
        .await;

        return match outcome {
            Ok(value) => TaskOutcome::Success(value),
            Err(error) => {
                tracing::warn!(
                    task_id = %task.id,
                    attempts = crate::retry::MAX_ATTEMPTS,
                    error = %error.message,
                    "safe-to-fail task exhausted retries"
                );
                TaskOutcome::FailedSafe(error.message)
            }
        };
    }

    match deps
        .sandbox
        .execute(code, &context, &sandbox_config.permission_set)
        .await
    {
        Ok(value) => TaskOutcome::Success(value),
        Err(error) if error.is_permission_error() => {
            tracing::info!(task_id = %task.id, kind = ?error.kind, "sandbox denied permission, escalating");
            escalate_and_retry_sandboxed(deps, workflow_id, task, &context, error, decisions).await
        }
        Err(error) => TaskOutcome::Error(error.message),
    }
}

async fn dispatch_learned_capability(
    deps: &DispatchDeps,
    workflow_id: WorkflowId,
    task: &Task,
    dependency_outputs: &HashMap<String, Value>,
    decisions: &mut Vec<Decision>,
) -> TaskOutcome {
    let (code, permission_set, capability_id) = match &task.code {
        Some(inline_code) => (
            inline_code.clone(),
            task.sandbox
                .as_ref()
                .map(|s| s.permission_set.clone())
                .unwrap_or_default(),
            None,
        ),
        None => {
            let Some(capability_id) = task.capability_id.as_deref() else {
                return TaskOutcome::Error(
                    "learned_capability task has neither inline code nor a capability id"
                        .to_string(),
                );
            };
            match deps.capability_store.find(capability_id).await {
                Ok(record) => (
                    record.code,
                    record.permission_set,
                    Some(capability_id.to_string()),
                ),
                Err(error) => return TaskOutcome::Error(error.to_string()),
            }
        }
    };

    let context = merged_context(task, dependency_outputs);
    match deps.sandbox.execute(&code, &context, &permission_set).await {
        Ok(value) => TaskOutcome::Success(value),
        Err(error) if error.is_permission_error() => {
            let outcome = escalate_permission(
                deps,
                workflow_id,
                &task.id,
                &error,
                &permission_set,
                decisions,
            )
            .await;
            match outcome {
                Some(widened) => {
                    let retried = deps.sandbox.execute(&code, &context, &widened).await;
                    if let (Some(capability_id), Ok(_)) = (&capability_id, &retried) {
                        let _ = deps
                            .capability_store
                            .update_permission_set(capability_id, widened)
                            .await;
                    }
                    match retried {
                        Ok(value) => TaskOutcome::Success(value),
                        Err(retry_error) => TaskOutcome::Error(retry_error.message),
                    }
                }
                None => TaskOutcome::Error(error.message),
            }
        }
        Err(error) => TaskOutcome::Error(error.message),
    }
}

async fn escalate_and_retry_sandboxed(
    deps: &DispatchDeps,
    workflow_id: WorkflowId,
    task: &Task,
    context: &Value,
    original_error: SandboxError,
    decisions: &mut Vec<Decision>,
) -> TaskOutcome {
    let permission_set = task
        .sandbox
        .as_ref()
        .map(|s| s.permission_set.clone())
        .unwrap_or_default();
    let code = task.code.as_deref().unwrap_or_default();

    match escalate_permission(
        deps,
        workflow_id,
        &task.id,
        &original_error,
        &permission_set,
        decisions,
    )
    .await
    {
        Some(widened) => match deps.sandbox.execute(code, context, &widened).await {
            Ok(value) => TaskOutcome::Success(value),
            Err(retry_error) => TaskOutcome::Error(retry_error.message),
        },
        None => TaskOutcome::Error(original_error.message),
    }
}

/// Parse a permission error into the minimal additional grant it implies.
/// A heuristic over the error message, since the sandbox contract (spec.md
/// §6) carries only a kind and a free-text message, not a structured
/// missing-grant field.
fn infer_missing_grant(message: &str) -> String {
    let lower = message.to_lowercase();
    if lower.contains("network") {
        "network".to_string()
    } else if lower.contains("filesystem") || lower.contains("file") {
        "filesystem".to_string()
    } else {
        "elevated".to_string()
    }
}

/// Request HIL approval for a widened permission set and wait for the
/// response (spec.md §4.2). Returns the widened set on approval, `None` on
/// denial or timeout.
async fn escalate_permission(
    deps: &DispatchDeps,
    workflow_id: WorkflowId,
    task_id: &str,
    original_error: &SandboxError,
    current_permission_set: &PermissionSet,
    decisions: &mut Vec<Decision>,
) -> Option<PermissionSet> {
    let inferred_grant = infer_missing_grant(&original_error.message);
    let description = format!(
        "task {task_id} denied permission ({}): requesting grant '{inferred_grant}'",
        original_error.message
    );

    deps.event_stream
        .publish(ExecutionEvent::new(
            workflow_id,
            EventPayload::DecisionRequired {
                kind: DecisionKind::Hil,
                description: description.clone(),
                summary: None,
            },
        ))
        .await;

    // spec.md §4.2 licenses waiting only on an approval-response or
    // permission-escalation-response command here; `abort` is non-decision
    // (command.rs `NON_DECISION`) and must be left for the scheduler's
    // between-layer sweep to observe, not dequeued and discarded as a plain
    // task error.
    let command = deps
        .command_queue
        .wait_for_decision(
            &[
                CommandKind::PermissionEscalationResponse,
                CommandKind::ApprovalResponse,
            ],
            PERMISSION_ESCALATION_TIMEOUT,
        )
        .await;

    let (decision_outcome, widened) = match command {
        None => (DecisionOutcome::Timeout, None),
        Some(Command::PermissionEscalationResponse {
            approved: true,
            widened_permissions,
            ..
        }) => {
            let grants = if widened_permissions.is_empty() {
                vec![inferred_grant]
            } else {
                widened_permissions
            };
            (
                DecisionOutcome::Approve,
                Some(current_permission_set.widened_with(grants)),
            )
        }
        Some(Command::PermissionEscalationResponse { approved: false, .. }) => {
            (DecisionOutcome::Reject, None)
        }
        Some(Command::ApprovalResponse { approved: true, .. }) => (
            DecisionOutcome::Approve,
            Some(current_permission_set.widened_with(vec![inferred_grant])),
        ),
        Some(Command::ApprovalResponse { approved: false, .. }) => (DecisionOutcome::Reject, None),
        Some(_) => (DecisionOutcome::Timeout, None),
    };

    tracing::info!(task_id, outcome = ?decision_outcome, "permission escalation resolved");

    decisions.push(Decision::new(
        DecisionKind::Hil,
        description,
        decision_outcome,
        HashMap::new(),
    ));
    widened
}
