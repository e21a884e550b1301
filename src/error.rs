//! Error types for the DAG execution core

use thiserror::Error;

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Comprehensive error taxonomy for the executor (spec.md §7)
#[derive(Error, Debug, Clone)]
pub enum ExecutorError {
    /// Input error: the DAG contains a cycle
    #[error("cycle detected in DAG: {0}")]
    CyclicDag(String),

    /// Input error: a task references an unknown dependency
    #[error("task {task} depends on unknown task {dependency}")]
    DanglingDependency { task: String, dependency: String },

    /// Input error: the DAG has no tasks
    #[error("DAG has no tasks")]
    EmptyDag,

    /// Input error: a task specification is malformed
    #[error("malformed task {0}: {1}")]
    MalformedTask(String, String),

    /// A dependency result was missing or errored before this task could dispatch
    #[error("task {task} failed: dependency {dependency} did not complete successfully")]
    DependencyFailed { task: String, dependency: String },

    /// The underlying tool/sandbox/capability call failed
    #[error("task {task} execution failed: {reason}")]
    TaskExecutionFailed { task: String, reason: String },

    /// Permission was denied by the sandbox and escalation did not resolve it
    #[error("task {task} denied permission: {reason}")]
    PermissionDenied { task: String, reason: String },

    /// A decision gate (AIL/HIL) resulted in a fatal outcome
    #[error("workflow aborted at decision gate: {0}")]
    DecisionAborted(String),

    /// An externally injected `abort` command terminated the workflow
    #[error("workflow aborted: {0}")]
    Aborted(String),

    /// Checkpoint load/resume failed in a way that cannot be recovered from
    #[error("checkpoint error: {0}")]
    CheckpointCorruption(String),

    /// The requested checkpoint does not exist
    #[error("checkpoint {0} not found")]
    CheckpointNotFound(String),

    /// The external planner could not be reached
    #[error("planner unavailable: {0}")]
    PlannerUnavailable(String),

    /// A capability referenced by a learned_capability task could not be resolved
    #[error("capability {0} not found")]
    CapabilityNotFound(String),

    /// An internal invariant was violated (should not happen in correct usage)
    #[error("internal invariant violation: {0}")]
    Internal(String),

    /// A wait for an external signal timed out
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ExecutorError {
    /// Whether this error represents a workflow-fatal condition (as opposed
    /// to a per-task failure recorded into state).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecutorError::CyclicDag(_)
                | ExecutorError::DanglingDependency { .. }
                | ExecutorError::EmptyDag
                | ExecutorError::MalformedTask(_, _)
                | ExecutorError::DecisionAborted(_)
                | ExecutorError::Aborted(_)
                | ExecutorError::CheckpointCorruption(_)
        )
    }
}
