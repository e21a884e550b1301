//! External collaborator contracts (spec.md §6).
//!
//! These are out of scope to implement for real — storage, the sandbox
//! runtime, the learned-capability store, the planner, and checkpoint
//! durability all live outside this crate. Grounded on the `async_trait`
//! idiom the teacher uses at its own external seams
//! (`concurrency/mod.rs`, `execution/engine.rs`).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::Dag;
use crate::error::ExecutorResult;
use crate::ids::{CheckpointId, WorkflowId};
use crate::result::TaskResult;
use crate::state::WorkflowState;
use crate::task::PermissionSet;

/// Consumed: forwards `remote_tool` invocations (spec.md §6 "ToolExecutor").
///
/// `automock` is applied ahead of `async_trait` (it must see the trait
/// before the expansion boxes its futures) so tests can script a
/// `MockToolExecutor` with `.expect_invoke()` instead of hand-writing a
/// fake for call-count/argument assertions, the way
/// `adamtc007-data-designer`'s `test-harness` crate mocks its simpler
/// single-method service traits.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn invoke(
        &self,
        tool_id: &str,
        arguments: &HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, String>;
}

/// Recognized sandbox failure kinds (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxErrorKind {
    PermissionDenied,
    NotCapable,
    Timeout,
    MemoryExceeded,
    RuntimeError,
}

/// Error returned by [`SandboxRuntime::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxError {
    pub kind: SandboxErrorKind,
    pub message: String,
}

impl SandboxError {
    pub fn is_permission_error(&self) -> bool {
        matches!(
            self.kind,
            SandboxErrorKind::PermissionDenied | SandboxErrorKind::NotCapable
        )
    }
}

/// Consumed: executes `sandboxed_code` / `learned_capability` bodies
/// (spec.md §6 "SandboxRuntime").
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        context: &serde_json::Value,
        permission_set: &PermissionSet,
    ) -> Result<serde_json::Value, SandboxError>;
}

/// A stored learned capability: its code body and recorded permission set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub code: String,
    pub permission_set: PermissionSet,
}

/// Consumed: resolves and updates learned capabilities (spec.md §6
/// "CapabilityStore").
#[async_trait]
pub trait CapabilityStore: Send + Sync {
    async fn find(&self, capability_id: &str) -> ExecutorResult<CapabilityRecord>;
    async fn update_permission_set(
        &self,
        capability_id: &str,
        new_set: PermissionSet,
    ) -> ExecutorResult<()>;
}

/// Consumed: produces an augmented DAG on a `replan_dag` command (spec.md §6
/// "Planner", §4.8).
#[async_trait]
pub trait Planner: Send + Sync {
    async fn replan(
        &self,
        current_dag: &Dag,
        completed_results: &[TaskResult],
        new_requirement: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> ExecutorResult<Dag>;
}

/// Durable layer-boundary snapshot (spec.md §3 "Checkpoint").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: CheckpointId,
    pub workflow_id: WorkflowId,
    pub layer_index: usize,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(workflow_id: WorkflowId, layer_index: usize, state: WorkflowState) -> Self {
        Self {
            checkpoint_id: CheckpointId::new(),
            workflow_id,
            layer_index,
            state,
            created_at: Utc::now(),
        }
    }
}

/// Consumed: the executor's durability contract (spec.md §4.6, §6
/// "Checkpointer"). Not owned storage — just a save/load/prune boundary.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Durable and idempotent per `(workflow_id, layer_index)`.
    async fn save(
        &self,
        workflow_id: WorkflowId,
        layer_index: usize,
        state: &WorkflowState,
    ) -> ExecutorResult<CheckpointId>;

    async fn load(&self, checkpoint_id: &CheckpointId) -> ExecutorResult<Checkpoint>;

    /// Optional retention policy; default implementation is a no-op since
    /// pruning is not required for correctness (spec.md §4.6).
    async fn prune(&self, _workflow_id: WorkflowId, _keep_n: usize) -> ExecutorResult<()> {
        Ok(())
    }
}

/// A ranked candidate returned by a [`Predictor`] (spec.md §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionCandidate {
    pub tool_id: crate::ids::ToolId,
    pub confidence: f64,
    pub reasoning: String,
}

/// Consumed: ranks likely next tool calls for the speculative executor
/// (spec.md §4.9). Named separately from the §6 interface list because the
/// spec introduces it inline rather than in the formal contract table, but
/// it is external on the same terms as the other five.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(
        &self,
        completed_results: &[TaskResult],
        upcoming_layer: &[crate::ids::TaskId],
    ) -> Vec<PredictionCandidate>;
}
