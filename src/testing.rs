//! Hand-written fakes for the external interfaces (spec.md §6), available to
//! downstream integration tests under the `testing` feature.
//!
//! Grounded on the teacher's own `test_helpers.rs`/`fixtures.rs` pattern of
//! shipping its mock collaborators alongside the crate rather than only in
//! `#[cfg(test)]` modules, since several of spec.md's testable properties
//! (§8) span multiple modules and are easiest to exercise against the full
//! [`crate::scheduler::DagExecutor`].

#![cfg(any(test, feature = "testing"))]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::dag::Dag;
use crate::error::{ExecutorError, ExecutorResult};
use crate::ids::{CheckpointId, TaskId, ToolId, WorkflowId};
use crate::interfaces::{
    CapabilityRecord, CapabilityStore, Checkpoint, Checkpointer, PredictionCandidate, Predictor,
    SandboxError, SandboxErrorKind, SandboxRuntime, ToolExecutor,
};
use crate::result::TaskResult;
use crate::state::WorkflowState;
use crate::task::PermissionSet;

/// A [`ToolExecutor`] that returns a fixed response per tool id, recording
/// every invocation for later assertion.
#[derive(Default)]
pub struct FakeToolExecutor {
    responses: Mutex<HashMap<ToolId, Result<Value, String>>>,
    calls: Mutex<Vec<ToolId>>,
}

impl FakeToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, tool_id: impl Into<ToolId>, response: Value) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(tool_id.into(), Ok(response));
        self
    }

    pub fn with_error(self, tool_id: impl Into<ToolId>, message: impl Into<String>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(tool_id.into(), Err(message.into()));
        self
    }

    pub fn calls(&self) -> Vec<ToolId> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for FakeToolExecutor {
    async fn invoke(&self, tool_id: &str, _arguments: &HashMap<String, Value>) -> Result<Value, String> {
        self.calls.lock().unwrap().push(tool_id.to_string());
        match self.responses.lock().unwrap().get(tool_id) {
            Some(response) => response.clone(),
            None => Ok(Value::Null),
        }
    }
}

/// A [`SandboxRuntime`] that denies permission a fixed number of times
/// before succeeding, modeling the permission-escalation-then-retry
/// scenario of spec.md §8.
pub struct ScriptedSandbox {
    denials_remaining: Mutex<u32>,
    result: Value,
    required_grant: String,
}

impl ScriptedSandbox {
    pub fn denies_then_succeeds(denials: u32, required_grant: impl Into<String>, result: Value) -> Self {
        Self {
            denials_remaining: Mutex::new(denials),
            result,
            required_grant: required_grant.into(),
        }
    }

    pub fn always_succeeds(result: Value) -> Self {
        Self {
            denials_remaining: Mutex::new(0),
            result,
            required_grant: String::new(),
        }
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedSandbox {
    async fn execute(
        &self,
        _code: &str,
        _context: &Value,
        permission_set: &PermissionSet,
    ) -> Result<Value, SandboxError> {
        let mut remaining = self.denials_remaining.lock().unwrap();
        if *remaining > 0 && !permission_set.contains(&self.required_grant) {
            *remaining -= 1;
            return Err(SandboxError {
                kind: SandboxErrorKind::PermissionDenied,
                message: format!("{} permission required", self.required_grant),
            });
        }
        Ok(self.result.clone())
    }
}

/// A [`CapabilityStore`] backed by an in-memory map, seeded up front.
#[derive(Default)]
pub struct FakeCapabilityStore {
    records: Mutex<HashMap<String, CapabilityRecord>>,
}

impl FakeCapabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capability(self, id: impl Into<String>, record: CapabilityRecord) -> Self {
        self.records.lock().unwrap().insert(id.into(), record);
        self
    }
}

#[async_trait]
impl CapabilityStore for FakeCapabilityStore {
    async fn find(&self, capability_id: &str) -> ExecutorResult<CapabilityRecord> {
        self.records
            .lock()
            .unwrap()
            .get(capability_id)
            .cloned()
            .ok_or_else(|| ExecutorError::CapabilityNotFound(capability_id.to_string()))
    }

    async fn update_permission_set(
        &self,
        capability_id: &str,
        new_set: PermissionSet,
    ) -> ExecutorResult<()> {
        if let Some(record) = self.records.lock().unwrap().get_mut(capability_id) {
            record.permission_set = new_set;
        }
        Ok(())
    }
}

/// A [`crate::interfaces::Planner`] that applies a caller-supplied closure,
/// so tests can script augmenting, no-op, or failing replans inline.
pub struct FakePlanner<F>(F)
where
    F: Fn(&Dag, &[TaskResult], &str, &HashMap<String, Value>) -> ExecutorResult<Dag> + Send + Sync;

impl<F> FakePlanner<F>
where
    F: Fn(&Dag, &[TaskResult], &str, &HashMap<String, Value>) -> ExecutorResult<Dag> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> crate::interfaces::Planner for FakePlanner<F>
where
    F: Fn(&Dag, &[TaskResult], &str, &HashMap<String, Value>) -> ExecutorResult<Dag> + Send + Sync,
{
    async fn replan(
        &self,
        current_dag: &Dag,
        completed_results: &[TaskResult],
        new_requirement: &str,
        context: &HashMap<String, Value>,
    ) -> ExecutorResult<Dag> {
        (self.0)(current_dag, completed_results, new_requirement, context)
    }
}

/// A [`Checkpointer`] backed by an in-memory map. Every checkpoint is kept
/// (no pruning) so tests can load any previously saved layer boundary.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    checkpoints: Mutex<HashMap<CheckpointId, Checkpoint>>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.lock().unwrap().len()
    }

    /// The id of the (first) saved checkpoint at `layer_index`, if any —
    /// lets tests drive `resume()` without reaching into private state.
    pub fn checkpoint_id_for_layer(&self, layer_index: usize) -> Option<CheckpointId> {
        self.checkpoints
            .lock()
            .unwrap()
            .values()
            .find(|c| c.layer_index == layer_index)
            .map(|c| c.checkpoint_id)
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn save(
        &self,
        workflow_id: WorkflowId,
        layer_index: usize,
        state: &WorkflowState,
    ) -> ExecutorResult<CheckpointId> {
        let checkpoint = Checkpoint::new(workflow_id, layer_index, state.clone());
        let id = checkpoint.checkpoint_id;
        self.checkpoints.lock().unwrap().insert(id, checkpoint);
        Ok(id)
    }

    async fn load(&self, checkpoint_id: &CheckpointId) -> ExecutorResult<Checkpoint> {
        self.checkpoints
            .lock()
            .unwrap()
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| ExecutorError::CheckpointNotFound(checkpoint_id.to_string()))
    }
}

/// A [`Predictor`] that always returns a fixed, caller-supplied candidate
/// list regardless of the upcoming layer.
pub struct FixedPredictor(Vec<PredictionCandidate>);

impl FixedPredictor {
    pub fn new(candidates: Vec<PredictionCandidate>) -> Self {
        Self(candidates)
    }

    pub fn none() -> Self {
        Self(Vec::new())
    }
}

#[async_trait]
impl Predictor for FixedPredictor {
    async fn predict(&self, _completed_results: &[TaskResult], _upcoming_layer: &[TaskId]) -> Vec<PredictionCandidate> {
        self.0.clone()
    }
}
