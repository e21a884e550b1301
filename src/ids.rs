//! Identifier types
//!
//! Tasks are named by DAG authors, so `TaskId` is a plain string. Workflows
//! and checkpoints are created by the executor itself, so they get UUID
//! newtypes in the shape of `knhk-workflow-engine`'s `CaseId`.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ExecutorError, ExecutorResult};

/// Author-supplied task identifier, unique within a single DAG.
pub type TaskId = String;

/// Tool identifier referenced by `remote_tool` tasks and by speculation.
pub type ToolId = String;

/// Unique identifier for a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(#[serde(with = "uuid::serde::compact")] pub Uuid);

impl WorkflowId {
    /// Generate a new random workflow id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a workflow id from its string form.
    pub fn parse_str(s: &str) -> ExecutorResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ExecutorError::Internal(format!("invalid workflow id: {e}")))
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a saved checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(#[serde(with = "uuid::serde::compact")] pub Uuid);

impl CheckpointId {
    /// Generate a new random checkpoint id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build a synthetic id used to surface a failed checkpoint save without
    /// aborting execution (spec.md §4.6).
    pub fn failed_placeholder() -> String {
        format!("failed-{}", Uuid::new_v4())
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current wall-clock time, milliseconds since the Unix epoch.
///
/// Every `ExecutionEvent` carries one of these (spec.md §6, "timestamp
/// (integer milliseconds since epoch)").
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
