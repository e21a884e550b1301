//! Task results (spec.md §3, "TaskResult")

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ids::TaskId;

/// Outcome of a single task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Completed without error.
    Success,
    /// Hard failure; the workflow proceeds but the task is recorded as failed.
    Error,
    /// A safe-to-fail task exhausted its retries (spec.md §4.2).
    FailedSafe,
}

/// Result of executing one task, appended to [`crate::state::WorkflowState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Which task this result belongs to.
    pub task_id: TaskId,
    /// Outcome status.
    pub status: TaskStatus,
    /// Output value, present on success.
    pub output: Option<serde_json::Value>,
    /// Error message, present on error/failed_safe.
    pub error: Option<String>,
    /// Wall-clock duration of the (final) attempt.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl TaskResult {
    /// Build a successful result.
    pub fn success(task_id: TaskId, output: serde_json::Value, duration: Duration) -> Self {
        Self {
            task_id,
            status: TaskStatus::Success,
            output: Some(output),
            error: None,
            duration,
        }
    }

    /// Build a hard-error result.
    pub fn error(task_id: TaskId, error: String, duration: Duration) -> Self {
        Self {
            task_id,
            status: TaskStatus::Error,
            output: None,
            error: Some(error),
            duration,
        }
    }

    /// Build a failed-safe result (safe-to-fail task that exhausted retries).
    pub fn failed_safe(task_id: TaskId, error: String, duration: Duration) -> Self {
        Self {
            task_id,
            status: TaskStatus::FailedSafe,
            output: None,
            error: Some(error),
            duration,
        }
    }

    /// Whether this result should fail downstream dependents (spec.md §4.2:
    /// "If the referenced result is absent or its status is `error`").
    pub fn blocks_dependents(&self) -> bool {
        self.status == TaskStatus::Error
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
