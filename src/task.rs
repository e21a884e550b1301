//! Task definitions (spec.md §3, "Task")

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::ids::{TaskId, ToolId};

/// Dispatch type of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Forwarded verbatim to the host-supplied `ToolExecutor`.
    RemoteTool,
    /// Executed in the sandbox with a merged argument/dependency context.
    SandboxedCode,
    /// Resolved via the capability store (or inline code) and executed in
    /// the sandbox with the capability's recorded permission set.
    LearnedCapability,
}

/// Named bundle of sandbox capabilities (glossary: "Permission set").
///
/// Well-known bundles (`minimal`, `network`, `filesystem`, ...) are plain
/// strings rather than a closed enum: the sandbox runtime, not this crate,
/// owns the vocabulary (spec.md §6, `SandboxRuntime` is a consumed
/// interface).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    /// The empty ("minimal") permission set.
    pub fn minimal() -> Self {
        Self(BTreeSet::new())
    }

    /// Build a permission set from an explicit list of grants.
    pub fn from_grants<I: IntoIterator<Item = String>>(grants: I) -> Self {
        Self(grants.into_iter().collect())
    }

    /// Whether `grant` is present in this set.
    pub fn contains(&self, grant: &str) -> bool {
        self.0.contains(grant)
    }

    /// Widen this set with additional grants, returning the merged set.
    /// Used by permission escalation (spec.md §4.2).
    pub fn widened_with<I: IntoIterator<Item = String>>(&self, grants: I) -> Self {
        let mut widened = self.0.clone();
        widened.extend(grants);
        Self(widened)
    }

    /// Iterate the grants in this set, in deterministic order.
    pub fn grants(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Default for PermissionSet {
    fn default() -> Self {
        Self::minimal()
    }
}

/// Sandbox execution configuration for `sandboxed_code` / `learned_capability` tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Per-task wall-clock time limit (spec.md §5 default: 30s).
    #[serde(with = "duration_millis")]
    pub time_limit: Duration,
    /// Optional memory limit in bytes.
    pub memory_limit_bytes: Option<u64>,
    /// Paths the sandboxed code may read.
    pub read_paths: Vec<String>,
    /// Granted permission set.
    pub permission_set: PermissionSet,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            time_limit: Duration::from_secs(30),
            memory_limit_bytes: None,
            read_paths: Vec::new(),
            permission_set: PermissionSet::minimal(),
        }
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

/// An immutable unit of work in the DAG (spec.md §3, "Task").
///
/// Tasks are never mutated once enqueued; replanning produces new tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within the owning DAG.
    pub id: TaskId,
    /// Dispatch type.
    pub task_type: TaskType,
    /// Tool reference (required for `remote_tool`, optional hint otherwise).
    pub tool: Option<ToolId>,
    /// Static argument map passed to the task.
    pub arguments: HashMap<String, serde_json::Value>,
    /// Identifiers of tasks that must complete before this one dispatches.
    pub dependencies: Vec<TaskId>,
    /// Inline code body (`sandboxed_code`, or `learned_capability` with no
    /// stored capability).
    pub code: Option<String>,
    /// Capability identifier (`learned_capability`).
    pub capability_id: Option<String>,
    /// Whether this task has side effects. `sandboxed_code` tasks with
    /// `side_effects == false` are "safe-to-fail" (spec.md §4.2).
    pub side_effects: bool,
    /// Sandbox configuration, used by `sandboxed_code` and `learned_capability`.
    pub sandbox: Option<SandboxConfig>,
}

impl Task {
    /// A task is safe-to-fail when it is sandboxed code with no side effects.
    pub fn is_safe_to_fail(&self) -> bool {
        self.task_type == TaskType::SandboxedCode && !self.side_effects
    }
}
