//! Controlled DAG execution core.
//!
//! Executes a directed acyclic graph of heterogeneous tasks in dependency
//! layers, with live event streaming, externally injected control commands,
//! per-layer checkpointing, agent/human decision gates, dynamic replanning,
//! and speculative pre-execution of predicted next tools.
//!
//! [`scheduler::DagExecutor`] is the entry point: it composes every other
//! module (the topological scheduler in [`dag`], the dispatcher in
//! [`dispatcher`], the event stream in [`event`], the command queue in
//! [`command`], state and its reducers in [`state`], checkpointing and
//! replanning through the traits in [`interfaces`], and decision gating in
//! [`decision_protocol`]) into one drive loop.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod command;
pub mod config;
pub mod dag;
pub mod decision;
pub mod decision_protocol;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod ids;
pub mod interfaces;
pub mod replanner;
pub mod result;
pub mod retry;
pub mod scheduler;
pub mod speculation;
pub mod state;
pub mod task;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use command::{Command, CommandKind, CommandQueue};
pub use config::Config;
pub use dag::{topological_layers, Dag, Layer, LayerPlan};
pub use decision::{Decision, DecisionKind, DecisionOutcome};
pub use error::{ExecutorError, ExecutorResult};
pub use event::{EventPayload, EventReceiver, EventStream, ExecutionEvent, StreamStats};
pub use ids::{CheckpointId, TaskId, ToolId, WorkflowId};
pub use interfaces::{
    CapabilityRecord, CapabilityStore, Checkpoint, Checkpointer, Planner, PredictionCandidate,
    Predictor, SandboxError, SandboxErrorKind, SandboxRuntime, ToolExecutor,
};
pub use result::{TaskResult, TaskStatus};
pub use scheduler::{Collaborators, DagExecutor, ExecutionHandle};
pub use state::{StateDelta, WorkflowState};
pub use task::{PermissionSet, SandboxConfig, Task, TaskType};
