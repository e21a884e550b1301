//! The command queue: externally injected control messages (spec.md §3
//! "Command", §4.4).
//!
//! Grounded on the teacher's `execution/queue.rs` `WorkQueue`, generalized
//! from a single FIFO of work items to a FIFO that two independent readers
//! (the between-layer sweep and the decision protocol) drain by type so
//! neither starves the other (spec.md §9, "command/decision coupling").

#![allow(clippy::unwrap_used)] // std Mutex::lock().unwrap(): poisoning is unrecoverable here anyway.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Discriminant of a [`Command`], used for type-filtered draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Continue,
    Abort,
    Pause,
    ReplanDag,
    ApprovalResponse,
    PermissionEscalationResponse,
}

impl CommandKind {
    /// Commands the between-layer sweep is allowed to consume (spec.md §4.4).
    pub const NON_DECISION: [CommandKind; 2] = [CommandKind::Abort, CommandKind::Pause];

    /// Commands only the decision protocol may consume (spec.md §4.4).
    pub const DECISION_BOUND: [CommandKind; 4] = [
        CommandKind::Continue,
        CommandKind::ApprovalResponse,
        CommandKind::PermissionEscalationResponse,
        CommandKind::ReplanDag,
    ];
}

/// Externally injected control message (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Continue {
        reason: Option<String>,
    },
    Abort {
        reason: Option<String>,
    },
    Pause {
        reason: Option<String>,
    },
    ReplanDag {
        requirement: String,
        #[serde(default)]
        context: HashMap<String, serde_json::Value>,
        reason: Option<String>,
    },
    ApprovalResponse {
        approved: bool,
        reason: Option<String>,
    },
    PermissionEscalationResponse {
        approved: bool,
        #[serde(default)]
        widened_permissions: Vec<String>,
        reason: Option<String>,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Continue { .. } => CommandKind::Continue,
            Command::Abort { .. } => CommandKind::Abort,
            Command::Pause { .. } => CommandKind::Pause,
            Command::ReplanDag { .. } => CommandKind::ReplanDag,
            Command::ApprovalResponse { .. } => CommandKind::ApprovalResponse,
            Command::PermissionEscalationResponse { .. } => {
                CommandKind::PermissionEscalationResponse
            }
        }
    }
}

/// Unbounded (memory-bounded only) FIFO mailbox for [`Command`]s.
pub struct CommandQueue {
    inner: Mutex<VecDeque<Command>>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a command (`enqueue_command`, spec.md §6).
    pub fn enqueue(&self, command: Command) {
        self.inner.lock().unwrap().push_back(command);
    }

    /// Number of commands currently queued, of any kind.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking: remove and return every currently enqueued command
    /// whose kind is in `kinds`, preserving relative FIFO order of both the
    /// matched and the remaining commands.
    pub fn drain_matching(&self, kinds: &[CommandKind]) -> Vec<Command> {
        let mut queue = self.inner.lock().unwrap();
        let mut matched = Vec::new();
        let mut remaining = VecDeque::with_capacity(queue.len());
        while let Some(command) = queue.pop_front() {
            if kinds.contains(&command.kind()) {
                matched.push(command);
            } else {
                remaining.push_back(command);
            }
        }
        *queue = remaining;
        matched
    }

    /// Blocking: poll every 100 ms until a command whose kind is in `kinds`
    /// is available, returning and removing the first (FIFO) match. Returns
    /// `None` if `timeout` elapses first.
    pub async fn wait_for_decision(
        &self,
        kinds: &[CommandKind],
        timeout: Duration,
    ) -> Option<Command> {
        let poll = async {
            loop {
                {
                    let mut queue = self.inner.lock().unwrap();
                    let position = queue.iter().position(|c| kinds.contains(&c.kind()));
                    if let Some(command) = position.and_then(|p| queue.remove(p)) {
                        return command;
                    }
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.ok()
    }
}
