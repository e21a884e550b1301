//! Replanner bridge: rate-limited live-DAG replacement (spec.md §4.8).
//!
//! The teacher has no direct counterpart (its workflows are author-defined
//! and immutable once registered); this is grounded on spec.md §4.8 alone,
//! with the rate-limit counter modeled the way the teacher counts other
//! per-run budgets, e.g. `engine/scheduler.rs`'s `AtomicU64` tick counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::dag::Dag;
use crate::interfaces::Planner;
use crate::result::TaskResult;

/// Default rate limit (spec.md §6 `max_replans`, default 3).
pub const DEFAULT_MAX_REPLANS: usize = 3;

/// Outcome of a replan attempt, mapped 1:1 onto the `replan_*`
/// [`crate::decision::DecisionOutcome`] variants by the decision protocol.
#[derive(Debug)]
pub enum ReplanOutcome {
    /// The planner returned a DAG with a different task count.
    Success(Dag),
    /// The per-workflow replan budget is exhausted.
    Rejected,
    /// The planner call failed or was unavailable.
    Failed(String),
    /// The planner returned a DAG with the same task count as the input.
    NoChanges,
}

/// Tracks the per-workflow replan budget and drives the planner call.
pub struct ReplannerBridge {
    max_replans: usize,
    replans_used: AtomicUsize,
}

impl ReplannerBridge {
    pub fn new(max_replans: usize) -> Self {
        Self {
            max_replans,
            replans_used: AtomicUsize::new(0),
        }
    }

    pub fn replans_used(&self) -> usize {
        self.replans_used.load(Ordering::SeqCst)
    }

    fn try_reserve(&self) -> bool {
        loop {
            let current = self.replans_used.load(Ordering::SeqCst);
            if current >= self.max_replans {
                return false;
            }
            if self
                .replans_used
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Consult the external planner for an augmented DAG (spec.md §4.8).
    /// Reserves a slot from the replan budget before calling out; a
    /// rejected request never consumes the budget.
    pub async fn replan(
        &self,
        planner: &dyn Planner,
        current_dag: &Dag,
        completed_results: &[TaskResult],
        requirement: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> ReplanOutcome {
        if !self.try_reserve() {
            tracing::warn!(
                max_replans = self.max_replans,
                "replan request rejected: budget exhausted"
            );
            return ReplanOutcome::Rejected;
        }
        match planner
            .replan(current_dag, completed_results, requirement, context)
            .await
        {
            Ok(new_dag) if new_dag.len() == current_dag.len() => {
                tracing::info!(%requirement, "replan returned an unchanged task count");
                ReplanOutcome::NoChanges
            }
            Ok(new_dag) => {
                tracing::info!(
                    %requirement,
                    old_task_count = current_dag.len(),
                    new_task_count = new_dag.len(),
                    "replan succeeded"
                );
                ReplanOutcome::Success(new_dag)
            }
            Err(err) => {
                tracing::warn!(%requirement, error = %err, "planner unavailable");
                ReplanOutcome::Failed(err.to_string())
            }
        }
    }
}
