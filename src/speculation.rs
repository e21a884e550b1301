//! Speculative pre-execution (spec.md §3 "SpeculationEntry", §4.9).
//!
//! Grounded on the teacher's `cache.rs` `ReflexCache`: the same
//! `Arc<DashMap<..>>` shape, generalized from a spec/case lookup cache to a
//! predecessor-validated speculation cache that invalidates itself on
//! mismatch.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::event::{EventPayload, EventStream, ExecutionEvent};
use crate::ids::{ToolId, WorkflowId};
use crate::interfaces::{PredictionCandidate, Predictor, ToolExecutor};
use crate::result::TaskResult;

/// Lifecycle state of a [`SpeculationEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeculationStatus {
    InFlight,
    Ready,
    Consumed,
    Invalidated,
}

/// One cached speculative pre-execution (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculationEntry {
    pub predicted_tool: ToolId,
    pub confidence: f64,
    pub reasoning: String,
    pub result: Option<serde_json::Value>,
    pub status: SpeculationStatus,
    /// Tool that must be the most recently completed one for this entry to
    /// be consumable (spec.md §4.9 "Validation on consumption").
    pub predecessor_tool: Option<ToolId>,
}

/// Default confidence threshold (spec.md §6 `speculation.confidence_threshold`).
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Per-workflow speculative pre-execution cache and driver.
pub struct SpeculativeExecutor {
    cache: Arc<DashMap<ToolId, SpeculationEntry>>,
    confidence_threshold: f64,
    max_concurrent: usize,
}

impl SpeculativeExecutor {
    pub fn new(confidence_threshold: f64, max_concurrent: usize) -> Self {
        Self {
            cache: Arc::new(DashMap::new()),
            confidence_threshold,
            max_concurrent,
        }
    }

    /// Kick off speculation for the layer about to run. Fires candidate
    /// tool invocations in the background; returns immediately (spec.md
    /// §4.1: "start speculation for the subsequent layer (non-blocking)").
    pub async fn start(
        &self,
        predictor: Arc<dyn Predictor>,
        tool_executor: Arc<dyn ToolExecutor>,
        event_stream: Arc<EventStream>,
        workflow_id: WorkflowId,
        completed_results: Vec<TaskResult>,
        upcoming_layer: Vec<String>,
        predecessor_tool: Option<ToolId>,
    ) {
        let candidates: Vec<PredictionCandidate> = predictor
            .predict(&completed_results, &upcoming_layer)
            .await;

        let winners: Vec<PredictionCandidate> = candidates
            .into_iter()
            .filter(|c| c.confidence >= self.confidence_threshold)
            .take(self.max_concurrent)
            .collect();

        for candidate in winners {
            if self.cache.contains_key(&candidate.tool_id) {
                continue;
            }
            self.cache.insert(
                candidate.tool_id.clone(),
                SpeculationEntry {
                    predicted_tool: candidate.tool_id.clone(),
                    confidence: candidate.confidence,
                    reasoning: candidate.reasoning.clone(),
                    result: None,
                    status: SpeculationStatus::InFlight,
                    predecessor_tool: predecessor_tool.clone(),
                },
            );

            event_stream
                .publish(ExecutionEvent::new(
                    workflow_id,
                    EventPayload::SpeculationStart {
                        tool_id: candidate.tool_id.clone(),
                        confidence: candidate.confidence,
                    },
                ))
                .await;

            let cache = self.cache.clone();
            let executor = tool_executor.clone();
            let tool_id = candidate.tool_id;
            tokio::spawn(async move {
                match executor.invoke(&tool_id, &Default::default()).await {
                    Ok(value) => {
                        if let Some(mut entry) = cache.get_mut(&tool_id) {
                            entry.result = Some(value);
                            entry.status = SpeculationStatus::Ready;
                        }
                    }
                    Err(_) => {
                        // Misses cost nothing (spec.md §4.2): drop the entry
                        // rather than serve a failed speculation.
                        cache.remove(&tool_id);
                    }
                }
            });
        }
    }

    /// Consult the cache before dispatching `tool_id`. Returns the cached
    /// result only if it is `ready` and its recorded predecessor matches
    /// `last_completed_tool`, transitioning the entry to `consumed` before
    /// dropping it; a predecessor mismatch transitions it to `invalidated`
    /// instead and yields nothing. Idempotent: a second call for the same
    /// tool id after either outcome finds nothing, since the entry was
    /// already removed.
    pub fn consume(
        &self,
        tool_id: &str,
        last_completed_tool: Option<&str>,
    ) -> Option<serde_json::Value> {
        let (_, mut entry) = self.cache.remove(tool_id)?;
        if entry.status == SpeculationStatus::Ready
            && entry.predecessor_tool.as_deref() == last_completed_tool
        {
            entry.status = SpeculationStatus::Consumed;
            Some(entry.result.unwrap_or(serde_json::Value::Null))
        } else {
            entry.status = SpeculationStatus::Invalidated;
            None
        }
    }

    /// Number of entries currently cached (for tests/diagnostics).
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Discard the entire cache (spec.md §4.9: "on workflow end the entire
    /// cache is discarded").
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Seed a ready cache entry directly, for dispatcher tests that exercise
    /// consumption without driving a full `start` round.
    #[cfg(any(test, feature = "testing"))]
    pub fn cache_insert_for_test(
        &self,
        tool_id: &str,
        result: serde_json::Value,
        predecessor_tool: Option<ToolId>,
    ) {
        self.cache.insert(
            tool_id.to_string(),
            SpeculationEntry {
                predicted_tool: tool_id.to_string(),
                confidence: 1.0,
                reasoning: "seeded for test".to_string(),
                result: Some(result),
                status: SpeculationStatus::Ready,
                predecessor_tool,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedPredictor(Vec<PredictionCandidate>);

    #[async_trait]
    impl Predictor for FixedPredictor {
        async fn predict(
            &self,
            _completed_results: &[TaskResult],
            _upcoming_layer: &[String],
        ) -> Vec<PredictionCandidate> {
            self.0.clone()
        }
    }

    struct CountingExecutor {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolExecutor for CountingExecutor {
        async fn invoke(
            &self,
            _tool_id: &str,
            _arguments: &HashMap<String, serde_json::Value>,
        ) -> Result<serde_json::Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"speculative": true}))
        }
    }

    #[tokio::test]
    async fn below_threshold_candidates_are_not_speculated() {
        let executor = SpeculativeExecutor::new(DEFAULT_CONFIDENCE_THRESHOLD, 4);
        let predictor = Arc::new(FixedPredictor(vec![PredictionCandidate {
            tool_id: "weather".to_string(),
            confidence: 0.3,
            reasoning: "low confidence".to_string(),
        }]));
        let calls = Arc::new(AtomicUsize::new(0));
        let tool_executor = Arc::new(CountingExecutor {
            calls: calls.clone(),
        });
        let stream = Arc::new(EventStream::new(16));
        let _receiver = stream.subscribe().await;

        executor
            .start(
                predictor,
                tool_executor,
                stream,
                WorkflowId::new(),
                vec![],
                vec!["B".to_string()],
                None,
            )
            .await;

        assert_eq!(executor.len(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mismatched_predecessor_invalidates_entry() {
        let executor = SpeculativeExecutor::new(DEFAULT_CONFIDENCE_THRESHOLD, 4);
        executor.cache.insert(
            "search".to_string(),
            SpeculationEntry {
                predicted_tool: "search".to_string(),
                confidence: 0.9,
                reasoning: "follows lookup".to_string(),
                result: Some(serde_json::json!({"hits": 3})),
                status: SpeculationStatus::Ready,
                predecessor_tool: Some("lookup".to_string()),
            },
        );

        assert!(executor.consume("search", Some("other_tool")).is_none());
        assert!(executor.is_empty());
        // Idempotent: consuming again finds nothing, no panic.
        assert!(executor.consume("search", Some("lookup")).is_none());
    }

    #[tokio::test]
    async fn matching_predecessor_yields_cached_result() {
        let executor = SpeculativeExecutor::new(DEFAULT_CONFIDENCE_THRESHOLD, 4);
        executor.cache.insert(
            "search".to_string(),
            SpeculationEntry {
                predicted_tool: "search".to_string(),
                confidence: 0.9,
                reasoning: "follows lookup".to_string(),
                result: Some(serde_json::json!({"hits": 3})),
                status: SpeculationStatus::Ready,
                predecessor_tool: Some("lookup".to_string()),
            },
        );

        let hit = executor.consume("search", Some("lookup"));
        assert_eq!(hit, Some(serde_json::json!({"hits": 3})));
        assert!(executor.is_empty());
    }
}
