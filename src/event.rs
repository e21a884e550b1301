//! The event stream: ordered, typed events fanned out to subscribers
//! (spec.md §3 "ExecutionEvent", §4.3).
//!
//! Grounded on the teacher's `events.rs` `EventSidecar`, which publishes to a
//! single `mpsc::Sender`. Here the stream has to fan out to an arbitrary
//! number of subscribers, each with its own bounded, drop-oldest buffer, so
//! publish can never block the scheduler on a stalled consumer.

#![allow(clippy::unwrap_used)] // std Mutex::lock().unwrap(): poisoning is unrecoverable here anyway.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};

use crate::decision::DecisionKind;
use crate::ids::{now_millis, TaskId, WorkflowId};

/// Type-specific payload of an [`ExecutionEvent`] (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    WorkflowStart,
    LayerStart {
        layer_index: usize,
        task_ids: Vec<TaskId>,
    },
    TaskStart {
        task_id: TaskId,
    },
    TaskComplete {
        task_id: TaskId,
        duration_ms: u64,
    },
    TaskWarning {
        task_id: TaskId,
        message: String,
    },
    TaskError {
        task_id: TaskId,
        message: String,
    },
    StateUpdated {
        layer_index: usize,
        successful_tasks: usize,
        failed_tasks: usize,
    },
    Checkpoint {
        checkpoint_id: String,
        layer_index: usize,
        failed: bool,
    },
    DecisionRequired {
        kind: DecisionKind,
        description: String,
        summary: Option<String>,
    },
    /// Not part of the §3 tagged union proper, but required by §4.9: the
    /// only event the speculative executor is allowed to emit.
    SpeculationStart {
        tool_id: String,
        confidence: f64,
    },
    WorkflowComplete {
        successful_tasks: usize,
        failed_tasks: usize,
        total_tasks: usize,
    },
}

/// A single event on the stream: a monotonic timestamp, the owning
/// workflow, and a type-specific payload (spec.md §6 "Event wire shape").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub timestamp: u64,
    pub workflow_id: WorkflowId,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl ExecutionEvent {
    pub fn new(workflow_id: WorkflowId, payload: EventPayload) -> Self {
        Self {
            timestamp: now_millis(),
            workflow_id,
            payload,
        }
    }
}

const DEFAULT_MAX_BUFFER: usize = 1024;

struct SubscriberInner {
    buffer: std::sync::Mutex<VecDeque<ExecutionEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
    max_buffer: usize,
}

/// Handle returned by [`EventStream::subscribe`].
pub struct EventReceiver {
    inner: Arc<SubscriberInner>,
}

impl EventReceiver {
    /// Await the next event, or `None` once the stream has closed and the
    /// buffer has drained.
    pub async fn recv(&self) -> Option<ExecutionEvent> {
        loop {
            {
                let mut buffer = self.inner.buffer.lock().unwrap();
                if let Some(event) = buffer.pop_front() {
                    return Some(event);
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Number of events dropped for this consumer due to overflow.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// Per-subscriber statistics, rolled up by [`EventStream::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStats {
    pub buffered: usize,
    pub dropped: u64,
}

/// Stream-wide statistics (backs the exposed `get_stream_stats()`, spec.md §6).
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub subscriber_count: usize,
    pub total_dropped: u64,
    pub per_subscriber: Vec<SubscriberStats>,
}

/// Single-producer, multi-consumer ordered event stream (spec.md §4.3).
///
/// Emission is synchronous and never awaits: a stalled consumer only loses
/// its own oldest buffered events, it never backs up the scheduler.
pub struct EventStream {
    subscribers: RwLock<Vec<Arc<SubscriberInner>>>,
    max_buffer: usize,
    closed: AtomicBool,
}

impl EventStream {
    pub fn new(max_buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            max_buffer: if max_buffer == 0 {
                DEFAULT_MAX_BUFFER
            } else {
                max_buffer
            },
            closed: AtomicBool::new(false),
        }
    }

    /// Attach a new consumer. Only events emitted after this call are
    /// visible to it (spec.md §4.3: "every consumer that was attached when
    /// the event was emitted").
    pub async fn subscribe(&self) -> EventReceiver {
        let inner = Arc::new(SubscriberInner {
            buffer: std::sync::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(self.closed.load(Ordering::Acquire)),
            max_buffer: self.max_buffer,
        });
        self.subscribers.write().await.push(inner.clone());
        EventReceiver { inner }
    }

    /// Publish `event` to every attached consumer. Never blocks.
    pub async fn publish(&self, event: ExecutionEvent) {
        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.iter() {
            let mut buffer = subscriber.buffer.lock().unwrap();
            buffer.push_back(event.clone());
            while buffer.len() > subscriber.max_buffer {
                buffer.pop_front();
                subscriber.dropped.fetch_add(1, Ordering::Relaxed);
            }
            drop(buffer);
            subscriber.notify.notify_one();
        }
    }

    /// Close the stream: subscribers drain their buffers, then `recv`
    /// returns `None`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.iter() {
            subscriber.closed.store(true, Ordering::Release);
            subscriber.notify.notify_one();
        }
    }

    /// Snapshot statistics across all attached consumers.
    pub async fn stats(&self) -> StreamStats {
        let subscribers = self.subscribers.read().await;
        let per_subscriber: Vec<SubscriberStats> = subscribers
            .iter()
            .map(|s| SubscriberStats {
                buffered: s.buffer.lock().unwrap().len(),
                dropped: s.dropped.load(Ordering::Relaxed),
            })
            .collect();
        StreamStats {
            subscriber_count: per_subscriber.len(),
            total_dropped: per_subscriber.iter().map(|s| s.dropped).sum(),
            per_subscriber,
        }
    }
}
