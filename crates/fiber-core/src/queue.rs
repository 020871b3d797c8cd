//! Durable FIFO queue abstraction between the gateway and the ETL.
//!
//! The queue is the single serialization point of the pipeline: the
//! gateway is the only writer of `fiber:etl:queue`, the ETL the only
//! reader, and `pop_batch` is atomic so parallel workers never split a
//! batch. Delivery is at-least-once: a pop *claims* items rather than
//! deleting them, and a consumer that dies before [`SampleQueue::ack`]
//! has its claim expire and the items redelivered. Storage-level
//! uniqueness absorbs the resulting duplicates.
//!
//! Items are opaque JSON values because the DLQ stores envelopes wrapped
//! with a failure stamp, not bare envelopes.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Primary work queue drained by the ETL.
pub const ETL_QUEUE: &str = "fiber:etl:queue";
/// Dead-letter queue for items that failed persistence after retries.
pub const ETL_DLQ: &str = "fiber:etl:dlq";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    Backend(String),

    #[error("queue payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One claimed queue entry. `id` is the ack token.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait SampleQueue: Send + Sync {
    /// Appends one item to the tail.
    async fn push(&self, queue: &str, item: serde_json::Value) -> Result<(), QueueError>;

    /// Appends items in order; either all land or none do.
    async fn push_all(&self, queue: &str, items: Vec<serde_json::Value>) -> Result<usize, QueueError>;

    /// Atomically claims up to `max` items from the head. Claimed items
    /// are invisible to other consumers until acked or until the claim
    /// expires (backend-defined visibility timeout).
    async fn pop_batch(&self, queue: &str, max: usize) -> Result<Vec<QueueItem>, QueueError>;

    /// Confirms processing; acked items are gone for good.
    async fn ack(&self, queue: &str, ids: &[i64]) -> Result<(), QueueError>;

    /// Current depth, claimed items included.
    async fn len(&self, queue: &str) -> Result<usize, QueueError>;

    /// Cheap backend liveness check for `/status`.
    async fn healthy(&self) -> bool;
}

#[derive(Default)]
struct MemQueueState {
    ready: VecDeque<QueueItem>,
    claimed: HashMap<i64, serde_json::Value>,
}

/// In-process queue for tests and single-process deployments.
///
/// One async mutex over all named queues makes multi-pop trivially
/// atomic. Claims do not expire on their own (the queue dies with the
/// process anyway), but [`MemoryQueue::requeue_claimed`] puts a dead
/// consumer's claims back at the head, which is how tests exercise
/// crash-redelivery.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<MemInner>,
}

#[derive(Default)]
struct MemInner {
    queues: HashMap<String, MemQueueState>,
    next_id: i64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every unacked claim of `queue` to the head, preserving id
    /// order, the redelivery a real backend performs when a consumer's
    /// visibility timeout lapses.
    pub async fn requeue_claimed(&self, queue: &str) {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.queues.get_mut(queue) else {
            return;
        };
        let mut reclaimed: Vec<QueueItem> = state
            .claimed
            .drain()
            .map(|(id, payload)| QueueItem { id, payload })
            .collect();
        reclaimed.sort_by_key(|item| item.id);
        for item in reclaimed.into_iter().rev() {
            state.ready.push_front(item);
        }
    }
}

#[async_trait]
impl SampleQueue for MemoryQueue {
    async fn push(&self, queue: &str, item: serde_json::Value) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(QueueItem { id, payload: item });
        Ok(())
    }

    async fn push_all(&self, queue: &str, items: Vec<serde_json::Value>) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().await;
        let n = items.len();
        for item in items {
            inner.next_id += 1;
            let id = inner.next_id;
            inner
                .queues
                .entry(queue.to_string())
                .or_default()
                .ready
                .push_back(QueueItem { id, payload: item });
        }
        Ok(n)
    }

    async fn pop_batch(&self, queue: &str, max: usize) -> Result<Vec<QueueItem>, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let take = max.min(state.ready.len());
        let items: Vec<QueueItem> = state.ready.drain(..take).collect();
        for item in &items {
            state.claimed.insert(item.id, item.payload.clone());
        }
        Ok(items)
    }

    async fn ack(&self, queue: &str, ids: &[i64]) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.queues.get_mut(queue) {
            for id in ids {
                state.claimed.remove(id);
            }
        }
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<usize, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queues
            .get(queue)
            .map_or(0, |state| state.ready.len() + state.claimed.len()))
    }

    async fn healthy(&self) -> bool {
        true
    }
}
