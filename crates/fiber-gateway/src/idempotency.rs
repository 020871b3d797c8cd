//! TTL-bounded index of recently seen batch ids.
//!
//! A duplicate `X-Batch-ID` inside the retention window is answered with
//! the originally enqueued count and no further work. Entries expire by
//! TTL; pruning piggybacks on writes so an idle gateway holds the map
//! steady without a sweeper task.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct IdempotencyIndex {
    ttl: Duration,
    inner: Mutex<HashMap<String, Seen>>,
}

struct Seen {
    enqueued: usize,
    at: Instant,
}

impl IdempotencyIndex {
    pub fn new(ttl: Duration) -> Self {
        IdempotencyIndex {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Originally enqueued count when `batch_id` was already processed
    /// inside the window.
    pub fn lookup(&self, batch_id: &str) -> Option<usize> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("idempotency lock poisoned");
        inner
            .get(batch_id)
            .filter(|seen| seen.at.elapsed() < self.ttl)
            .map(|seen| seen.enqueued)
    }

    /// Records a processed batch after its enqueue committed.
    pub fn record(&self, batch_id: &str, enqueued: usize) {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("idempotency lock poisoned");
        let ttl = self.ttl;
        if inner.len() % 256 == 0 {
            inner.retain(|_, seen| seen.at.elapsed() < ttl);
        }
        inner.insert(
            batch_id.to_string(),
            Seen {
                enqueued,
                at: Instant::now(),
            },
        );
    }

    #[cfg(test)]
    fn record_at(&self, batch_id: &str, enqueued: usize, at: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(batch_id.to_string(), Seen { enqueued, at });
    }
}
