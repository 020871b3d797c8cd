//! Bounded FIFO buffer for samples the uplink could not take.
//!
//! Capacity is a hard item bound; at capacity the oldest sample is dropped
//! so recency is preserved. Owned by the agent loop: single writer, no
//! locking.

use std::collections::VecDeque;

use fiber_core::sample::Sample;
use tracing::warn;

pub struct SampleBuffer {
    items: VecDeque<Sample>,
    max: usize,
    dropped: u64,
}

impl SampleBuffer {
    pub fn new(max: usize) -> Self {
        SampleBuffer {
            items: VecDeque::with_capacity(max.min(1024)),
            max,
            dropped: 0,
        }
    }

    /// Buffers a sample, evicting the oldest when full.
    pub fn push(&mut self, sample: Sample) {
        if self.items.len() >= self.max {
            self.items.pop_front();
            self.dropped += 1;
            warn!(
                buffered = self.items.len(),
                dropped_total = self.dropped,
                "probe buffer full, dropping oldest sample"
            );
        }
        self.items.push_back(sample);
    }

    /// Removes up to `max` samples from the head for a flush attempt.
    pub fn drain_batch(&mut self, max: usize) -> Vec<Sample> {
        let take = max.min(self.items.len());
        self.items.drain(..take).collect()
    }

    /// Puts a failed flush back at the head, preserving order. Anything
    /// that no longer fits is dropped from the returned batch's oldest end.
    pub fn requeue_front(&mut self, batch: Vec<Sample>) {
        let room = self.max - self.items.len();
        let skip = batch.len().saturating_sub(room);
        if skip > 0 {
            self.dropped += skip as u64;
            warn!(dropped = skip, "probe buffer overflow on requeue, dropping oldest");
        }
        for sample in batch.into_iter().skip(skip).rev() {
            self.items.push_front(sample);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped
    }
}
