//! The ETL processing loop.
//!
//! Workers are stateless and restart-safe: the only coordination between
//! parallel workers is the queue's atomic batch pop, and anything a
//! crashed worker had in flight is redelivered and absorbed by the
//! storage uniqueness constraint. Persist failures retry with exponential
//! backoff; past the retry budget the batch is stamped and routed to the
//! DLQ instead of being lost or wedging the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fiber_core::queue::{SampleQueue, ETL_DLQ, ETL_QUEUE};
use fiber_core::sample::Envelope;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EtlConfig;
use crate::normalizer;
use crate::store::{sightings, Store};

const PERSIST_BACKOFF_BASE: Duration = Duration::from_millis(100);

pub struct Worker {
    id: usize,
    config: EtlConfig,
    queue: Arc<dyn SampleQueue>,
    store: Arc<dyn Store>,
    cancel: CancellationToken,
    processed_total: u64,
    conflict_total: u64,
    last_processed_ts: Option<DateTime<Utc>>,
}

impl Worker {
    pub fn new(
        id: usize,
        config: EtlConfig,
        queue: Arc<dyn SampleQueue>,
        store: Arc<dyn Store>,
        cancel: CancellationToken,
    ) -> Self {
        Worker {
            id,
            config,
            queue,
            store,
            cancel,
            processed_total: 0,
            conflict_total: 0,
            last_processed_ts: None,
        }
    }

    pub async fn run(mut self) {
        info!(worker = self.id, batch_size = self.config.batch_size, "etl worker started");
        let cancel = self.cancel.clone();
        let mut last_beat = tokio::time::Instant::now();

        while !cancel.is_cancelled() {
            if last_beat.elapsed() >= self.config.heartbeat {
                self.heartbeat().await;
                last_beat = tokio::time::Instant::now();
            }

            let processed = self.process_round().await;
            if processed == 0 {
                // empty queue; idle off the pop loop
                tokio::select! {
                    () = tokio::time::sleep(self.config.idle_backoff) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }
        info!(
            worker = self.id,
            processed_total = self.processed_total,
            "etl worker stopped"
        );
    }

    /// One claim-normalize-persist-ack cycle. Returns how many items it
    /// claimed. Items are acked only once they are in storage, the
    /// conflict log, or the DLQ; a crash anywhere before that leaves the
    /// claim to expire and the queue redelivers.
    async fn process_round(&mut self) -> usize {
        let items = match self.queue.pop_batch(ETL_QUEUE, self.config.batch_size).await {
            Ok(items) => items,
            Err(e) => {
                warn!(worker = self.id, error = %e, "queue pop failed");
                tokio::time::sleep(self.config.idle_backoff).await;
                return 0;
            }
        };
        if items.is_empty() {
            return 0;
        }
        let taken = items.len();
        debug!(worker = self.id, count = taken, "processing batch");

        // parse/normalize; poisoned items go straight to the DLQ
        let mut batch: Vec<Envelope> = Vec::with_capacity(taken);
        let mut batch_ids: Vec<i64> = Vec::with_capacity(taken);
        let mut done_ids: Vec<i64> = Vec::new();
        for item in items {
            match normalizer::normalize(&item.payload) {
                Ok(envelope) => {
                    batch.push(envelope);
                    batch_ids.push(item.id);
                }
                Err(e) => {
                    warn!(worker = self.id, error = %e, "unparseable item, routing to DLQ");
                    if self.send_to_dlq(item.payload, &e.to_string()).await {
                        done_ids.push(item.id);
                    }
                }
            }
        }

        if !batch.is_empty() {
            match self.persist_with_retries(&batch).await {
                Ok(()) => done_ids.extend(&batch_ids),
                Err(e) => {
                    error!(
                        worker = self.id,
                        error = %e,
                        count = batch.len(),
                        "persist retries exhausted, routing batch to DLQ"
                    );
                    for (envelope, id) in batch.iter().zip(&batch_ids) {
                        let payload = serde_json::to_value(envelope).unwrap_or_default();
                        if self.send_to_dlq(payload, &e).await {
                            done_ids.push(*id);
                        }
                    }
                }
            }
        }

        if let Err(e) = self.queue.ack(ETL_QUEUE, &done_ids).await {
            // redelivery will replay; uniqueness absorbs the duplicates
            warn!(worker = self.id, error = %e, "ack failed, items will be redelivered");
        }
        taken
    }

    async fn persist_with_retries(&mut self, batch: &[Envelope]) -> Result<(), String> {
        let mut last_error = String::new();
        for attempt in 1..=self.config.max_persist_retries {
            match self.persist_once(batch).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = e;
                    warn!(
                        worker = self.id,
                        attempt,
                        error = %last_error,
                        "persist attempt failed"
                    );
                    if attempt < self.config.max_persist_retries {
                        let backoff = PERSIST_BACKOFF_BASE
                            .saturating_mul(1u32 << attempt.min(8))
                            .min(Duration::from_secs(10));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn persist_once(&mut self, batch: &[Envelope]) -> Result<(), String> {
        for sighting in sightings(batch) {
            self.store
                .ensure_node(&sighting)
                .await
                .map_err(|e| e.to_string())?;
        }

        let report = self
            .store
            .persist_batch(batch)
            .await
            .map_err(|e| e.to_string())?;

        self.processed_total += report.inserted as u64;
        self.conflict_total += report.conflicts as u64;
        self.last_processed_ts = batch.iter().map(|e| e.sample.timestamp).max();

        if report.conflicts > 0 {
            // duplicates are expected under federation replay
            let duplicate_traces: Vec<&str> = batch
                .iter()
                .map(|e| e.meta.trace_id.as_str())
                .take(5)
                .collect();
            info!(
                worker = self.id,
                inserted = report.inserted,
                conflicts = report.conflicts,
                traces = ?duplicate_traces,
                "batch persisted with conflicts"
            );
        } else {
            info!(
                worker = self.id,
                inserted = report.inserted,
                "batch persisted"
            );
        }
        Ok(())
    }

    /// True when the entry landed in the DLQ (and may be acked away).
    async fn send_to_dlq(&self, payload: serde_json::Value, error: &str) -> bool {
        let entry = serde_json::json!({
            "payload": payload,
            "error": error,
            "failed_at": Utc::now().to_rfc3339(),
        });
        match self.queue.push(ETL_DLQ, entry).await {
            Ok(()) => true,
            Err(e) => {
                // leave the claim unacked; redelivery retries the move
                error!(worker = self.id, error = %e, "DLQ push failed");
                false
            }
        }
    }

    async fn heartbeat(&self) {
        let depth = self.queue.len(ETL_QUEUE).await.unwrap_or(0);
        info!(
            worker = self.id,
            processed_total = self.processed_total,
            conflict_total = self.conflict_total,
            last_processed_ts = ?self.last_processed_ts,
            queue_depth = depth,
            "heartbeat"
        );
        if depth > self.config.queue_high_water {
            warn!(
                worker = self.id,
                queue_depth = depth,
                high_water = self.config.queue_high_water,
                "queue depth over high-water mark"
            );
        }
    }
}
