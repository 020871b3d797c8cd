//! Worker pipeline tests over the in-process queue and store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fiber_core::queue::{MemoryQueue, SampleQueue, ETL_DLQ, ETL_QUEUE};
use fiber_core::sample::Envelope;
use fiber_etl::config::EtlConfig;
use fiber_etl::store::{MemoryStore, NodeSighting, PersistReport, Store, StoreError};
use fiber_etl::worker::Worker;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn test_config() -> EtlConfig {
    EtlConfig {
        queue_url: "mem:".to_string(),
        db_url: None,
        batch_size: 100,
        idle_backoff: Duration::from_millis(20),
        max_persist_retries: 3,
        heartbeat: Duration::from_secs(60),
        workers: 1,
        queue_high_water: 10_000,
    }
}

fn raw_envelope(node_id: &str, minute: u32, trace: &str, region: &str) -> serde_json::Value {
    json!({
        "node_id": node_id,
        "country": "GH",
        "region": "Accra",
        "latency_ms": 42.0,
        "uptime_pct": 99.5,
        "packet_loss": 0.1,
        "timestamp": format!("2025-12-30T12:{minute:02}:00Z"),
        "probe_type": "ping",
        "_meta": {
            "trace_id": trace,
            "ingest_region": region,
            "ingest_ts": "2025-12-30T12:00:01Z"
        }
    })
}

async fn run_worker_until(
    queue: Arc<MemoryQueue>,
    store: Arc<dyn Store>,
    config: EtlConfig,
    mut done: impl FnMut() -> bool,
) {
    let cancel = CancellationToken::new();
    let worker = Worker::new(0, config, queue, store, cancel.clone());
    let handle = tokio::spawn(worker.run());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline && !done() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn test_happy_path_persists_within_bound() {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());

    for i in 0..5 {
        queue
            .push(ETL_QUEUE, raw_envelope("p1", i, "happyTr", "central"))
            .await
            .unwrap();
    }

    let store_check = store.clone();
    run_worker_until(queue.clone(), store.clone(), test_config(), move || {
        store_check.sample_count() == 5
    })
    .await;

    assert_eq!(store.sample_count(), 5);
    assert!(store.conflicts().is_empty());
    assert_eq!(queue.len(ETL_QUEUE).await.unwrap(), 0);
    assert_eq!(queue.len(ETL_DLQ).await.unwrap(), 0);

    // node registry reflects the sightings
    let node = store.node("p1").unwrap();
    assert_eq!(node.region, "gh-accra");
    assert_eq!(
        node.last_seen_at,
        Utc.with_ymd_and_hms(2025, 12, 30, 12, 4, 0).unwrap()
    );

    // trace continuity into storage
    let persisted = store
        .sample(Utc.with_ymd_and_hms(2025, 12, 30, 12, 0, 0).unwrap(), "p1")
        .unwrap();
    assert_eq!(persisted.meta.trace_id, "happyTr");
}

#[tokio::test]
async fn test_cross_path_duplicate_becomes_conflict() {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());

    // same (node, timestamp) once via the regional path, once direct
    queue
        .push(ETL_QUEUE, raw_envelope("p2", 0, "pathATr", "gh-accra"))
        .await
        .unwrap();
    queue
        .push(ETL_QUEUE, raw_envelope("p2", 0, "pathBTr", "central"))
        .await
        .unwrap();

    let store_check = store.clone();
    run_worker_until(queue.clone(), store.clone(), test_config(), move || {
        store_check.sample_count() == 1 && !store_check.conflicts().is_empty()
    })
    .await;

    assert_eq!(store.sample_count(), 1);
    let conflicts = store.conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].node_id, "p2");
    // the conflict names the second arrival's ingest path
    assert_eq!(conflicts[0].ingest_region.as_deref(), Some("central"));
    assert_eq!(queue.len(ETL_DLQ).await.unwrap(), 0);
}

#[tokio::test]
async fn test_redelivery_after_crash_is_absorbed() {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());

    for i in 0..3 {
        queue
            .push(ETL_QUEUE, raw_envelope("p3", i, "crashTr", "central"))
            .await
            .unwrap();
    }

    // a worker claims the batch and dies before persisting anything
    let stolen = queue.pop_batch(ETL_QUEUE, 100).await.unwrap();
    assert_eq!(stolen.len(), 3);
    assert_eq!(store.sample_count(), 0);

    // at-least-once: the claim lapses and the queue redelivers
    queue.requeue_claimed(ETL_QUEUE).await;

    let store_check = store.clone();
    run_worker_until(queue.clone(), store.clone(), test_config(), move || {
        store_check.sample_count() == 3
    })
    .await;

    assert_eq!(store.sample_count(), 3);
    assert!(store.conflicts().is_empty());
    assert_eq!(queue.len(ETL_DLQ).await.unwrap(), 0);
}

#[tokio::test]
async fn test_poison_item_routed_to_dlq() {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());

    queue.push(ETL_QUEUE, json!({ "garbage": true })).await.unwrap();
    queue
        .push(ETL_QUEUE, raw_envelope("p4", 0, "poisonTr", "central"))
        .await
        .unwrap();

    let store_check = store.clone();
    run_worker_until(queue.clone(), store.clone(), test_config(), move || {
        store_check.sample_count() == 1
    })
    .await;

    // the good item persisted, the poisoned one is stamped in the DLQ
    assert_eq!(store.sample_count(), 1);
    let dlq = queue.pop_batch(ETL_DLQ, 10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].payload["payload"]["garbage"], true);
    assert!(dlq[0].payload["error"].as_str().unwrap().contains("node_id"));
    assert!(dlq[0].payload["failed_at"].is_string());
    // the primary queue holds nothing back
    assert_eq!(queue.len(ETL_QUEUE).await.unwrap(), 0);
}

/// Store that fails a configured number of persist attempts first.
struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicU32,
}

#[async_trait]
impl Store for FlakyStore {
    async fn ensure_node(&self, sighting: &NodeSighting) -> Result<(), StoreError> {
        self.inner.ensure_node(sighting).await
    }

    async fn persist_batch(&self, batch: &[Envelope]) -> Result<PersistReport, StoreError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Backend("synthetic outage".to_string()));
        }
        self.inner.persist_batch(batch).await
    }

    async fn healthy(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_transient_store_failure_retried() {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        failures_left: AtomicU32::new(2),
    });

    queue
        .push(ETL_QUEUE, raw_envelope("p5", 0, "flakyTr", "central"))
        .await
        .unwrap();

    let store_check = store.clone();
    run_worker_until(queue.clone(), store.clone(), test_config(), move || {
        store_check.inner.sample_count() == 1
    })
    .await;

    assert_eq!(store.inner.sample_count(), 1);
    assert_eq!(queue.len(ETL_DLQ).await.unwrap(), 0);
}

#[tokio::test]
async fn test_persistent_store_failure_goes_to_dlq() {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        failures_left: AtomicU32::new(u32::MAX),
    });

    queue
        .push(ETL_QUEUE, raw_envelope("p6", 0, "deadTr", "central"))
        .await
        .unwrap();

    let config = EtlConfig {
        max_persist_retries: 2,
        ..test_config()
    };
    let cancel = CancellationToken::new();
    let worker = Worker::new(0, config, queue.clone(), store.clone(), cancel.clone());
    let handle = tokio::spawn(worker.run());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline && queue.len(ETL_DLQ).await.unwrap() == 0 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();
    let _ = handle.await;

    assert_eq!(store.inner.sample_count(), 0);
    let dlq = queue.pop_batch(ETL_DLQ, 10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].payload["payload"]["node_id"], "p6");
    assert!(dlq[0].payload["error"]
        .as_str()
        .unwrap()
        .contains("synthetic outage"));
}
