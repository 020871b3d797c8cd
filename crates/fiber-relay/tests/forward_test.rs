//! Forwarder state machine and end-to-end relay tests.

mod common;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::MockCentral;
use fiber_core::queue::SampleQueue;
use fiber_gateway::config::{GatewayConfig, Role};
use fiber_gateway::{server, Gateway};
use fiber_relay::buffer::DurableBuffer;
use fiber_relay::config::RelayConfig;
use fiber_relay::forwarder::Forwarder;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const FED_SECRET: &str = "relay-it-secret";

fn relay_config(central_url: &str, buffer_dir: &Path, audit_dir: &Path) -> RelayConfig {
    RelayConfig {
        gateway: GatewayConfig {
            bind_addr: "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            role: Role::Regional,
            region: "gh-accra".to_string(),
            jwt_secret: None,
            federation_secret: Some(FED_SECRET.to_string()),
            queue_url: "mem:".to_string(),
            db_url: None,
            push_rate: 100.0,
            push_burst: 100.0,
            ingest_rate: 100.0,
            ingest_burst: 100.0,
            metrics_rate: 100.0,
            metrics_burst: 100.0,
            global_max: 10_000.0,
            per_key_share: 1.0,
            idempotency_ttl: Duration::from_secs(3600),
            audit_log_path: audit_dir.join("audit.jsonl"),
            shutdown_grace: Duration::from_secs(1),
            dlq_degrade_threshold: 1000,
        },
        central_endpoint: central_url.to_string(),
        federation_secret: FED_SECRET.to_string(),
        buffer_dir: buffer_dir.to_path_buf(),
        buffer_max_bytes: 1 << 20,
        buffer_retention: Duration::from_secs(24 * 3600),
        forward_batch: 1000,
        fail_threshold: 2,
        probe_interval: Duration::from_millis(100),
        drain_idle: Duration::from_millis(50),
        request_timeout: Duration::from_secs(2),
    }
}

fn envelope(node_id: &str, minute: u32, trace: &str) -> serde_json::Value {
    json!({
        "node_id": node_id,
        "country": "GH",
        "region": "Accra",
        "latency_ms": 42.0,
        "uptime_pct": 100.0,
        "packet_loss": 0.0,
        "timestamp": format!("2025-12-30T12:{minute:02}:00Z"),
        "probe_type": "ping",
        "_meta": {
            "trace_id": trace,
            "ingest_region": "gh-accra",
            "ingest_ts": "2025-12-30T12:00:01Z"
        }
    })
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_forwarder_drains_buffer_to_central() {
    let central = MockCentral::start().await;
    let buffer_dir = tempfile::tempdir().unwrap();
    let audit_dir = tempfile::tempdir().unwrap();
    let config = relay_config(&central.url(), buffer_dir.path(), audit_dir.path());

    let buffer = Arc::new(
        DurableBuffer::open(buffer_dir.path(), 1 << 20, Duration::from_secs(3600)).unwrap(),
    );
    for i in 0..5 {
        buffer.append(envelope("p1", i, "relayTr1")).unwrap();
    }

    let cancel = CancellationToken::new();
    let (forwarder, status) = Forwarder::new(Arc::clone(&buffer), config, cancel.clone()).unwrap();
    let handle = tokio::spawn(forwarder.run());

    assert!(wait_until(|| buffer.pending() == 0, Duration::from_secs(5)).await);
    assert_eq!(status.state_name(), "forwarding");

    let ingests = central.requests_for("/ingest");
    assert!(!ingests.is_empty());
    let req = &ingests[0];
    assert_eq!(req.body["samples"].as_array().unwrap().len(), 5);
    assert_eq!(req.body["source_region"], "gh-accra");
    assert_eq!(req.header("x-region-id"), Some("gh-accra"));
    assert_eq!(req.header("x-trace-id"), Some("relayTr1"));
    assert_eq!(req.header("authorization"), Some("Bearer relay-it-secret"));
    assert!(req.header("x-batch-id").unwrap().starts_with("gh-accra-"));

    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn test_outage_buffers_then_replays() {
    let central = MockCentral::start().await;
    central.ingest_responds_with(503);
    central.status_responds_with(503);

    let buffer_dir = tempfile::tempdir().unwrap();
    let audit_dir = tempfile::tempdir().unwrap();
    let config = relay_config(&central.url(), buffer_dir.path(), audit_dir.path());

    let buffer = Arc::new(
        DurableBuffer::open(buffer_dir.path(), 1 << 20, Duration::from_secs(3600)).unwrap(),
    );
    for i in 0..3 {
        buffer.append(envelope("p2", i, "outageTr")).unwrap();
    }

    let cancel = CancellationToken::new();
    let (forwarder, status) =
        Forwarder::new(Arc::clone(&buffer), config, cancel.clone()).unwrap();
    let handle = tokio::spawn(forwarder.run());

    // fail_threshold transient failures flip the state machine
    assert!(wait_until(|| status.state_name() == "buffering", Duration::from_secs(10)).await);
    assert_eq!(buffer.pending(), 3);

    // samples accepted during the outage keep accumulating
    buffer.append(envelope("p2", 10, "outageTr")).unwrap();
    assert_eq!(buffer.pending(), 4);

    // recovery: health probe notices, full replay follows
    central.ingest_responds_with(202);
    central.status_responds_with(200);
    assert!(wait_until(|| buffer.pending() == 0, Duration::from_secs(10)).await);
    assert!(wait_until(|| status.state_name() == "forwarding", Duration::from_secs(5)).await);

    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn test_replayed_batch_reuses_batch_id() {
    let central = MockCentral::start().await;
    central.ingest_responds_with(500);

    let buffer_dir = tempfile::tempdir().unwrap();
    let audit_dir = tempfile::tempdir().unwrap();
    let mut config = relay_config(&central.url(), buffer_dir.path(), audit_dir.path());
    config.fail_threshold = 10; // keep retrying instead of flipping state

    let buffer = Arc::new(
        DurableBuffer::open(buffer_dir.path(), 1 << 20, Duration::from_secs(3600)).unwrap(),
    );
    buffer.append(envelope("p3", 0, "replayTr")).unwrap();

    let cancel = CancellationToken::new();
    let (forwarder, _status) = Forwarder::new(Arc::clone(&buffer), config, cancel.clone()).unwrap();
    let handle = tokio::spawn(forwarder.run());

    assert!(
        wait_until(|| central.requests_for("/ingest").len() >= 2, Duration::from_secs(10)).await
    );
    central.ingest_responds_with(202);
    assert!(wait_until(|| buffer.pending() == 0, Duration::from_secs(10)).await);

    let ids: Vec<String> = central
        .requests_for("/ingest")
        .iter()
        .map(|r| r.header("x-batch-id").unwrap().to_string())
        .collect();
    assert!(ids.len() >= 2);
    assert!(
        ids.iter().all(|id| id == &ids[0]),
        "same unsent range must present the same batch id: {ids:?}"
    );

    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn test_central_conflict_counts_as_delivered() {
    let central = MockCentral::start().await;
    central.ingest_responds_with(409);

    let buffer_dir = tempfile::tempdir().unwrap();
    let audit_dir = tempfile::tempdir().unwrap();
    let config = relay_config(&central.url(), buffer_dir.path(), audit_dir.path());

    let buffer = Arc::new(
        DurableBuffer::open(buffer_dir.path(), 1 << 20, Duration::from_secs(3600)).unwrap(),
    );
    buffer.append(envelope("p4", 0, "confTr")).unwrap();

    let cancel = CancellationToken::new();
    let (forwarder, _status) = Forwarder::new(Arc::clone(&buffer), config, cancel.clone()).unwrap();
    let handle = tokio::spawn(forwarder.run());

    assert!(wait_until(|| buffer.pending() == 0, Duration::from_secs(5)).await);
    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn test_rejected_batch_is_discarded_not_wedged() {
    let central = MockCentral::start().await;
    central.ingest_responds_with(400);

    let buffer_dir = tempfile::tempdir().unwrap();
    let audit_dir = tempfile::tempdir().unwrap();
    let config = relay_config(&central.url(), buffer_dir.path(), audit_dir.path());

    let buffer = Arc::new(
        DurableBuffer::open(buffer_dir.path(), 1 << 20, Duration::from_secs(3600)).unwrap(),
    );
    buffer.append(envelope("p5", 0, "rejTr")).unwrap();

    let cancel = CancellationToken::new();
    let (forwarder, _status) = Forwarder::new(Arc::clone(&buffer), config, cancel.clone()).unwrap();
    let handle = tokio::spawn(forwarder.run());

    assert!(wait_until(|| buffer.pending() == 0, Duration::from_secs(5)).await);
    // exactly one attempt; rejection is terminal
    assert_eq!(central.requests_for("/ingest").len(), 1);

    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn test_end_to_end_relay_front_end_to_central() {
    let central = MockCentral::start().await;
    let buffer_dir = tempfile::tempdir().unwrap();
    let audit_dir = tempfile::tempdir().unwrap();
    let config = relay_config(&central.url(), buffer_dir.path(), audit_dir.path());

    let buffer = Arc::new(
        DurableBuffer::open(buffer_dir.path(), 1 << 20, Duration::from_secs(3600)).unwrap(),
    );

    let cancel = CancellationToken::new();
    let (forwarder, status) = Forwarder::new(Arc::clone(&buffer), config.clone(), cancel.clone()).unwrap();
    tokio::spawn(forwarder.run());

    let gateway = Arc::new(
        Gateway::new(config.gateway.clone(), Arc::clone(&buffer) as Arc<dyn SampleQueue>)
            .with_federation(status),
    );
    let listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = server::serve_on(gateway, listener, serve_cancel).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // probe pushes a batch at the relay front end
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/ingest"))
        .bearer_auth(FED_SECRET)
        .header("X-Batch-ID", "probe-batch-1")
        .header("X-Trace-ID", "e2eTrace")
        .json(&json!({
            "samples": [{
                "node_id": "p6",
                "country": "GH",
                "region": "Accra",
                "latency_ms": 10.0,
                "uptime_pct": 99.0,
                "packet_loss": 0.5,
                "timestamp": "2025-12-30T13:00:00Z"
            }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    // the forwarder relays it to central with the region stamp intact
    assert!(
        wait_until(|| !central.requests_for("/ingest").is_empty(), Duration::from_secs(5)).await
    );
    let forwarded = &central.requests_for("/ingest")[0];
    let sample = &forwarded.body["samples"][0];
    assert_eq!(sample["node_id"], "p6");
    assert_eq!(sample["_meta"]["ingest_region"], "gh-accra");
    assert_eq!(sample["_meta"]["trace_id"], "e2eTrace");

    // federation status reflects the relay role
    let status_body: serde_json::Value = client
        .get(format!("http://{addr}/federation/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status_body["data"]["role"], "regional");
    assert_eq!(status_body["data"]["state"], "forwarding");

    cancel.cancel();
}
