//! Store-and-forward drain toward central.
//!
//! The forwarder moves between two states driven by central's health:
//!
//! * `Forwarding`: drain the buffer at a sustained rate, retrying
//!   transient failures with exponential backoff; after `fail_threshold`
//!   consecutive failures central is declared down.
//! * `Buffering`: accept pushes only (the front end keeps writing to the
//!   buffer) and probe central's `/status` until it answers again.
//!
//! Buffer occupancy past high-water is the third, overriding state: the
//! front end rejects with 503 while the drain keeps running. Batch ids are
//! derived from the buffered sequence range, so a replay after a crash
//! re-presents the same id and central's idempotency index absorbs it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fiber_core::sample::MAX_BATCH_BYTES;
use fiber_core::trace::TRACE_HEADER;
use reqwest::StatusCode;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::DurableBuffer;
use crate::config::RelayConfig;
use crate::RelayError;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Forwarding,
    Buffering,
}

#[derive(Debug)]
struct StatusInner {
    state: ForwardState,
    consecutive_failures: u32,
    forwarded_total: u64,
    last_forward: Option<DateTime<Utc>>,
}

/// Shared view of the forwarder for `/federation/status`.
pub struct ForwarderStatus {
    buffer: Arc<DurableBuffer>,
    inner: Mutex<StatusInner>,
}

impl ForwarderStatus {
    fn new(buffer: Arc<DurableBuffer>) -> Self {
        ForwarderStatus {
            buffer,
            inner: Mutex::new(StatusInner {
                state: ForwardState::Forwarding,
                consecutive_failures: 0,
                forwarded_total: 0,
                last_forward: None,
            }),
        }
    }

    pub fn state_name(&self) -> &'static str {
        if self.buffer.is_degraded() {
            return "degraded_full";
        }
        #[allow(clippy::expect_used)]
        match self.inner.lock().expect("status lock poisoned").state {
            ForwardState::Forwarding => "forwarding",
            ForwardState::Buffering => "buffering",
        }
    }
}

impl fiber_gateway::FederationReporter for ForwarderStatus {
    fn report(&self) -> serde_json::Value {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("status lock poisoned");
        json!({
            "state": match (self.buffer.is_degraded(), inner.state) {
                (true, _) => "degraded_full",
                (false, ForwardState::Forwarding) => "forwarding",
                (false, ForwardState::Buffering) => "buffering",
            },
            "buffered": self.buffer.pending(),
            "buffered_bytes": self.buffer.pending_bytes(),
            "consecutive_failures": inner.consecutive_failures,
            "forwarded_total": inner.forwarded_total,
            "last_forward": inner.last_forward.map(|t| t.to_rfc3339()),
            "source": "forwarder",
        })
    }
}

enum ForwardError {
    /// 5xx or network trouble; retry and count toward the threshold.
    Transient(String),
    /// Central refused the payload outright; retrying cannot help.
    Rejected(StatusCode),
}

pub struct Forwarder {
    buffer: Arc<DurableBuffer>,
    config: RelayConfig,
    client: reqwest::Client,
    status: Arc<ForwarderStatus>,
    cancel: CancellationToken,
}

impl Forwarder {
    pub fn new(
        buffer: Arc<DurableBuffer>,
        config: RelayConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, Arc<ForwarderStatus>), RelayError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let status = Arc::new(ForwarderStatus::new(Arc::clone(&buffer)));
        Ok((
            Forwarder {
                buffer,
                config,
                client,
                status: Arc::clone(&status),
                cancel,
            },
            status,
        ))
    }

    pub async fn run(self) {
        info!(
            central = %self.config.central_endpoint,
            region = %self.config.gateway.region,
            "forwarder started"
        );
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let state = {
                #[allow(clippy::expect_used)]
                self.status.inner.lock().expect("status lock poisoned").state
            };
            match state {
                ForwardState::Forwarding => self.drain_round().await,
                ForwardState::Buffering => self.probe_round().await,
            }
        }
        info!("forwarder stopped");
    }

    async fn drain_round(&self) {
        self.buffer.enforce_retention();

        let batch = self
            .buffer
            .peek_batch(self.config.forward_batch, MAX_BATCH_BYTES);
        if batch.is_empty() {
            self.sleep(self.config.drain_idle).await;
            return;
        }

        let last_seq = batch.last().map(|(seq, _)| *seq).unwrap_or(0);
        let count = batch.len();
        match self.forward(&batch).await {
            Ok(()) => {
                if let Err(e) = self.buffer.ack(last_seq) {
                    error!(error = %e, "ack failed after successful forward");
                }
                #[allow(clippy::expect_used)]
                let mut inner = self.status.inner.lock().expect("status lock poisoned");
                inner.consecutive_failures = 0;
                inner.forwarded_total += count as u64;
                inner.last_forward = Some(Utc::now());
                debug!(count, last_seq, "batch forwarded to central");
            }
            Err(ForwardError::Rejected(status)) => {
                // malformed data never becomes acceptable; drop it rather
                // than wedge the buffer head
                error!(count, %status, "central rejected batch, discarding");
                if let Err(e) = self.buffer.ack(last_seq) {
                    error!(error = %e, "ack failed while discarding rejected batch");
                }
            }
            Err(ForwardError::Transient(reason)) => {
                let failures = {
                    #[allow(clippy::expect_used)]
                    let mut inner = self.status.inner.lock().expect("status lock poisoned");
                    inner.consecutive_failures += 1;
                    inner.consecutive_failures
                };
                warn!(failures, reason, "forward attempt failed");
                if failures >= self.config.fail_threshold {
                    warn!("central unreachable, entering buffering state");
                    #[allow(clippy::expect_used)]
                    let mut inner = self.status.inner.lock().expect("status lock poisoned");
                    inner.state = ForwardState::Buffering;
                } else {
                    let backoff = BACKOFF_BASE
                        .saturating_mul(1u32 << failures.min(5))
                        .min(BACKOFF_CAP);
                    self.sleep(backoff).await;
                }
            }
        }
    }

    async fn probe_round(&self) {
        self.sleep(self.config.probe_interval).await;
        if self.cancel.is_cancelled() {
            return;
        }
        if self.central_healthy().await {
            info!("central healthy again, resuming forwarding");
            #[allow(clippy::expect_used)]
            let mut inner = self.status.inner.lock().expect("status lock poisoned");
            inner.state = ForwardState::Forwarding;
            inner.consecutive_failures = 0;
        }
    }

    async fn forward(&self, batch: &[(u64, serde_json::Value)]) -> Result<(), ForwardError> {
        let first_seq = batch.first().map(|(seq, _)| *seq).unwrap_or(0);
        let last_seq = batch.last().map(|(seq, _)| *seq).unwrap_or(0);
        // same unsent range => same id => central dedupes replays
        let batch_id = format!("{}-{}-{}", self.config.gateway.region, first_seq, last_seq);

        let samples: Vec<&serde_json::Value> = batch.iter().map(|(_, payload)| payload).collect();
        let trace_id = samples
            .first()
            .and_then(|payload| payload["_meta"]["trace_id"].as_str())
            .unwrap_or("");

        let mut req = self
            .client
            .post(format!("{}/ingest", self.config.central_endpoint))
            .bearer_auth(&self.config.federation_secret)
            .header("X-Batch-ID", &batch_id)
            .header("X-Region-ID", &self.config.gateway.region)
            .json(&json!({
                "samples": samples,
                "source_region": self.config.gateway.region,
            }));
        if !trace_id.is_empty() {
            req = req.header(TRACE_HEADER, trace_id);
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() || status == StatusCode::CONFLICT {
                    Ok(())
                } else if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                    Err(ForwardError::Rejected(status))
                } else {
                    Err(ForwardError::Transient(format!("central answered {status}")))
                }
            }
            Err(e) => Err(ForwardError::Transient(e.to_string())),
        }
    }

    async fn central_healthy(&self) -> bool {
        let url = format!("{}/status", self.config.central_endpoint);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Cancellable sleep so shutdown never waits out a backoff.
    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.cancel.cancelled() => {}
        }
    }
}
