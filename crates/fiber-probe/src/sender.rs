//! HTTP delivery with retry and trace propagation.
//!
//! Singles go to `/push`, recovered buffer batches to `/ingest` with a
//! fresh `X-Batch-ID` so the gateway can dedupe replays. 5xx and network
//! errors retry with exponential backoff; other 4xx responses are terminal
//! for the attempt; the payload will never become acceptable by retrying.

use std::time::Duration;

use fiber_core::sample::{Sample, SampleBatch};
use fiber_core::trace::{TraceId, TRACE_HEADER};
use reqwest::StatusCode;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::ProbeConfig;
use crate::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// 2xx, or 409 idempotent accept.
    Delivered,
    /// Terminal 4xx; retrying cannot help.
    Rejected,
    /// Retries exhausted on transient failures; caller should buffer.
    Failed,
}

pub struct Sender {
    client: reqwest::Client,
    config: ProbeConfig,
}

impl Sender {
    pub fn new(config: ProbeConfig) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Sender { client, config })
    }

    pub async fn send_sample(&self, base: &str, sample: &Sample, trace: &TraceId) -> SendOutcome {
        let body = match serde_json::to_value(sample) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "sample failed to serialize, dropping");
                return SendOutcome::Rejected;
            }
        };
        self.post_with_retry(format!("{base}/push"), body, trace, None).await
    }

    pub async fn send_batch(&self, base: &str, samples: &[Sample], trace: &TraceId) -> SendOutcome {
        if samples.is_empty() {
            return SendOutcome::Delivered;
        }
        let batch = SampleBatch {
            samples: samples.to_vec(),
            source_region: None,
        };
        let body = match serde_json::to_value(&batch) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "batch failed to serialize, dropping");
                return SendOutcome::Rejected;
            }
        };
        let batch_id = Uuid::new_v4().to_string();
        self.post_with_retry(format!("{base}/ingest"), body, trace, Some(batch_id))
            .await
    }

    async fn post_with_retry(
        &self,
        url: String,
        body: serde_json::Value,
        trace: &TraceId,
        batch_id: Option<String>,
    ) -> SendOutcome {
        for attempt in 1..=self.config.max_retries {
            let mut req = self
                .client
                .post(&url)
                .header(TRACE_HEADER, trace.as_str())
                .json(&body);
            if let Some(secret) = &self.config.federation_secret {
                req = req.bearer_auth(secret);
            }
            if let Some(id) = &batch_id {
                req = req.header("X-Batch-ID", id);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() || status == StatusCode::CONFLICT {
                        debug!(%url, %status, trace_id = trace.as_str(), "delivered");
                        return SendOutcome::Delivered;
                    }
                    if status.is_client_error()
                        && status != StatusCode::REQUEST_TIMEOUT
                        && status != StatusCode::TOO_MANY_REQUESTS
                    {
                        let detail = resp.text().await.unwrap_or_default();
                        error!(%url, %status, detail = %truncate(&detail), "payload rejected");
                        return SendOutcome::Rejected;
                    }
                    warn!(%url, %status, attempt, "transient failure");
                }
                Err(e) => {
                    warn!(%url, attempt, error = %e, "send failed");
                }
            }

            if attempt < self.config.max_retries {
                tokio::time::sleep(backoff_delay(self.config.retry_backoff_base, attempt)).await;
            }
        }
        SendOutcome::Failed
    }
}

/// 2s, 4s, 8s for the default base of 2.0.
fn backoff_delay(base: f64, attempt: u32) -> Duration {
    Duration::from_secs_f64(base.powi(attempt as i32).min(60.0))
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(120) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
