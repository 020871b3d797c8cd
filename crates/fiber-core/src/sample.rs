//! Sample and batch wire model.
//!
//! A [`Sample`] is one per-minute measurement emitted by a probe. The same
//! JSON shape travels probe → gateway → queue → ETL; once a sample is
//! enqueued it is wrapped in an [`Envelope`] that carries the ingest
//! metadata (`_meta`) alongside the original fields.
//!
//! Validation here is the single source of truth for the bounds the
//! gateway enforces: latency 0–10000 ms, percentages 0–100, country codes
//! ISO-3166 alpha-2. The ETL *clips* instead of rejecting (values may have
//! been valid when accepted and drifted through float re-encoding); the
//! gateway rejects outright.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trace::TraceId;

/// Hard ceiling on samples per batch.
pub const MAX_BATCH_SAMPLES: usize = 1000;
/// Hard ceiling on a batch payload, in bytes.
pub const MAX_BATCH_BYTES: usize = 10 * 1024 * 1024;
/// Hard ceiling on a single serialized sample, in bytes.
pub const MAX_SAMPLE_BYTES: usize = 4 * 1024;

pub const MAX_LATENCY_MS: f64 = 10_000.0;
pub const MAX_PCT: f64 = 100.0;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("node_id must not be empty")]
    EmptyNodeId,

    #[error("country must be an ISO-3166 alpha-2 code, got {0:?}")]
    BadCountry(String),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("sample exceeds {MAX_SAMPLE_BYTES} bytes")]
    SampleTooLarge,

    #[error("batch exceeds {MAX_BATCH_SAMPLES} samples: {0}")]
    BatchTooLong(usize),
}

fn default_probe_type() -> String {
    "ping".to_string()
}

/// One measurement from one probe at one instant.
///
/// `(node_id, timestamp)` identifies a sample end-to-end; storage enforces
/// that pair as unique and routes later arrivals to the conflict log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub node_id: String,
    pub country: String,
    pub region: String,
    pub latency_ms: f64,
    pub uptime_pct: f64,
    pub packet_loss: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    #[serde(default = "default_probe_type")]
    pub probe_type: String,
    /// Opaque probe-supplied map. Persisted as-is, never branched on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Sample {
    /// Checks gateway-side bounds. The first offending field wins.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.node_id.trim().is_empty() {
            return Err(ValidationError::EmptyNodeId);
        }
        if !is_alpha2(&self.country) {
            return Err(ValidationError::BadCountry(self.country.clone()));
        }
        check_range("latency_ms", self.latency_ms, MAX_LATENCY_MS)?;
        check_range("uptime_pct", self.uptime_pct, MAX_PCT)?;
        check_range("packet_loss", self.packet_loss, MAX_PCT)?;
        Ok(())
    }

    /// Clips numeric fields into their valid ranges in place.
    pub fn clip_bounds(&mut self) {
        self.latency_ms = self.latency_ms.clamp(0.0, MAX_LATENCY_MS);
        self.uptime_pct = self.uptime_pct.clamp(0.0, MAX_PCT);
        self.packet_loss = self.packet_loss.clamp(0.0, MAX_PCT);
    }
}

fn check_range(field: &'static str, value: f64, max: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || value < 0.0 || value > max {
        return Err(ValidationError::OutOfRange { field, value });
    }
    Ok(())
}

fn is_alpha2(code: &str) -> bool {
    code.len() == 2 && code.bytes().all(|b| b.is_ascii_uppercase())
}

/// Ordered group of samples sharing one idempotency id (the `X-Batch-ID`
/// request header; the id itself is not part of the body).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleBatch {
    pub samples: Vec<Sample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_region: Option<String>,
}

impl SampleBatch {
    /// Validates cardinality and every member, first offender aborting.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.samples.len() > MAX_BATCH_SAMPLES {
            return Err(ValidationError::BatchTooLong(self.samples.len()));
        }
        for sample in &self.samples {
            sample.validate()?;
        }
        Ok(())
    }
}

/// Ingest metadata attached to a sample when it is committed to the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvelopeMeta {
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_region: Option<String>,
    pub ingest_ts: DateTime<Utc>,
}

/// A queued sample: the original wire fields plus `_meta`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(flatten)]
    pub sample: Sample,
    #[serde(rename = "_meta")]
    pub meta: EnvelopeMeta,
}

impl Envelope {
    pub fn new(sample: Sample, trace_id: &TraceId, ingest_region: Option<String>) -> Self {
        Envelope {
            sample,
            meta: EnvelopeMeta {
                trace_id: trace_id.as_str().to_string(),
                ingest_region,
                ingest_ts: Utc::now(),
            },
        }
    }
}
