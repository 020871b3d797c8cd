//! Durable store-and-forward buffer.
//!
//! An append-only JSONL log plus an acked-sequence sidecar. Every entry is
//! `{"seq": n, "payload": {...}}`; the ack file holds the highest sequence
//! confirmed by central. Restart replays the unacked tail from disk, which
//! is what lets the region ride out a central outage across its own
//! restarts.
//!
//! Occupancy hysteresis: at the high-water mark appends start failing with
//! [`BufferError::Full`] (the HTTP front end turns that into 503) and keep
//! failing until drain brings occupancy below the low-water mark.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fiber_core::queue::{QueueError, QueueItem, SampleQueue};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const LOG_FILE: &str = "buffer.log";
const ACK_FILE: &str = "buffer.ack";
/// Rewrite the log once this many acked bytes have accumulated.
const COMPACT_THRESHOLD_BYTES: u64 = 8 * 1024 * 1024;

pub const HIGH_WATER_FRACTION: f64 = 0.9;
pub const LOW_WATER_FRACTION: f64 = 0.7;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffer at capacity")]
    Full,

    #[error("buffer io: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer entry corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Record {
    seq: u64,
    ts: DateTime<Utc>,
    payload: serde_json::Value,
}

struct Inner {
    pending: VecDeque<Record>,
    next_seq: u64,
    acked_seq: u64,
    pending_bytes: u64,
    acked_bytes_on_disk: u64,
    degraded: bool,
}

pub struct DurableBuffer {
    dir: PathBuf,
    max_bytes: u64,
    retention: Duration,
    inner: Mutex<Inner>,
}

impl DurableBuffer {
    /// Opens the buffer directory, replaying any unacked tail.
    pub fn open(dir: &Path, max_bytes: u64, retention: Duration) -> Result<Self, BufferError> {
        std::fs::create_dir_all(dir)?;

        let acked_seq = std::fs::read_to_string(dir.join(ACK_FILE))
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);

        let mut pending = VecDeque::new();
        let mut next_seq = acked_seq + 1;
        let mut pending_bytes = 0u64;
        let mut acked_bytes = 0u64;
        let log_path = dir.join(LOG_FILE);
        if log_path.exists() {
            let file = std::fs::File::open(&log_path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: Record = match serde_json::from_str(&line) {
                    Ok(record) => record,
                    Err(e) => {
                        // a torn tail write from a crash; everything before it is intact
                        warn!(error = %e, "skipping corrupt buffer line");
                        continue;
                    }
                };
                next_seq = next_seq.max(record.seq + 1);
                if record.seq > acked_seq {
                    pending_bytes += line.len() as u64;
                    pending.push_back(record);
                } else {
                    acked_bytes += line.len() as u64;
                }
            }
        }

        info!(
            dir = %dir.display(),
            pending = pending.len(),
            acked_seq,
            "durable buffer opened"
        );

        Ok(DurableBuffer {
            dir: dir.to_path_buf(),
            max_bytes,
            retention,
            inner: Mutex::new(Inner {
                pending,
                next_seq,
                acked_seq,
                pending_bytes,
                acked_bytes_on_disk: acked_bytes,
                degraded: false,
            }),
        })
    }

    /// Appends one payload; `Full` once past high-water until drain
    /// recovers below low-water.
    pub fn append(&self, payload: serde_json::Value) -> Result<u64, BufferError> {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("buffer lock poisoned");

        let high = (self.max_bytes as f64 * HIGH_WATER_FRACTION) as u64;
        let low = (self.max_bytes as f64 * LOW_WATER_FRACTION) as u64;
        if inner.degraded {
            if inner.pending_bytes >= low {
                return Err(BufferError::Full);
            }
            info!("buffer drained below low-water, accepting again");
            inner.degraded = false;
        } else if inner.pending_bytes >= high {
            warn!(
                pending_bytes = inner.pending_bytes,
                high_water = high,
                "buffer past high-water, rejecting new samples"
            );
            inner.degraded = true;
            return Err(BufferError::Full);
        }

        let record = Record {
            seq: inner.next_seq,
            ts: Utc::now(),
            payload,
        };
        let line = serde_json::to_string(&record)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(LOG_FILE))?;
        writeln!(file, "{line}")?;

        inner.next_seq += 1;
        inner.pending_bytes += line.len() as u64;
        inner.pending.push_back(record);
        Ok(inner.next_seq - 1)
    }

    /// Non-destructive read of the oldest unacked entries, bounded by item
    /// count and serialized size.
    pub fn peek_batch(&self, max_items: usize, max_bytes: usize) -> Vec<(u64, serde_json::Value)> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("buffer lock poisoned");
        let mut out = Vec::new();
        let mut bytes = 0usize;
        for record in inner.pending.iter().take(max_items) {
            let size = record.payload.to_string().len();
            if !out.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            out.push((record.seq, record.payload.clone()));
        }
        out
    }

    /// Confirms everything up to `seq` as delivered and persists the mark.
    pub fn ack(&self, seq: u64) -> Result<(), BufferError> {
        #[allow(clippy::expect_used)]
        let mut guard = self.inner.lock().expect("buffer lock poisoned");
        let inner = &mut *guard;
        if seq <= inner.acked_seq {
            return Ok(());
        }
        while inner.pending.front().is_some_and(|r| r.seq <= seq) {
            if let Some(record) = inner.pending.pop_front() {
                let line_len = serde_json::to_string(&record)
                    .map(|l| l.len() as u64)
                    .unwrap_or(0);
                inner.pending_bytes = inner.pending_bytes.saturating_sub(line_len);
                inner.acked_bytes_on_disk += line_len;
            }
        }
        inner.acked_seq = seq;
        std::fs::write(self.dir.join(ACK_FILE), format!("{seq}\n"))?;

        if inner.acked_bytes_on_disk >= COMPACT_THRESHOLD_BYTES {
            self.compact(inner)?;
        }
        Ok(())
    }

    /// Drops aged-out unacked entries (retention bound) and reports how
    /// many were discarded.
    pub fn enforce_retention(&self) -> usize {
        #[allow(clippy::expect_used)]
        let mut guard = self.inner.lock().expect("buffer lock poisoned");
        let inner = &mut *guard;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::hours(24));
        let mut dropped = 0;
        while inner.pending.front().is_some_and(|r| r.ts < cutoff) {
            if let Some(record) = inner.pending.pop_front() {
                let line_len = serde_json::to_string(&record)
                    .map(|l| l.len() as u64)
                    .unwrap_or(0);
                inner.pending_bytes = inner.pending_bytes.saturating_sub(line_len);
                inner.acked_seq = inner.acked_seq.max(record.seq);
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(dropped, "buffer retention expired samples");
            let _ = std::fs::write(self.dir.join(ACK_FILE), format!("{}\n", inner.acked_seq));
        }
        dropped
    }

    /// Rewrites the log keeping only unacked records.
    fn compact(&self, inner: &mut Inner) -> Result<(), BufferError> {
        let tmp = self.dir.join("buffer.log.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            for record in &inner.pending {
                writeln!(file, "{}", serde_json::to_string(record)?)?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp, self.dir.join(LOG_FILE))?;
        info!(
            kept = inner.pending.len(),
            reclaimed_bytes = inner.acked_bytes_on_disk,
            "buffer compacted"
        );
        inner.acked_bytes_on_disk = 0;
        Ok(())
    }

    pub fn pending(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("buffer lock poisoned").pending.len()
    }

    pub fn pending_bytes(&self) -> u64 {
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("buffer lock poisoned").pending_bytes
    }

    pub fn is_degraded(&self) -> bool {
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("buffer lock poisoned").degraded
    }
}

/// Lets the gateway front end commit straight into the buffer. The queue
/// name is ignored; a relay has exactly one buffer.
#[async_trait]
impl SampleQueue for DurableBuffer {
    async fn push(&self, _queue: &str, item: serde_json::Value) -> Result<(), QueueError> {
        self.append(item)
            .map(|_| ())
            .map_err(|e| QueueError::Backend(e.to_string()))
    }

    async fn push_all(&self, _queue: &str, items: Vec<serde_json::Value>) -> Result<usize, QueueError> {
        let n = items.len();
        for item in items {
            self.append(item).map_err(|e| QueueError::Backend(e.to_string()))?;
        }
        Ok(n)
    }

    async fn pop_batch(&self, _queue: &str, max: usize) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self
            .peek_batch(max, usize::MAX)
            .into_iter()
            .map(|(seq, payload)| QueueItem {
                id: i64::try_from(seq).unwrap_or(i64::MAX),
                payload,
            })
            .collect())
    }

    async fn ack(&self, _queue: &str, ids: &[i64]) -> Result<(), QueueError> {
        if let Some(max) = ids.iter().max() {
            self.ack(u64::try_from(*max).unwrap_or(0))
                .map_err(|e| QueueError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    async fn len(&self, _queue: &str) -> Result<usize, QueueError> {
        Ok(self.pending())
    }

    async fn healthy(&self) -> bool {
        !self.is_degraded()
    }
}
