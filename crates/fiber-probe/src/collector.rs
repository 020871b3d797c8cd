//! Local network vitals collection.
//!
//! Latency is measured as the median of a few TCP connects to the target
//! host; packet loss is the failed fraction of those connects; uptime is a
//! load-derived proxy. CPU load and memory pressure ride along as opaque
//! metadata read from /proc; hosts without procfs just emit no metadata.

use std::time::{Duration, Instant};

use chrono::{SubsecRound, Utc};
use fiber_core::sample::Sample;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ProbeConfig;

const CONNECT_ATTEMPTS: usize = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

const PROC_LOADAVG: &str = "/proc/loadavg";
const PROC_MEMINFO: &str = "/proc/meminfo";

pub struct Collector {
    config: ProbeConfig,
}

impl Collector {
    pub fn new(config: ProbeConfig) -> Self {
        Collector { config }
    }

    /// Takes one measurement. Always yields an in-bounds sample; an
    /// unreachable target reads as max latency and full loss rather than
    /// an error.
    pub async fn collect(&self) -> Sample {
        let (latency_ms, packet_loss) = self.measure_target().await;
        let load1 = read_load1();
        let uptime_pct = load_to_uptime(load1);

        let mut metadata = serde_json::Map::new();
        if let Some(load) = load1 {
            metadata.insert("cpu_load".to_string(), proximate_number(load));
        }
        if let Some(mem) = read_memory_used_pct() {
            metadata.insert("memory_percent".to_string(), proximate_number(mem));
        }

        let mut sample = Sample {
            node_id: self.config.node_id.clone(),
            country: self.config.country.clone(),
            region: self.config.region.clone(),
            latency_ms,
            uptime_pct,
            packet_loss,
            timestamp: Utc::now().trunc_subsecs(3),
            target_host: Some(self.config.target_host.clone()),
            probe_type: "tcp".to_string(),
            metadata: (!metadata.is_empty()).then_some(metadata),
        };
        sample.clip_bounds();
        debug!(
            node_id = %sample.node_id,
            latency_ms = sample.latency_ms,
            packet_loss = sample.packet_loss,
            "collected sample"
        );
        sample
    }

    async fn measure_target(&self) -> (f64, f64) {
        let mut latencies = Vec::with_capacity(CONNECT_ATTEMPTS);
        let mut failures = 0usize;

        for _ in 0..CONNECT_ATTEMPTS {
            let start = Instant::now();
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.config.target_host)).await {
                Ok(Ok(_stream)) => {
                    latencies.push(start.elapsed().as_secs_f64() * 1000.0);
                }
                _ => failures += 1,
            }
        }

        let packet_loss = (failures as f64 / CONNECT_ATTEMPTS as f64) * 100.0;
        let latency_ms = median(&mut latencies)
            .unwrap_or(fiber_core::sample::MAX_LATENCY_MS);
        (latency_ms, packet_loss)
    }
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Some(values[values.len() / 2])
}

/// One-minute load average, when procfs is around.
fn read_load1() -> Option<f64> {
    let contents = std::fs::read_to_string(PROC_LOADAVG).ok()?;
    contents.split_whitespace().next()?.parse().ok()
}

/// Uptime proxy: a loaded host is a degraded host.
fn load_to_uptime(load1: Option<f64>) -> f64 {
    match load1 {
        Some(load) => (100.0 - load * 10.0).clamp(0.0, 100.0),
        None => 100.0,
    }
}

/// Used-memory percentage from MemTotal/MemAvailable.
fn read_memory_used_pct() -> Option<f64> {
    let contents = std::fs::read_to_string(PROC_MEMINFO).ok()?;
    let mut total = None;
    let mut available = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.split_whitespace().next()?.parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.split_whitespace().next()?.parse::<f64>().ok();
        }
    }
    let (total, available) = (total?, available?);
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}

fn proximate_number(v: f64) -> serde_json::Value {
    serde_json::Number::from_f64((v * 100.0).round() / 100.0)
        .map_or(serde_json::Value::Null, serde_json::Value::Number)
}
