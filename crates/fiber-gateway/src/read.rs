//! Query-only read path for the dashboard.
//!
//! The gateway never writes the storage tables; this module is the one
//! place it reads them. Deployments without a database serve empty pages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};

pub const MAX_PAGE: usize = 500;

#[derive(Debug, thiserror::Error)]
#[error("read path unavailable: {0}")]
pub struct ReadError(pub String);

#[derive(Debug, Serialize)]
pub struct MetricRow {
    pub time: DateTime<Utc>,
    pub node_id: String,
    pub latency_ms: f64,
    pub uptime_pct: f64,
    pub packet_loss: f64,
}

#[async_trait]
pub trait MetricsReader: Send + Sync {
    async fn recent(
        &self,
        node_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MetricRow>, ReadError>;
}

pub struct PgMetricsReader {
    pool: PgPool,
}

impl PgMetricsReader {
    pub fn new(pool: PgPool) -> Self {
        PgMetricsReader { pool }
    }
}

#[async_trait]
impl MetricsReader for PgMetricsReader {
    async fn recent(
        &self,
        node_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MetricRow>, ReadError> {
        let limit = i64::try_from(limit.min(MAX_PAGE)).unwrap_or(100);
        let offset = i64::try_from(offset).unwrap_or(0);

        let rows = match node_id {
            Some(node) => {
                sqlx::query(
                    "SELECT time, node_id, latency_ms, uptime_pct, packet_loss \
                     FROM samples WHERE node_id = $1 ORDER BY time DESC LIMIT $2 OFFSET $3",
                )
                .bind(node)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT time, node_id, latency_ms, uptime_pct, packet_loss \
                     FROM samples ORDER BY time DESC LIMIT $1 OFFSET $2",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| ReadError(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| MetricRow {
                time: row.get("time"),
                node_id: row.get("node_id"),
                latency_ms: row.get("latency_ms"),
                uptime_pct: row.get("uptime_pct"),
                packet_loss: row.get("packet_loss"),
            })
            .collect())
    }
}
