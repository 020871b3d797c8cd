//! Postgres-backed [`Store`].
//!
//! Persistence strategy: conflict-ignoring insert per row inside one
//! transaction, with a zero-rows-affected insert meaning the `(time,
//! node_id)` pair already exists; that row is appended to the conflict
//! table in the same transaction, so the batch commits as a whole either
//! way. Migrations are embedded and applied at connect time.

use std::time::Duration;

use async_trait::async_trait;
use fiber_core::sample::Envelope;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::store::{NodeSighting, PersistReport, Store, StoreError};

pub struct PgStore {
    pool: PgPool,
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(backend)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(PgStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ensure_node(&self, sighting: &NodeSighting) -> Result<(), StoreError> {
        let short: String = sighting.node_id.chars().take(8).collect();
        sqlx::query(
            r#"
            INSERT INTO nodes (node_id, node_name, country, region, status, last_seen_at)
            VALUES ($1, $2, $3, $4, 'reporting', $5)
            ON CONFLICT (node_id) DO UPDATE SET
                last_seen_at = GREATEST(nodes.last_seen_at, EXCLUDED.last_seen_at),
                status = CASE WHEN nodes.status = 'registered' THEN 'reporting'
                              ELSE nodes.status END
            "#,
        )
        .bind(&sighting.node_id)
        .bind(format!("probe-{short}"))
        .bind(&sighting.country)
        .bind(&sighting.region)
        .bind(sighting.last_seen_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn persist_batch(&self, batch: &[Envelope]) -> Result<PersistReport, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut report = PersistReport::default();

        for envelope in batch {
            let s = &envelope.sample;
            let metadata = s.metadata.as_ref().map(|m| serde_json::Value::Object(m.clone()));
            let inserted = sqlx::query(
                r#"
                INSERT INTO samples
                    (time, node_id, latency_ms, uptime_pct, packet_loss,
                     target_host, probe_type, metadata, trace_id, ingest_region)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (time, node_id) DO NOTHING
                "#,
            )
            .bind(s.timestamp)
            .bind(&s.node_id)
            .bind(s.latency_ms)
            .bind(s.uptime_pct)
            .bind(s.packet_loss)
            .bind(&s.target_host)
            .bind(&s.probe_type)
            .bind(&metadata)
            .bind(&envelope.meta.trace_id)
            .bind(&envelope.meta.ingest_region)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();

            if inserted == 1 {
                report.inserted += 1;
            } else {
                let payload = serde_json::to_value(envelope).unwrap_or_default();
                sqlx::query(
                    r#"
                    INSERT INTO sample_conflicts (time, node_id, payload, ingest_region)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(s.timestamp)
                .bind(&s.node_id)
                .bind(&payload)
                .bind(&envelope.meta.ingest_region)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
                report.conflicts += 1;
            }
        }

        tx.commit().await.map_err(backend)?;
        Ok(report)
    }

    async fn healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
