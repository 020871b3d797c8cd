//! Postgres-backed implementation of [`SampleQueue`].
//!
//! One `queue_items` table holds every named queue; ordering comes from
//! the bigserial id. A pop is one `UPDATE ... WHERE id IN (SELECT ... FOR
//! UPDATE SKIP LOCKED) RETURNING` statement stamping `claimed_at`, so two
//! workers can drain concurrently without splitting or double-claiming a
//! batch. Acked items are deleted; a claim whose consumer died becomes
//! eligible again once the visibility timeout lapses: at-least-once, with
//! storage-level uniqueness absorbing the replays.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::queue::{QueueError, QueueItem, SampleQueue};

/// Claims older than this are considered abandoned and redelivered.
const DEFAULT_VISIBILITY_S: f64 = 60.0;

const POP_SQL: &str = r#"
UPDATE queue_items SET claimed_at = now()
WHERE id IN (
    SELECT id FROM queue_items
    WHERE queue = $1
      AND (claimed_at IS NULL OR claimed_at < now() - make_interval(secs => $3))
    ORDER BY id
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
RETURNING id, payload
"#;

pub struct PgQueue {
    pool: PgPool,
    visibility_s: f64,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        PgQueue {
            pool,
            visibility_s: DEFAULT_VISIBILITY_S,
        }
    }

    /// Connects with explicit pool limits and timeouts; hanging forever on
    /// a dead backend is not acceptable for the ingest path.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn with_visibility(mut self, visibility: Duration) -> Self {
        self.visibility_s = visibility.as_secs_f64();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SampleQueue for PgQueue {
    async fn push(&self, queue: &str, item: serde_json::Value) -> Result<(), QueueError> {
        sqlx::query("INSERT INTO queue_items (queue, payload) VALUES ($1, $2)")
            .bind(queue)
            .bind(&item)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn push_all(&self, queue: &str, items: Vec<serde_json::Value>) -> Result<usize, QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        let n = items.len();
        for item in items {
            sqlx::query("INSERT INTO queue_items (queue, payload) VALUES ($1, $2)")
                .bind(queue)
                .bind(&item)
                .execute(&mut *tx)
                .await
                .map_err(|e| QueueError::Backend(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(n)
    }

    async fn pop_batch(&self, queue: &str, max: usize) -> Result<Vec<QueueItem>, QueueError> {
        let rows = sqlx::query(POP_SQL)
            .bind(queue)
            .bind(i64::try_from(max).unwrap_or(i64::MAX))
            .bind(self.visibility_s)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        // UPDATE ... RETURNING does not promise row order; restore FIFO by id.
        let mut items: Vec<QueueItem> = rows
            .into_iter()
            .map(|row| QueueItem {
                id: row.get::<i64, _>("id"),
                payload: row.get::<serde_json::Value, _>("payload"),
            })
            .collect();
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    async fn ack(&self, queue: &str, ids: &[i64]) -> Result<(), QueueError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM queue_items WHERE queue = $1 AND id = ANY($2)")
            .bind(queue)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<usize, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_items WHERE queue = $1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
