//! Storage behind the ETL.
//!
//! The ETL is the only writer of the samples, nodes and conflicts tables.
//! `persist_batch` must be transactional: every non-duplicate row lands,
//! every duplicate becomes a conflict record, and the batch commits as a
//! whole. Duplicates are expected traffic (federation replay, probe
//! retries crossing paths), not errors.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fiber_core::sample::Envelope;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    Backend(String),
}

/// What one transactional batch persist did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub inserted: usize,
    pub conflicts: usize,
}

/// A node sighting derived from a batch: the registry row to upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSighting {
    pub node_id: String,
    pub country: String,
    pub region: String,
    /// Highest sample timestamp for this node in the batch.
    pub last_seen_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert-on-absent with minimal fields; bumps `last_seen_at` to the
    /// max of the existing value and the sighting. Operator-set fields
    /// are never overwritten and deleted nodes stay deleted.
    async fn ensure_node(&self, sighting: &NodeSighting) -> Result<(), StoreError>;

    /// Inserts the batch in one transaction; duplicate `(time, node_id)`
    /// rows go to the conflict log instead of the samples table.
    async fn persist_batch(&self, batch: &[Envelope]) -> Result<PersistReport, StoreError>;

    async fn healthy(&self) -> bool;
}

/// Extracts the distinct node sightings of a batch, keeping the maximum
/// timestamp per node.
pub fn sightings(batch: &[Envelope]) -> Vec<NodeSighting> {
    let mut by_node: HashMap<&str, NodeSighting> = HashMap::new();
    for envelope in batch {
        let s = &envelope.sample;
        by_node
            .entry(s.node_id.as_str())
            .and_modify(|existing| {
                if s.timestamp > existing.last_seen_at {
                    existing.last_seen_at = s.timestamp;
                }
            })
            .or_insert_with(|| NodeSighting {
                node_id: s.node_id.clone(),
                country: s.country.clone(),
                region: s.region.clone(),
                last_seen_at: s.timestamp,
            });
    }
    let mut out: Vec<NodeSighting> = by_node.into_values().collect();
    out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    out
}

// --- in-memory implementation (tests, single-host demos) ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Registered,
    Reporting,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct MemoryNode {
    pub node_id: String,
    pub country: String,
    pub region: String,
    pub status: NodeStatus,
    pub last_seen_at: DateTime<Utc>,
    /// Set when an operator registered the node; geo fields are theirs.
    pub operator_managed: bool,
}

#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub time: DateTime<Utc>,
    pub node_id: String,
    pub payload: serde_json::Value,
    pub conflict_at: DateTime<Utc>,
    pub ingest_region: Option<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    samples: Mutex<HashMap<(DateTime<Utc>, String), Envelope>>,
    nodes: Mutex<HashMap<String, MemoryNode>>,
    conflicts: Mutex<Vec<ConflictRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operator-side registration, used by tests to seed managed nodes.
    /// Deletion is final: a soft-deleted id is never re-registered.
    pub fn register_node(&self, node_id: &str, country: &str, region: &str) {
        #[allow(clippy::expect_used)]
        let mut nodes = self.nodes.lock().expect("store lock poisoned");
        if nodes
            .get(node_id)
            .is_some_and(|node| node.status == NodeStatus::Deleted)
        {
            return;
        }
        nodes.insert(
            node_id.to_string(),
            MemoryNode {
                node_id: node_id.to_string(),
                country: country.to_string(),
                region: region.to_string(),
                status: NodeStatus::Registered,
                last_seen_at: DateTime::<Utc>::MIN_UTC,
                operator_managed: true,
            },
        );
    }

    /// Operator-side soft delete: the row stays, only the status flips.
    pub fn delete_node(&self, node_id: &str) {
        #[allow(clippy::expect_used)]
        let mut nodes = self.nodes.lock().expect("store lock poisoned");
        if let Some(node) = nodes.get_mut(node_id) {
            node.status = NodeStatus::Deleted;
        }
    }

    pub fn sample_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.samples.lock().expect("store lock poisoned").len()
    }

    pub fn node(&self, node_id: &str) -> Option<MemoryNode> {
        #[allow(clippy::expect_used)]
        self.nodes.lock().expect("store lock poisoned").get(node_id).cloned()
    }

    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        #[allow(clippy::expect_used)]
        self.conflicts.lock().expect("store lock poisoned").clone()
    }

    pub fn sample(&self, time: DateTime<Utc>, node_id: &str) -> Option<Envelope> {
        #[allow(clippy::expect_used)]
        self.samples
            .lock()
            .expect("store lock poisoned")
            .get(&(time, node_id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ensure_node(&self, sighting: &NodeSighting) -> Result<(), StoreError> {
        #[allow(clippy::expect_used)]
        let mut nodes = self.nodes.lock().expect("store lock poisoned");
        match nodes.get_mut(&sighting.node_id) {
            Some(node) => {
                node.last_seen_at = node.last_seen_at.max(sighting.last_seen_at);
                if node.status == NodeStatus::Registered {
                    node.status = NodeStatus::Reporting;
                }
                // geo fields untouched: operator data wins
            }
            None => {
                nodes.insert(
                    sighting.node_id.clone(),
                    MemoryNode {
                        node_id: sighting.node_id.clone(),
                        country: sighting.country.clone(),
                        region: sighting.region.clone(),
                        status: NodeStatus::Reporting,
                        last_seen_at: sighting.last_seen_at,
                        operator_managed: false,
                    },
                );
            }
        }
        Ok(())
    }

    async fn persist_batch(&self, batch: &[Envelope]) -> Result<PersistReport, StoreError> {
        #[allow(clippy::expect_used)]
        let mut samples = self.samples.lock().expect("store lock poisoned");
        #[allow(clippy::expect_used)]
        let mut conflicts = self.conflicts.lock().expect("store lock poisoned");

        let mut report = PersistReport::default();
        for envelope in batch {
            let key = (envelope.sample.timestamp, envelope.sample.node_id.clone());
            if samples.contains_key(&key) {
                conflicts.push(ConflictRecord {
                    time: envelope.sample.timestamp,
                    node_id: envelope.sample.node_id.clone(),
                    payload: serde_json::to_value(envelope).unwrap_or_default(),
                    conflict_at: Utc::now(),
                    ingest_region: envelope.meta.ingest_region.clone(),
                });
                report.conflicts += 1;
            } else {
                samples.insert(key, envelope.clone());
                report.inserted += 1;
            }
        }
        Ok(report)
    }

    async fn healthy(&self) -> bool {
        true
    }
}
