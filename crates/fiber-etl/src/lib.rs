//! ETL consumer.
//!
//! Stateless workers drain the queue in atomic batches, normalize what
//! they find, keep the node registry current and persist samples behind
//! the `(time, node_id)` uniqueness constraint. Duplicates land in the
//! conflict log, poisoned or unpersistable items land in the DLQ; a
//! sample accepted by the gateway is never silently lost.

pub mod config;
pub mod normalizer;
pub mod postgres;
pub mod store;
pub mod worker;

#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage: {0}")]
    Store(#[from] store::StoreError),

    #[error("queue: {0}")]
    Queue(#[from] fiber_core::queue::QueueError),
}
