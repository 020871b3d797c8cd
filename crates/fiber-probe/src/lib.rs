//! Edge probe agent.
//!
//! Outbound-only: a single scheduling loop collects one sample per
//! interval, ships it to the active gateway (regional when configured,
//! central otherwise) and falls back to a bounded in-memory buffer when
//! the uplink is down. Recovery drains the buffer opportunistically in
//! small batches between live sends.

pub mod agent;
pub mod buffer;
pub mod collector;
pub mod config;
pub mod failover;
pub mod sender;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}
