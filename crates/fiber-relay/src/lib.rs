//! Regional federation relay.
//!
//! The relay is the gateway crate's HTTP surface wired to a durable
//! on-disk buffer instead of the central queue, plus a forwarder that
//! drains that buffer toward central in idempotent batches. Probes keep
//! getting 202s through a central outage of up to the buffer's retention;
//! replay after recovery is at-least-once and collapses at storage.

pub mod buffer;
pub mod config;
pub mod forwarder;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("buffer io: {0}")]
    Buffer(#[from] buffer::BufferError),

    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}
