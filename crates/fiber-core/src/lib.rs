//! Shared building blocks for the fiber telemetry fabric.
//!
//! Everything in this crate is consumed by at least two of the probe,
//! gateway, relay and ETL binaries: the sample wire model and its
//! validation rules, trace-id propagation, the token-bucket rate limiter,
//! the durable queue abstraction, bearer-token verification and the
//! env/secret configuration helpers.

pub mod auth;
pub mod config;
pub mod pg_queue;
pub mod queue;
pub mod sample;
pub mod token_bucket;
pub mod trace;
