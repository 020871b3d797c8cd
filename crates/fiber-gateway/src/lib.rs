//! Ingestion gateway.
//!
//! Every write request walks the same pipeline in a fixed order: auth,
//! size gate, validation, idempotency, rate limit, enqueue. The enqueue is
//! the commit point: after a 202 the sample is the queue's problem, and
//! the gateway never waits on the ETL.
//!
//! The relay reuses this crate wholesale: a regional relay is this same
//! HTTP surface configured with `role=regional` and a durable on-disk
//! buffer standing in for the central queue.

pub mod audit;
pub mod config;
pub mod handlers;
pub mod http_utils;
pub mod idempotency;
pub mod rate_limit;
pub mod read;
pub mod server;

use std::sync::Arc;

use fiber_core::auth::TokenVerifier;
use fiber_core::queue::SampleQueue;

use crate::audit::AuditLog;
use crate::config::GatewayConfig;
use crate::idempotency::IdempotencyIndex;
use crate::rate_limit::RateLimiter;
use crate::read::MetricsReader;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("server io: {0}")]
    Io(#[from] std::io::Error),
}

/// Extra status a deployment can surface on `/federation/status`.
/// The relay plugs its forwarder state machine in here.
pub trait FederationReporter: Send + Sync {
    fn report(&self) -> serde_json::Value;
}

/// Shared state behind every request handler.
pub struct Gateway {
    pub config: Arc<GatewayConfig>,
    pub queue: Arc<dyn SampleQueue>,
    pub verifier: TokenVerifier,
    pub limiter: RateLimiter,
    pub idempotency: IdempotencyIndex,
    pub audit: AuditLog,
    pub reader: Option<Arc<dyn MetricsReader>>,
    pub federation: Option<Arc<dyn FederationReporter>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, queue: Arc<dyn SampleQueue>) -> Self {
        let config = Arc::new(config);
        let verifier = TokenVerifier::new(
            config.jwt_secret.as_deref(),
            config.federation_secret.as_deref(),
        );
        let limiter = RateLimiter::new(&config);
        let idempotency = IdempotencyIndex::new(config.idempotency_ttl);
        let audit = AuditLog::new(config.audit_log_path.clone());
        Gateway {
            verifier,
            limiter,
            idempotency,
            audit,
            queue,
            reader: None,
            federation: None,
            config,
        }
    }

    pub fn with_reader(mut self, reader: Arc<dyn MetricsReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn with_federation(mut self, reporter: Arc<dyn FederationReporter>) -> Self {
        self.federation = Some(reporter);
        self
    }
}
