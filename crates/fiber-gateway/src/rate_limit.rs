//! Request rate limiting: per-key buckets by endpoint class, a global
//! safety cap, and a per-key share guard on the global budget.
//!
//! The global cap trips before any per-key bookkeeping: a fleet-wide
//! flood answers 503, not 429, because no client backoff will clear it.
//! Per-key denials answer 429 with `Retry-After` and the standard
//! `X-RateLimit-*` headers on every write response.

use fiber_core::token_bucket::{BucketConfig, Decision, TokenBucketLimiter};

use crate::config::GatewayConfig;

const BUCKET_TTL_S: f64 = 600.0;
const GLOBAL_KEY: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Push,
    Ingest,
    Metrics,
}

/// Outcome of the combined rate decision.
#[derive(Debug)]
pub enum RateCheck {
    Allowed { headers: Vec<(String, String)> },
    Limited {
        headers: Vec<(String, String)>,
        retry_after_s: u64,
    },
    /// Global cap exhausted; not attributable to this key.
    Overloaded,
}

impl RateCheck {
    pub fn headers(&self) -> &[(String, String)] {
        match self {
            RateCheck::Allowed { headers } | RateCheck::Limited { headers, .. } => headers,
            RateCheck::Overloaded => &[],
        }
    }
}

pub struct RateLimiter {
    push: TokenBucketLimiter,
    ingest: TokenBucketLimiter,
    metrics: TokenBucketLimiter,
    global: TokenBucketLimiter,
    /// Sustained per-key ceiling at `per_key_share` of the global budget.
    share: TokenBucketLimiter,
}

fn bucket(rate: f64, capacity: f64) -> TokenBucketLimiter {
    TokenBucketLimiter::new(BucketConfig {
        rate,
        capacity,
        ttl_s: BUCKET_TTL_S,
    })
}

impl RateLimiter {
    pub fn new(config: &GatewayConfig) -> Self {
        RateLimiter {
            push: bucket(config.push_rate, config.push_burst),
            ingest: bucket(config.ingest_rate, config.ingest_burst),
            metrics: bucket(config.metrics_rate, config.metrics_burst),
            global: bucket(config.global_max, config.global_max),
            share: bucket(
                config.global_max * config.per_key_share,
                (config.global_max * config.per_key_share).max(1.0),
            ),
        }
    }

    pub fn check(&self, class: EndpointClass, key: &str) -> RateCheck {
        if !self.global.allow(GLOBAL_KEY, 1.0).allowed {
            return RateCheck::Overloaded;
        }
        let share_decision = self.share.allow(key, 1.0);
        if !share_decision.allowed {
            return limited(share_decision);
        }

        let limiter = match class {
            EndpointClass::Push => &self.push,
            EndpointClass::Ingest => &self.ingest,
            EndpointClass::Metrics => &self.metrics,
        };
        let decision = limiter.allow(key, 1.0);
        if decision.allowed {
            RateCheck::Allowed {
                headers: rate_headers(&decision),
            }
        } else {
            limited(decision)
        }
    }
}

fn limited(decision: Decision) -> RateCheck {
    let retry_after_s = decision.retry_after.map_or(60, |s| s.ceil().max(1.0) as u64);
    let mut headers = rate_headers(&decision);
    headers.push(("Retry-After".to_string(), retry_after_s.to_string()));
    RateCheck::Limited { headers, retry_after_s }
}

fn rate_headers(decision: &Decision) -> Vec<(String, String)> {
    let reset = if decision.reset_at.is_finite() {
        decision.reset_at.ceil() as u64
    } else {
        0
    };
    vec![
        (
            "X-RateLimit-Remaining".to_string(),
            (decision.remaining.floor().max(0.0) as u64).to_string(),
        ),
        ("X-RateLimit-Reset".to_string(), reset.to_string()),
    ]
}
