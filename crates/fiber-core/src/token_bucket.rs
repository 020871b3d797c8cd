//! Token-bucket rate limiter shared by the gateway and relay.
//!
//! The read-modify-write for one key happens under a single mutex-guarded
//! critical section, which is the documented in-process rendition of the
//! backend-scripted atomic update: with several gateway instances each
//! carries its own bucket map and cross-instance fairness is lost, so the
//! effective ceiling is `instances * capacity`. Per-instance decisions are
//! still exact and deterministic.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Bucket parameters for one key class (e.g. `/push` per probe).
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    /// Tokens added per second.
    pub rate: f64,
    /// Burst ceiling; also the initial fill of a fresh bucket.
    pub capacity: f64,
    /// Idle seconds after which a bucket is forgotten.
    pub ttl_s: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        BucketConfig {
            rate: 100.0 / 60.0,
            capacity: 100.0,
            ttl_s: 600.0,
        }
    }
}

/// Outcome of one `allow` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Tokens left after this decision.
    pub remaining: f64,
    /// Unix seconds at which the bucket is full again.
    pub reset_at: f64,
    /// Seconds until the denied request would fit. `None` when it never
    /// will (rate 0).
    pub retry_after: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: f64,
}

/// Per-key token buckets behind one mutex.
pub struct TokenBucketLimiter {
    config: BucketConfig,
    inner: Mutex<Inner>,
}

struct Inner {
    buckets: HashMap<String, BucketState>,
    last_prune: f64,
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl TokenBucketLimiter {
    pub fn new(config: BucketConfig) -> Self {
        TokenBucketLimiter {
            config,
            inner: Mutex::new(Inner {
                buckets: HashMap::new(),
                last_prune: 0.0,
            }),
        }
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Decides `requested` tokens for `key` at the current wall clock.
    pub fn allow(&self, key: &str, requested: f64) -> Decision {
        self.allow_at(key, requested, unix_now())
    }

    /// Decides `requested` tokens for `key` at an explicit instant.
    ///
    /// `requested == 0` is a read-only probe: the refreshed level is
    /// reported but nothing is stored.
    pub fn allow_at(&self, key: &str, requested: f64, now_s: f64) -> Decision {
        let cfg = self.config;
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("limiter lock poisoned");

        if now_s - inner.last_prune > cfg.ttl_s {
            let cutoff = now_s - cfg.ttl_s;
            inner.buckets.retain(|_, b| b.last_refill >= cutoff);
            inner.last_prune = now_s;
        }

        let state = inner
            .buckets
            .get(key)
            .copied()
            .filter(|b| now_s - b.last_refill <= cfg.ttl_s)
            .unwrap_or(BucketState {
                tokens: cfg.capacity,
                last_refill: now_s,
            });

        let elapsed = (now_s - state.last_refill).max(0.0);
        let refilled = (state.tokens + elapsed * cfg.rate).min(cfg.capacity);

        if requested == 0.0 {
            return Decision {
                allowed: true,
                remaining: refilled,
                reset_at: reset_at(now_s, refilled, cfg),
                retry_after: None,
            };
        }

        let (allowed, tokens_after, retry_after) = if refilled >= requested {
            (true, refilled - requested, None)
        } else if cfg.rate > 0.0 {
            (false, refilled, Some((requested - refilled) / cfg.rate))
        } else {
            (false, refilled, None)
        };

        inner.buckets.insert(
            key.to_string(),
            BucketState {
                tokens: tokens_after,
                last_refill: now_s,
            },
        );

        Decision {
            allowed,
            remaining: tokens_after,
            reset_at: reset_at(now_s, tokens_after, cfg),
            retry_after,
        }
    }
}

fn reset_at(now_s: f64, tokens: f64, cfg: BucketConfig) -> f64 {
    if tokens >= cfg.capacity {
        now_s
    } else if cfg.rate > 0.0 {
        now_s + ((cfg.capacity - tokens) / cfg.rate).ceil()
    } else {
        f64::INFINITY
    }
}
