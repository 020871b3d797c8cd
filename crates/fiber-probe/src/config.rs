//! Probe configuration from the environment.

use std::time::Duration;

use fiber_core::config::{env_opt, env_or, get_secret};

use crate::ProbeError;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Operator-issued identity; every sample carries it.
    pub node_id: String,
    pub country: String,
    pub region: String,
    /// Central gateway base URL.
    pub api_endpoint: String,
    /// Regional relay base URL; preferred when set.
    pub regional_endpoint: Option<String>,
    /// Bearer credential for both endpoints.
    pub federation_secret: Option<String>,
    /// Host probed for latency; defaults to the gateway host.
    pub target_host: String,
    pub interval: Duration,
    pub max_retries: u32,
    pub retry_backoff_base: f64,
    pub request_timeout: Duration,
    pub max_buffer: usize,
    /// Buffered samples drained per recovery batch.
    pub flush_batch: usize,
    /// Time on central before regional is retried.
    pub stickiness: Duration,
    /// Grace for the shutdown flush.
    pub shutdown_grace: Duration,
}

impl ProbeConfig {
    pub fn from_env() -> Result<Self, ProbeError> {
        let node_id = env_opt("NODE_ID").ok_or_else(|| {
            ProbeError::Config("NODE_ID must be set to the operator-issued identity".to_string())
        })?;
        let api_endpoint = env_opt("API_ENDPOINT")
            .ok_or_else(|| ProbeError::Config("API_ENDPOINT must be set".to_string()))?;

        let target_host = env_opt("TARGET_HOST").unwrap_or_else(|| {
            host_of(&api_endpoint).unwrap_or_else(|| "127.0.0.1:80".to_string())
        });

        let config = ProbeConfig {
            node_id,
            country: env_opt("COUNTRY").unwrap_or_else(|| "XX".to_string()),
            region: env_opt("REGION").unwrap_or_else(|| "unknown".to_string()),
            api_endpoint,
            regional_endpoint: env_opt("REGIONAL_ENDPOINT"),
            federation_secret: get_secret("FEDERATION_SECRET"),
            target_host,
            interval: Duration::from_secs(env_or("INTERVAL", 60u64).map_err(cfg_err)?),
            max_retries: env_or("MAX_RETRIES", 3u32).map_err(cfg_err)?,
            retry_backoff_base: env_or("RETRY_BACKOFF_BASE", 2.0f64).map_err(cfg_err)?,
            request_timeout: Duration::from_secs(env_or("REQUEST_TIMEOUT", 10u64).map_err(cfg_err)?),
            max_buffer: env_or("MAX_BUFFER", 1000usize).map_err(cfg_err)?,
            flush_batch: env_or("FLUSH_BATCH", 50usize).map_err(cfg_err)?,
            stickiness: Duration::from_secs(env_or("STICKINESS", 120u64).map_err(cfg_err)?),
            shutdown_grace: Duration::from_secs(env_or("SHUTDOWN_GRACE", 5u64).map_err(cfg_err)?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.node_id.trim().is_empty() {
            return Err(ProbeError::Config("NODE_ID must not be empty".to_string()));
        }
        if self.api_endpoint.trim().is_empty() {
            return Err(ProbeError::Config("API_ENDPOINT must not be empty".to_string()));
        }
        if self.interval.is_zero() {
            return Err(ProbeError::Config("INTERVAL must be at least 1 second".to_string()));
        }
        if self.max_buffer == 0 {
            return Err(ProbeError::Config("MAX_BUFFER must be at least 1".to_string()));
        }
        if self.flush_batch == 0 {
            return Err(ProbeError::Config("FLUSH_BATCH must be at least 1".to_string()));
        }
        if self.retry_backoff_base < 1.0 {
            return Err(ProbeError::Config(
                "RETRY_BACKOFF_BASE must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

fn cfg_err(e: fiber_core::config::ConfigError) -> ProbeError {
    ProbeError::Config(e.to_string())
}

/// Extracts `host:port` from a base URL for the latency target default.
fn host_of(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let host = rest.split('/').next()?;
    if host.is_empty() {
        return None;
    }
    if host.contains(':') {
        Some(host.to_string())
    } else {
        Some(format!("{host}:443"))
    }
}
