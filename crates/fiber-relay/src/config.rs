//! Relay configuration: the gateway front-end settings plus the
//! forwarder's central-hop parameters.

use std::path::PathBuf;
use std::time::Duration;

use fiber_core::config::{env_opt, env_or, get_secret};
use fiber_gateway::config::{GatewayConfig, Role};

use crate::RelayError;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Front-end settings, forced to the regional role.
    pub gateway: GatewayConfig,
    /// Central gateway base URL.
    pub central_endpoint: String,
    /// Bearer credential for the central hop.
    pub federation_secret: String,
    pub buffer_dir: PathBuf,
    pub buffer_max_bytes: u64,
    pub buffer_retention: Duration,
    /// Samples per forwarded batch.
    pub forward_batch: usize,
    /// Consecutive failures before the forwarder declares central down.
    pub fail_threshold: u32,
    /// Central health-probe cadence while buffering.
    pub probe_interval: Duration,
    /// Pause between drain rounds when the buffer is empty.
    pub drain_idle: Duration,
    pub request_timeout: Duration,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, RelayError> {
        let mut gateway = GatewayConfig::from_env()
            .map_err(|e| RelayError::Config(e.to_string()))?;
        gateway.role = Role::Regional;

        let central_endpoint = env_opt("API_ENDPOINT")
            .ok_or_else(|| RelayError::Config("API_ENDPOINT (central) must be set".to_string()))?;
        let federation_secret = get_secret("FEDERATION_SECRET").ok_or_else(|| {
            RelayError::Config("FEDERATION_SECRET must be set for the central hop".to_string())
        })?;

        let config = RelayConfig {
            gateway,
            central_endpoint,
            federation_secret,
            buffer_dir: env_opt("BUFFER_DIR")
                .map_or_else(|| PathBuf::from("/var/lib/fiber/relay-buffer"), PathBuf::from),
            buffer_max_bytes: env_or("BUFFER_MAX_BYTES", 1u64 << 30).map_err(cfg_err)?,
            buffer_retention: Duration::from_secs(
                env_or("BUFFER_RETENTION_S", 24 * 3600u64).map_err(cfg_err)?,
            ),
            forward_batch: env_or("FORWARD_BATCH", 1000usize).map_err(cfg_err)?,
            fail_threshold: env_or("FAIL_THRESHOLD", 3u32).map_err(cfg_err)?,
            probe_interval: Duration::from_secs(env_or("PROBE_INTERVAL", 15u64).map_err(cfg_err)?),
            drain_idle: Duration::from_millis(env_or("DRAIN_IDLE_MS", 500u64).map_err(cfg_err)?),
            request_timeout: Duration::from_secs(env_or("REQUEST_TIMEOUT", 10u64).map_err(cfg_err)?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.forward_batch == 0 || self.forward_batch > fiber_core::sample::MAX_BATCH_SAMPLES {
            return Err(RelayError::Config(format!(
                "FORWARD_BATCH must be 1..={}",
                fiber_core::sample::MAX_BATCH_SAMPLES
            )));
        }
        if self.fail_threshold == 0 {
            return Err(RelayError::Config("FAIL_THRESHOLD must be at least 1".to_string()));
        }
        if self.buffer_max_bytes < 1024 {
            return Err(RelayError::Config("BUFFER_MAX_BYTES is implausibly small".to_string()));
        }
        Ok(())
    }
}

fn cfg_err(e: fiber_core::config::ConfigError) -> RelayError {
    RelayError::Config(e.to_string())
}
