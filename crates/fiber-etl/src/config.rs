//! ETL worker configuration.

use std::time::Duration;

use fiber_core::config::{env_opt, env_or};

use crate::EtlError;

#[derive(Debug, Clone)]
pub struct EtlConfig {
    /// `mem:` or a postgres:// URL for the queue backend.
    pub queue_url: String,
    /// Storage database.
    pub db_url: Option<String>,
    pub batch_size: usize,
    pub idle_backoff: Duration,
    pub max_persist_retries: u32,
    pub heartbeat: Duration,
    pub workers: usize,
    /// Queue depth past which the heartbeat flags back-pressure.
    pub queue_high_water: usize,
}

impl EtlConfig {
    pub fn from_env() -> Result<Self, EtlError> {
        let config = EtlConfig {
            queue_url: env_opt("QUEUE_URL").unwrap_or_else(|| "mem:".to_string()),
            db_url: env_opt("DB_URL"),
            batch_size: env_or("BATCH_SIZE", 100usize).map_err(cfg_err)?,
            idle_backoff: Duration::from_millis(env_or("IDLE_BACKOFF_MS", 200u64).map_err(cfg_err)?),
            max_persist_retries: env_or("MAX_PERSIST_RETRIES", 5u32).map_err(cfg_err)?,
            heartbeat: Duration::from_secs(env_or("HEARTBEAT_S", 10u64).map_err(cfg_err)?),
            workers: env_or("WORKERS", 1usize).map_err(cfg_err)?,
            queue_high_water: env_or("QUEUE_HIGH_WATER", 10_000usize).map_err(cfg_err)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EtlError> {
        if self.batch_size == 0 {
            return Err(EtlError::Config("BATCH_SIZE must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(EtlError::Config("WORKERS must be at least 1".to_string()));
        }
        if self.max_persist_retries == 0 {
            return Err(EtlError::Config("MAX_PERSIST_RETRIES must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn cfg_err(e: fiber_core::config::ConfigError) -> EtlError {
    EtlError::Config(e.to_string())
}
