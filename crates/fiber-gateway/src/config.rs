//! Gateway configuration from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use fiber_core::config::{env_opt, env_or, get_secret};

use crate::GatewayError;

/// Which tier of the federation this instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Central,
    Regional,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Central => "central",
            Role::Regional => "regional",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub role: Role,
    /// Region stamped into `_meta.ingest_region` for every enqueued sample.
    pub region: String,
    pub jwt_secret: Option<String>,
    pub federation_secret: Option<String>,
    /// `mem:` or a postgres:// URL.
    pub queue_url: String,
    /// Read-path database; optional, the gateway serves empty reads without it.
    pub db_url: Option<String>,

    pub push_rate: f64,
    pub push_burst: f64,
    pub ingest_rate: f64,
    pub ingest_burst: f64,
    pub metrics_rate: f64,
    pub metrics_burst: f64,
    /// System-wide requests/second ceiling.
    pub global_max: f64,
    /// Largest sustained fraction of the global budget one key may take.
    pub per_key_share: f64,

    pub idempotency_ttl: Duration,
    pub audit_log_path: PathBuf,
    pub shutdown_grace: Duration,
    /// DLQ depth at which `/status` starts reporting degraded.
    pub dlq_degrade_threshold: usize,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, GatewayError> {
        let port: u16 = env_or("PORT", 8000).map_err(cfg_err)?;
        let bind_addr = env_opt("BIND_ADDR")
            .unwrap_or_else(|| format!("0.0.0.0:{port}"))
            .parse()
            .map_err(|_| GatewayError::Config("BIND_ADDR must be host:port".to_string()))?;

        let role = match env_opt("FEDERATION_ROLE").as_deref() {
            None | Some("central") => Role::Central,
            Some("regional") => Role::Regional,
            Some(other) => {
                return Err(GatewayError::Config(format!(
                    "FEDERATION_ROLE must be central or regional, got {other}"
                )))
            }
        };

        let jwt_secret = get_secret("JWT_SECRET");
        let federation_secret = get_secret("FEDERATION_SECRET");
        if jwt_secret.is_none() && federation_secret.is_none() {
            return Err(GatewayError::Config(
                "at least one of JWT_SECRET / FEDERATION_SECRET must be configured".to_string(),
            ));
        }

        let config = GatewayConfig {
            bind_addr,
            role,
            region: env_opt("REGION").unwrap_or_else(|| "central".to_string()),
            jwt_secret,
            federation_secret,
            queue_url: env_opt("QUEUE_URL").unwrap_or_else(|| "mem:".to_string()),
            db_url: env_opt("DB_URL"),
            push_rate: env_or("RATE_LIMIT_PUSH_RATE", 100.0 / 60.0).map_err(cfg_err)?,
            push_burst: env_or("RATE_LIMIT_PUSH_BURST", 100.0).map_err(cfg_err)?,
            ingest_rate: env_or("RATE_LIMIT_INGEST_RATE", 50.0 / 60.0).map_err(cfg_err)?,
            ingest_burst: env_or("RATE_LIMIT_INGEST_BURST", 50.0).map_err(cfg_err)?,
            metrics_rate: env_or("RATE_LIMIT_METRICS_RATE", 200.0 / 60.0).map_err(cfg_err)?,
            metrics_burst: env_or("RATE_LIMIT_METRICS_BURST", 200.0).map_err(cfg_err)?,
            global_max: env_or("RATE_LIMIT_GLOBAL_MAX", 500.0).map_err(cfg_err)?,
            per_key_share: env_or("RATE_LIMIT_PER_KEY_SHARE", 0.2).map_err(cfg_err)?,
            idempotency_ttl: Duration::from_secs(env_or("IDEMPOTENCY_TTL", 3600u64).map_err(cfg_err)?),
            audit_log_path: env_opt("AUDIT_LOG_PATH")
                .map_or_else(|| PathBuf::from("/var/lib/fiber/audit.jsonl"), PathBuf::from),
            shutdown_grace: Duration::from_secs(env_or("SHUTDOWN_GRACE", 10u64).map_err(cfg_err)?),
            dlq_degrade_threshold: env_or("DLQ_DEGRADE_THRESHOLD", 1000usize).map_err(cfg_err)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Queue the ingest path commits to. The relay substitutes its durable
    /// buffer behind the same name.
    pub fn queue_name(&self) -> &'static str {
        fiber_core::queue::ETL_QUEUE
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.region.trim().is_empty() {
            return Err(GatewayError::Config("REGION must not be empty".to_string()));
        }
        for (name, v) in [
            ("RATE_LIMIT_PUSH_RATE", self.push_rate),
            ("RATE_LIMIT_INGEST_RATE", self.ingest_rate),
            ("RATE_LIMIT_METRICS_RATE", self.metrics_rate),
            ("RATE_LIMIT_GLOBAL_MAX", self.global_max),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(GatewayError::Config(format!("{name} must be >= 0")));
            }
        }
        if !(0.0..=1.0).contains(&self.per_key_share) {
            return Err(GatewayError::Config(
                "RATE_LIMIT_PER_KEY_SHARE must be within 0..=1".to_string(),
            ));
        }
        if self.idempotency_ttl < Duration::from_secs(60) {
            return Err(GatewayError::Config(
                "IDEMPOTENCY_TTL below one minute defeats batch replay protection".to_string(),
            ));
        }
        Ok(())
    }
}

fn cfg_err(e: fiber_core::config::ConfigError) -> GatewayError {
    GatewayError::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_gateway_env() {
        for key in [
            "PORT", "BIND_ADDR", "FEDERATION_ROLE", "REGION", "JWT_SECRET",
            "FEDERATION_SECRET", "QUEUE_URL", "DB_URL", "RATE_LIMIT_PUSH_RATE",
            "RATE_LIMIT_PUSH_BURST", "RATE_LIMIT_INGEST_RATE", "RATE_LIMIT_INGEST_BURST",
            "RATE_LIMIT_METRICS_RATE", "RATE_LIMIT_METRICS_BURST", "RATE_LIMIT_GLOBAL_MAX",
            "RATE_LIMIT_PER_KEY_SHARE", "IDEMPOTENCY_TTL", "AUDIT_LOG_PATH",
            "SHUTDOWN_GRACE", "DLQ_DEGRADE_THRESHOLD", "SECRETS_DIR",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_requires_some_credential_backend() {
        clear_gateway_env();
        assert!(GatewayConfig::from_env().is_err());
        env::set_var("FEDERATION_SECRET", "s3cret");
        assert!(GatewayConfig::from_env().is_ok());
        clear_gateway_env();
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_gateway_env();
        env::set_var("JWT_SECRET", "jwt");
        let cfg = GatewayConfig::from_env().unwrap();
        assert_eq!(cfg.role, Role::Central);
        assert_eq!(cfg.queue_url, "mem:");
        assert_eq!(cfg.idempotency_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.bind_addr.port(), 8000);
        clear_gateway_env();
    }

    #[test]
    #[serial]
    fn test_rejects_unknown_role() {
        clear_gateway_env();
        env::set_var("JWT_SECRET", "jwt");
        env::set_var("FEDERATION_ROLE", "edge");
        assert!(GatewayConfig::from_env().is_err());
        clear_gateway_env();
    }

    #[test]
    #[serial]
    fn test_rejects_short_idempotency_ttl() {
        clear_gateway_env();
        env::set_var("JWT_SECRET", "jwt");
        env::set_var("IDEMPOTENCY_TTL", "5");
        assert!(GatewayConfig::from_env().is_err());
        clear_gateway_env();
    }

    #[test]
    #[serial]
    fn test_share_fraction_bounds() {
        clear_gateway_env();
        env::set_var("JWT_SECRET", "jwt");
        env::set_var("RATE_LIMIT_PER_KEY_SHARE", "1.5");
        assert!(GatewayConfig::from_env().is_err());
        clear_gateway_env();
    }
}
