//! Environment and secret loading shared by every binary.
//!
//! Secrets resolve from a mounted secrets directory first (one file per
//! key, lower-cased name, the Docker/K8s convention) and fall back to the
//! environment. Required secrets fail fast at startup.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Default mount point for file-based secrets.
const SECRETS_DIR: &str = "/run/secrets";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration for {0}")]
    MissingKey(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

fn secrets_dir() -> PathBuf {
    env::var("SECRETS_DIR").map_or_else(|_| PathBuf::from(SECRETS_DIR), PathBuf::from)
}

/// Resolves `key` from the secrets directory, then the environment.
pub fn get_secret(key: &str) -> Option<String> {
    let path = secrets_dir().join(key.to_lowercase());
    if let Ok(contents) = std::fs::read_to_string(&path) {
        let trimmed = contents.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Like [`get_secret`] but startup-fatal when absent.
pub fn require_secret(key: &str) -> Result<String, ConfigError> {
    get_secret(key).ok_or_else(|| ConfigError::MissingKey(key.to_string()))
}

/// Parses `key` from the environment, falling back to `default`.
/// A present-but-unparseable value is an error rather than a silent default.
pub fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

/// Optional string from the environment, empty treated as unset.
pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Installs the global tracing subscriber from `LOG_LEVEL` and
/// `LOG_FORMAT` (`json` or `human`, default `human`).
pub fn init_tracing(service: &str) {
    let level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    tracing::info!(service, level = %level, json, "logging initialized");
}
