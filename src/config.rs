//! Bus configuration.
//!
//! Supports YAML file and environment variable overrides. The merged
//! configuration is built once at startup and passed to the components that
//! need it; nothing reads process state after `load` returns.

use std::path::Path;

use serde::Deserialize;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
}

/// Top-level bus configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Outbox delivery and sweep configuration.
    pub outbox: OutboxConfig,
    /// Retry policy configuration.
    pub retry: RetryConfig,
    /// Shutdown configuration.
    pub shutdown: ShutdownConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type (sqlite, memory).
    #[serde(rename = "type")]
    pub storage_type: String,
    /// Path to database file (sqlite only).
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: if cfg!(feature = "sqlite") {
                "sqlite".to_string()
            } else {
                "memory".to_string()
            },
            path: "./data/bus.db".to_string(),
        }
    }
}

/// Outbox delivery and sweep configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Interval in seconds between background sweep runs.
    pub sweep_interval_secs: u64,
    /// Minimum age in seconds before an unsent row is re-delivered.
    pub delivery_interval_secs: u64,
    /// Maximum rows re-delivered per sweep run.
    pub sweep_batch: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 5,
            delivery_interval_secs: 30,
            sweep_batch: 100,
        }
    }
}

/// Retry policy configuration.
///
/// Retry is opt-in: with `max_retries = 0` a failing message is rejected on
/// first failure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum redelivery attempts before the message is rejected.
    pub max_retries: u32,
    /// Minimum backoff delay in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            min_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Deadline in seconds for draining in-flight handlers. No deadline
    /// waits indefinitely.
    pub drain_timeout_secs: Option<u64>,
}

impl BusConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file (`HUGINN_CONFIG`, default `bus.yaml`)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("HUGINN_CONFIG").unwrap_or_else(|_| "bus.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("HUGINN_STORAGE_TYPE") {
            self.storage.storage_type = value;
        }
        if let Ok(value) = std::env::var("HUGINN_STORAGE_PATH") {
            self.storage.path = value;
        }
        if let Ok(value) = std::env::var("HUGINN_OUTBOX_SWEEP_INTERVAL_SECS") {
            self.outbox.sweep_interval_secs = parse_env("HUGINN_OUTBOX_SWEEP_INTERVAL_SECS", &value)?;
        }
        if let Ok(value) = std::env::var("HUGINN_OUTBOX_DELIVERY_INTERVAL_SECS") {
            self.outbox.delivery_interval_secs =
                parse_env("HUGINN_OUTBOX_DELIVERY_INTERVAL_SECS", &value)?;
        }
        if let Ok(value) = std::env::var("HUGINN_RETRY_MAX") {
            self.retry.max_retries = parse_env("HUGINN_RETRY_MAX", &value)?;
        }
        if let Ok(value) = std::env::var("HUGINN_DRAIN_TIMEOUT_SECS") {
            self.shutdown.drain_timeout_secs =
                Some(parse_env("HUGINN_DRAIN_TIMEOUT_SECS", &value)?);
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();

        assert_eq!(config.outbox.sweep_interval_secs, 5);
        assert_eq!(config.outbox.delivery_interval_secs, 30);
        assert_eq!(config.retry.max_retries, 0);
        assert!(config.shutdown.drain_timeout_secs.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: BusConfig = serde_yaml::from_str(
            "
storage:
  type: memory
retry:
  max_retries: 3
",
        )
        .unwrap();

        assert_eq!(config.storage.storage_type, "memory");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.min_delay_ms, 100);
        assert_eq!(config.outbox.sweep_batch, 100);
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        let parsed: Result<u64, _> = parse_env("HUGINN_RETRY_MAX", "not-a-number");
        assert!(matches!(parsed, Err(ConfigError::InvalidValue { .. })));
    }
}
