//! Application configuration.
//!
//! Aggregates configuration from all pipeline stages into a single Config
//! struct that can be loaded from YAML files or environment variables.

mod storage;

pub use storage::StorageConfig;

use std::time::Duration;

use serde::Deserialize;

use crate::adapter::AdapterConfig;
use crate::bus::QueueConfig;
use crate::dlq::SanitizerConfig;
use crate::ingest::IngestConfig;
use crate::oracle::OracleConfig;
use crate::reconciler::ReconcilerConfig;
use crate::utils::retry::RetryPolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "GOPHERMART_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "GOPHERMART";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "GOPHERMART_LOG";
/// Legacy environment variable for the accrual service address.
pub const ACCRUAL_ADDRESS_ENV_VAR: &str = "ACCRUAL_SYSTEM_ADDRESS";
/// Legacy environment variable for the database location.
pub const DATABASE_URI_ENV_VAR: &str = "DATABASE_URI";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub oracle: OracleConfig,
    pub queues: QueueConfig,
    pub ingest: IngestConfig,
    pub adapter: AdapterConfig,
    pub reconciler: ReconcilerConfig,
    pub sanitizer: SanitizerConfig,
    /// How long shutdown waits for workers before aborting them.
    pub shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            oracle: OracleConfig::default(),
            queues: QueueConfig::default(),
            ingest: IngestConfig::default(),
            adapter: AdapterConfig::default(),
            reconciler: ReconcilerConfig::default(),
            sanitizer: SanitizerConfig::default(),
            shutdown_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. Legacy `ACCRUAL_SYSTEM_ADDRESS` / `DATABASE_URI`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(CONFIG_ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        if let Ok(address) = std::env::var(ACCRUAL_ADDRESS_ENV_VAR) {
            builder = builder.set_override("oracle.address", address)?;
        }
        if let Ok(uri) = std::env::var(DATABASE_URI_ENV_VAR) {
            builder = builder.set_override("storage.path", uri)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-section constraints.
    ///
    /// The sanitizer ceiling must sit above every per-pass bound, otherwise
    /// an order would be quarantined before it ever got a second chance.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.adapter.workers == 0 {
            return Err(ConfigError::Invalid("adapter.workers must be > 0".into()));
        }
        if self.reconciler.workers == 0 {
            return Err(ConfigError::Invalid("reconciler.workers must be > 0".into()));
        }
        if self.queues.capacity == 0 {
            return Err(ConfigError::Invalid("queues.capacity must be > 0".into()));
        }
        if self.adapter.max_poll_attempts == 0 {
            return Err(ConfigError::Invalid(
                "adapter.max_poll_attempts must be > 0".into(),
            ));
        }

        let per_pass = [
            self.adapter.max_poll_attempts as usize,
            self.adapter.oracle_retry.max_calls(),
            self.reconciler.retry.max_calls(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0);

        if (self.sanitizer.max_attempts as usize) <= per_pass {
            return Err(ConfigError::Invalid(format!(
                "sanitizer.max_attempts ({}) must exceed the adapter and reconciler bounds ({})",
                self.sanitizer.max_attempts, per_pass
            )));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Create config for testing: in-memory storage, millisecond delays.
    pub fn for_test() -> Self {
        let fast = RetryPolicy::new(1, 5, 2);
        Self {
            storage: StorageConfig::memory(),
            oracle: OracleConfig {
                address: "http://127.0.0.1:1".to_string(),
                timeout_ms: 200,
                default_retry_after_secs: 1,
            },
            queues: QueueConfig {
                capacity: 100,
                visibility_timeout_secs: 5,
                receive_wait_ms: 20,
            },
            ingest: IngestConfig {
                publish_retry: fast.clone(),
                stale_after_secs: 600,
                sweep_interval_secs: 3600,
                sweep_batch: 100,
            },
            adapter: AdapterConfig {
                workers: 2,
                call_timeout_ms: 200,
                oracle_retry: fast.clone(),
                poll_delay_ms: 5,
                max_poll_delay_ms: 50,
                max_poll_attempts: 5,
            },
            reconciler: ReconcilerConfig {
                workers: 2,
                retry: fast,
            },
            sanitizer: SanitizerConfig {
                interval_ms: 50,
                cooldown_ms: 100,
                max_attempts: 30,
            },
            shutdown_timeout_secs: 5,
        }
    }
}
