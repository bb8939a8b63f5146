//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::Quota;

/// Prefix of environment variables that override file settings.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Admission control configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which keyed store backs the cache and the limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local store; state is lost on restart and not shared.
    #[default]
    Memory,
    /// Shared Redis server.
    Redis(RedisConfig),
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (redis:// or rediss://)
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Maximum pooled connections
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: usize,

    /// Upper bound on a single command round-trip, in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Upper bound on opening or waiting for a pooled connection, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl RedisConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_max_size: default_pool_max_size(),
            response_timeout_ms: default_response_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_pool_max_size() -> usize {
    16
}

fn default_response_timeout_ms() -> u64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied when a write does not name one
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    3600
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Namespace for every admission window key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Quota per protected operation
    #[serde(default = "default_quotas")]
    pub quotas: BTreeMap<String, Quota>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            quotas: default_quotas(),
        }
    }
}

fn default_key_prefix() -> String {
    "rate_limit".to_string()
}

/// Quotas of the administrative surface.
fn default_quotas() -> BTreeMap<String, Quota> {
    [
        ("system_overview", 10),
        ("list_users", 20),
        ("user_details", 30),
        ("api_statistics", 10),
        ("list_roles", 20),
        ("list_permissions", 20),
        ("assign_role", 10),
        ("remove_role", 10),
        ("deactivate_user", 5),
        ("activate_user", 5),
        ("cache_statistics", 10),
    ]
    .into_iter()
    .map(|(operation, limit)| (operation.to_string(), Quota::new(limit, 60)))
    .collect()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `TOLLGATE__SECTION__FIELD` environment overrides.
    ///
    /// Runs before logging is installed, so it logs nothing itself.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store or limiter cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.cache.default_ttl_secs == 0 {
            return Err(TollgateError::Config("cache.default_ttl_secs must be positive".to_string()));
        }
        if let StoreConfig::Redis(redis) = &self.store {
            if redis.response_timeout_ms == 0 {
                return Err(TollgateError::Config(
                    "store.response_timeout_ms must be positive".to_string(),
                ));
            }
            if redis.pool_max_size == 0 {
                return Err(TollgateError::Config("store.pool_max_size must be positive".to_string()));
            }
        }
        for (operation, quota) in &self.admission.quotas {
            quota
                .validate()
                .map_err(|reason| TollgateError::Config(format!("quota for {operation}: {reason}")))?;
        }
        Ok(())
    }
}
