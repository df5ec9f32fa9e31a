use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Limits and thresholds of the connection & resilience manager.
///
/// This is the complete set of recognized options; unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    /// Maximum connections in existence (idle + lent), also the concurrency limit
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum idle connections kept for reuse
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Maximum requests waiting for admission
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Idle age after which a pooled connection is evicted
    #[serde(default = "default_connection_ttl_ms")]
    pub connection_ttl_ms: u64,

    /// Failures in Closed state before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the circuit stays open before allowing half-open trials
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Concurrent trials allowed, and successes needed to close, in half-open state
    #[serde(default = "default_half_open_max_trials")]
    pub half_open_max_trials: u32,

    /// Interval between warmup ticks
    #[serde(default = "default_warmup_interval_ms")]
    pub warmup_interval_ms: u64,

    /// Idle connections the warmup scheduler tries to keep ready
    #[serde(default = "default_warmup_target_count")]
    pub warmup_target_count: usize,
}

fn default_max_connections() -> usize {
    10
}

fn default_max_pool_size() -> usize {
    5
}

fn default_max_queue_size() -> usize {
    50
}

fn default_connection_ttl_ms() -> u64 {
    300_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_trials() -> u32 {
    3
}

fn default_warmup_interval_ms() -> u64 {
    60_000
}

fn default_warmup_target_count() -> usize {
    2
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_pool_size: default_max_pool_size(),
            max_queue_size: default_max_queue_size(),
            connection_ttl_ms: default_connection_ttl_ms(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_trials: default_half_open_max_trials(),
            warmup_interval_ms: default_warmup_interval_ms(),
            warmup_target_count: default_warmup_target_count(),
        }
    }
}

impl ManagerConfig {
    /// Check that every option is positive and the pool fits inside the connection limit
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, u64); 9] = [
            ("max_connections", self.max_connections as u64),
            ("max_pool_size", self.max_pool_size as u64),
            ("max_queue_size", self.max_queue_size as u64),
            ("connection_ttl_ms", self.connection_ttl_ms),
            ("failure_threshold", u64::from(self.failure_threshold)),
            ("reset_timeout_ms", self.reset_timeout_ms),
            ("half_open_max_trials", u64::from(self.half_open_max_trials)),
            ("warmup_interval_ms", self.warmup_interval_ms),
            ("warmup_target_count", self.warmup_target_count as u64),
        ];

        if let Some((name, _)) = checks.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::NotPositive(name));
        }

        if self.max_pool_size > self.max_connections {
            return Err(ConfigError::PoolLargerThanConnections {
                max_pool_size: self.max_pool_size as u64,
                max_connections: self.max_connections as u64,
            });
        }

        Ok(())
    }

    pub fn connection_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_ttl_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn warmup_interval(&self) -> Duration {
        Duration::from_millis(self.warmup_interval_ms)
    }
}

/// Where and how to reach the completion API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Completion endpoint, e.g. "http://127.0.0.1:8080/v1/completions"
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Path requested by warmup pings
    #[serde(default = "default_ping_path")]
    pub ping_path: String,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Connection establishment timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bearer token sent with every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080/v1/completions".to_string()
}

fn default_ping_path() -> String {
    "/v1/models".to_string()
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            ping_path: default_ping_path(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            api_key: None,
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Every variable is optional; unset ones keep their defaults:
/// - GENPOOL_ENDPOINT, GENPOOL_PING_PATH, GENPOOL_API_KEY
/// - GENPOOL_REQUEST_TIMEOUT_MS, GENPOOL_CONNECT_TIMEOUT_MS
/// - GENPOOL_MAX_CONNECTIONS, GENPOOL_MAX_POOL_SIZE, GENPOOL_MAX_QUEUE_SIZE
/// - GENPOOL_CONNECTION_TTL_MS, GENPOOL_FAILURE_THRESHOLD, GENPOOL_RESET_TIMEOUT_MS
/// - GENPOOL_HALF_OPEN_MAX_TRIALS, GENPOOL_WARMUP_INTERVAL_MS, GENPOOL_WARMUP_TARGET_COUNT
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::default();

    if let Ok(endpoint) = std::env::var("GENPOOL_ENDPOINT") {
        config.upstream.endpoint = endpoint;
    }
    if let Ok(path) = std::env::var("GENPOOL_PING_PATH") {
        config.upstream.ping_path = path;
    }
    config.upstream.api_key = std::env::var("GENPOOL_API_KEY").ok().filter(|k| !k.is_empty());
    env_override("GENPOOL_REQUEST_TIMEOUT_MS", &mut config.upstream.request_timeout_ms)?;
    env_override("GENPOOL_CONNECT_TIMEOUT_MS", &mut config.upstream.connect_timeout_ms)?;

    let manager = &mut config.manager;
    env_override("GENPOOL_MAX_CONNECTIONS", &mut manager.max_connections)?;
    env_override("GENPOOL_MAX_POOL_SIZE", &mut manager.max_pool_size)?;
    env_override("GENPOOL_MAX_QUEUE_SIZE", &mut manager.max_queue_size)?;
    env_override("GENPOOL_CONNECTION_TTL_MS", &mut manager.connection_ttl_ms)?;
    env_override("GENPOOL_FAILURE_THRESHOLD", &mut manager.failure_threshold)?;
    env_override("GENPOOL_RESET_TIMEOUT_MS", &mut manager.reset_timeout_ms)?;
    env_override("GENPOOL_HALF_OPEN_MAX_TRIALS", &mut manager.half_open_max_trials)?;
    env_override("GENPOOL_WARMUP_INTERVAL_MS", &mut manager.warmup_interval_ms)?;
    env_override("GENPOOL_WARMUP_TARGET_COUNT", &mut manager.warmup_target_count)?;

    Ok(config)
}

fn env_override<T>(key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(raw) = std::env::var(key) {
        *target = raw
            .trim()
            .parse()
            .context(format!("Invalid value for {}: {:?}", key, raw))?;
    }
    Ok(())
}

/// Load configuration from file or environment, then validate it
///
/// A YAML file is used when `config_path` is given, environment variables otherwise.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };

    config
        .manager
        .validate()
        .context("Invalid manager configuration")?;

    Ok(config)
}
