//! Configuration for clubrelay.
//!
//! Loaded from TOML with `${VAR}` placeholders replaced from the environment.
//! Every section and field is optional.
//!
//! ```toml
//! [server]
//! port = 8080
//!
//! [broker]
//! backend = "redis"
//! url = "${REDIS_URL}"
//!
//! [pipeline]
//! pool_size = 5
//! max_redeliveries = 5
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consumer::RetryPolicy;
use crate::publisher::PoolConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CLUBRELAY_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "config/clubrelay.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid placeholder pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClubRelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

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

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Defaults to the host name
    #[serde(default)]
    pub consumer_name: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            url: default_redis_url(),
            consumer_group: default_consumer_group(),
            consumer_name: None,
        }
    }
}

impl BrokerConfig {
    /// Configured consumer name, else `clubrelay-<hostname>`, else a random one.
    pub fn consumer_name(&self) -> String {
        if let Some(name) = &self.consumer_name {
            return name.clone();
        }
        match hostname::get().ok().and_then(|h| h.into_string().ok()) {
            Some(host) => format!("clubrelay-{}", host),
            None => format!("clubrelay-{}", uuid::Uuid::new_v4()),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_consumer_group() -> String {
    "clubrelay".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Ingestion buffer depth
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_max_worker_restarts")]
    pub max_worker_restarts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            pool_size: default_pool_size(),
            max_redeliveries: default_max_redeliveries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_worker_restarts: default_max_worker_restarts(),
        }
    }
}

impl PipelineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_redeliveries: self.max_redeliveries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            size: self.pool_size,
            max_restarts: self.max_worker_restarts,
        }
    }
}

fn default_capacity() -> usize {
    crate::buffer::DEFAULT_CAPACITY
}

fn default_pool_size() -> usize {
    5
}

fn default_max_redeliveries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_max_worker_restarts() -> u32 {
    3
}

impl ClubRelayConfig {
    /// Load from `$CLUBRELAY_CONFIG` or `config/clubrelay.toml`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Load from a path. A missing file yields the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate TOML text after environment substitution.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        debug!("Parsing TOML configuration");
        let config: ClubRelayConfig = toml::from_str(&content)?;
        config.validate()?;

        info!(
            broker = ?config.broker.backend,
            store = ?config.store.backend,
            capacity = config.pipeline.capacity,
            pool_size = config.pipeline.pool_size,
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.capacity == 0 {
            return Err(ConfigError::Invalid("pipeline.capacity must be at least 1".to_string()));
        }
        if self.pipeline.pool_size == 0 {
            return Err(ConfigError::Invalid("pipeline.pool_size must be at least 1".to_string()));
        }
        if self.pipeline.max_redeliveries == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_redeliveries must be at least 1".to_string(),
            ));
        }
        if self.broker.backend == Backend::Redis {
            validate_redis_url("broker", &self.broker.url)?;
        }
        if self.store.backend == Backend::Redis {
            validate_redis_url("store", &self.store.url)?;
        }
        Ok(())
    }
}

fn validate_redis_url(section: &str, url: &str) -> Result<(), ConfigError> {
    if url.contains("${") {
        warn!(section = %section, url = %url, "Redis URL contains unsubstituted environment variable");
    }
    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
        return Err(ConfigError::Invalid(format!(
            "{}.url must start with redis:// or rediss://",
            section
        )));
    }
    Ok(())
}

/// Replace `${VAR}` with the variable's value; unset variables stay as-is.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let placeholder = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;
    let substituted = placeholder.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    });
    Ok(substituted.into_owned())
}
