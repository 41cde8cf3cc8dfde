//! Configuration for the gateway.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::dispatch::WaitStrategy;

/// Buffer type that routes requests through the dispatch core.
pub const BUFFER_TYPE_PARALLEL: &str = "parallel";

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid listen address format.
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidListenAddr { addr: String, reason: String },

    /// Invalid admin address format.
    #[error("invalid admin address '{addr}': {reason}")]
    InvalidAdminAddr { addr: String, reason: String },

    /// Duplicate listen and admin addresses.
    #[error("listen address and admin address cannot be the same: {addr}")]
    DuplicateAddrs { addr: String },

    /// Invalid timeout value.
    #[error("invalid timeout value: {reason}")]
    InvalidTimeout { reason: String },

    /// Ring buffer capacity is not a power of two.
    #[error("buffer size {size} must be a non-zero power of two")]
    InvalidBufferSize { size: usize },

    /// Worker thread count is zero.
    #[error("process thread count must be greater than zero")]
    InvalidThreadCount,

    /// Unknown consumer wait strategy.
    #[error("unknown wait strategy '{0}'")]
    InvalidWaitStrategy(String),

    /// Redis URL could not be parsed.
    #[error("invalid redis url '{url}': {reason}")]
    InvalidRedisUrl { url: String, reason: String },

    /// Config file could not be read or parsed.
    #[error("failed to load config file {path}: {reason}")]
    File { path: String, reason: String },
}

/// Gateway configuration loaded at startup.
///
/// Immutable after initialization and shared across tasks via `Arc`.
/// Values are layered: built-in defaults, then an optional TOML file named by
/// `GATEWAY_CONFIG_FILE`, then individual `GATEWAY_*` environment variables.
///
/// # Environment Variables
///
/// * `GATEWAY_LISTEN_ADDR` - Address to listen on (default: "127.0.0.1:9888")
/// * `GATEWAY_ADMIN_ADDR` - Health and metrics address (default: "127.0.0.1:18100")
/// * `GATEWAY_RULES_FILE` - Rules and services file watched by the config center
/// * `GATEWAY_BUFFER_TYPE` - "parallel" for the dispatch core, anything else runs serially
/// * `GATEWAY_BUFFER_SIZE` - Ring buffer capacity, a power of two (default: 16384)
/// * `GATEWAY_PROCESS_THREADS` - Dispatch worker threads (default: available parallelism)
/// * `GATEWAY_WAIT_STRATEGY` - blocking, busySpin, yielding or sleeping (default: blocking)
/// * `GATEWAY_WHEN_COMPLETE` - Run outbound continuations inline (default: true)
/// * `GATEWAY_REQUEST_TIMEOUT_MS` - Outbound request timeout (default: 30000)
/// * `GATEWAY_REDIS_URL` - Redis used by distributed flow control
///
/// # Example
///
/// ```
/// use rust_apigateway::config::GatewayConfig;
///
/// let config = GatewayConfig::from_env();
/// assert!(config.buffer_size.is_power_of_two());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to listen on for incoming requests.
    pub listen_addr: String,

    /// Address serving `/health`, `/metrics` and `/rules`.
    pub admin_addr: String,

    /// Name reported in logs.
    pub application_name: String,

    /// Deployment environment tag.
    pub env: String,

    /// Rules and services file, TOML or JSON.
    pub rules_file: Option<String>,

    /// How often the rules file is checked for changes.
    #[serde(with = "duration_ms")]
    pub rules_poll_interval: Duration,

    /// Maximum inbound body size in bytes.
    pub max_content_length: usize,

    /// Maximum concurrent inbound connections.
    pub max_connections: usize,

    /// Run the outbound continuation on the completing task instead of
    /// redispatching it.
    pub when_complete: bool,

    /// Outbound connect timeout.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Outbound request timeout.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// Idle pooled connections kept per backend host.
    pub connections_per_host: usize,

    /// Idle pooled connection eviction timeout.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,

    /// "parallel" routes requests through the dispatch core.
    pub buffer_type: String,

    /// Ring buffer capacity.
    pub buffer_size: usize,

    /// Dispatch worker thread count.
    pub process_threads: usize,

    /// Consumer wait strategy name.
    pub wait_strategy: String,

    /// Redis connection string for distributed flow control.
    pub redis_url: Option<String>,
}

fn default_process_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9888".to_string(),
            admin_addr: "127.0.0.1:18100".to_string(),
            application_name: "api-gateway".to_string(),
            env: "dev".to_string(),
            rules_file: None,
            rules_poll_interval: Duration::from_secs(5),
            max_content_length: 64 * 1024 * 1024,
            max_connections: 10_000,
            when_complete: true,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            connections_per_host: 8000,
            idle_timeout: Duration::from_secs(60),
            buffer_type: BUFFER_TYPE_PARALLEL.to_string(),
            buffer_size: 16 * 1024,
            process_threads: default_process_threads(),
            wait_strategy: "blocking".to_string(),
            redis_url: None,
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from the optional config file and environment
    /// variables, falling back to defaults.
    ///
    /// A config file that cannot be read is ignored here; use
    /// [`GatewayConfig::load`] to surface the error.
    pub fn from_env() -> Self {
        Self::load().unwrap_or_else(|_| {
            let mut config = Self::default();
            config.apply_env();
            config
        })
    }

    /// Loads and layers configuration, returning file errors.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var("GATEWAY_CONFIG_FILE") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Parses a TOML config file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Loads, layers and validates configuration.
    pub fn from_env_validated() -> Result<Self, ConfigError> {
        let config = Self::load()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("GATEWAY_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = env::var("GATEWAY_ADMIN_ADDR") {
            self.admin_addr = v;
        }
        if let Ok(v) = env::var("GATEWAY_APPLICATION_NAME") {
            self.application_name = v;
        }
        if let Ok(v) = env::var("GATEWAY_ENV") {
            self.env = v;
        }
        if let Ok(v) = env::var("GATEWAY_RULES_FILE") {
            self.rules_file = Some(v);
        }
        if let Ok(v) = env::var("GATEWAY_BUFFER_TYPE") {
            self.buffer_type = v;
        }
        if let Ok(v) = env::var("GATEWAY_WAIT_STRATEGY") {
            self.wait_strategy = v;
        }
        if let Ok(v) = env::var("GATEWAY_REDIS_URL") {
            self.redis_url = Some(v);
        }
        if let Some(v) = env_parse("GATEWAY_MAX_CONTENT_LENGTH") {
            self.max_content_length = v;
        }
        if let Some(v) = env_parse("GATEWAY_MAX_CONNECTIONS") {
            self.max_connections = v;
        }
        if let Some(v) = env_parse("GATEWAY_WHEN_COMPLETE") {
            self.when_complete = v;
        }
        if let Some(v) = env_parse("GATEWAY_CONNECTIONS_PER_HOST") {
            self.connections_per_host = v;
        }
        if let Some(v) = env_parse("GATEWAY_BUFFER_SIZE") {
            self.buffer_size = v;
        }
        if let Some(v) = env_parse("GATEWAY_PROCESS_THREADS") {
            self.process_threads = v;
        }
        if let Some(ms) = env_parse("GATEWAY_RULES_POLL_INTERVAL_MS") {
            self.rules_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("GATEWAY_CONNECT_TIMEOUT_MS") {
            self.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("GATEWAY_REQUEST_TIMEOUT_MS") {
            self.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("GATEWAY_IDLE_TIMEOUT_MS") {
            self.idle_timeout = Duration::from_millis(ms);
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Listen or admin address is not a valid socket address
    /// - Listen and admin addresses are the same
    /// - A timeout is zero or too large
    /// - Buffer size is not a power of two
    /// - Process thread count is zero
    /// - Wait strategy is unknown
    /// - Redis URL does not parse
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidListenAddr {
                addr: self.listen_addr.clone(),
                reason: e.to_string(),
            })?;

        self.admin_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidAdminAddr {
                addr: self.admin_addr.clone(),
                reason: e.to_string(),
            })?;

        if self.listen_addr == self.admin_addr {
            return Err(ConfigError::DuplicateAddrs {
                addr: self.listen_addr.clone(),
            });
        }

        for (name, timeout) in [
            ("connect", self.connect_timeout),
            ("request", self.request_timeout),
        ] {
            if timeout.is_zero() {
                return Err(ConfigError::InvalidTimeout {
                    reason: format!("{} timeout must be greater than zero", name),
                });
            }
            if timeout > Duration::from_secs(3600) {
                return Err(ConfigError::InvalidTimeout {
                    reason: format!("{} timeout must not exceed 1 hour", name),
                });
            }
        }

        if !self.buffer_size.is_power_of_two() {
            return Err(ConfigError::InvalidBufferSize {
                size: self.buffer_size,
            });
        }

        if self.process_threads == 0 {
            return Err(ConfigError::InvalidThreadCount);
        }

        self.wait_strategy()?;

        if let Some(redis_url) = &self.redis_url {
            url::Url::parse(redis_url).map_err(|e| ConfigError::InvalidRedisUrl {
                url: redis_url.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    /// Whether requests go through the dispatch core.
    pub fn is_parallel(&self) -> bool {
        self.buffer_type == BUFFER_TYPE_PARALLEL
    }

    /// Parsed consumer wait strategy.
    pub fn wait_strategy(&self) -> Result<WaitStrategy, ConfigError> {
        self.wait_strategy
            .parse()
            .map_err(|_| ConfigError::InvalidWaitStrategy(self.wait_strategy.clone()))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
