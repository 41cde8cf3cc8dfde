//! Routing rules and service metadata.
//!
//! A [`Rule`] binds a service and its paths to the filters, flow control,
//! retry and circuit breaker settings applied to matching requests. Rules and
//! services are distributed by the config center and the registry, or loaded
//! from a [`GatewayFile`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Weight given to instances that do not declare one.
pub const DEFAULT_WEIGHT: u32 = 100;

/// Errors raised while loading a rules file.
#[derive(Error, Debug)]
pub enum LoadError {
    /// File could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    /// TOML content did not parse.
    #[error("invalid toml: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON content did not parse.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reference from a rule to a registered filter, with its free-form config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Filter id looked up in the registry.
    pub id: String,
    /// Filter specific settings.
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

impl FilterConfig {
    /// Creates a filter reference without settings.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: None,
        }
    }

    /// Attaches settings to the filter reference.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Reads a string setting.
    pub fn str_setting(&self, key: &str) -> Option<&str> {
        self.config.as_ref()?.get(key)?.as_str()
    }
}

/// Scope of a flow control config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowCtlType {
    /// Limits a single path, named by `value`.
    Path,
    /// Limits the whole service.
    Service,
}

/// Where the flow control counter lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowCtlModel {
    /// Shared counter in Redis.
    Distributed,
    /// Token bucket local to this process.
    #[default]
    Singleton,
}

/// Permits granted per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowCtlLimit {
    /// Window length in seconds.
    pub duration: u64,
    /// Requests admitted per window.
    pub permits: u64,
}

/// Flow control settings of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowCtlConfig {
    /// Scope of the limit.
    #[serde(rename = "type")]
    pub kind: FlowCtlType,
    /// Path the limit applies to when scoped by path.
    #[serde(default)]
    pub value: String,
    /// Counter location.
    #[serde(default)]
    pub model: FlowCtlModel,
    /// Window and permits.
    pub config: FlowCtlLimit,
}

/// Retry settings of a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt.
    pub times: u32,
}

/// Circuit breaker settings for one path of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    /// Path guarded by the breaker.
    pub path: String,
    /// Execution timeout of a guarded call.
    pub timeout_ms: u64,
    /// Concurrent guarded calls allowed.
    #[serde(default = "default_thread_core_size")]
    pub thread_core_size: usize,
    /// Data returned when the breaker short-circuits.
    #[serde(default)]
    pub fallback_response: String,
    /// Failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
    /// How long the breaker stays open.
    #[serde(default = "default_open_ms")]
    pub open_ms: u64,
}

fn default_thread_core_size() -> usize {
    10
}

fn default_failure_threshold() -> u64 {
    5
}

fn default_open_ms() -> u64 {
    30_000
}

/// A routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Backend protocol.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Ordering among rules of the same service.
    #[serde(default)]
    pub order: i32,
    /// Service the rule belongs to.
    pub service_id: String,
    /// Path prefix matched when no exact path applies.
    #[serde(default)]
    pub prefix: String,
    /// Exact paths served by the rule.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Filters applied to matching requests, unique by id.
    #[serde(default)]
    pub filter_configs: Vec<FilterConfig>,
    /// Flow control limits.
    #[serde(default)]
    pub flow_ctl_configs: Vec<FlowCtlConfig>,
    /// Retry settings.
    #[serde(default)]
    pub retry_config: RetryConfig,
    /// Circuit breakers by path.
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerPolicy>,
}

fn default_protocol() -> String {
    "http".to_string()
}

impl Rule {
    /// Creates a rule for a service with no paths or filters.
    pub fn new(id: impl Into<String>, service_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            protocol: default_protocol(),
            order: 0,
            service_id: service_id.into(),
            prefix: String::new(),
            paths: Vec::new(),
            filter_configs: Vec::new(),
            flow_ctl_configs: Vec::new(),
            retry_config: RetryConfig::default(),
            circuit_breakers: Vec::new(),
        }
    }

    /// Adds an exact path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Sets the path prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the rule order.
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Adds a filter reference, replacing any existing one with the same id.
    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        self.filter_configs.retain(|f| f.id != filter.id);
        self.filter_configs.push(filter);
        self
    }

    /// Adds a flow control limit.
    pub fn with_flow_ctl(mut self, config: FlowCtlConfig) -> Self {
        self.flow_ctl_configs.push(config);
        self
    }

    /// Sets the retry count.
    pub fn with_retry_times(mut self, times: u32) -> Self {
        self.retry_config.times = times;
        self
    }

    /// Adds a circuit breaker.
    pub fn with_circuit_breaker(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breakers.push(policy);
        self
    }

    /// Returns the filter reference with the given id.
    pub fn filter_config(&self, id: &str) -> Option<&FilterConfig> {
        self.filter_configs.iter().find(|f| f.id == id)
    }

    /// Whether the rule references the filter id.
    pub fn has_filter(&self, id: &str) -> bool {
        self.filter_config(id).is_some()
    }

    /// Returns the circuit breaker guarding `path`.
    pub fn circuit_breaker(&self, path: &str) -> Option<&CircuitBreakerPolicy> {
        self.circuit_breakers.iter().find(|cb| cb.path == path)
    }

    /// Drops duplicate filter references, keeping the first of each id.
    pub fn dedup_filters(&mut self) {
        let mut seen = HashSet::new();
        self.filter_configs.retain(|f| seen.insert(f.id.clone()));
    }

    /// Precedence among rules: `order` ascending, then id.
    ///
    /// Two distinct rules may share a precedence only if they share an id,
    /// which the store never holds at once.
    pub fn precedence(&self, other: &Rule) -> Ordering {
        self.order
            .cmp(&other.order)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Service known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Key carried in the `uniqueId` request header.
    pub unique_id: String,
    /// Service name.
    #[serde(default)]
    pub service_id: String,
    /// Service version.
    #[serde(default)]
    pub version: String,
    /// Backend protocol.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Environment tag.
    #[serde(default)]
    pub env_type: String,
    /// Whether the service accepts traffic.
    #[serde(default = "default_true")]
    pub enable: bool,
}

impl ServiceDefinition {
    /// Creates an enabled http service definition.
    pub fn new(unique_id: impl Into<String>) -> Self {
        let unique_id = unique_id.into();
        Self {
            service_id: unique_id.clone(),
            unique_id,
            version: String::new(),
            protocol: default_protocol(),
            env_type: String::new(),
            enable: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    DEFAULT_WEIGHT
}

/// A live backend process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Instance id, usually `ip:port`.
    pub service_instance_id: String,
    /// Service key the instance belongs to.
    pub unique_id: String,
    /// Address.
    pub ip: String,
    /// Port.
    pub port: u16,
    /// Load balancing weight.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Registration time in epoch milliseconds.
    #[serde(default)]
    pub register_time: u64,
    /// Deployed version.
    #[serde(default)]
    pub version: String,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Receives gray traffic.
    #[serde(default)]
    pub gray: bool,
    /// Accepts traffic.
    #[serde(default = "default_true")]
    pub enable: bool,
}

impl ServiceInstance {
    /// Creates an enabled instance whose id is `ip:port`.
    pub fn new(unique_id: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        let ip = ip.into();
        Self {
            service_instance_id: format!("{}:{}", ip, port),
            unique_id: unique_id.into(),
            ip,
            port,
            weight: DEFAULT_WEIGHT,
            register_time: 0,
            version: String::new(),
            metadata: HashMap::new(),
            gray: false,
            enable: true,
        }
    }

    /// Marks the instance as a gray instance.
    pub fn with_gray(mut self, gray: bool) -> Self {
        self.gray = gray;
        self
    }

    /// Host and port used as the outbound target.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// A service and its instances as listed in a rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Service definition.
    #[serde(flatten)]
    pub definition: ServiceDefinition,
    /// Instances of the service.
    #[serde(default)]
    pub instances: Vec<ServiceInstance>,
}

/// Rules and services that can be loaded from file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayFile {
    /// Routing rules.
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Services with their instances.
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

impl GatewayFile {
    /// Loads configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Loads configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Reads a file, choosing the format from its extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(Self::from_json(&content)?),
            _ => Ok(Self::from_toml(&content)?),
        }
    }
}
