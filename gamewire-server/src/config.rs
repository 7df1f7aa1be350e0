//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via GAMEWIRE_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub network: NetworkConfig,
    /// Worker pool and poller configuration.
    pub workers: WorkerConfig,
    /// Argument binding limits.
    pub bind: BindConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("GAMEWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, msg) => ConfigError::ParseError(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(PathBuf::from("<inline>"), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.workers.apply_env_overrides();
        self.bind.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks that at least one listener is configured and limits are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let net = &self.network;
        if net.socket_addr.is_none() && net.tcp_addr.is_none() && net.websocket_addr.is_none() {
            return Err(ConfigError::ValidationError(
                "no listener configured (socket_addr, tcp_addr or websocket_addr)".to_string(),
            ));
        }
        if net.write_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "write_timeout_ms must be positive".to_string(),
            ));
        }
        if net.outbound_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "outbound_queue_capacity must be positive".to_string(),
            ));
        }
        if net.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be positive".to_string(),
            ));
        }
        if self.bind.max_list_len == 0 || self.bind.max_depth == 0 {
            return Err(ConfigError::ValidationError(
                "bind limits must be positive".to_string(),
            ));
        }
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue_capacity must be positive".to_string(),
            ));
        }
        if net.socket_addr.is_some() && self.workers.pollers == 0 {
            return Err(ConfigError::ValidationError(
                "socket listener configured without pollers".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Blocking-socket listener (polled by the poller group).
    #[serde(with = "opt_socket_addr_serde")]
    pub socket_addr: Option<SocketAddr>,
    /// Event-loop listener.
    #[serde(with = "opt_socket_addr_serde")]
    pub tcp_addr: Option<SocketAddr>,
    /// Websocket listener.
    #[serde(with = "opt_socket_addr_serde")]
    pub websocket_addr: Option<SocketAddr>,
    /// Seconds without inbound traffic before a heartbeat is sent
    /// (0 = no heartbeats).
    pub idle_heartbeat_secs: u64,
    /// Maximum concurrent connections per listener.
    pub max_connections: usize,
    /// Read slice for blocking sockets in milliseconds.
    pub read_timeout_ms: u64,
    /// Consecutive protocol errors tolerated before a connection is closed.
    pub max_protocol_errors: u32,
    /// Longest a blocking write may stall before the peer is dropped.
    pub write_timeout_ms: u64,
    /// Replies queued per async connection before the peer is dropped.
    pub outbound_queue_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            socket_addr: None,
            tcp_addr: Some(SocketAddr::from((
                [127, 0, 0, 1],
                gamewire_protocol::DEFAULT_PORT,
            ))),
            websocket_addr: None,
            idle_heartbeat_secs: 30,
            max_connections: 1000,
            read_timeout_ms: 5,
            max_protocol_errors: 3,
            write_timeout_ms: 5000,
            outbound_queue_capacity: 1024,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_addr("GAMEWIRE_SOCKET_BIND") {
            self.socket_addr = Some(addr);
        }

        if let Some(addr) = env_addr("GAMEWIRE_TCP_BIND") {
            self.tcp_addr = Some(addr);
        }

        if let Some(addr) = env_addr("GAMEWIRE_WS_BIND") {
            self.websocket_addr = Some(addr);
        }

        if let Ok(secs) = std::env::var("GAMEWIRE_IDLE_HEARTBEAT") {
            if let Ok(secs) = secs.parse() {
                self.idle_heartbeat_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("GAMEWIRE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(ms) = std::env::var("GAMEWIRE_WRITE_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.write_timeout_ms = ms;
            }
        }

        if let Ok(cap) = std::env::var("GAMEWIRE_OUTBOUND_QUEUE") {
            if let Ok(n) = cap.parse() {
                self.outbound_queue_capacity = n;
            }
        }
    }

    /// Returns the idle heartbeat interval as Duration.
    pub fn idle_heartbeat(&self) -> Duration {
        Duration::from_secs(self.idle_heartbeat_secs)
    }

    /// Returns the blocking read slice as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    /// Returns the blocking write bound as Duration.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }
}

/// Argument binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    /// Nesting limit when flattening replies.
    pub max_depth: usize,
    /// Largest list an incoming payload may describe.
    pub max_list_len: usize,
    /// Retry string scalars as JSON text when they do not bind directly.
    pub lenient_scalars: bool,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            max_depth: gamewire_bind::DEFAULT_MAX_DEPTH,
            max_list_len: gamewire_bind::DEFAULT_MAX_LIST_LEN,
            lenient_scalars: true,
        }
    }
}

impl BindConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("GAMEWIRE_MAX_LIST_LEN") {
            if let Ok(n) = max.parse() {
                self.max_list_len = n;
            }
        }
    }

    /// Builds the materializer these settings describe.
    pub fn materializer(&self) -> gamewire_bind::Materializer {
        gamewire_bind::Materializer::new()
            .with_max_depth(self.max_depth)
            .with_max_list_len(self.max_list_len)
            .with_lenient_scalars(self.lenient_scalars)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker threads (0 = available CPU parallelism).
    pub pool_size: usize,
    /// Bounded task queue capacity.
    pub queue_capacity: usize,
    /// Poller threads for blocking-socket sessions.
    pub pollers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 0,
            queue_capacity: 4096,
            pollers: 2,
        }
    }
}

impl WorkerConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("GAMEWIRE_WORKERS") {
            if let Ok(n) = size.parse() {
                self.pool_size = n;
            }
        }

        if let Ok(cap) = std::env::var("GAMEWIRE_QUEUE_CAPACITY") {
            if let Ok(n) = cap.parse() {
                self.queue_capacity = n;
            }
        }

        if let Ok(pollers) = std::env::var("GAMEWIRE_POLLERS") {
            if let Ok(n) = pollers.parse() {
                self.pollers = n;
            }
        }
    }

    /// Returns the effective worker thread count.
    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size > 0 {
            self.pool_size
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("GAMEWIRE_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Some(addr) = env_addr("GAMEWIRE_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

fn env_addr(name: &str) -> Option<SocketAddr> {
    std::env::var(name).ok().and_then(|addr| addr.parse().ok())
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
    /// A required collaborator was not supplied.
    Missing(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
            ConfigError::Missing(what) => {
                write!(f, "missing required collaborator: {}", what)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Optional listener addresses; `~` or an empty string disables a listener.
mod opt_socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &Option<SocketAddr>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match addr {
            Some(addr) => serializer.serialize_str(&addr.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SocketAddr>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) if !s.trim().is_empty() => s.parse().map(Some).map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}
