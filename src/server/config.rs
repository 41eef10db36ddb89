//! Server configuration parsing.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::clock::Chrono;
use crate::cluster::{BucketOptions, ClusterOptions, NodeOptions};
use crate::services::ServiceType;

/// Server configuration loaded from a TOML file. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Process settings.
    pub server: ServerConfig,
    /// Shape of the mock cluster.
    pub cluster: ClusterConfig,
    /// Buckets created at startup.
    pub buckets: Vec<BucketOptions>,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Control channel settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address of the control listener (e.g., "127.0.0.1" or "0.0.0.0").
    pub bind: String,
    /// Port of the control listener. No listener when unset.
    pub control_port: Option<u16>,
    /// Address of a harness to dial and serve instead of listening.
    pub control_connect: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            control_port: None,
            control_connect: None,
        }
    }
}

/// Cluster topology and timing.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub num_vbuckets: u16,
    pub replica_latency_ms: u64,
    pub persist_latency_ms: u64,
    /// Number of nodes, including the initial one.
    pub nodes: usize,
    /// Services every node runs. Empty means all of them.
    pub services: Vec<ServiceType>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_vbuckets: 1024,
            replica_latency_ms: 50,
            persist_latency_ms: 100,
            nodes: 1,
            services: Vec::new(),
        }
    }
}

impl ClusterConfig {
    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            services: self.services.clone(),
        }
    }

    pub fn cluster_options(&self) -> ClusterOptions {
        ClusterOptions {
            chrono: Chrono::new(),
            num_vbuckets: self.num_vbuckets,
            replica_latency: Duration::from_millis(self.replica_latency_ms),
            persist_latency: Duration::from_millis(self.persist_latency_ms),
            initial_node: self.node_options(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. "info" or "caves=debug,tower_http=info".
    pub level: String,
    pub format: LogFormat,
    /// "stdout", "stderr" or a file path.
    pub output: String,
    pub color: bool,
    /// Include the event target (module path).
    pub target: bool,
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            output: "stdout".to_string(),
            color: true,
            target: false,
            timestamps: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Socket address of the control listener, if one is configured.
    pub fn control_addr(&self) -> Option<String> {
        self.server
            .control_port
            .map(|port| format!("{}:{}", self.server.bind, port))
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(String, std::io::Error),
    /// TOML parse error.
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Failed to read config file '{}': {}", path, e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
