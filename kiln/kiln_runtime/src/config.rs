//! Configuration for the Kiln server
//!
//! Handles loading and validating server configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use kiln_core::types::ServerInfo;
use kiln_core::utils::LoggingConfig;
use kiln_pool::InstancePoolConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

/// Errors that can occur in configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Instance pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of warm containers
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Longest a request may wait for a container (milliseconds)
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
}

fn default_capacity() -> usize {
    10
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            acquire_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    /// The pool's own view of this configuration.
    pub fn instance_pool(&self) -> InstancePoolConfig {
        InstancePoolConfig {
            capacity: self.capacity,
            acquire_timeout: self.acquire_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Buffered notifications per subscriber
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
}

fn default_channel_buffer_size() -> usize {
    64
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: default_channel_buffer_size(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name
    #[serde(default = "default_name")]
    pub name: String,

    /// Advertised host
    #[serde(default = "default_host")]
    pub host: String,

    /// Advertised port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Instance pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Event bus configuration
    #[serde(default)]
    pub events: EventsConfig,

    /// Shutdown timeout (seconds)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u32,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Additional configuration
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_name() -> String {
    "kiln".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1215
}

fn default_shutdown_timeout() -> u32 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: default_host(),
            port: default_port(),
            pool: PoolConfig::default(),
            events: EventsConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
            logging: LoggingConfig::default(),
            extra: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a file
    ///
    /// `.toml` files are read as TOML, anything else as JSON. A missing
    /// file falls back to the defaults.
    pub async fn load(path: Option<&str>) -> Result<Self> {
        let mut config = ServerConfig::default();

        if let Some(path) = path {
            info!("Loading configuration from {}", path);

            if !Path::new(path).exists() {
                warn!("Configuration file not found: {}", path);
                return Ok(config);
            }

            let content = fs::read_to_string(path)
                .await
                .context(format!("Failed to read configuration file: {}", path))?;

            config = Self::parse(path, &content)
                .context(format!("Failed to parse configuration file: {}", path))?;
        } else {
            info!("No configuration file specified, using defaults");
        }

        config.validate()?;

        Ok(config)
    }

    fn parse(path: &str, content: &str) -> std::result::Result<Self, ConfigError> {
        let is_toml = Path::new(path)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        if is_toml {
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))
        } else {
            serde_json::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("Server name cannot be empty".to_string()).into());
        }

        if self.pool.capacity == 0 {
            return Err(ConfigError::Invalid("Pool capacity cannot be zero".to_string()).into());
        }

        if self.pool.acquire_timeout_ms == Some(0) {
            warn!("Acquire timeout of 0ms rejects every request that has to wait");
        }

        if self.events.channel_buffer_size == 0 {
            return Err(
                ConfigError::Invalid("Event channel buffer size cannot be zero".to_string()).into(),
            );
        }

        if self.shutdown_timeout == 0 {
            return Err(ConfigError::Invalid("Shutdown timeout cannot be zero".to_string()).into());
        }

        if let Err(e) = self.logging.log_level() {
            return Err(ConfigError::Invalid(e).into());
        }

        Ok(())
    }

    /// Merge with another configuration
    pub fn merge(&mut self, other: ServerConfig) {
        if !other.name.is_empty() && other.name != default_name() {
            self.name = other.name;
        }

        if !other.host.is_empty() && other.host != default_host() {
            self.host = other.host;
        }

        if other.port != default_port() {
            self.port = other.port;
        }

        if other.pool.capacity > 0 && other.pool.capacity != default_capacity() {
            self.pool.capacity = other.pool.capacity;
        }

        if other.pool.acquire_timeout_ms.is_some() {
            self.pool.acquire_timeout_ms = other.pool.acquire_timeout_ms;
        }

        if other.events.channel_buffer_size > 0
            && other.events.channel_buffer_size != default_channel_buffer_size()
        {
            self.events.channel_buffer_size = other.events.channel_buffer_size;
        }

        if other.shutdown_timeout > 0 && other.shutdown_timeout != default_shutdown_timeout() {
            self.shutdown_timeout = other.shutdown_timeout;
        }

        if other.logging.level != LoggingConfig::default().level {
            self.logging.level = other.logging.level;
        }
        self.logging.ansi |= other.logging.ansi;

        for (key, value) in other.extra {
            self.extra.insert(key, value);
        }
    }

    /// The server reference carried by upgraded connections.
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo::new(self.name.clone(), self.host.clone(), self.port)
    }

    /// Shutdown drain timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.shutdown_timeout))
    }
}
