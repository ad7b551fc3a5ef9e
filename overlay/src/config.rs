// Copyright (c) 2024 Botho Foundation

//! Configuration for an overlay node.

use crate::{
    codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PREFIX_WIDTH},
    error::NodeError,
};
use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Default port for overlay connections.
pub const DEFAULT_PORT: u16 = 5050;

/// Default number of dial attempts per peer during bootstrap.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Configuration for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identifier of this node on the overlay
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Host to bind the listener on
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on (0 picks a free port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host other nodes should use to reach us, if different from `host`
    /// (e.g. when binding 0.0.0.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertised_host: Option<String>,

    /// Rendezvous node to join through, as `host:port`.
    /// Without one the node starts a new network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<String>,

    /// Width of the frame length header in bytes
    #[serde(default = "default_prefix_width")]
    pub prefix_width: usize,

    /// Maximum frame body size in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Dial attempts per peer during bootstrap
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Pause between dial attempts (milliseconds)
    #[serde(default)]
    pub retry_delay_ms: u64,

    /// Timeout for opening a connection (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for reading or writing a frame (milliseconds)
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// How long shutdown waits for in-flight handlers (milliseconds)
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Maximum number of inbound connections handled at once
    #[serde(default = "default_max_inbound_connections")]
    pub max_inbound_connections: usize,

    /// Remove a peer from the registry when sending to it fails
    #[serde(default = "default_true")]
    pub evict_unreachable_peers: bool,
}

fn default_node_id() -> String {
    format!("node-{:08x}", rand::thread_rng().gen::<u32>())
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_prefix_width() -> usize {
    DEFAULT_PREFIX_WIDTH
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_retry_count() -> u32 {
    DEFAULT_RETRY_COUNT
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_io_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_max_inbound_connections() -> usize {
    // MAX_CONNECTIONS backlog of the first deployments
    128
}

fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            host: default_host(),
            port: default_port(),
            advertised_host: None,
            bootstrap: None,
            prefix_width: default_prefix_width(),
            max_frame_size: default_max_frame_size(),
            retry_count: default_retry_count(),
            retry_delay_ms: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_inbound_connections: default_max_inbound_connections(),
            evict_unreachable_peers: true,
        }
    }
}

impl NodeConfig {
    /// Create a config for `node_id` listening on `host:port`.
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Join through the rendezvous node at `addr` (`host:port`).
    pub fn with_bootstrap(mut self, addr: impl Into<String>) -> Self {
        self.bootstrap = Some(addr.into());
        self
    }

    /// Host advertised to other nodes.
    pub fn advertised_host(&self) -> &str {
        self.advertised_host.as_deref().unwrap_or(&self.host)
    }

    /// `host:port` to bind the listener on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The rendezvous endpoint, if one is configured.
    pub fn bootstrap_endpoint(&self) -> Result<Option<(String, u16)>, NodeError> {
        self.bootstrap
            .as_deref()
            .map(|addr| {
                parse_endpoint(addr)
                    .ok_or_else(|| NodeError::Config(format!("invalid bootstrap address {addr:?}")))
            })
            .transpose()
    }

    /// Codec matching the configured framing.
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.prefix_width, self.max_frame_size)
    }

    /// Pause between dial attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Timeout for opening a connection.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Timeout for reading or writing a frame.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// How long shutdown waits for in-flight handlers.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Check the config for values the node cannot run with.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.node_id.trim().is_empty() {
            return Err(NodeError::Config("node_id must not be empty".into()));
        }
        if self.retry_count == 0 {
            return Err(NodeError::Config("retry_count must be at least 1".into()));
        }
        if self.max_inbound_connections == 0 {
            return Err(NodeError::Config(
                "max_inbound_connections must be at least 1".into(),
            ));
        }
        if self.prefix_width == 0 {
            return Err(NodeError::Config("prefix_width must be at least 1".into()));
        }
        if self.max_frame_size.to_string().len() > self.prefix_width {
            return Err(NodeError::Config(format!(
                "prefix_width {} cannot hold max_frame_size {}",
                self.prefix_width, self.max_frame_size
            )));
        }
        self.bootstrap_endpoint()?;
        Ok(())
    }

    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Save config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

/// Parse `host:port`. IPv6 hosts may be bracketed (`[::1]:5050`).
pub fn parse_endpoint(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.trim().rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

/// Default data directory (`~/.overlay`).
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".overlay")
}

/// Default config file path.
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

/// Builder for [`NodeConfig`].
#[derive(Debug, Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node id.
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.config.node_id = id.into();
        self
    }

    /// Set the listen host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the listen port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the advertised host.
    pub fn advertised_host(mut self, host: impl Into<String>) -> Self {
        self.config.advertised_host = Some(host.into());
        self
    }

    /// Set the rendezvous address.
    pub fn bootstrap(mut self, addr: impl Into<String>) -> Self {
        self.config.bootstrap = Some(addr.into());
        self
    }

    /// Set the frame length header width.
    pub fn prefix_width(mut self, width: usize) -> Self {
        self.config.prefix_width = width;
        self
    }

    /// Set the maximum frame body size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the dial attempts per peer during bootstrap.
    pub fn retry_count(mut self, count: u32) -> Self {
        self.config.retry_count = count;
        self
    }

    /// Set the pause between dial attempts.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the frame I/O timeout.
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.config.io_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the shutdown grace period.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Set the inbound connection limit.
    pub fn max_inbound_connections(mut self, max: usize) -> Self {
        self.config.max_inbound_connections = max;
        self
    }

    /// Enable or disable eviction of peers that cannot be reached.
    pub fn evict_unreachable_peers(mut self, evict: bool) -> Self {
        self.config.evict_unreachable_peers = evict;
        self
    }

    /// Build the config.
    pub fn build(self) -> NodeConfig {
        self.config
    }
}
