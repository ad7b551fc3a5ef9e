// Copyright (c) 2024 Botho Foundation

//! CLI command implementations.
//!
//! These modules implement the user-facing CLI commands and legitimately
//! use stdout for output.

pub mod init;
pub mod query;
pub mod run;

use crate::config::NodeConfig;
use anyhow::{Context, Result};
use std::path::Path;

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Node id
    pub node_id: Option<String>,
    /// Listen host
    pub host: Option<String>,
    /// Listen port
    pub port: Option<u16>,
    /// Rendezvous `host:port`
    pub bootstrap: Option<String>,
}

impl Overrides {
    /// Apply the overrides to `config`.
    pub fn apply(self, mut config: NodeConfig) -> NodeConfig {
        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bootstrap) = self.bootstrap {
            config.bootstrap = Some(bootstrap);
        }
        config
    }
}

/// Load the config at `path`, or fall back to defaults when no file exists.
pub fn load_or_default(path: &Path) -> Result<NodeConfig> {
    if path.exists() {
        NodeConfig::load(path)
            .context("Config file is invalid. Fix it or run 'overlay-node init' again.")
    } else {
        Ok(NodeConfig::default())
    }
}
