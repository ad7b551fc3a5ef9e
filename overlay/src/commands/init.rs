// Copyright (c) 2024 Botho Foundation

use anyhow::{bail, Result};
use std::path::Path;
use tracing::info;

use super::Overrides;
use crate::config::NodeConfig;

/// Run the init command: write a config file with defaults and overrides.
pub fn run(config_path: &Path, overrides: Overrides) -> Result<()> {
    if config_path.exists() {
        bail!(
            "Config already exists at {}\n\
             Use a different --config path or delete the existing config.",
            config_path.display()
        );
    }

    let config = overrides.apply(NodeConfig::default());
    config.validate()?;
    config.save(config_path)?;

    info!("Node initialized at {}", config_path.display());
    println!("Node id:   {}", config.node_id);
    println!("Listen:    {}", config.listen_addr());
    match &config.bootstrap {
        Some(bootstrap) => println!("Joins via: {bootstrap}"),
        None => println!("Joins via: (none, starts a new network)"),
    }
    println!("Config saved to: {}", config_path.display());
    println!("\nNext steps:");
    println!("  1. Run 'overlay-node run' to start the node");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_config_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let overrides = Overrides {
            node_id: Some("fresh".into()),
            port: Some(7100),
            ..Default::default()
        };

        run(&path, overrides.clone()).unwrap();
        let saved = NodeConfig::load(&path).unwrap();
        assert_eq!(saved.node_id, "fresh");
        assert_eq!(saved.port, 7100);

        assert!(run(&path, overrides).is_err());
    }
}
