// Copyright (c) 2024 Botho Foundation

use anyhow::{Context, Result};
use std::path::Path;

use super::{load_or_default, Overrides};
use crate::{config::parse_endpoint, gossip::GossipResponse, node::Node};

/// Run the query command: print the gossip response of the node at `target`.
pub fn run(config_path: &Path, overrides: Overrides, target: &str) -> Result<()> {
    let (host, port) = parse_endpoint(target)
        .with_context(|| format!("Invalid node address {target:?}, expected host:port"))?;

    let mut config = overrides.apply(load_or_default(config_path)?);
    // Ask from an ephemeral node that does not join anything.
    config.port = 0;
    config.bootstrap = None;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let node = Node::new(config).await?;
        node.start().await?;
        let response = node.query(&host, port).await;
        node.shutdown().await;

        match response.with_context(|| format!("Query to {target} failed"))? {
            GossipResponse::Announcement(addr) => {
                println!("{target} knows no peers yet; it announced {}:{}", addr.host, addr.port);
            }
            GossipResponse::PeerList(peers) => {
                println!("=== {} peers shared by {target} ===", peers.len());
                for peer in peers {
                    println!("  - {peer}");
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}
