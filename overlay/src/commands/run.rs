// Copyright (c) 2024 Botho Foundation

use anyhow::{Context, Result};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use super::{load_or_default, Overrides};
use crate::{config::NodeConfig, event::NodeEvent, node::Node};

/// How often the main loop checks for Ctrl+C.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run the node until Ctrl+C. Every line read from stdin is broadcast to all
/// known peers.
pub fn run(config_path: &Path, overrides: Overrides) -> Result<()> {
    let config = overrides.apply(load_or_default(config_path)?);

    println!("Overlay node starting. Type a line to broadcast it, Ctrl+C to stop.");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async { run_async(config).await })
}

async fn run_async(config: NodeConfig) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::SeqCst);
    })?;

    let node = Node::new(config).await.context("Failed to create node")?;
    let mut events = node.subscribe();

    if let Some(report) = node.start().await.context("Failed to join network")? {
        println!(
            "Joined network: {} peers learned, {} reachable",
            report.learned.len(),
            report.connected.len()
        );
    }
    println!("Listening as {}", node.address());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    while !shutdown.load(Ordering::SeqCst) {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    let report = node.broadcast(line).await?;
                    println!(
                        "Sent to {} peers ({} failed)",
                        report.delivered.len(),
                        report.failed.len()
                    );
                }
                Ok(Some(_)) => {}
                Ok(None) => stdin_open = false,
                Err(err) => {
                    warn!(error = %err, "Reading stdin failed");
                    stdin_open = false;
                }
            },
            event = events.recv() => match event {
                Ok(NodeEvent::PeerAdded(peer)) => println!("+ {peer}"),
                Ok(NodeEvent::PeerRemoved(peer)) => println!("- {peer}"),
                Ok(NodeEvent::DataReceived { sender, body }) => println!("[{}] {body}", sender.id),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "Missed node events"),
            },
            _ = tokio::time::sleep(SHUTDOWN_POLL_INTERVAL) => {}
        }
    }

    info!("Shutting down...");
    node.shutdown().await;
    Ok(())
}
