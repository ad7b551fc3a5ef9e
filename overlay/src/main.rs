// Copyright (c) 2024 Botho Foundation

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bth_overlay::{
    commands::{self, Overrides},
    config,
};

#[derive(Parser)]
#[command(name = "overlay-node")]
#[command(about = "Minimal peer-to-peer overlay node", long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.overlay/config.toml)
    #[arg(short, long, global = true, env = "OVERLAY_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Node id (overrides the config file)
    #[arg(long, global = true)]
    id: Option<String>,

    /// Host to listen on (overrides the config file)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to listen on, 0 for any (overrides the config file)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Rendezvous node to join through, as host:port
    #[arg(long, global = true)]
    bootstrap: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file with default settings
    Init,

    /// Run the node, broadcasting every line typed on stdin
    Run,

    /// Print the peers a node would share with us
    Query {
        /// Address of the node to ask, as host:port
        target: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose when set
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(config::default_config_path);

    let overrides = Overrides {
        node_id: cli.id,
        host: cli.host,
        port: cli.port,
        bootstrap: cli.bootstrap,
    };

    match cli.command {
        Commands::Init => commands::init::run(&config_path, overrides),
        Commands::Run => commands::run::run(&config_path, overrides),
        Commands::Query { target } => commands::query::run(&config_path, overrides, &target),
    }
}
