use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use palisade_chain::config::{LockFile, NodeConfig};
use palisade_chain::crypto::{generate_keypair, save_keypair};
use palisade_chain::node::{Node, NodeContext};
use palisade_chain::rollback;

#[derive(Parser)]
#[command(author, version, about = "Palisade permissioned blockchain node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node using the provided configuration file
    Start {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
    },
    /// Roll the chain back to the given block id (1 = full rewind)
    Rollback {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
        #[arg(long)]
        block_id: u64,
    },
    /// Generate a default node configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/node.toml")]
        path: PathBuf,
    },
    /// Generate a new Ed25519 keypair for the node
    Keygen {
        #[arg(short, long, default_value = "keys/node.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_node(config).await?,
        Commands::Rollback { config, block_id } => rollback_chain(config, block_id)?,
        Commands::GenerateConfig { path } => generate_config(path)?,
        Commands::Keygen { path } => keygen(path)?,
    }

    Ok(())
}

async fn start_node(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        let config = NodeConfig::default();
        config.save(&config_path)?;
        config
    };
    let _lock = LockFile::acquire(&config.lock_file)?;

    let node = Node::new(config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let node_task = tokio::spawn(async move { node.start(shutdown_rx).await });

    signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    node_task.await??;
    Ok(())
}

/// `rollback --block-id N`: exclusive-lock the node directory, bring up
/// storage and the VM, and rewind the chain.
fn rollback_chain(config_path: PathBuf, block_id: u64) -> Result<()> {
    let config = NodeConfig::load(&config_path)?;
    let _lock = LockFile::acquire(&config.lock_file)?;
    let ctx = NodeContext::new(config)?;
    rollback::to_block_id(&ctx.storage, block_id)?;
    if block_id == 1 {
        info!("full rewind finished");
    } else {
        info!(block_id, "rollback finished");
    }
    Ok(())
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = NodeConfig::default();
    config.ensure_directories()?;
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}

fn keygen(path: PathBuf) -> Result<()> {
    let keypair = generate_keypair();
    save_keypair(&path, &keypair)?;
    info!(?path, "generated node keypair");
    Ok(())
}
