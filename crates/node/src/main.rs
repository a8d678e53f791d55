//! # Blobber Node Entry Point
//!
//! ```text
//! blobber-node --config blobber.toml [--chain-seed chain.json] [--blobber-id auto]
//! ```
//!
//! ## Initialization Flow
//! 1. Parse CLI and load the TOML configuration (defaults when absent)
//! 2. Validate configuration
//! 3. Build the chain collaborator (in-memory, optionally seeded from JSON)
//! 4. Open the metadata database and content store
//! 5. Start the connection sweeper
//! 6. Wait for Ctrl-C, then stop the sweeper

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use blobber_common::config::load_from_file;
use blobber_common::BlobberConfig;
use blobber_node::{BlobberNode, MockChain};

// ════════════════════════════════════════════════════════════════════════════
// CLI CONFIGURATION
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Parser)]
#[command(name = "blobber-node", about = "Blobber allocation commit and read-authorization node")]
struct Cli {
    /// TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON file preloading allocations and pools into the in-memory chain.
    #[arg(long)]
    chain_seed: Option<PathBuf>,

    /// Overrides `blobber_id`; "auto" generates a random id.
    #[arg(long)]
    blobber_id: Option<String>,

    /// Overrides `data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> anyhow::Result<BlobberConfig> {
    let mut config = match &cli.config {
        Some(path) => load_from_file(path)
            .map_err(|e| anyhow!("failed to load config {}: {}", path.display(), e))?,
        None => {
            warn!("no --config given, using defaults");
            BlobberConfig::default()
        }
    };
    if let Some(id) = &cli.blobber_id {
        config.blobber_id = if id == "auto" { Uuid::new_v4().to_string() } else { id.clone() };
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    config.validate().map_err(|e| anyhow!("configuration error: {}", e))?;
    Ok(config)
}

fn load_chain(cli: &Cli) -> anyhow::Result<Arc<MockChain>> {
    warn!("no chain client configured, serving from the in-memory chain");
    let chain = match &cli.chain_seed {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read chain seed {}", path.display()))?;
            MockChain::from_seed_json(&json).with_context(|| format!("invalid chain seed {}", path.display()))?
        }
        None => MockChain::new(),
    };
    Ok(Arc::new(chain))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    info!("═══════════════════════════════════════════════════════════════");
    info!("                      Blobber Node                              ");
    info!("═══════════════════════════════════════════════════════════════");
    info!("Blobber ID:   {}", config.blobber_id);
    info!("Data Dir:     {}", config.data_dir.display());
    info!("Stale After:  {}s", config.connection_stale_secs);
    info!("Sweep Every:  {}s", config.sweep_interval_secs);
    info!("═══════════════════════════════════════════════════════════════");

    let chain = load_chain(&cli)?;
    let node = BlobberNode::open(&config, chain).context("failed to open blobber node")?;

    let sweeper = node.sweeper();
    let sweeper_handle = sweeper.clone().start();

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    sweeper.shutdown();
    if let Err(e) = sweeper_handle.await {
        error!("sweeper task failed: {}", e);
    }
    info!("blobber node stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
