#![forbid(unsafe_code)]
//! Validator node for EpochChain.
//!
//! Runs one validator, or with `--local-validators N` an in-process cluster
//! of N validators connected through the local network hub.

use clap::Parser;
use epochchain::config::{load_config, Allocation, NodeConfig};
use epochchain::crypto::{address_to_hex, KeyPair};
use epochchain::network::{LocalNetwork, PeerId};
use epochchain::node::{Node, NodeHandle};
use epochchain::persistence::{Database, InMemoryStore, Store};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "epochchain.toml")]
    config: String,
    /// Hex secret key of the validator identity; ephemeral when omitted
    #[arg(long)]
    identity_key: Option<String>,
    /// Hex secret key used for commitment proofs; ephemeral when omitted
    #[arg(long)]
    commitment_key: Option<String>,
    /// Act as the bootstrap node regardless of the configuration
    #[arg(long)]
    bootstrap: bool,
    /// Keep everything in memory instead of the configured database
    #[arg(long)]
    in_memory: bool,
    /// Start this many validators in one process
    #[arg(long, default_value_t = 1)]
    local_validators: usize,
}

fn key_or_generate(hex: Option<&str>, role: &str) -> Result<KeyPair, Box<dyn std::error::Error>> {
    match hex {
        Some(hex) => Ok(KeyPair::from_secret_hex(hex)?),
        None => {
            let key = KeyPair::generate();
            warn!(role, address = %address_to_hex(&key.address()), "Using an ephemeral key");
            Ok(key)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if cli.bootstrap {
        config.node.bootstrap = true;
    }

    let identity = key_or_generate(cli.identity_key.as_deref(), "identity")?;
    let commitment = key_or_generate(cli.commitment_key.as_deref(), "commitment")?;
    let mut validators = vec![(identity, commitment)];
    for _ in 1..cli.local_validators.max(1) {
        validators.push((KeyPair::generate(), KeyPair::generate()));
    }

    if validators.len() > 1 {
        config.node.bootstrap = true;
        for (identity, commitment) in validators.iter().skip(1) {
            config.genesis.allocations.push(Allocation {
                address: address_to_hex(&identity.address()),
                balance: config.consensus.staking_minimum,
                commitment_key: Some(address_to_hex(&commitment.address())),
            });
        }
    }
    config.validate()?;

    let network = LocalNetwork::new();
    let mut handles: Vec<NodeHandle> = Vec::new();
    for (index, (identity, commitment)) in validators.into_iter().enumerate() {
        let mut node_config: NodeConfig = config.clone();
        node_config.node.bootstrap = index == 0 && config.node.bootstrap;
        let store: Arc<dyn Store> = if cli.in_memory || index > 0 {
            Arc::new(InMemoryStore::new())
        } else {
            let path = Path::new(&node_config.node.database_path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            Arc::new(Database::open(&node_config.node.database_path)?)
        };
        let (transport, inbox) = network.join(PeerId(identity.address()));
        let node = Node::new(node_config, store, transport, inbox);
        let handle = node.start(identity, commitment).await?;
        handles.push(handle);
    }
    info!(validators = handles.len(), "Validators running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    for handle in handles {
        let ctx = Arc::clone(handle.context());
        info!(
            address = %address_to_hex(&ctx.address()),
            shard = ctx.shard_id(),
            height = ctx.head().height,
            "Stopping validator"
        );
        handle.shutdown().await;
    }
    Ok(())
}
