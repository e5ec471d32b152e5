//! Forge daemon — entry point for running a Forge node.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use forge_crypto::{keypair_from_seed, sign_block};
use forge_node::{Node, NodeConfig};
use forge_store::{AccountStore, ChainStore, MemoryStore, TransactionPool};
use forge_types::{Block, BlockSignature, NetworkId, Timestamp};

/// Well-known seed for the deterministic genesis keypair (all zeros).
const GENESIS_SEED: [u8; 32] = [0u8; 32];

#[derive(Parser)]
#[command(name = "forge-daemon", about = "Forge protocol node daemon")]
struct Cli {
    /// Network to connect to: "live", "test", or "dev".
    /// When a config file is provided, defaults to the file's network value.
    #[arg(long, env = "FORGE_NETWORK")]
    network: Option<String>,

    /// Run as a lightweight node (no minting).
    #[arg(long, env = "FORGE_LITE")]
    lite: bool,

    /// Permissive single-node test network configuration.
    #[arg(long, env = "FORGE_SINGLE_NODE_TESTNET")]
    single_node_testnet: bool,

    /// Maximum number of peer connections.
    #[arg(long, env = "FORGE_MAX_PEERS")]
    max_peers: Option<usize>,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[arg(long, default_value = "info", env = "FORGE_LOG_LEVEL")]
    log_level: String,

    /// Path to a TOML configuration file. If provided, file settings
    /// are used as the base; CLI flags and env vars override them.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Build the deterministic genesis block.
fn genesis_block() -> Block {
    let keypair = keypair_from_seed(&GENESIS_SEED);
    let mut block = Block {
        height: 1,
        signature: BlockSignature::ZERO,
        reference: BlockSignature::ZERO,
        minter_public_key: keypair.public,
        timestamp: Timestamp::EPOCH,
        online_accounts_count: 0,
        transactions: vec![],
    };
    block.signature = sign_block(&block.signable_bytes(), &keypair.private);
    block
}

fn parse_network(s: &str) -> NetworkId {
    match s.to_lowercase().as_str() {
        "live" => NetworkId::Live,
        "test" => NetworkId::Test,
        _ => NetworkId::Dev,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forge_utils::init_tracing();

    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => {
            let config = NodeConfig::from_toml_file(path)?;
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        None => NodeConfig::default(),
    };

    if let Some(ref network) = cli.network {
        config.network = parse_network(network);
    }
    if let Some(max_peers) = cli.max_peers {
        config.max_peers = max_peers;
    }
    config.lite |= cli.lite;
    config.single_node_testnet |= cli.single_node_testnet;
    config.log_level = cli.log_level;

    // The persistent storage backend is wired in by the packaging layer;
    // the in-memory store backs dev networks and local experiments.
    let store = Arc::new(MemoryStore::with_genesis(genesis_block()));
    let chain: Arc<dyn ChainStore> = store.clone();
    let accounts: Arc<dyn AccountStore> = store.clone();
    let pool: Arc<dyn TransactionPool> = store;

    let mut node = Node::new(
        config,
        chain,
        accounts,
        pool,
    );
    node.start();

    node.shutdown.wait_for_signal().await;
    node.stop().await;

    Ok(())
}
