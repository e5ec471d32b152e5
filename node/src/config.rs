//! Node configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use forge_types::NetworkId;

use crate::NodeError;

/// Configuration for a Forge node.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Which network to connect to.
    #[serde(default = "default_network")]
    pub network: NetworkId,

    /// Lightweight/read-only node: follows the chain but never mints.
    #[serde(default)]
    pub lite: bool,

    /// Permissive single-node test configuration: mint without peers and
    /// without the back-to-back self-minting restriction.
    #[serde(default)]
    pub single_node_testnet: bool,

    /// Maximum number of peer connections.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Minimum up-to-date peers required before minting a block.
    #[serde(default = "default_min_peers_for_minting")]
    pub min_peers_for_minting: usize,

    /// Per-block cap on attached transactions.
    #[serde(default = "default_max_transactions_per_block")]
    pub max_transactions_per_block: usize,

    /// Keys resolving below this effective level are not used to build
    /// block candidates.
    #[serde(default = "default_min_level_for_block_submissions")]
    pub min_level_for_block_submissions: u32,

    /// Target spacing between blocks, in seconds.
    #[serde(default = "default_target_block_interval_secs")]
    pub target_block_interval_secs: u64,

    /// A chain tip older than this is considered stale: the node prefers
    /// synchronizing over minting, and ditches its own fork during weight
    /// comparison.
    #[serde(default = "default_stale_tip_threshold_secs")]
    pub stale_tip_threshold_secs: u64,

    /// Per-request timeout for peer exchanges, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Pause between synchronization rounds, in seconds.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Pause between minting rounds, in milliseconds.
    #[serde(default = "default_mint_interval_millis")]
    pub mint_interval_millis: u64,

    /// How long the synchronizer waits for the blockchain lock, in seconds.
    #[serde(default = "default_sync_lock_timeout_secs")]
    pub sync_lock_timeout_secs: u64,

    /// How long the minter waits for the blockchain lock, in seconds.
    #[serde(default = "default_mint_lock_timeout_secs")]
    pub mint_lock_timeout_secs: u64,

    /// Maximum height delta between our tip and a common block before the
    /// peer is considered too divergent to sync with.
    #[serde(default = "default_max_common_divergence")]
    pub max_common_divergence: u64,

    /// Initial backward step of the common-block probe.
    #[serde(default = "default_initial_probe_step")]
    pub initial_probe_step: u64,

    /// Cap on the (doubling) common-block probe step.
    #[serde(default = "default_max_probe_step")]
    pub max_probe_step: u64,

    /// Maximum summaries/signatures requested from a peer in one message.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: u32,

    /// Maximum blocks applied past the common block in one forward-sync
    /// session.
    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: u64,

    /// Re-request attempts for a block the peer failed to deliver.
    #[serde(default = "default_max_block_retries")]
    pub max_block_retries: u32,

    /// Online-account timestamp bucket width, in seconds.
    #[serde(default = "default_online_timestamp_modulus_secs")]
    pub online_timestamp_modulus_secs: u64,

    /// Interval for online-account self-attestation broadcast and remote
    /// requests, in seconds.
    #[serde(default = "default_online_broadcast_interval_secs")]
    pub online_broadcast_interval_secs: u64,

    /// Interval of the online-account expiry sweep, in seconds.
    #[serde(default = "default_online_expiry_interval_secs")]
    pub online_expiry_interval_secs: u64,

    /// Grace period before committing a candidate despite a more favorable
    /// chain being visible in peers, in seconds.
    #[serde(default = "default_candidate_hold_grace_secs")]
    pub candidate_hold_grace_secs: u64,

    /// Cool-off applied to peers that sent invalid data, in seconds.
    #[serde(default = "default_misbehavior_cooloff_secs")]
    pub misbehavior_cooloff_secs: u64,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_network() -> NetworkId {
    NetworkId::Dev
}

fn default_max_peers() -> usize {
    50
}

fn default_min_peers_for_minting() -> usize {
    3
}

fn default_max_transactions_per_block() -> usize {
    100
}

fn default_min_level_for_block_submissions() -> u32 {
    1
}

fn default_target_block_interval_secs() -> u64 {
    60
}

fn default_stale_tip_threshold_secs() -> u64 {
    // Five target block intervals plus slack.
    450
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_sync_interval_secs() -> u64 {
    2
}

fn default_mint_interval_millis() -> u64 {
    1000
}

fn default_sync_lock_timeout_secs() -> u64 {
    3
}

fn default_mint_lock_timeout_secs() -> u64 {
    30
}

fn default_max_common_divergence() -> u64 {
    240
}

fn default_initial_probe_step() -> u64 {
    8
}

fn default_max_probe_step() -> u64 {
    500
}

fn default_max_request_size() -> u32 {
    200
}

fn default_sync_batch_size() -> u64 {
    1000
}

fn default_max_block_retries() -> u32 {
    3
}

fn default_online_timestamp_modulus_secs() -> u64 {
    300
}

fn default_online_broadcast_interval_secs() -> u64 {
    5
}

fn default_online_expiry_interval_secs() -> u64 {
    10
}

fn default_candidate_hold_grace_secs() -> u64 {
    30
}

fn default_misbehavior_cooloff_secs() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config uses serde defaults")
    }
}

impl NodeConfig {
    /// Load a configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, NodeError> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| NodeError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// A permissive configuration for a single-node test network: fast
    /// minting, no peer requirements.
    pub fn single_node_testnet() -> Self {
        Self {
            single_node_testnet: true,
            min_peers_for_minting: 0,
            mint_interval_millis: 50,
            target_block_interval_secs: 1,
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_lock_timeout_secs)
    }

    pub fn mint_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.mint_lock_timeout_secs)
    }
}
