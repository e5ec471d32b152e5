//! Network message content for Forge node-to-node communication.
//!
//! Only message *content* is defined here; framing, transport, and peer
//! authentication are owned by the connection layer. Request variants pair
//! with their response variants (`GetBlockSummaries` → `BlockSummaries`,
//! and so on); `ChainTipAnnounce` is fire-and-forget.

use serde::{Deserialize, Serialize};

use forge_types::{Block, BlockSignature, BlockSummary, ChainTip, OnlineAccountEntry, PublicKey,
    Timestamp};

/// Upper bound on online-account entries carried by a single message.
pub const MAX_ONLINE_ACCOUNTS_PER_MESSAGE: usize = 1000;

/// All consensus-relevant messages exchanged between nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// A node's current chain tip claim. Sent after minting or
    /// synchronizing, and as the reply to an inferior-chain peer.
    ChainTipAnnounce(ChainTip),

    /// Request up to `count` block summaries for the blocks *after* the
    /// given parent signature.
    GetBlockSummaries {
        parent_signature: BlockSignature,
        count: u32,
    },
    /// Ordered block summaries, ascending height. Empty when the parent
    /// signature is unknown or has no descendants.
    BlockSummaries { summaries: Vec<BlockSummary> },

    /// Request up to `count` block signatures after the given parent.
    GetSignatures {
        parent_signature: BlockSignature,
        count: u32,
    },
    /// Ordered block signatures, ascending height.
    Signatures { signatures: Vec<BlockSignature> },

    /// Request a full block by signature.
    GetBlock { signature: BlockSignature },
    /// The requested block, or `None` if unknown.
    BlockResponse { block: Option<Block> },

    /// Request online-account entries, excluding (timestamp, key) pairs the
    /// requester already holds.
    GetOnlineAccounts {
        known: Vec<(Timestamp, PublicKey)>,
    },
    /// Online-account entries, capped at
    /// [`MAX_ONLINE_ACCOUNTS_PER_MESSAGE`].
    OnlineAccounts { entries: Vec<OnlineAccountEntry> },
}

impl Message {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChainTipAnnounce(_) => "chain_tip_announce",
            Self::GetBlockSummaries { .. } => "get_block_summaries",
            Self::BlockSummaries { .. } => "block_summaries",
            Self::GetSignatures { .. } => "get_signatures",
            Self::Signatures { .. } => "signatures",
            Self::GetBlock { .. } => "get_block",
            Self::BlockResponse { .. } => "block_response",
            Self::GetOnlineAccounts { .. } => "get_online_accounts",
            Self::OnlineAccounts { .. } => "online_accounts",
        }
    }
}
