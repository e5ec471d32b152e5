//! Block, block summary, and chain tip types.
//!
//! A block's identity is its minter signature over the deterministic
//! signable bytes. There is no separate block hash: fork-choice, storage
//! lookups, and wire requests all key on the 64-byte signature.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::keys::{PublicKey, SigVisitor};
use crate::time::Timestamp;
use crate::transaction::Transaction;

type Blake2b256 = Blake2b<U32>;

/// A 64-byte block signature — the block's identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockSignature(pub [u8; 64]);

impl BlockSignature {
    /// The all-zero signature, used as the genesis block's reference.
    pub const ZERO: Self = Self([0u8; 64]);

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 64]
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        crate::hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for BlockSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockSignature({})", self.short())
    }
}

impl fmt::Display for BlockSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl Serialize for BlockSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for BlockSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(SigVisitor).map(BlockSignature)
    }
}

/// A full block.
///
/// `reference` is the parent block's signature; height strictly increases
/// by one along a chain. `online_accounts_count` is the number of
/// online-account attestations the minter witnessed when building the
/// block — it feeds the block's fork-choice weight.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub signature: BlockSignature,
    pub reference: BlockSignature,
    pub minter_public_key: PublicKey,
    pub timestamp: Timestamp,
    pub online_accounts_count: u32,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Deterministic bytes covered by the block signature.
    ///
    /// Layout: reference ‖ minter public key ‖ height (BE) ‖ timestamp (BE)
    /// ‖ online accounts count (BE) ‖ transactions digest.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64 + 32 + 8 + 8 + 4 + 32);
        bytes.extend_from_slice(&self.reference.0);
        bytes.extend_from_slice(&self.minter_public_key.0);
        bytes.extend_from_slice(&self.height.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp.as_secs().to_be_bytes());
        bytes.extend_from_slice(&self.online_accounts_count.to_be_bytes());
        bytes.extend_from_slice(&self.transactions_digest());
        bytes
    }

    /// Blake2b-256 digest over the attached transaction signatures, in
    /// block order. All-zero for an empty block.
    pub fn transactions_digest(&self) -> [u8; 32] {
        if self.transactions.is_empty() {
            return [0u8; 32];
        }
        let mut hasher = Blake2b256::new();
        for tx in &self.transactions {
            hasher.update(tx.signature.as_bytes());
        }
        let result = hasher.finalize();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        output
    }

    /// Lightweight fork-choice view of this block. The minter level is not
    /// carried by blocks and starts at zero; callers populate it through
    /// reward-share resolution.
    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            height: self.height,
            signature: self.signature,
            minter_public_key: self.minter_public_key,
            minter_level: 0,
        }
    }

    /// Chain-tip claim for this block.
    pub fn chain_tip(&self) -> ChainTip {
        ChainTip {
            height: self.height,
            signature: self.signature,
            timestamp: self.timestamp,
            minter_public_key: self.minter_public_key,
        }
    }
}

/// Lightweight fork-choice unit: enough of a block to weigh it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub height: u64,
    pub signature: BlockSignature,
    pub minter_public_key: PublicKey,
    /// Effective minting level of the key's underlying account, resolved
    /// through reward-share indirection. Zero until populated.
    pub minter_level: u32,
}

/// A peer's (or our own) claimed chain tip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub height: u64,
    pub signature: BlockSignature,
    pub timestamp: Timestamp,
    pub minter_public_key: PublicKey,
}
