//! Fundamental types for the Forge protocol.
//!
//! This crate defines the core types shared across every other crate in the
//! workspace: keys, signatures, addresses, timestamps, blocks and their
//! lightweight summaries, transactions, and online-account attestations.

pub mod address;
pub mod block;
pub mod error;
pub mod keys;
pub mod network;
pub mod online;
pub mod time;
pub mod transaction;

pub use address::Address;
pub use block::{Block, BlockSignature, BlockSummary, ChainTip};
pub use error::ForgeError;
pub use keys::{KeyPair, PrivateKey, PublicKey, Signature};
pub use network::NetworkId;
pub use online::OnlineAccountEntry;
pub use time::Timestamp;
pub use transaction::Transaction;

// Inline hex encoding to avoid adding the `hex` crate as a dependency of types.
pub(crate) mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
