//! Transaction type.
//!
//! Forge blocks carry opaque transactions: the consensus engine only cares
//! about structural validity (timestamps, deadlines, the per-block cap).
//! Type-specific validation happens in the transaction-processing layer.

use serde::{Deserialize, Serialize};

use crate::keys::{PublicKey, Signature};
use crate::time::Timestamp;

/// An unconfirmed or confirmed transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub signature: Signature,
    pub public_key: PublicKey,
    pub timestamp: Timestamp,
    /// After this instant the transaction can no longer be confirmed.
    pub deadline: Timestamp,
    pub fee: u64,
    pub payload: Vec<u8>,
}

impl Transaction {
    /// Whether this transaction may be included in a block minted at
    /// `block_timestamp`: it must already exist and must not have expired.
    pub fn is_confirmable_at(&self, block_timestamp: Timestamp) -> bool {
        self.timestamp <= block_timestamp && self.deadline > block_timestamp
    }
}
