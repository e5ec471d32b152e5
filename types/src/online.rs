//! Online-account attestation entry.

use serde::{Deserialize, Serialize};

use crate::keys::{PublicKey, Signature};
use crate::time::Timestamp;

/// A timestamp-bucketed attestation that a minting key is currently online.
///
/// The signature covers the big-endian bytes of the bucketed timestamp.
/// At most one live entry exists per public key; a newer bucket replaces
/// an older one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineAccountEntry {
    pub timestamp: Timestamp,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl OnlineAccountEntry {
    /// The bytes the attestation signature covers.
    pub fn signable_bytes(timestamp: Timestamp) -> [u8; 8] {
        timestamp.as_secs().to_be_bytes()
    }
}
