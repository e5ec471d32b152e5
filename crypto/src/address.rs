//! Account address derivation from public keys.
//!
//! Address format: `fg_` + hex(first 20 bytes of Blake2b-256(public_key)).

use forge_types::{Address, PublicKey};

use crate::hash::blake2b_256;

/// Number of digest bytes carried in an address (160 bits).
const ADDRESS_BYTES: usize = 20;

/// Derive the account address for a public key.
pub fn derive_address(public_key: &PublicKey) -> Address {
    let digest = blake2b_256(&public_key.0);
    let hex: String = digest[..ADDRESS_BYTES]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    Address::new(format!("{}{}", Address::PREFIX, hex))
}
