//! Cryptographic primitives for the Forge protocol.
//!
//! - **Ed25519** for block/transaction/attestation signing and verification
//! - **SHA-256** for the fork-choice key-distance digests
//! - **Blake2b** for transaction digests and address derivation
//! - Address derivation with `fg_` prefix and hex encoding

pub mod address;
pub mod hash;
pub mod keys;
pub mod sign;

pub use address::derive_address;
pub use hash::{blake2b_256, sha256, sha256_multi};
pub use keys::{generate_keypair, keypair_from_private, keypair_from_seed, public_from_private};
pub use sign::{sign_block, sign_message, verify_block_signature, verify_signature};
