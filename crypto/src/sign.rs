//! Ed25519 message signing and verification.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use forge_types::{BlockSignature, PrivateKey, PublicKey, Signature};

/// Sign a message with a private key, returning the signature.
pub fn sign_message(message: &[u8], private_key: &PrivateKey) -> Signature {
    let signing_key = SigningKey::from_bytes(&private_key.0);
    Signature(signing_key.sign(message).to_bytes())
}

/// Verify a signature against a message and public key.
///
/// Returns `true` if the signature is valid, `false` otherwise.
pub fn verify_signature(message: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
    verify_bytes(message, &signature.0, public_key)
}

/// Sign block signable bytes, producing the block's identity signature.
pub fn sign_block(signable_bytes: &[u8], private_key: &PrivateKey) -> BlockSignature {
    let signing_key = SigningKey::from_bytes(&private_key.0);
    BlockSignature(signing_key.sign(signable_bytes).to_bytes())
}

/// Verify a block signature against the block's signable bytes and the
/// minter public key.
pub fn verify_block_signature(
    signable_bytes: &[u8],
    signature: &BlockSignature,
    minter_public_key: &PublicKey,
) -> bool {
    verify_bytes(signable_bytes, &signature.0, minter_public_key)
}

fn verify_bytes(message: &[u8], signature: &[u8; 64], public_key: &PublicKey) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key.0) else {
        return false;
    };
    let dalek_sig = ed25519_dalek::Signature::from_bytes(signature);
    verifying_key.verify(message, &dalek_sig).is_ok()
}
