//! Full block validation.
//!
//! Covers everything the consensus engine checks before committing a block:
//! parent linkage, timestamps, the minter signature, minter eligibility
//! through reward-share indirection, and structural transaction validity.
//! Transaction-type-specific validation belongs to the transaction
//! processing layer and is not performed here.

use thiserror::Error;

use forge_store::{effective_minter_level, AccountStore};
use forge_types::{Block, Timestamp};

/// Tolerated clock drift when checking a block timestamp against `now`.
const MAX_TIMESTAMP_DRIFT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum BlockValidationError {
    #[error("reference does not match parent signature")]
    WrongReference,

    #[error("height {actual} does not follow parent height {parent}")]
    WrongHeight { parent: u64, actual: u64 },

    #[error("timestamp is not after parent timestamp")]
    TimestampNotAfterParent,

    #[error("timestamp is too far in the future")]
    TimestampInFuture,

    #[error("minter signature is invalid")]
    InvalidSignature,

    #[error("minter key does not resolve to an eligible account")]
    IneligibleMinter,

    #[error("transaction not confirmable in this block")]
    UnconfirmableTransaction,

    #[error("too many transactions: {0}")]
    TooManyTransactions(usize),

    #[error("storage error during validation: {0}")]
    Storage(String),
}

/// Verify only the minter signature over the block's signable bytes.
pub fn verify_block_signature(block: &Block) -> bool {
    forge_crypto::verify_block_signature(
        &block.signable_bytes(),
        &block.signature,
        &block.minter_public_key,
    )
}

/// Fully validate `block` as the next block after `parent`.
pub fn validate_block(
    parent: &Block,
    block: &Block,
    accounts: &dyn AccountStore,
    max_transactions: usize,
    now: Timestamp,
) -> Result<(), BlockValidationError> {
    if block.reference != parent.signature {
        return Err(BlockValidationError::WrongReference);
    }
    if block.height != parent.height + 1 {
        return Err(BlockValidationError::WrongHeight {
            parent: parent.height,
            actual: block.height,
        });
    }
    if block.timestamp <= parent.timestamp {
        return Err(BlockValidationError::TimestampNotAfterParent);
    }
    if block.timestamp > now.plus(MAX_TIMESTAMP_DRIFT_SECS) {
        return Err(BlockValidationError::TimestampInFuture);
    }
    if !verify_block_signature(block) {
        return Err(BlockValidationError::InvalidSignature);
    }

    let level = effective_minter_level(accounts, &block.minter_public_key)
        .map_err(|e| BlockValidationError::Storage(e.to_string()))?;
    if level == 0 {
        return Err(BlockValidationError::IneligibleMinter);
    }

    if block.transactions.len() > max_transactions {
        return Err(BlockValidationError::TooManyTransactions(
            block.transactions.len(),
        ));
    }
    for tx in &block.transactions {
        if !tx.is_confirmable_at(block.timestamp) {
            return Err(BlockValidationError::UnconfirmableTransaction);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_crypto::{derive_address, generate_keypair, sign_block};
    use forge_store::{MemoryStore, RewardShare};
    use forge_types::{BlockSignature, KeyPair, PublicKey};

    fn eligible_store(keypair: &KeyPair) -> MemoryStore {
        let store = MemoryStore::new();
        let minter = derive_address(&keypair.public);
        store.put_reward_share(RewardShare {
            share_public_key: keypair.public,
            minter: minter.clone(),
            recipient: minter.clone(),
            share_percent: 0,
        });
        store.put_account(minter, 3, true);
        store
    }

    fn parent() -> Block {
        Block {
            height: 4,
            signature: BlockSignature([4u8; 64]),
            reference: BlockSignature([3u8; 64]),
            minter_public_key: PublicKey([1u8; 32]),
            timestamp: Timestamp::new(1000),
            online_accounts_count: 1,
            transactions: vec![],
        }
    }

    fn signed_child(keypair: &KeyPair, parent: &Block) -> Block {
        let mut block = Block {
            height: parent.height + 1,
            signature: BlockSignature::ZERO,
            reference: parent.signature,
            minter_public_key: keypair.public,
            timestamp: parent.timestamp.plus(60),
            online_accounts_count: 1,
            transactions: vec![],
        };
        block.signature = sign_block(&block.signable_bytes(), &keypair.private);
        block
    }

    #[test]
    fn valid_block_passes() {
        let kp = generate_keypair();
        let store = eligible_store(&kp);
        let parent = parent();
        let block = signed_child(&kp, &parent);
        let now = block.timestamp;
        assert!(validate_block(&parent, &block, &store, 10, now).is_ok());
    }

    #[test]
    fn wrong_reference_rejected() {
        let kp = generate_keypair();
        let store = eligible_store(&kp);
        let parent = parent();
        let mut block = signed_child(&kp, &parent);
        block.reference = BlockSignature([0xEE; 64]);
        block.signature = sign_block(&block.signable_bytes(), &kp.private);
        assert!(matches!(
            validate_block(&parent, &block, &store, 10, block.timestamp),
            Err(BlockValidationError::WrongReference)
        ));
    }

    #[test]
    fn tampered_signature_rejected() {
        let kp = generate_keypair();
        let store = eligible_store(&kp);
        let parent = parent();
        let mut block = signed_child(&kp, &parent);
        block.online_accounts_count += 1;
        assert!(matches!(
            validate_block(&parent, &block, &store, 10, block.timestamp),
            Err(BlockValidationError::InvalidSignature)
        ));
    }

    #[test]
    fn ineligible_minter_rejected() {
        let kp = generate_keypair();
        let store = MemoryStore::new(); // no reward-share registered
        let parent = parent();
        let block = signed_child(&kp, &parent);
        assert!(matches!(
            validate_block(&parent, &block, &store, 10, block.timestamp),
            Err(BlockValidationError::IneligibleMinter)
        ));
    }

    #[test]
    fn future_timestamp_rejected() {
        let kp = generate_keypair();
        let store = eligible_store(&kp);
        let parent = parent();
        let block = signed_child(&kp, &parent);
        let now = parent.timestamp; // block is 60s ahead, drift allows 30s
        assert!(matches!(
            validate_block(&parent, &block, &store, 10, now),
            Err(BlockValidationError::TimestampInFuture)
        ));
    }
}
