//! Account storage trait and reward-share indirection.

use forge_types::{Address, KeyPair, PublicKey};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// A reward-share record: maps a share public key (the key blocks are
/// minted with) to the underlying minting account and the reward-split
/// recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardShare {
    pub share_public_key: PublicKey,
    pub minter: Address,
    pub recipient: Address,
    /// Recipient's share of the block reward, in percent (0..=100).
    pub share_percent: u8,
}

/// Trait for account storage operations.
pub trait AccountStore: Send + Sync {
    /// Look up a reward-share by its share public key.
    fn reward_share(&self, share_public_key: &PublicKey)
        -> Result<Option<RewardShare>, StoreError>;

    /// Effective level of an account (0 for unknown accounts).
    fn account_level(&self, address: &Address) -> Result<u32, StoreError>;

    /// Whether an account currently holds minting rights.
    fn can_mint(&self, address: &Address) -> Result<bool, StoreError>;

    /// The node's local minting keys (reward-share key pairs).
    fn minting_accounts(&self) -> Result<Vec<KeyPair>, StoreError>;
}

/// Resolve a share public key to the effective minting level of its
/// underlying account.
///
/// Returns 0 when the reward-share does not exist or the underlying
/// account has lost minting rights.
pub fn effective_minter_level(
    accounts: &dyn AccountStore,
    share_public_key: &PublicKey,
) -> Result<u32, StoreError> {
    match accounts.reward_share(share_public_key)? {
        Some(share) if accounts.can_mint(&share.minter)? => {
            accounts.account_level(&share.minter)
        }
        _ => Ok(0),
    }
}
