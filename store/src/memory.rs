//! In-memory storage implementation.
//!
//! Backs tests and the dev-network daemon. The staged-write session is
//! modelled as a full copy of the chain: the first staged mutation clones
//! the committed chain, `save` promotes the session copy, `discard` drops
//! it. Chains in tests are short, so the copy is cheap.

use std::collections::HashMap;
use std::sync::RwLock;

use forge_types::{Address, Block, BlockSignature, BlockSummary, KeyPair, PrivateKey, PublicKey,
    Signature, Transaction};

use crate::account::{AccountStore, RewardShare};
use crate::chain::ChainStore;
use crate::pool::TransactionPool;
use crate::StoreError;

/// Minting eligibility record for one account.
#[derive(Clone, Debug)]
struct AccountRecord {
    level: u32,
    can_mint: bool,
}

#[derive(Default)]
struct Inner {
    /// Committed chain, ascending height, `committed[0]` is genesis.
    committed: Vec<Block>,
    /// Staged session view; equals `committed` when clean.
    session: Vec<Block>,
    dirty: bool,

    reward_shares: HashMap<PublicKey, RewardShare>,
    accounts: HashMap<Address, AccountRecord>,
    /// Local minting keys as (public, private bytes).
    minting_keys: Vec<(PublicKey, [u8; 32])>,

    pool: Vec<Transaction>,
}

impl Inner {
    fn chain(&self) -> &Vec<Block> {
        if self.dirty {
            &self.session
        } else {
            &self.committed
        }
    }

    fn chain_mut(&mut self) -> &mut Vec<Block> {
        if !self.dirty {
            self.session = self.committed.clone();
            self.dirty = true;
        }
        &mut self.session
    }

    fn block_at_height(&self, height: u64) -> Option<&Block> {
        let chain = self.chain();
        let first = chain.first()?.height;
        if height < first {
            return None;
        }
        chain.get((height - first) as usize)
    }
}

/// In-memory store implementing [`ChainStore`], [`AccountStore`], and
/// [`TransactionPool`].
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store. Use [`with_genesis`] for a usable chain.
    ///
    /// [`with_genesis`]: MemoryStore::with_genesis
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Create a store with a committed genesis block.
    pub fn with_genesis(genesis: Block) -> Self {
        let store = Self::new();
        {
            let mut inner = store.write();
            inner.committed.push(genesis);
        }
        store
    }

    /// Register a reward-share record.
    pub fn put_reward_share(&self, share: RewardShare) {
        self.write()
            .reward_shares
            .insert(share.share_public_key, share);
    }

    /// Remove a reward-share record (e.g. after cancellation).
    pub fn remove_reward_share(&self, share_public_key: &PublicKey) {
        self.write().reward_shares.remove(share_public_key);
    }

    /// Register an account with a level and minting rights.
    pub fn put_account(&self, address: Address, level: u32, can_mint: bool) {
        self.write()
            .accounts
            .insert(address, AccountRecord { level, can_mint });
    }

    /// Register a local minting key.
    pub fn add_minting_key(&self, public: PublicKey, private: [u8; 32]) {
        self.write().minting_keys.push((public, private));
    }

    /// Remove a local minting key.
    pub fn remove_minting_key(&self, public: &PublicKey) {
        self.write().minting_keys.retain(|(p, _)| p != public);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainStore for MemoryStore {
    fn last_block(&self) -> Result<Block, StoreError> {
        self.read()
            .chain()
            .last()
            .cloned()
            .ok_or_else(|| StoreError::NotFound("chain is empty".into()))
    }

    fn block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError> {
        Ok(self.read().block_at_height(height).cloned())
    }

    fn block_by_signature(
        &self,
        signature: &BlockSignature,
    ) -> Result<Option<Block>, StoreError> {
        let inner = self.read();
        Ok(inner
            .chain()
            .iter()
            .find(|b| &b.signature == signature)
            .cloned())
    }

    fn height_of_signature(
        &self,
        signature: &BlockSignature,
    ) -> Result<Option<u64>, StoreError> {
        let inner = self.read();
        Ok(inner
            .chain()
            .iter()
            .find(|b| &b.signature == signature)
            .map(|b| b.height))
    }

    fn contains(&self, signature: &BlockSignature) -> Result<bool, StoreError> {
        Ok(self.height_of_signature(signature)?.is_some())
    }

    fn block_summaries(
        &self,
        from_height: u64,
        to_height: u64,
    ) -> Result<Vec<BlockSummary>, StoreError> {
        let inner = self.read();
        Ok(inner
            .chain()
            .iter()
            .filter(|b| b.height >= from_height && b.height <= to_height)
            .map(|b| b.summary())
            .collect())
    }

    fn apply_block(&self, block: &Block) -> Result<(), StoreError> {
        let mut inner = self.write();
        let chain = inner.chain_mut();
        match chain.last() {
            Some(tip) => {
                if block.height != tip.height + 1 {
                    return Err(StoreError::Backend(format!(
                        "apply out of order: tip height {}, block height {}",
                        tip.height, block.height
                    )));
                }
                if block.reference != tip.signature {
                    return Err(StoreError::Backend(format!(
                        "apply reference mismatch at height {}",
                        block.height
                    )));
                }
            }
            None => {
                if block.height != 1 {
                    return Err(StoreError::Backend(
                        "first block must have height 1".into(),
                    ));
                }
            }
        }
        chain.push(block.clone());
        Ok(())
    }

    fn orphan_last_block(&self) -> Result<Block, StoreError> {
        let mut inner = self.write();
        let chain = inner.chain_mut();
        if chain.len() <= 1 {
            return Err(StoreError::Backend("cannot orphan genesis".into()));
        }
        Ok(chain.pop().expect("chain checked non-empty"))
    }

    fn save(&self) -> Result<(), StoreError> {
        let mut inner = self.write();
        if inner.dirty {
            inner.committed = inner.session.clone();
            inner.dirty = false;
        }
        Ok(())
    }

    fn discard(&self) -> Result<(), StoreError> {
        let mut inner = self.write();
        inner.session.clear();
        inner.dirty = false;
        Ok(())
    }
}

impl AccountStore for MemoryStore {
    fn reward_share(
        &self,
        share_public_key: &PublicKey,
    ) -> Result<Option<RewardShare>, StoreError> {
        Ok(self.read().reward_shares.get(share_public_key).cloned())
    }

    fn account_level(&self, address: &Address) -> Result<u32, StoreError> {
        Ok(self.read().accounts.get(address).map_or(0, |a| a.level))
    }

    fn can_mint(&self, address: &Address) -> Result<bool, StoreError> {
        Ok(self.read().accounts.get(address).is_some_and(|a| a.can_mint))
    }

    fn minting_accounts(&self) -> Result<Vec<KeyPair>, StoreError> {
        Ok(self
            .read()
            .minting_keys
            .iter()
            .map(|(public, private)| KeyPair {
                public: *public,
                private: PrivateKey(*private),
            })
            .collect())
    }
}

impl TransactionPool for MemoryStore {
    fn unconfirmed_transactions(&self) -> Result<Vec<Transaction>, StoreError> {
        let mut txs = self.read().pool.clone();
        txs.sort_by(|a, b| b.fee.cmp(&a.fee).then(a.timestamp.cmp(&b.timestamp)));
        Ok(txs)
    }

    fn add_transaction(&self, transaction: Transaction) -> Result<(), StoreError> {
        let mut inner = self.write();
        if inner
            .pool
            .iter()
            .any(|t| t.signature == transaction.signature)
        {
            return Err(StoreError::Duplicate("transaction already pooled".into()));
        }
        inner.pool.push(transaction);
        Ok(())
    }

    fn remove_transaction(&self, signature: &Signature) -> Result<(), StoreError> {
        self.write().pool.retain(|t| &t.signature != signature);
        Ok(())
    }
}
