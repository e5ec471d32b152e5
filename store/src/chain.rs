//! Chain storage trait.

use forge_types::{Block, BlockSignature, BlockSummary};

use crate::StoreError;

/// Trait for chain storage operations.
///
/// Writes are staged: [`apply_block`] and [`orphan_last_block`] mutate a
/// session view that readers of the same handle observe, but nothing is
/// durable until [`save`]. [`discard`] drops staged work. The synchronizer
/// and minter commit per block, so the staged window stays shallow.
///
/// [`apply_block`]: ChainStore::apply_block
/// [`orphan_last_block`]: ChainStore::orphan_last_block
/// [`save`]: ChainStore::save
/// [`discard`]: ChainStore::discard
pub trait ChainStore: Send + Sync {
    /// The current chain tip.
    fn last_block(&self) -> Result<Block, StoreError>;

    /// Look up a block by height.
    fn block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError>;

    /// Look up a block by its signature.
    fn block_by_signature(&self, signature: &BlockSignature)
        -> Result<Option<Block>, StoreError>;

    /// Height of the block with the given signature, if present.
    fn height_of_signature(&self, signature: &BlockSignature)
        -> Result<Option<u64>, StoreError>;

    /// Whether a block with this signature is on the local chain.
    fn contains(&self, signature: &BlockSignature) -> Result<bool, StoreError>;

    /// Block summaries for the inclusive height range `from..=to`, in
    /// ascending height order. Heights outside the chain are skipped.
    fn block_summaries(&self, from_height: u64, to_height: u64)
        -> Result<Vec<BlockSummary>, StoreError>;

    /// Append a block to the chain tip (staged).
    ///
    /// The block's height must be exactly one above the current tip and its
    /// reference must match the tip's signature.
    fn apply_block(&self, block: &Block) -> Result<(), StoreError>;

    /// Revert the chain tip (staged), returning the removed block.
    ///
    /// The genesis block cannot be orphaned.
    fn orphan_last_block(&self) -> Result<Block, StoreError>;

    /// Commit staged changes.
    fn save(&self) -> Result<(), StoreError>;

    /// Drop staged changes, restoring the last committed state.
    fn discard(&self) -> Result<(), StoreError>;
}
