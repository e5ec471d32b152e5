//! Abstract storage traits for the Forge protocol.
//!
//! The consensus engine treats persistence as an external collaborator.
//! This crate defines the trait seams it consumes:
//!
//! - [`ChainStore`] — block lookup, ranged summaries, apply/orphan
//!   primitives, and the staged save/discard transactional boundary.
//! - [`AccountStore`] — reward-share indirection, account minting
//!   eligibility, and the node's local minting keys.
//! - [`TransactionPool`] — unconfirmed transaction queries.
//!
//! [`MemoryStore`] implements all three in memory; it backs tests and the
//! dev-network daemon.

pub mod account;
pub mod chain;
pub mod error;
pub mod memory;
pub mod pool;

pub use account::{effective_minter_level, AccountStore, RewardShare};
pub use chain::ChainStore;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use pool::TransactionPool;
