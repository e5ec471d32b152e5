//! Unconfirmed transaction pool trait.

use forge_types::{Signature, Transaction};

use crate::StoreError;

/// Trait for unconfirmed-transaction pool queries.
///
/// The pool is advisory: the minter pulls candidates from it and removes
/// what it confirms; expiry cleanup is the pool implementation's concern.
pub trait TransactionPool: Send + Sync {
    /// All unconfirmed transactions, sorted by (fee descending, timestamp
    /// ascending).
    fn unconfirmed_transactions(&self) -> Result<Vec<Transaction>, StoreError>;

    /// Add a transaction to the pool.
    fn add_transaction(&self, transaction: Transaction) -> Result<(), StoreError>;

    /// Remove a transaction by signature (no-op if absent).
    fn remove_transaction(&self, signature: &Signature) -> Result<(), StoreError>;
}
