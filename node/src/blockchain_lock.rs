//! The single mutual-exclusion primitive guarding local chain mutation.
//!
//! Exactly one of the synchronizer and the block minter may mutate chain
//! state at a time. Both acquire this lock with a **timed** attempt and
//! never wait unboundedly, so neither subsystem can starve the other:
//! failing to acquire is a normal condition, retried next iteration.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;

/// Guard proving exclusive access to chain state. Mutation happens while
/// this is held; dropping it releases the lock.
pub type BlockchainGuard<'a> = MutexGuard<'a, ()>;

/// The blockchain write lock.
pub struct BlockchainLock {
    inner: Mutex<()>,
}

impl BlockchainLock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    /// Try to acquire the lock, waiting at most `wait`. Returns `None` on
    /// timeout.
    pub async fn try_acquire(&self, wait: Duration) -> Option<BlockchainGuard<'_>> {
        timeout(wait, self.inner.lock()).await.ok()
    }

    /// Non-blocking acquire attempt.
    pub fn try_acquire_now(&self) -> Option<BlockchainGuard<'_>> {
        self.inner.try_lock().ok()
    }
}

impl Default for BlockchainLock {
    fn default() -> Self {
        Self::new()
    }
}
