//! Memory of invalid block signatures.
//!
//! When a peer delivers a block that fails full validation, its signature
//! is remembered for a while so the same bad chain is not re-downloaded
//! from every peer that carries it, and so the minter can disregard peer
//! chain-weight claims built on it. Entries expire to allow recovery if a
//! block was misjudged (e.g. local storage trouble during validation).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use forge_types::{BlockSignature, BlockSummary, Timestamp};

/// How long an invalid signature is remembered.
const INVALID_SIGNATURE_EXPIRY_SECS: u64 = 60 * 60;

/// Shared, cloneable memory of recently-seen invalid block signatures.
#[derive(Clone, Default)]
pub struct InvalidSignatureMemory {
    inner: Arc<Mutex<HashMap<BlockSignature, Timestamp>>>,
}

impl InvalidSignatureMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, signature: BlockSignature, now: Timestamp) {
        self.lock().insert(signature, now);
    }

    pub fn contains(&self, signature: &BlockSignature) -> bool {
        self.lock().contains_key(signature)
    }

    /// Whether any of the given signatures is remembered as invalid.
    pub fn contains_any(&self, signatures: &[BlockSignature]) -> bool {
        let inner = self.lock();
        signatures.iter().any(|sig| inner.contains_key(sig))
    }

    /// Whether any of the given summaries carries a remembered signature.
    pub fn contains_any_summary(&self, summaries: &[BlockSummary]) -> bool {
        let inner = self.lock();
        summaries.iter().any(|s| inner.contains_key(&s.signature))
    }

    /// Drop entries older than the expiry window.
    pub fn purge_expired(&self, now: Timestamp) {
        self.lock()
            .retain(|_, seen| !seen.has_expired(INVALID_SIGNATURE_EXPIRY_SECS, now));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BlockSignature, Timestamp>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_and_query() {
        let memory = InvalidSignatureMemory::new();
        let sig = BlockSignature([1u8; 64]);
        assert!(!memory.contains(&sig));

        memory.remember(sig, Timestamp::new(1000));
        assert!(memory.contains(&sig));
        assert!(memory.contains_any(&[BlockSignature([2u8; 64]), sig]));
    }

    #[test]
    fn entries_expire() {
        let memory = InvalidSignatureMemory::new();
        let sig = BlockSignature([1u8; 64]);
        memory.remember(sig, Timestamp::new(1000));

        memory.purge_expired(Timestamp::new(1000 + 3599));
        assert!(memory.contains(&sig));

        memory.purge_expired(Timestamp::new(1000 + 3600));
        assert!(!memory.contains(&sig));
    }
}
