//! Handshaked peer registry with misbehavior cool-off.
//!
//! A peer that sends invalid data is not banned outright: it is
//! de-prioritized for a cool-off window and then considered again. This is
//! deliberately forgiving — a peer on a bad fork today may be the best
//! sync source tomorrow.

use std::collections::HashMap;
use std::sync::Arc;

use forge_types::Timestamp;

use crate::peer::Peer;

/// Default cool-off after a peer sent invalid data (10 minutes).
pub const MISBEHAVIOR_COOLOFF_SECS: u64 = 10 * 60;

/// Registry of handshaked peers.
pub struct PeerManager {
    peers: HashMap<String, Arc<Peer>>,
    /// Peer id → time of last misbehavior.
    misbehavior: HashMap<String, Timestamp>,
    cooloff_secs: u64,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::with_cooloff(MISBEHAVIOR_COOLOFF_SECS)
    }

    pub fn with_cooloff(cooloff_secs: u64) -> Self {
        Self {
            peers: HashMap::new(),
            misbehavior: HashMap::new(),
            cooloff_secs,
        }
    }

    /// Register a handshaked peer.
    pub fn register(&mut self, peer: Arc<Peer>) {
        self.peers.insert(peer.id().to_string(), peer);
    }

    /// Remove a peer (connection dropped).
    pub fn remove(&mut self, peer_id: &str) {
        self.peers.remove(peer_id);
        self.misbehavior.remove(peer_id);
    }

    /// All handshaked peers.
    pub fn handshaked(&self) -> Vec<Arc<Peer>> {
        self.peers.values().cloned().collect()
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.get(peer_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Record that a peer sent invalid data.
    pub fn penalize(&mut self, peer_id: &str, now: Timestamp) {
        tracing::debug!(peer = peer_id, "penalizing peer, cooling off");
        self.misbehavior.insert(peer_id.to_string(), now);
    }

    /// Whether a peer is inside its misbehavior cool-off window.
    pub fn has_misbehaved(&self, peer_id: &str, now: Timestamp) -> bool {
        self.misbehavior
            .get(peer_id)
            .is_some_and(|last| !last.has_expired(self.cooloff_secs, now))
    }

    /// Handshaked peers outside their cool-off window.
    pub fn eligible(&self, now: Timestamp) -> Vec<Arc<Peer>> {
        self.peers
            .values()
            .filter(|p| !self.has_misbehaved(p.id(), now))
            .cloned()
            .collect()
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer(id: &str) -> Arc<Peer> {
        let (peer, _handle) = Peer::new(id, Duration::from_secs(1));
        // Handle intentionally dropped — these tests never exchange messages.
        Arc::new(peer)
    }

    #[test]
    fn register_and_remove() {
        let mut manager = PeerManager::new();
        manager.register(peer("a"));
        manager.register(peer("b"));
        assert_eq!(manager.len(), 2);

        manager.remove("a");
        assert_eq!(manager.len(), 1);
        assert!(manager.get("a").is_none());
        assert!(manager.get("b").is_some());
    }

    #[test]
    fn cooloff_expires() {
        let mut manager = PeerManager::with_cooloff(600);
        manager.register(peer("a"));

        manager.penalize("a", Timestamp::new(1000));
        assert!(manager.has_misbehaved("a", Timestamp::new(1300)));
        assert!(!manager.has_misbehaved("a", Timestamp::new(1600)));
    }

    #[test]
    fn eligible_filters_misbehaving_peers() {
        let mut manager = PeerManager::with_cooloff(600);
        manager.register(peer("good"));
        manager.register(peer("bad"));
        manager.penalize("bad", Timestamp::new(1000));

        let eligible = manager.eligible(Timestamp::new(1100));
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id(), "good");
    }
}
