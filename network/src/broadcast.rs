//! Best-effort message broadcast.
//!
//! The message is built per recipient: the builder closure may tailor the
//! payload to each peer (e.g. excluding entries that peer already knows)
//! or skip a peer entirely by returning `None`.

use std::sync::Arc;

use forge_messages::Message;

use crate::peer::Peer;

/// Outcome of a broadcast attempt.
#[derive(Clone, Debug, Default)]
pub struct BroadcastResult {
    /// Number of peers the message was successfully queued for.
    pub sent: usize,
    /// Number of peers for which queueing failed (channel full / closed).
    pub failed: usize,
    /// Number of peers skipped by the builder.
    pub skipped: usize,
}

/// Broadcast a per-recipient message to the given peers, best effort.
pub fn broadcast_with(
    peers: &[Arc<Peer>],
    build: impl Fn(&Peer) -> Option<Message>,
) -> BroadcastResult {
    let mut result = BroadcastResult::default();
    for peer in peers {
        match build(peer) {
            Some(message) => match peer.send(message) {
                Ok(()) => result.sent += 1,
                Err(_) => result.failed += 1,
            },
            None => result.skipped += 1,
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_types::{BlockSignature, ChainTip, PublicKey, Timestamp};
    use std::time::Duration;

    fn tip(height: u64) -> ChainTip {
        ChainTip {
            height,
            signature: BlockSignature([height as u8; 64]),
            timestamp: Timestamp::new(height * 60),
            minter_public_key: PublicKey([1u8; 32]),
        }
    }

    #[tokio::test]
    async fn builder_tailors_and_skips() {
        let (peer_a, mut handle_a) = Peer::new("a", Duration::from_secs(1));
        let (peer_b, _handle_b) = Peer::new("b", Duration::from_secs(1));
        let peers = vec![Arc::new(peer_a), Arc::new(peer_b)];

        let result = broadcast_with(&peers, |peer| {
            if peer.id() == "a" {
                Some(Message::ChainTipAnnounce(tip(5)))
            } else {
                None
            }
        });
        assert_eq!(result.sent, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.failed, 0);

        let req = handle_a.requests.recv().await.unwrap();
        assert!(req.reply.is_none());
        match req.message {
            Message::ChainTipAnnounce(t) => assert_eq!(t.height, 5),
            other => panic!("unexpected message: {}", other.kind()),
        }
    }

    #[test]
    fn closed_peer_counts_as_failed() {
        let (peer, handle) = Peer::new("a", Duration::from_secs(1));
        drop(handle);
        let peers = vec![Arc::new(peer)];

        let result = broadcast_with(&peers, |_| Some(Message::ChainTipAnnounce(tip(1))));
        assert_eq!(result.failed, 1);
    }
}
