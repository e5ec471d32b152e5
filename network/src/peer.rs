//! A handshaked peer as seen by the consensus engine.
//!
//! The [`Peer`] does not own a socket. Requests are pushed onto an `mpsc`
//! channel as [`PeerRequest`]s; the connection layer (or a test harness)
//! drains the companion [`PeerHandle`], performs the wire exchange, and
//! answers through the attached `oneshot` sender. Every request is bounded
//! by a timeout — a peer that doesn't answer in time is simply treated as
//! having no reply.

use std::sync::Mutex;
use std::time::Duration;

use num_bigint::BigUint;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use forge_messages::Message;
use forge_types::{Block, BlockSignature, BlockSummary, ChainTip, OnlineAccountEntry, PublicKey,
    Timestamp};

use crate::NetworkError;

/// Capacity of the per-peer outbound request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// One outbound exchange. `reply` is `None` for fire-and-forget sends.
pub struct PeerRequest {
    pub message: Message,
    pub reply: Option<oneshot::Sender<Message>>,
}

/// Comparison data cached after the synchronizer negotiated a common block
/// with this peer. The block minter consults it to see whether the peer is
/// on a more favorable chain than anything we could mint.
#[derive(Clone, Debug)]
pub struct CommonBlockData {
    pub common_block_summary: BlockSummary,
    /// Peer's summaries after the common block, as of the last comparison.
    pub summaries_after_common: Option<Vec<BlockSummary>>,
    /// Peer's cumulative chain weight from the common block (mutual-height
    /// truncated). Lower is more favorable.
    pub chain_weight: Option<BigUint>,
}

#[derive(Default)]
struct PeerMeta {
    chain_tip: Option<ChainTip>,
    common_block: Option<CommonBlockData>,
}

/// A handshaked peer.
pub struct Peer {
    id: String,
    outbound: mpsc::Sender<PeerRequest>,
    request_timeout: Duration,
    meta: Mutex<PeerMeta>,
}

/// Handle given to the connection layer (or a test harness) to serve one
/// peer's outbound requests.
pub struct PeerHandle {
    pub peer_id: String,
    pub requests: mpsc::Receiver<PeerRequest>,
}

impl Peer {
    /// Create a peer and its companion [`PeerHandle`].
    pub fn new(id: impl Into<String>, request_timeout: Duration) -> (Self, PeerHandle) {
        let id = id.into();
        let (outbound, requests) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let peer = Self {
            id: id.clone(),
            outbound,
            request_timeout,
            meta: Mutex::new(PeerMeta::default()),
        };
        let handle = PeerHandle {
            peer_id: id,
            requests,
        };
        (peer, handle)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Exchange a request for a response, bounded by the peer timeout.
    pub async fn request(&self, message: Message) -> Result<Message, NetworkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.outbound
            .send(PeerRequest {
                message,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| NetworkError::ChannelClosed(self.id.clone()))?;

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NetworkError::ChannelClosed(self.id.clone())),
            Err(_) => Err(NetworkError::Timeout(self.id.clone())),
        }
    }

    /// Fire-and-forget send (best effort; a full channel drops the message).
    pub fn send(&self, message: Message) -> Result<(), NetworkError> {
        self.outbound
            .try_send(PeerRequest {
                message,
                reply: None,
            })
            .map_err(|_| NetworkError::ChannelClosed(self.id.clone()))
    }

    // ── Typed request helpers ───────────────────────────────────────────
    //
    // `None` means the peer gave no usable reply (timeout, closed channel,
    // or a response of the wrong kind) — callers treat all three the same.

    pub async fn get_block_summaries(
        &self,
        parent_signature: &BlockSignature,
        count: u32,
    ) -> Option<Vec<BlockSummary>> {
        match self
            .request(Message::GetBlockSummaries {
                parent_signature: *parent_signature,
                count,
            })
            .await
        {
            Ok(Message::BlockSummaries { summaries }) => Some(summaries),
            _ => None,
        }
    }

    pub async fn get_signatures(
        &self,
        parent_signature: &BlockSignature,
        count: u32,
    ) -> Option<Vec<BlockSignature>> {
        match self
            .request(Message::GetSignatures {
                parent_signature: *parent_signature,
                count,
            })
            .await
        {
            Ok(Message::Signatures { signatures }) => Some(signatures),
            _ => None,
        }
    }

    pub async fn get_block(&self, signature: &BlockSignature) -> Option<Block> {
        match self
            .request(Message::GetBlock {
                signature: *signature,
            })
            .await
        {
            Ok(Message::BlockResponse { block }) => block,
            _ => None,
        }
    }

    pub async fn get_online_accounts(
        &self,
        known: Vec<(Timestamp, PublicKey)>,
    ) -> Option<Vec<OnlineAccountEntry>> {
        match self.request(Message::GetOnlineAccounts { known }).await {
            Ok(Message::OnlineAccounts { entries }) => Some(entries),
            _ => None,
        }
    }

    // ── Cached metadata ─────────────────────────────────────────────────

    /// The peer's last claimed chain tip, if any.
    pub fn chain_tip(&self) -> Option<ChainTip> {
        self.meta().chain_tip.clone()
    }

    /// Refresh the tip claim (called on every height-bearing message).
    pub fn set_chain_tip(&self, tip: ChainTip) {
        self.meta().chain_tip = Some(tip);
    }

    pub fn common_block_data(&self) -> Option<CommonBlockData> {
        self.meta().common_block.clone()
    }

    pub fn set_common_block_data(&self, data: Option<CommonBlockData>) {
        self.meta().common_block = data;
    }

    fn meta(&self) -> std::sync::MutexGuard<'_, PeerMeta> {
        self.meta.lock().unwrap_or_else(|e| e.into_inner())
    }
}
