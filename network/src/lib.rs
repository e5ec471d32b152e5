//! P2P peer plumbing for the Forge consensus engine.
//!
//! The transport layer (connection establishment, framing, handshakes) is
//! an external collaborator. This crate provides what consensus needs from
//! it:
//!
//! - [`Peer`] — bounded request/response exchange over channels, plus the
//!   per-peer caches consensus relies on (claimed chain tip, common-block
//!   comparison data).
//! - [`PeerManager`] — the handshaked peer registry with misbehavior
//!   cool-off.
//! - [`broadcast`] — best-effort fan-out of a message built per recipient.

pub mod broadcast;
pub mod error;
pub mod peer;
pub mod peer_manager;

pub use broadcast::{broadcast_with, BroadcastResult};
pub use error::NetworkError;
pub use peer::{CommonBlockData, Peer, PeerHandle, PeerRequest};
pub use peer_manager::PeerManager;
