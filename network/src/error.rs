use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request to peer {0} timed out")]
    Timeout(String),

    #[error("connection to peer {0} is closed")]
    ChannelClosed(String),

    #[error("peer {0} not found")]
    PeerNotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}
