//! Top-level error type shared across crates.

use thiserror::Error;

/// Common error type for the Forge protocol.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid account address: {0}")]
    InvalidAddress(String),

    #[error("invalid block: {reason}")]
    InvalidBlock { reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}
