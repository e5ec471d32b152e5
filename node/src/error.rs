use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("network error: {0}")]
    Network(#[from] forge_network::NetworkError),

    #[error("store error: {0}")]
    Store(#[from] forge_store::StoreError),

    #[error("invalid block: {0}")]
    InvalidBlock(#[from] crate::validation::BlockValidationError),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shutdown timeout")]
    ShutdownTimeout,

    #[error("{0}")]
    Other(String),
}
