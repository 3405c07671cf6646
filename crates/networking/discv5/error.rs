use crate::{
    config::ConfigError, crypto::CryptoError, packet::PacketCodecError, session::SessionError,
    types::NodeError,
};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to bind UDP socket: {0}")]
    Bind(std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Packet codec error: {0}")]
    Codec(#[from] PacketCodecError),
    #[error("Node error: {0}")]
    Node(#[from] NodeError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("RLP error: {0}")]
    Rlp(#[from] alloy_rlp::Error),
    #[error("Request to {0} timed out")]
    Timeout(String),
    #[error("No route to node {0}")]
    UnknownNode(String),
    #[error("Discovery server is shutting down")]
    ShuttingDown,
}
