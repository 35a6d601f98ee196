use hashnet_p2p::errors::{PeerConnectionError, PeerDirectoryError};
use hashnet_p2p::IdentityError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid configuration file: {0}")]
    InvalidConfig(#[from] serde_yml::Error),
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Peer directory error: {0}")]
    PeerDirectory(#[from] PeerDirectoryError),
    #[error("Network error: {0}")]
    Network(#[from] PeerConnectionError),
}
