/// Error types for the relay synchronization core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("No identity keypair available")]
    MissingIdentity,

    #[error("Invalid relay url: {0}")]
    InvalidRelayUrl(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Coordinator is not running")]
    CoordinatorStopped,
}

pub type Result<T> = std::result::Result<T, SyncError>;
