//! Error types for the discovery layer

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Encoded node metadata does not fit the engine's per-message ceiling
    #[error("Node metadata is {size} bytes, exceeding the {limit} byte limit")]
    MetaTooLarge { size: usize, limit: usize },

    #[error("Membership engine is not initialized")]
    NotInitialized,

    #[error("Join failed: {0}")]
    Join(String),

    #[error("Membership engine error: {0}")]
    Engine(String),

    #[error("No connection available")]
    NoConnectionAvailable,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
