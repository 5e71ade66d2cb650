//! Unified error handling for the sync layer.

use crate::config::ConfigError;
use livequery_engine::{CollectionName, Txid};

/// Failure reported by a remote mutation function.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Sync layer error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("Engine error: {0}")]
    Engine(#[from] livequery_engine::Error),

    #[error("Remote mutation failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("Timed out waiting for txid {txid} on {collection}")]
    TxidTimeout {
        collection: CollectionName,
        txid: Txid,
    },

    #[error("Timed out refetching {0}")]
    RefetchTimeout(CollectionName),

    #[error("Timed out loading {0}")]
    LoadTimeout(CollectionName),

    #[error("Commit cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for the sync layer.
pub type Result<T> = std::result::Result<T, SyncError>;
