//! Error types for the collaborative shape store.

use thiserror::Error;

/// Errors produced by the store, the replication layer and the transport.
///
/// Engine verbs never return these: they log and degrade to no-ops.
#[derive(Debug, Error)]
pub enum ShapeSyncError {
    #[error("CRDT error: {0}")]
    Crdt(#[from] loro::LoroError),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

/// Result type for store and replication operations.
pub type Result<T> = std::result::Result<T, ShapeSyncError>;
