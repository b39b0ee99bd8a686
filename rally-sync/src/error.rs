//! Error types for the sync core.
//!
//! Each layer has its own enum: [`StoreError`] for the remote session store,
//! [`QueueError`] for the durable pending queue, and [`SyncError`] for the
//! engine's public operations.

use thiserror::Error;

/// Errors reported by a [`SessionStore`](crate::store::SessionStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The session document does not exist.
    #[error("session {0} not found")]
    NotFound(String),

    /// The session is finished and no longer accepts state writes.
    #[error("session {0} is finished")]
    SessionFinished(String),

    /// The store could not be reached (offline, socket closed, ...).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected or failed the operation.
    #[error("store operation failed: {0}")]
    Backend(String),

    /// A document or payload could not be encoded or decoded.
    #[error("malformed document: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Malformed(e.to_string())
    }
}

/// Errors reported by a [`PendingQueue`](crate::queue::PendingQueue).
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(String),

    #[error("queue record serialization error: {0}")]
    Serialization(String),

    #[error("queue record deserialization error: {0}")]
    Deserialization(String),

    #[error("queue record compression error: {0}")]
    Compression(String),

    #[error("queue record checksum mismatch")]
    ChecksumMismatch,
}

impl From<rocksdb::Error> for QueueError {
    fn from(e: rocksdb::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

/// Errors returned by [`SyncEngine`](crate::engine::SyncEngine) operations.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The match subscription gave up after exhausting its reconnect budget.
    #[error("subscription to {session_id} failed after {attempts} attempts: {source}")]
    ReconnectExhausted {
        session_id: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}
