//! Error types for the chunk/document storage layer.
//!
//! Orchestration layers (entry assembly, conflict resolution, journal sync)
//! use `anyhow::Result` with context; the storage seam uses this typed enum
//! so callers can tell a fatal consistency violation apart from an ordinary
//! backend failure.

use crate::document::DocumentId;

/// Result type for storage-layer operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in the document/chunk store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Same content-address resolved to different content. This is a hash
    /// collision or on-disk corruption and must never be silently resolved.
    #[error("content-address collision on {id}: same id, different content")]
    Collision {
        /// The chunk id that collided.
        id: DocumentId,
    },

    /// A revision-checked put lost the race against a concurrent writer.
    #[error("revision conflict on {0}")]
    Conflict(DocumentId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this error is the non-recoverable consistency violation.
    /// Callers must surface it distinctly and must not retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Collision { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
