//! Error types for scoutsync wire types.

use thiserror::Error;

/// Errors that can occur while encoding or decoding scoutsync wire types.
#[derive(Debug, Error)]
pub enum SyncError {
    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// JSON deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Room code is not six ASCII digits
    #[error("invalid room code: {0:?}")]
    InvalidRoomCode(String),
}
