//! Error types for the scoutsync client.

use sync_types::{DataType, SessionId, SyncError};
use thiserror::Error;

use crate::relay::RelayError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Client errors.
///
/// The first three variants are the failures a user ever sees; the rest
/// are state errors surfaced to the caller or wrapped lower-level faults.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The peer did not answer in time or went away.
    #[error("peer unreachable")]
    PeerUnreachable,

    /// The peer refused a data request.
    #[error("request declined by peer")]
    RequestDeclined,

    /// The peer refused a push.
    #[error("push of {0} declined by peer")]
    PushDeclined(DataType),

    /// No session with this id.
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// The session's channel is not open.
    #[error("session {0} is not connected")]
    NotConnected(SessionId),

    /// The operation does not apply to this node's role.
    #[error("operation not available: {0}")]
    WrongRole(&'static str),

    /// A request for this data type is already outstanding on the session.
    #[error("a {0} request is already pending")]
    RequestPending(DataType),

    /// The registry task has stopped.
    #[error("registry stopped")]
    RegistryStopped,

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Relay error.
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Record store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Wire format error.
    #[error("wire format error: {0}")]
    Wire(#[from] SyncError),

    /// Payload framing error.
    #[error("framing error: {0}")]
    Framing(#[from] sync_core::ChunkError),

    /// Handshake rule violated.
    #[error("negotiation error: {0}")]
    Negotiation(#[from] sync_core::NegotiationError),

    /// A received payload did not have the expected shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Persisted state could not be read or written.
    #[error("state persistence failed: {0}")]
    Persistence(String),
}

impl ClientError {
    /// True for the failures shown to a user as-is.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            ClientError::PeerUnreachable | ClientError::RequestDeclined | ClientError::PushDeclined(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_visible_taxonomy() {
        assert!(ClientError::PeerUnreachable.is_user_visible());
        assert!(ClientError::RequestDeclined.is_user_visible());
        assert!(ClientError::PushDeclined(DataType::Scouting).is_user_visible());
        assert!(!ClientError::NotConnected(SessionId::new()).is_user_visible());
        assert!(!ClientError::Transport(TransportError::NotConnected).is_user_visible());
    }

    #[test]
    fn error_display() {
        assert_eq!(
            ClientError::PushDeclined(DataType::PitScouting).to_string(),
            "push of pit-scouting declined by peer"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ClientError>();
    }
}
