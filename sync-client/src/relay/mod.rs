//! Rendezvous relay abstraction.
//!
//! The relay is an opaque room-scoped message bus used only to exchange
//! handshakes and candidates. Sending is synchronous and never waits on the
//! network: implementations queue the message (an unbounded channel in
//! front of a socket writer, or direct delivery in memory). Incoming
//! messages arrive on a receiver handed out when the room is joined.

mod memory;

pub use memory::{MemoryRelay, MemoryRelayClient};

use sync_types::{RelayMessage, RelayPeerId, RoomCode};
use thiserror::Error;

/// Relay errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The relay connection is gone.
    #[error("relay connection closed")]
    Closed,

    /// The target is not a member of the room.
    #[error("peer {0} is not in room")]
    UnknownPeer(RelayPeerId),

    /// The message could not be encoded or decoded.
    #[error("relay message encoding failed: {0}")]
    Encoding(String),

    /// Send failed.
    #[error("relay send failed: {0}")]
    SendFailed(String),
}

/// Sending half of a relay connection.
pub trait RelaySender: Send + Sync {
    /// Our identifier in the relay's namespace.
    fn local_id(&self) -> &RelayPeerId;

    /// The room we joined.
    fn room(&self) -> &RoomCode;

    /// Queue a message for one member, or for every other member when
    /// `target` is `None`.
    fn send(&self, target: Option<&RelayPeerId>, message: RelayMessage) -> Result<(), RelayError>;
}
