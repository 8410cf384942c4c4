//! Role-specific handshake rules.
//!
//! The host offers and the client answers. Rather than branching on role
//! throughout the session code, each role gets its own [`Negotiation`]
//! implementation, chosen once when the session is created.

use sync_types::{HandshakeAnswer, HandshakeOffer, PeerRole, RelayMessage, RelayPeerId};
use thiserror::Error;

/// A session description received from the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteDescription {
    /// The host's offer
    Offer(HandshakeOffer),
    /// The client's answer
    Answer(HandshakeAnswer),
}

/// Handshake errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// This role never receives that kind of description.
    #[error("{role:?} cannot accept a remote {kind}")]
    WrongDirection {
        /// Local role
        role: PeerRole,
        /// "offer" or "answer"
        kind: &'static str,
    },

    /// The remote description was already applied.
    #[error("remote description already applied")]
    AlreadyDescribed,
}

/// Handshake rules for one side of a session.
pub trait Negotiation: Send + std::fmt::Debug {
    /// Role of the local device.
    fn local_role(&self) -> PeerRole;

    /// Record that a remote description arrived.
    ///
    /// Errors when the description runs against this role's direction or
    /// repeats one already applied.
    fn on_remote(&mut self, remote: &RemoteDescription) -> Result<(), NegotiationError>;

    /// True once the remote description is applied; candidates can be
    /// applied from then on.
    fn remote_described(&self) -> bool;

    /// Wrap the local session description in the relay message this role
    /// sends.
    fn describe(&self, sender: RelayPeerId, local: String) -> RelayMessage;
}

/// Host side: creates the offer, applies the answer.
#[derive(Debug, Default)]
pub struct HostNegotiation {
    described: bool,
}

impl Negotiation for HostNegotiation {
    fn local_role(&self) -> PeerRole {
        PeerRole::Host
    }

    fn on_remote(&mut self, remote: &RemoteDescription) -> Result<(), NegotiationError> {
        match remote {
            RemoteDescription::Offer(_) => Err(NegotiationError::WrongDirection {
                role: PeerRole::Host,
                kind: "offer",
            }),
            RemoteDescription::Answer(_) if self.described => {
                Err(NegotiationError::AlreadyDescribed)
            }
            RemoteDescription::Answer(_) => {
                self.described = true;
                Ok(())
            }
        }
    }

    fn remote_described(&self) -> bool {
        self.described
    }

    fn describe(&self, sender: RelayPeerId, local: String) -> RelayMessage {
        RelayMessage::offer(sender, &HandshakeOffer(local))
    }
}

/// Client side: accepts the offer, produces the answer.
#[derive(Debug, Default)]
pub struct ClientNegotiation {
    described: bool,
}

impl Negotiation for ClientNegotiation {
    fn local_role(&self) -> PeerRole {
        PeerRole::Client
    }

    fn on_remote(&mut self, remote: &RemoteDescription) -> Result<(), NegotiationError> {
        match remote {
            RemoteDescription::Answer(_) => Err(NegotiationError::WrongDirection {
                role: PeerRole::Client,
                kind: "answer",
            }),
            RemoteDescription::Offer(_) if self.described => {
                Err(NegotiationError::AlreadyDescribed)
            }
            RemoteDescription::Offer(_) => {
                self.described = true;
                Ok(())
            }
        }
    }

    fn remote_described(&self) -> bool {
        self.described
    }

    fn describe(&self, sender: RelayPeerId, local: String) -> RelayMessage {
        RelayMessage::answer(sender, &HandshakeAnswer(local))
    }
}

/// Pick the implementation for a local role.
pub fn for_role(role: PeerRole) -> Box<dyn Negotiation> {
    match role {
        PeerRole::Host => Box::new(HostNegotiation::default()),
        PeerRole::Client => Box::new(ClientNegotiation::default()),
    }
}
