//! Control messages exchanged through the rendezvous relay.
//!
//! The relay is an opaque room-scoped message bus. Every message names its
//! sender in `peerId`; routing to a specific member is the relay client's
//! concern, not part of the message.

use serde::{Deserialize, Serialize};

use crate::{RelayPeerId, SyncError};

/// Which side of the star topology a device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// The hub device that opens one session per client
    Host,
    /// A device that connects to the host
    Client,
}

impl PeerRole {
    /// The role of the device on the other end of a session.
    pub fn opposite(self) -> Self {
        match self {
            PeerRole::Host => PeerRole::Client,
            PeerRole::Client => PeerRole::Host,
        }
    }
}

/// An opaque local session description offered to a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandshakeOffer(pub String);

/// An opaque session description answering a [`HandshakeOffer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandshakeAnswer(pub String);

/// A network-path candidate discovered during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Candidate line (address/port or relay path)
    pub candidate: String,
    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl Candidate {
    /// Build a candidate from its line only.
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// All messages carried by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// A device announces itself in the room
    Join(Join),
    /// Host's session description for one client
    Offer(Describe),
    /// Client's answer to an offer
    Answer(Describe),
    /// A trickled network-path candidate
    IceCandidate(SignalCandidate),
    /// Any message type this build does not know
    #[serde(other)]
    Unknown,
}

impl RelayMessage {
    /// Build a join announcement.
    pub fn join(role: PeerRole, peer_id: RelayPeerId, peer_name: impl Into<String>) -> Self {
        RelayMessage::Join(Join {
            role,
            peer_id,
            peer_name: peer_name.into(),
        })
    }

    /// Build an offer message.
    pub fn offer(peer_id: RelayPeerId, offer: &HandshakeOffer) -> Self {
        RelayMessage::Offer(Describe {
            peer_id,
            data: offer.0.clone(),
        })
    }

    /// Build an answer message.
    pub fn answer(peer_id: RelayPeerId, answer: &HandshakeAnswer) -> Self {
        RelayMessage::Answer(Describe {
            peer_id,
            data: answer.0.clone(),
        })
    }

    /// Build a candidate message.
    pub fn candidate(peer_id: RelayPeerId, data: Candidate) -> Self {
        RelayMessage::IceCandidate(SignalCandidate { peer_id, data })
    }

    /// The sender's relay id, if the message carries one.
    pub fn sender(&self) -> Option<&RelayPeerId> {
        match self {
            RelayMessage::Join(m) => Some(&m.peer_id),
            RelayMessage::Offer(m) | RelayMessage::Answer(m) => Some(&m.peer_id),
            RelayMessage::IceCandidate(m) => Some(&m.peer_id),
            RelayMessage::Unknown => None,
        }
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        serde_json::from_str(json).map_err(SyncError::Deserialization)
    }
}

/// Join announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Join {
    /// Role the sender plays
    pub role: PeerRole,
    /// Sender's relay id
    pub peer_id: RelayPeerId,
    /// Human-readable device name
    #[serde(default)]
    pub peer_name: String,
}

/// Offer or answer carrying a session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Describe {
    /// Sender's relay id
    pub peer_id: RelayPeerId,
    /// Opaque session description
    pub data: String,
}

/// Candidate message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalCandidate {
    /// Sender's relay id
    pub peer_id: RelayPeerId,
    /// The candidate itself
    pub data: Candidate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_wire_shape() {
        let msg = RelayMessage::join(PeerRole::Client, RelayPeerId::new("c1"), "Tablet 3");
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "join", "role": "client", "peerId": "c1", "peerName": "Tablet 3"})
        );
    }

    #[test]
    fn offer_and_answer_wire_shape() {
        let offer = RelayMessage::offer(RelayPeerId::new("h"), &HandshakeOffer("sdp-o".into()));
        let value = serde_json::to_value(&offer).unwrap();
        assert_eq!(value, json!({"type": "offer", "peerId": "h", "data": "sdp-o"}));

        let answer = RelayMessage::answer(RelayPeerId::new("c"), &HandshakeAnswer("sdp-a".into()));
        let value = serde_json::to_value(&answer).unwrap();
        assert_eq!(value["type"], "answer");
    }

    #[test]
    fn ice_candidate_wire_shape() {
        let mut cand = Candidate::new("candidate:1 1 udp 2122 10.0.0.2 5000 typ host");
        cand.sdp_m_line_index = Some(0);
        let msg = RelayMessage::candidate(RelayPeerId::new("h"), cand.clone());
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["data"]["sdpMLineIndex"], 0);
        assert!(value["data"].get("sdpMid").is_none());

        let parsed = RelayMessage::from_json(&value.to_string()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let parsed = RelayMessage::from_json(r#"{"type":"room-full","peerId":"x"}"#).unwrap();
        assert_eq!(parsed, RelayMessage::Unknown);
        assert!(parsed.sender().is_none());
    }

    #[test]
    fn malformed_message_errors() {
        let result = RelayMessage::from_json(r#"{"type":"join"}"#);
        assert!(matches!(result, Err(SyncError::Deserialization(_))));
    }

    #[test]
    fn role_opposite() {
        assert_eq!(PeerRole::Host.opposite(), PeerRole::Client);
        assert_eq!(PeerRole::Client.opposite(), PeerRole::Host);
    }
}
