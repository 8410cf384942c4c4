//! In-memory relay for tests and the demo.
//!
//! Messages are encoded to JSON and decoded on delivery so the wire shape
//! is exercised end to end.

use super::{RelayError, RelaySender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use sync_types::{RelayMessage, RelayPeerId, RoomCode};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Rooms {
    members: HashMap<RoomCode, HashMap<RelayPeerId, mpsc::UnboundedSender<RelayMessage>>>,
    delivered: Vec<(RelayPeerId, RelayMessage)>,
    fail_next_send: Option<String>,
}

/// A process-local relay holding any number of rooms.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    rooms: Arc<Mutex<Rooms>>,
}

impl MemoryRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a room. Returns the sending half and the inbox.
    ///
    /// Joining again with the same id replaces the previous inbox.
    pub fn join(
        &self,
        room: RoomCode,
        peer_id: RelayPeerId,
    ) -> (MemoryRelayClient, mpsc::UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.lock().unwrap();
        rooms
            .members
            .entry(room.clone())
            .or_default()
            .insert(peer_id.clone(), tx);

        let client = MemoryRelayClient {
            relay: self.clone(),
            room,
            peer_id,
        };
        (client, rx)
    }

    /// Members currently in a room.
    pub fn members(&self, room: &RoomCode) -> Vec<RelayPeerId> {
        let rooms = self.rooms.lock().unwrap();
        let mut ids: Vec<RelayPeerId> = rooms
            .members
            .get(room)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Every delivered message with its recipient, in delivery order.
    pub fn delivered(&self) -> Vec<(RelayPeerId, RelayMessage)> {
        self.rooms.lock().unwrap().delivered.clone()
    }

    /// Cause the next send from any member to fail.
    pub fn fail_next_send(&self, error: &str) {
        self.rooms.lock().unwrap().fail_next_send = Some(error.to_string());
    }

    fn leave(&self, room: &RoomCode, peer_id: &RelayPeerId) {
        let mut rooms = self.rooms.lock().unwrap();
        let now_empty = match rooms.members.get_mut(room) {
            Some(members) => {
                members.remove(peer_id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            rooms.members.remove(room);
        }
    }

    fn route(
        &self,
        room: &RoomCode,
        from: &RelayPeerId,
        target: Option<&RelayPeerId>,
        message: RelayMessage,
    ) -> Result<(), RelayError> {
        let json = message
            .to_json()
            .map_err(|e| RelayError::Encoding(e.to_string()))?;

        let mut rooms = self.rooms.lock().unwrap();
        if let Some(error) = rooms.fail_next_send.take() {
            return Err(RelayError::SendFailed(error));
        }

        let recipients: Vec<(RelayPeerId, mpsc::UnboundedSender<RelayMessage>)> = {
            let members = rooms.members.get(room).ok_or(RelayError::Closed)?;
            if !members.contains_key(from) {
                return Err(RelayError::Closed);
            }
            match target {
                Some(id) => {
                    let tx = members
                        .get(id)
                        .ok_or_else(|| RelayError::UnknownPeer(id.clone()))?;
                    vec![(id.clone(), tx.clone())]
                }
                None => members
                    .iter()
                    .filter(|(id, _)| *id != from)
                    .map(|(id, tx)| (id.clone(), tx.clone()))
                    .collect(),
            }
        };

        for (id, tx) in recipients {
            let decoded =
                RelayMessage::from_json(&json).map_err(|e| RelayError::Encoding(e.to_string()))?;
            if tx.send(decoded.clone()).is_ok() {
                rooms.delivered.push((id, decoded));
            }
        }
        Ok(())
    }
}

/// One member's connection to a [`MemoryRelay`] room.
#[derive(Debug, Clone)]
pub struct MemoryRelayClient {
    relay: MemoryRelay,
    room: RoomCode,
    peer_id: RelayPeerId,
}

impl MemoryRelayClient {
    /// Leave the room; the inbox stops receiving.
    pub fn leave(&self) {
        self.relay.leave(&self.room, &self.peer_id);
    }
}

impl RelaySender for MemoryRelayClient {
    fn local_id(&self) -> &RelayPeerId {
        &self.peer_id
    }

    fn room(&self) -> &RoomCode {
        &self.room
    }

    fn send(&self, target: Option<&RelayPeerId>, message: RelayMessage) -> Result<(), RelayError> {
        self.relay.route(&self.room, &self.peer_id, target, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::PeerRole;

    fn room() -> RoomCode {
        RoomCode::parse("424242").unwrap()
    }

    #[test]
    fn broadcast_skips_sender() {
        let relay = MemoryRelay::new();
        let (a, mut a_rx) = relay.join(room(), RelayPeerId::new("a"));
        let (_b, mut b_rx) = relay.join(room(), RelayPeerId::new("b"));
        let (_c, mut c_rx) = relay.join(room(), RelayPeerId::new("c"));

        let msg = RelayMessage::join(PeerRole::Host, RelayPeerId::new("a"), "hub");
        a.send(None, msg.clone()).unwrap();

        assert!(a_rx.try_recv().is_err());
        assert_eq!(b_rx.try_recv().unwrap(), msg);
        assert_eq!(c_rx.try_recv().unwrap(), msg);
    }

    #[test]
    fn targeted_send_reaches_only_target() {
        let relay = MemoryRelay::new();
        let (a, _a_rx) = relay.join(room(), RelayPeerId::new("a"));
        let (_b, mut b_rx) = relay.join(room(), RelayPeerId::new("b"));
        let (_c, mut c_rx) = relay.join(room(), RelayPeerId::new("c"));

        let msg = RelayMessage::join(PeerRole::Host, RelayPeerId::new("a"), "hub");
        a.send(Some(&RelayPeerId::new("b")), msg).unwrap();

        assert!(b_rx.try_recv().is_ok());
        assert!(c_rx.try_recv().is_err());
        assert_eq!(relay.delivered().len(), 1);
    }

    #[test]
    fn unknown_target_errors() {
        let relay = MemoryRelay::new();
        let (a, _rx) = relay.join(room(), RelayPeerId::new("a"));
        let msg = RelayMessage::join(PeerRole::Host, RelayPeerId::new("a"), "hub");
        assert_eq!(
            a.send(Some(&RelayPeerId::new("zz")), msg),
            Err(RelayError::UnknownPeer(RelayPeerId::new("zz")))
        );
    }

    #[test]
    fn rooms_are_isolated() {
        let relay = MemoryRelay::new();
        let (a, _a_rx) = relay.join(room(), RelayPeerId::new("a"));
        let (_b, mut b_rx) = relay.join(RoomCode::parse("000001").unwrap(), RelayPeerId::new("b"));

        let msg = RelayMessage::join(PeerRole::Host, RelayPeerId::new("a"), "hub");
        a.send(None, msg).unwrap();
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn leave_removes_member() {
        let relay = MemoryRelay::new();
        let (a, _a_rx) = relay.join(room(), RelayPeerId::new("a"));
        let (b, _b_rx) = relay.join(room(), RelayPeerId::new("b"));
        assert_eq!(relay.members(&room()).len(), 2);

        b.leave();
        assert_eq!(relay.members(&room()), vec![RelayPeerId::new("a")]);
        let msg = RelayMessage::join(PeerRole::Host, RelayPeerId::new("a"), "hub");
        assert!(a.send(Some(&RelayPeerId::new("b")), msg).is_err());
    }

    #[test]
    fn fail_next_send_injects_error() {
        let relay = MemoryRelay::new();
        let (a, _a_rx) = relay.join(room(), RelayPeerId::new("a"));
        relay.fail_next_send("down");
        let msg = RelayMessage::join(PeerRole::Host, RelayPeerId::new("a"), "hub");
        assert!(matches!(a.send(None, msg.clone()), Err(RelayError::SendFailed(_))));
        assert!(a.send(None, msg).is_ok());
    }
}
