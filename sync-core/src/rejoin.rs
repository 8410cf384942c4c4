//! Client-side automatic rejoin.
//!
//! When a client device returns to the foreground it may try to rejoin its
//! room. Foreground notifications can fire repeatedly, so a single
//! in-flight flag gates the attempts:
//! - set when an attempt starts
//! - cleared when a connected state is newly observed
//! - expires on its own after a bounded timeout
//!
//! [`RejoinState`] is the small record a client keeps between runs.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use sync_types::{HandshakeOffer, RoomCode};

/// Default bound on one rejoin attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Guard against parallel rejoin attempts.
#[derive(Debug, Clone)]
pub struct RejoinGuard {
    timeout: Duration,
    in_flight_since: Option<Instant>,
}

impl RejoinGuard {
    /// Create an idle guard.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            in_flight_since: None,
        }
    }

    /// Try to start an attempt. Returns false while another is in flight.
    pub fn try_begin(&mut self, now: Instant) -> bool {
        if self.is_in_flight(now) {
            return false;
        }
        self.in_flight_since = Some(now);
        true
    }

    /// A connected state was observed; the attempt, if any, is over.
    pub fn observe_connected(&mut self) {
        self.in_flight_since = None;
    }

    /// Check whether an attempt is running and has not timed out.
    pub fn is_in_flight(&self, now: Instant) -> bool {
        self.in_flight_since
            .is_some_and(|since| now.saturating_duration_since(since) < self.timeout)
    }
}

impl Default for RejoinGuard {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPT_TIMEOUT)
    }
}

/// What a client remembers about its last room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejoinState {
    /// Room the client last joined
    pub room: RoomCode,
    /// Name the client announced
    pub peer_name: String,
    /// The last offer the client accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_offer: Option<HandshakeOffer>,
}

impl RejoinState {
    /// Create a state with no offer yet.
    pub fn new(room: RoomCode, peer_name: impl Into<String>) -> Self {
        Self {
            room,
            peer_name: peer_name.into(),
            last_offer: None,
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_attempt_is_blocked_while_in_flight() {
        let now = Instant::now();
        let mut guard = RejoinGuard::default();
        assert!(guard.try_begin(now));
        assert!(!guard.try_begin(now + Duration::from_secs(1)));
        assert!(!guard.try_begin(now + Duration::from_secs(14)));
    }

    #[test]
    fn connected_clears_flag() {
        let now = Instant::now();
        let mut guard = RejoinGuard::default();
        assert!(guard.try_begin(now));
        guard.observe_connected();
        assert!(guard.try_begin(now + Duration::from_millis(10)));
    }

    #[test]
    fn flag_expires_after_timeout() {
        let now = Instant::now();
        let mut guard = RejoinGuard::new(Duration::from_secs(5));
        assert!(guard.try_begin(now));
        assert!(!guard.is_in_flight(now + Duration::from_secs(5)));
        assert!(guard.try_begin(now + Duration::from_secs(5)));
    }

    #[test]
    fn state_json_round_trip() {
        let mut state = RejoinState::new(RoomCode::parse("123456").unwrap(), "Tablet 2");
        state.last_offer = Some(HandshakeOffer("sdp".into()));

        let json = state.to_json().unwrap();
        assert!(json.contains("\"room\": \"123456\""));
        assert!(json.contains("lastOffer"));
        assert_eq!(RejoinState::from_json(&json).unwrap(), state);
    }

    #[test]
    fn state_rejects_bad_room() {
        let json = r#"{"room":"12","peerName":"x"}"#;
        assert!(RejoinState::from_json(json).is_err());
    }
}
