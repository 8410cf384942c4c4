//! Peer session lifecycle state machine.
//!
//! Pure and side-effect-free: the state machine takes events and returns
//! the new status plus actions. Time is passed in, never read, so liveness
//! rules are testable without clocks.
//!
//! ```text
//! pending --(channel opens)--> connected --(link lost)--> disconnected
//!    |                            ^                            |
//!    | stale (20s)                +------(link recovers)-------+
//!    v                                                         | grace (30s)
//! torn down <--------------------------------------------------+
//! ```

use std::time::{Duration, Instant};
use sync_types::{PeerRole, RelayPeerId, SessionId};

/// Default window after which a pending session is stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(20);

/// Default grace window before a disconnected session is removed.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// Liveness windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimers {
    /// Pending sessions older than this are torn down.
    pub stale_after: Duration,
    /// Disconnected sessions older than this are removed.
    pub grace: Duration,
}

impl Default for SessionTimers {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
            grace: DEFAULT_GRACE,
        }
    }
}

/// Transport state of the underlying point-to-point link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Created, nothing negotiated yet.
    New,
    /// Negotiation in progress.
    Connecting,
    /// Network path established.
    Connected,
    /// Path lost, may recover.
    Disconnected,
    /// Path failed.
    Failed,
    /// Closed locally or remotely.
    Closed,
}

impl LinkState {
    /// True for states a link does not come back from on its own.
    pub fn is_broken(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Negotiating; `since` is when the session was created.
    Pending {
        /// Creation time
        since: Instant,
    },
    /// Channel open.
    Connected,
    /// Link lost, inside the grace window.
    Disconnected {
        /// When the link was lost
        since: Instant,
    },
}

impl SessionStatus {
    /// Process an event and return the new status plus actions to execute.
    ///
    /// This is a pure function. The caller owns the session and performs
    /// the returned actions.
    pub fn on_event(self, event: Event, timers: &SessionTimers) -> (Self, Vec<Action>) {
        match (self, event) {
            // From Pending
            (Self::Pending { .. }, Event::ChannelOpened) => (
                Self::Connected,
                vec![Action::DrainCandidates, Action::EmitConnected],
            ),
            (Self::Pending { since }, Event::Tick { now })
                if now.saturating_duration_since(since) > timers.stale_after =>
            {
                (self, vec![Action::TearDown(TearDownReason::Stale)])
            }

            // From Connected
            (Self::Connected, Event::LinkLost { now }) => (
                Self::Disconnected { since: now },
                vec![Action::EmitDisconnected],
            ),

            // From Disconnected
            (Self::Disconnected { .. }, Event::ChannelOpened | Event::LinkRecovered) => {
                (Self::Connected, vec![Action::EmitReconnected])
            }
            (Self::Disconnected { since }, Event::Tick { now })
                if now.saturating_duration_since(since) >= timers.grace =>
            {
                (self, vec![Action::TearDown(TearDownReason::GraceExpired)])
            }

            // From any status
            (Self::Connected, Event::CloseRequested) => (
                self,
                vec![
                    Action::SendGoodbye,
                    Action::TearDown(TearDownReason::LocalClose),
                ],
            ),
            (status, Event::CloseRequested) => {
                (status, vec![Action::TearDown(TearDownReason::LocalClose)])
            }
            (status, Event::RemoteGoodbye) => {
                (status, vec![Action::TearDown(TearDownReason::RemoteClose)])
            }

            // Everything else leaves the status alone
            (status, _) => (status, vec![]),
        }
    }

    /// Check if the channel is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// When the session entered pending, if it is pending.
    pub fn pending_since(&self) -> Option<Instant> {
        match self {
            Self::Pending { since } => Some(*since),
            _ => None,
        }
    }

    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
        }
    }
}

/// Events that drive a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The data channel opened.
    ChannelOpened,
    /// The network path came back without a new handshake.
    LinkRecovered,
    /// The link dropped or failed.
    LinkLost {
        /// When it was noticed
        now: Instant,
    },
    /// Periodic liveness check.
    Tick {
        /// Current time
        now: Instant,
    },
    /// The remote sent a `disconnected` frame.
    RemoteGoodbye,
    /// The local application closed the session.
    CloseRequested,
}

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TearDownReason {
    /// Pending for longer than the staleness window.
    Stale,
    /// Disconnected for longer than the grace window.
    GraceExpired,
    /// Replaced by a newer session for the same peer.
    Replaced,
    /// The remote said goodbye.
    RemoteClose,
    /// The local application asked.
    LocalClose,
}

impl std::fmt::Display for TearDownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TearDownReason::Stale => "stale",
            TearDownReason::GraceExpired => "grace expired",
            TearDownReason::Replaced => "replaced",
            TearDownReason::RemoteClose => "remote closed",
            TearDownReason::LocalClose => "closed locally",
        };
        f.write_str(text)
    }
}

/// Actions for the session owner to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Apply buffered candidates, in arrival order.
    DrainCandidates,
    /// Tell the application the session connected.
    EmitConnected,
    /// Tell the application the session came back inside the grace window.
    EmitReconnected,
    /// Tell the application the session lost its link.
    EmitDisconnected,
    /// Send a `disconnected` frame before closing.
    SendGoodbye,
    /// Close the link, drop buffers and transfers, remove the session.
    TearDown(TearDownReason),
}

/// What to do with a join announcement from a peer we already know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDisposition {
    /// The existing session is healthy; ignore the join.
    Ignore,
    /// Tear the existing session down and open a new one.
    Replace,
}

/// One session record, as owned by the registry.
#[derive(Debug, Clone)]
pub struct PeerSession {
    /// Local identifier
    pub id: SessionId,
    /// Remote device's display name
    pub display_name: String,
    /// Role of the remote device
    pub role: PeerRole,
    /// Remote's relay id, once learned
    pub relay_peer_id: Option<RelayPeerId>,
    /// Lifecycle status
    pub status: SessionStatus,
    /// Last reported link state
    pub link_state: LinkState,
}

impl PeerSession {
    /// Create a pending session.
    pub fn new(display_name: impl Into<String>, role: PeerRole, now: Instant) -> Self {
        Self {
            id: SessionId::new(),
            display_name: display_name.into(),
            role,
            relay_peer_id: None,
            status: SessionStatus::Pending { since: now },
            link_state: LinkState::New,
        }
    }

    /// Feed an event through the status machine, updating in place.
    pub fn apply(&mut self, event: Event, timers: &SessionTimers) -> Vec<Action> {
        let (status, actions) = self.status.on_event(event, timers);
        self.status = status;
        actions
    }

    /// True if pending for longer than the staleness window.
    pub fn is_stale(&self, now: Instant, timers: &SessionTimers) -> bool {
        self.status
            .pending_since()
            .is_some_and(|since| now.saturating_duration_since(since) > timers.stale_after)
    }

    /// Decide how a repeated join from this session's peer is handled.
    ///
    /// Healthy pending or connected sessions make the join a no-op. Stale,
    /// broken or already-disconnected sessions are replaced.
    pub fn join_disposition(&self, now: Instant, timers: &SessionTimers) -> JoinDisposition {
        if self.link_state.is_broken() || self.is_stale(now, timers) {
            return JoinDisposition::Replace;
        }
        match self.status {
            SessionStatus::Pending { .. } | SessionStatus::Connected => JoinDisposition::Ignore,
            SessionStatus::Disconnected { .. } => JoinDisposition::Replace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timers() -> SessionTimers {
        SessionTimers::default()
    }

    #[test]
    fn channel_open_connects_and_drains() {
        let now = Instant::now();
        let (status, actions) = SessionStatus::Pending { since: now }.on_event(Event::ChannelOpened, &timers());

        assert!(status.is_connected());
        assert_eq!(actions, vec![Action::DrainCandidates, Action::EmitConnected]);
    }

    #[test]
    fn pending_goes_stale_after_window() {
        let start = Instant::now();
        let status = SessionStatus::Pending { since: start };

        let (_, actions) = status.on_event(
            Event::Tick {
                now: start + Duration::from_secs(20),
            },
            &timers(),
        );
        assert!(actions.is_empty());

        let (_, actions) = status.on_event(
            Event::Tick {
                now: start + Duration::from_secs(21),
            },
            &timers(),
        );
        assert_eq!(actions, vec![Action::TearDown(TearDownReason::Stale)]);
    }

    #[test]
    fn link_loss_starts_grace() {
        let now = Instant::now();
        let (status, actions) = SessionStatus::Connected.on_event(Event::LinkLost { now }, &timers());

        assert_eq!(status, SessionStatus::Disconnected { since: now });
        assert_eq!(actions, vec![Action::EmitDisconnected]);
    }

    #[test]
    fn recovery_inside_grace_resumes() {
        let now = Instant::now();
        let status = SessionStatus::Disconnected { since: now };
        let (status, actions) = status.on_event(Event::LinkRecovered, &timers());

        assert!(status.is_connected());
        assert_eq!(actions, vec![Action::EmitReconnected]);
    }

    #[test]
    fn grace_expiry_tears_down() {
        let since = Instant::now();
        let status = SessionStatus::Disconnected { since };

        let (_, actions) = status.on_event(
            Event::Tick {
                now: since + Duration::from_secs(29),
            },
            &timers(),
        );
        assert!(actions.is_empty());

        let (_, actions) = status.on_event(
            Event::Tick {
                now: since + Duration::from_secs(30),
            },
            &timers(),
        );
        assert_eq!(actions, vec![Action::TearDown(TearDownReason::GraceExpired)]);
    }

    #[test]
    fn pending_ignores_link_loss() {
        let since = Instant::now();
        let status = SessionStatus::Pending { since };
        let (new_status, actions) = status.on_event(Event::LinkLost { now: since }, &timers());

        assert_eq!(new_status, status);
        assert!(actions.is_empty());
    }

    #[test]
    fn close_on_connected_sends_goodbye_first() {
        let (_, actions) = SessionStatus::Connected.on_event(Event::CloseRequested, &timers());
        assert_eq!(
            actions,
            vec![
                Action::SendGoodbye,
                Action::TearDown(TearDownReason::LocalClose)
            ]
        );
    }

    #[test]
    fn close_on_pending_skips_goodbye() {
        let status = SessionStatus::Pending {
            since: Instant::now(),
        };
        let (_, actions) = status.on_event(Event::CloseRequested, &timers());
        assert_eq!(actions, vec![Action::TearDown(TearDownReason::LocalClose)]);
    }

    #[test]
    fn remote_goodbye_skips_grace() {
        let (_, actions) = SessionStatus::Connected.on_event(Event::RemoteGoodbye, &timers());
        assert_eq!(actions, vec![Action::TearDown(TearDownReason::RemoteClose)]);
    }

    #[test]
    fn connected_ignores_second_open() {
        let (status, actions) = SessionStatus::Connected.on_event(Event::ChannelOpened, &timers());
        assert!(status.is_connected());
        assert!(actions.is_empty());
    }

    // ===========================================
    // Duplicate joins
    // ===========================================

    #[test]
    fn healthy_pending_ignores_join() {
        let now = Instant::now();
        let session = PeerSession::new("tablet", PeerRole::Client, now);
        assert_eq!(
            session.join_disposition(now + Duration::from_secs(5), &timers()),
            JoinDisposition::Ignore
        );
    }

    #[test]
    fn stale_pending_is_replaced() {
        let now = Instant::now();
        let session = PeerSession::new("tablet", PeerRole::Client, now);
        assert!(session.is_stale(now + Duration::from_secs(21), &timers()));
        assert_eq!(
            session.join_disposition(now + Duration::from_secs(21), &timers()),
            JoinDisposition::Replace
        );
    }

    #[test]
    fn broken_link_is_replaced() {
        let now = Instant::now();
        let mut session = PeerSession::new("tablet", PeerRole::Client, now);
        session.apply(Event::ChannelOpened, &timers());
        assert_eq!(session.join_disposition(now, &timers()), JoinDisposition::Ignore);

        session.link_state = LinkState::Failed;
        assert_eq!(session.join_disposition(now, &timers()), JoinDisposition::Replace);
    }

    #[test]
    fn disconnected_session_is_replaced() {
        let now = Instant::now();
        let mut session = PeerSession::new("tablet", PeerRole::Client, now);
        session.apply(Event::ChannelOpened, &timers());
        session.apply(Event::LinkLost { now }, &timers());
        assert_eq!(session.join_disposition(now, &timers()), JoinDisposition::Replace);
    }

    #[test]
    fn connected_session_is_never_stale() {
        let now = Instant::now();
        let mut session = PeerSession::new("tablet", PeerRole::Client, now);
        session.apply(Event::ChannelOpened, &timers());
        assert!(!session.is_stale(now + Duration::from_secs(600), &timers()));
    }
}
