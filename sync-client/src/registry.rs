//! Connection registry.
//!
//! One actor task owns every session, both candidate buffers and the
//! reassembly tables. Everything else reaches it through messages:
//! - [`RegistryHandle`] calls from the application
//! - relay messages from the room
//! - reports from each session's pump and worker (see `worker`)
//! - a periodic tick driving staleness and grace timeouts
//!
//! The session state machine itself lives in `sync_core::session`; this
//! module feeds it events and carries out the actions it returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use sync_core::negotiation::for_role;
use sync_core::{
    Action, CandidateBuffer, Chunker, Event, JoinDisposition, LinkState, Negotiation,
    PeerSession, Reassembler, RejoinGuard, RejoinState, RemoteDescription, SessionTimers,
    TearDownReason,
};
use sync_types::{
    Candidate, DataFilters, DataType, Frame, HandshakeAnswer, HandshakeOffer, Join,
    PayloadKind, PeerRole, RelayMessage, RelayPeerId, SessionId,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::config::NodeConfig;
use crate::error::ClientError;
use crate::rejoin::RejoinFile;
use crate::relay::RelaySender;
use crate::transport::{LinkEvent, PeerConnector, PeerLink, TransportError};
use crate::worker::{spawn_session_tasks, LinkOp, SessionTasks, TaskReport};

/// Display name given to the host when accepting an offer by hand.
const MANUAL_HOST_NAME: &str = "host";

/// Everything the registry needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Role of this device
    pub role: PeerRole,
    /// Name announced in join messages
    pub peer_name: String,
    /// Staleness and grace windows
    pub timers: SessionTimers,
    /// Bound on waiting for candidate gathering
    pub gather_timeout: Duration,
    /// Liveness tick period
    pub tick: Duration,
    /// Per-key cap of every candidate buffer
    pub max_buffered_candidates: usize,
    /// Outbound framing
    pub chunker: Chunker,
    /// Largest inbound transfer accepted, in chunks
    pub max_chunks: u32,
    /// Bound on one rejoin attempt
    pub rejoin_timeout: Duration,
    /// Where a client keeps its rejoin state
    pub rejoin_file: Option<RejoinFile>,
}

impl RegistrySettings {
    /// Settings with every default.
    pub fn new(role: PeerRole, peer_name: impl Into<String>) -> Self {
        Self::from_config(role, peer_name, &NodeConfig::default())
    }

    /// Settings taken from a loaded configuration.
    pub fn from_config(role: PeerRole, peer_name: impl Into<String>, config: &NodeConfig) -> Self {
        Self {
            role,
            peer_name: peer_name.into(),
            timers: config.session.timers(),
            gather_timeout: config.session.gather_timeout(),
            tick: config.session.tick_interval(),
            max_buffered_candidates: config.session.max_buffered_candidates,
            chunker: config.transfer.chunker(),
            max_chunks: config.transfer.max_chunks,
            rejoin_timeout: config.rejoin.attempt_timeout(),
            rejoin_file: config.rejoin.state_path.clone().map(RejoinFile::new),
        }
    }
}

/// Session lifecycle and data notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session's channel opened for the first time.
    Connected {
        /// Session
        session_id: SessionId,
        /// Remote device's name
        display_name: String,
    },
    /// The link came back inside the grace window.
    Reconnected {
        /// Session
        session_id: SessionId,
    },
    /// The link dropped; the session is held for the grace window.
    Disconnected {
        /// Session
        session_id: SessionId,
    },
    /// The session is gone.
    Removed {
        /// Session
        session_id: SessionId,
        /// Why it was torn down
        reason: TearDownReason,
    },
    /// A complete payload arrived.
    Payload {
        /// Source session
        session_id: SessionId,
        /// Push or response, and content type
        kind: PayloadKind,
        /// The payload
        data: Value,
    },
    /// The remote asked for data.
    DataRequested {
        /// Source session
        session_id: SessionId,
        /// Requested content type
        data_type: DataType,
        /// Selection, empty for everything
        filters: DataFilters,
    },
    /// The remote refused our request.
    RequestDeclined {
        /// Source session
        session_id: SessionId,
    },
    /// The remote refused our push.
    PushDeclined {
        /// Source session
        session_id: SessionId,
        /// Content type that was refused
        data_type: DataType,
    },
    /// A transfer reassembled into something unreadable and was discarded.
    TransferFailed {
        /// Source session
        session_id: SessionId,
        /// What the discarded payload was meant to be
        kind: PayloadKind,
        /// What went wrong
        error: String,
    },
}

impl SessionEvent {
    /// Session the event belongs to.
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::Connected { session_id, .. }
            | SessionEvent::Reconnected { session_id }
            | SessionEvent::Disconnected { session_id }
            | SessionEvent::Removed { session_id, .. }
            | SessionEvent::Payload { session_id, .. }
            | SessionEvent::DataRequested { session_id, .. }
            | SessionEvent::RequestDeclined { session_id }
            | SessionEvent::PushDeclined { session_id, .. }
            | SessionEvent::TransferFailed { session_id, .. } => *session_id,
        }
    }
}

/// A session as reported to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session id
    pub id: SessionId,
    /// Remote device's name
    pub display_name: String,
    /// Remote device's role
    pub role: PeerRole,
    /// "pending", "connected" or "disconnected"
    pub status: &'static str,
    /// Remote's relay id, if known
    pub relay_peer_id: Option<RelayPeerId>,
    /// Last reported link state
    pub link_state: LinkState,
}

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

enum Command {
    Open {
        display_name: String,
        reply: Reply<(SessionId, HandshakeOffer)>,
    },
    Complete {
        session_id: SessionId,
        answer: HandshakeAnswer,
        reply: Reply<()>,
    },
    Accept {
        offer: HandshakeOffer,
        reply: Reply<(SessionId, HandshakeAnswer)>,
    },
    SubmitCandidate {
        session_id: SessionId,
        candidate: Candidate,
        reply: Reply<()>,
    },
    TakeLocalCandidates {
        session_id: SessionId,
        reply: Reply<Vec<Candidate>>,
    },
    Send {
        session_id: SessionId,
        payload: Value,
        kind: PayloadKind,
        reply: Reply<()>,
    },
    SendFrame {
        session_id: SessionId,
        frame: Frame,
        reply: Reply<()>,
    },
    Close {
        session_id: SessionId,
        reply: Reply<()>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionSnapshot>>,
    },
    Foreground {
        reply: Reply<bool>,
    },
    Shutdown,
}

/// A caller waiting for the local description of a session it opened.
enum Waiter {
    Offer(Reply<(SessionId, HandshakeOffer)>),
    Answer(Reply<(SessionId, HandshakeAnswer)>),
}

impl Waiter {
    fn succeed(self, session_id: SessionId, description: String) {
        match self {
            Waiter::Offer(reply) => {
                let _ = reply.send(Ok((session_id, HandshakeOffer(description))));
            }
            Waiter::Answer(reply) => {
                let _ = reply.send(Ok((session_id, HandshakeAnswer(description))));
            }
        }
    }

    fn fail(self, error: ClientError) {
        match self {
            Waiter::Offer(reply) => {
                let _ = reply.send(Err(error));
            }
            Waiter::Answer(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

struct SessionEntry {
    session: PeerSession,
    negotiation: Box<dyn Negotiation>,
    link: Arc<dyn PeerLink>,
    tasks: SessionTasks,
    reassembler: Reassembler,
    local_description: Option<String>,
    description_sent: bool,
    remote_offer: Option<HandshakeOffer>,
    waiter: Option<Waiter>,
}

/// Cloneable handle to a running registry.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    commands: mpsc::UnboundedSender<Command>,
    role: PeerRole,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Open { .. } => "Open",
            Command::Complete { .. } => "Complete",
            Command::Accept { .. } => "Accept",
            Command::SubmitCandidate { .. } => "SubmitCandidate",
            Command::TakeLocalCandidates { .. } => "TakeLocalCandidates",
            Command::Send { .. } => "Send",
            Command::SendFrame { .. } => "SendFrame",
            Command::Close { .. } => "Close",
            Command::Sessions { .. } => "Sessions",
            Command::Foreground { .. } => "Foreground",
            Command::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl RegistryHandle {
    /// Role of the local device.
    pub fn role(&self) -> PeerRole {
        self.role
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| ClientError::RegistryStopped)?;
        rx.await.map_err(|_| ClientError::RegistryStopped)?
    }

    /// Open a pending session and return its offer (host only).
    ///
    /// The offer is also sent over the relay once a client with this
    /// display name joins.
    pub async fn open_session_to(
        &self,
        display_name: impl Into<String>,
    ) -> Result<(SessionId, HandshakeOffer), ClientError> {
        let display_name = display_name.into();
        self.call(|reply| Command::Open {
            display_name,
            reply,
        })
        .await
    }

    /// Apply the client's answer to a session opened by hand (host only).
    pub async fn complete_session(
        &self,
        session_id: SessionId,
        answer: HandshakeAnswer,
    ) -> Result<(), ClientError> {
        self.call(|reply| Command::Complete {
            session_id,
            answer,
            reply,
        })
        .await
    }

    /// Accept a host's offer received out of band (client only).
    pub async fn accept_incoming_offer(
        &self,
        offer: HandshakeOffer,
    ) -> Result<(SessionId, HandshakeAnswer), ClientError> {
        self.call(|reply| Command::Accept { offer, reply }).await
    }

    /// Hand over a remote candidate received out of band.
    ///
    /// Buffered until the handshake resolves if it arrives early.
    pub async fn submit_candidate(
        &self,
        session_id: SessionId,
        candidate: Candidate,
    ) -> Result<(), ClientError> {
        self.call(|reply| Command::SubmitCandidate {
            session_id,
            candidate,
            reply,
        })
        .await
    }

    /// Take the local candidates queued for a session with no relay route.
    pub async fn take_local_candidates(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<Candidate>, ClientError> {
        self.call(|reply| Command::TakeLocalCandidates { session_id, reply })
            .await
    }

    /// Send a payload, chunked when above the threshold.
    pub async fn send(
        &self,
        session_id: SessionId,
        payload: Value,
        kind: PayloadKind,
    ) -> Result<(), ClientError> {
        self.call(|reply| Command::Send {
            session_id,
            payload,
            kind,
            reply,
        })
        .await
    }

    /// Send one control frame.
    pub async fn send_frame(&self, session_id: SessionId, frame: Frame) -> Result<(), ClientError> {
        self.call(|reply| Command::SendFrame {
            session_id,
            frame,
            reply,
        })
        .await
    }

    /// Say goodbye and tear the session down.
    pub async fn close_session(&self, session_id: SessionId) -> Result<(), ClientError> {
        self.call(|reply| Command::Close { session_id, reply })
            .await
    }

    /// Current sessions.
    pub async fn sessions(&self) -> Result<Vec<SessionSnapshot>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Sessions { reply: tx })
            .map_err(|_| ClientError::RegistryStopped)?;
        rx.await.map_err(|_| ClientError::RegistryStopped)
    }

    /// The app came back to the foreground (client only).
    ///
    /// Returns true if a rejoin attempt was started.
    pub async fn foreground(&self) -> Result<bool, ClientError> {
        self.call(|reply| Command::Foreground { reply }).await
    }

    /// Close every session and stop the registry.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Start a registry on the current runtime.
///
/// The registry stops on [`RegistryHandle::shutdown`] or once every handle
/// is dropped.
pub fn spawn_registry(
    settings: RegistrySettings,
    connector: Arc<dyn PeerConnector>,
    relay: Arc<dyn RelaySender>,
    relay_inbox: mpsc::UnboundedReceiver<RelayMessage>,
) -> (RegistryHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let handle = RegistryHandle {
        commands: commands_tx,
        role: settings.role,
    };
    let registry = Registry {
        rejoin_guard: RejoinGuard::new(settings.rejoin_timeout),
        pre_session: CandidateBuffer::new(settings.max_buffered_candidates),
        inbound: CandidateBuffer::new(settings.max_buffered_candidates),
        outbound: CandidateBuffer::new(settings.max_buffered_candidates),
        settings,
        connector,
        relay,
        reports: reports_tx,
        events: events_tx,
        sessions: HashMap::new(),
        peer_names: HashMap::new(),
        rejoin_state: None,
    };
    tokio::spawn(registry.run(commands_rx, reports_rx, relay_inbox));

    (handle, events_rx)
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

struct Registry {
    settings: RegistrySettings,
    connector: Arc<dyn PeerConnector>,
    relay: Arc<dyn RelaySender>,
    reports: mpsc::UnboundedSender<TaskReport>,
    events: mpsc::UnboundedSender<SessionEvent>,
    sessions: HashMap<SessionId, SessionEntry>,
    peer_names: HashMap<RelayPeerId, String>,
    /// Candidates from peers with no session yet, keyed by their role and id.
    pre_session: CandidateBuffer<(PeerRole, RelayPeerId)>,
    /// Remote candidates waiting for the remote description.
    inbound: CandidateBuffer<SessionId>,
    /// Local candidates waiting for a relay route.
    outbound: CandidateBuffer<SessionId>,
    rejoin_guard: RejoinGuard,
    rejoin_state: Option<RejoinState>,
}

impl Registry {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<TaskReport>,
        mut relay_inbox: mpsc::UnboundedReceiver<RelayMessage>,
    ) {
        tracing::info!(
            "Registry started as {:?} '{}' in room {}",
            self.settings.role,
            self.settings.peer_name,
            self.relay.room()
        );
        self.load_rejoin_state().await;
        if self.rejoin_state.is_some() && self.rejoin_guard.try_begin(now()) {
            tracing::info!("Rejoining room {} from saved state", self.relay.room());
        }
        if let Err(e) = self.announce(None) {
            tracing::warn!("Failed to announce in room: {}", e);
        }

        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut relay_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(report) = reports.recv() => self.handle_report(report),
                message = relay_inbox.recv(), if relay_open => match message {
                    Some(message) => self.handle_relay(message).await,
                    None => {
                        tracing::warn!("Relay inbox closed, continuing without signaling");
                        relay_open = false;
                    }
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }

        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.drive(id, Event::CloseRequested);
        }
        tracing::info!("Registry stopped");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    // ----- application commands -----

    fn handle_command(&mut self, command: Command) {
        tracing::debug!("Command {:?}", command);
        match command {
            Command::Open {
                display_name,
                reply,
            } => {
                if self.settings.role != PeerRole::Host {
                    let _ = reply.send(Err(ClientError::WrongRole("only a host opens sessions")));
                    return;
                }
                match self.create_session(display_name, None) {
                    Ok(id) => {
                        if let Some(entry) = self.sessions.get_mut(&id) {
                            entry.waiter = Some(Waiter::Offer(reply));
                            entry.tasks.submit(LinkOp::CreateOffer);
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Complete {
                session_id,
                answer,
                reply,
            } => {
                let result = if self.settings.role == PeerRole::Host {
                    self.apply_remote_answer(session_id, answer)
                } else {
                    Err(ClientError::WrongRole("only a host completes sessions"))
                };
                let _ = reply.send(result);
            }
            Command::Accept { offer, reply } => {
                if self.settings.role != PeerRole::Client {
                    let _ = reply.send(Err(ClientError::WrongRole("only a client accepts offers")));
                    return;
                }
                match self.accept_remote_offer(MANUAL_HOST_NAME.to_string(), None, offer) {
                    Ok(id) => {
                        if let Some(entry) = self.sessions.get_mut(&id) {
                            entry.waiter = Some(Waiter::Answer(reply));
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::SubmitCandidate {
                session_id,
                candidate,
                reply,
            } => {
                let _ = reply.send(self.route_remote_candidate(session_id, candidate));
            }
            Command::TakeLocalCandidates { session_id, reply } => {
                let result = if self.sessions.contains_key(&session_id) {
                    Ok(self.outbound.drain(&session_id))
                } else {
                    Err(ClientError::SessionNotFound(session_id))
                };
                let _ = reply.send(result);
            }
            Command::Send {
                session_id,
                payload,
                kind,
                reply,
            } => {
                let _ = reply.send(self.send_payload(session_id, &payload, kind));
            }
            Command::SendFrame {
                session_id,
                frame,
                reply,
            } => {
                let result = self
                    .connected_entry(session_id)
                    .and_then(|entry| transmit(entry, &frame));
                let _ = reply.send(result);
            }
            Command::Close { session_id, reply } => {
                let result = if self.sessions.contains_key(&session_id) {
                    self.drive(session_id, Event::CloseRequested);
                    Ok(())
                } else {
                    Err(ClientError::SessionNotFound(session_id))
                };
                let _ = reply.send(result);
            }
            Command::Sessions { reply } => {
                let _ = reply.send(self.snapshots());
            }
            Command::Foreground { reply } => {
                let _ = reply.send(self.on_foreground());
            }
            Command::Shutdown => {}
        }
    }

    fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<SessionSnapshot> = self
            .sessions
            .values()
            .map(|entry| SessionSnapshot {
                id: entry.session.id,
                display_name: entry.session.display_name.clone(),
                role: entry.session.role,
                status: entry.session.status.label(),
                relay_peer_id: entry.session.relay_peer_id.clone(),
                link_state: entry.session.link_state,
            })
            .collect();
        all.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        all
    }

    fn on_foreground(&mut self) -> Result<bool, ClientError> {
        if self.settings.role != PeerRole::Client {
            return Err(ClientError::WrongRole("foreground rejoin applies to clients"));
        }
        if self
            .sessions
            .values()
            .any(|entry| entry.session.status.is_connected())
        {
            return Ok(false);
        }
        if !self.rejoin_guard.try_begin(now()) {
            tracing::debug!("Rejoin already in flight");
            return Ok(false);
        }
        tracing::info!("Rejoining room {}", self.relay.room());
        self.announce(None)?;
        Ok(true)
    }

    fn send_payload(
        &self,
        session_id: SessionId,
        payload: &Value,
        kind: PayloadKind,
    ) -> Result<(), ClientError> {
        let entry = self.connected_entry(session_id)?;
        let frames = self.settings.chunker.frames(payload, kind)?;
        tracing::debug!(
            "Session {}: sending {} as {} frame(s)",
            session_id,
            kind.data_type,
            frames.len()
        );
        for frame in &frames {
            transmit(entry, frame)?;
        }
        Ok(())
    }

    fn connected_entry(&self, session_id: SessionId) -> Result<&SessionEntry, ClientError> {
        let entry = self
            .sessions
            .get(&session_id)
            .ok_or(ClientError::SessionNotFound(session_id))?;
        if !entry.session.status.is_connected() {
            return Err(ClientError::NotConnected(session_id));
        }
        Ok(entry)
    }

    // ----- sessions -----

    fn create_session(
        &mut self,
        display_name: String,
        relay_peer_id: Option<RelayPeerId>,
    ) -> Result<SessionId, ClientError> {
        let (link, link_events) = self.connector.create_link()?;
        let mut session = PeerSession::new(display_name, self.settings.role.opposite(), now());
        session.relay_peer_id = relay_peer_id;
        let id = session.id;

        let tasks = spawn_session_tasks(
            id,
            Arc::clone(&link),
            link_events,
            self.reports.clone(),
            self.settings.gather_timeout,
        );
        tracing::info!(
            "Session {} opened for '{}' (relay id {})",
            id,
            session.display_name,
            session
                .relay_peer_id
                .as_ref()
                .map(RelayPeerId::as_str)
                .unwrap_or("unknown")
        );

        self.sessions.insert(
            id,
            SessionEntry {
                session,
                negotiation: for_role(self.settings.role),
                link,
                tasks,
                reassembler: Reassembler::new(self.settings.max_chunks),
                local_description: None,
                description_sent: false,
                remote_offer: None,
                waiter: None,
            },
        );
        Ok(id)
    }

    fn session_for_relay(&self, relay_peer_id: &RelayPeerId) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|entry| entry.session.relay_peer_id.as_ref() == Some(relay_peer_id))
            .map(|entry| entry.session.id)
    }

    fn accept_remote_offer(
        &mut self,
        display_name: String,
        relay_peer_id: Option<RelayPeerId>,
        offer: HandshakeOffer,
    ) -> Result<SessionId, ClientError> {
        let id = self.create_session(display_name, relay_peer_id)?;
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry
                .negotiation
                .on_remote(&RemoteDescription::Offer(offer.clone()))?;
            entry.remote_offer = Some(offer.clone());
            entry.tasks.submit(LinkOp::AcceptOffer(offer));
        }
        self.apply_buffered_inbound(id);
        Ok(id)
    }

    fn apply_remote_answer(
        &mut self,
        session_id: SessionId,
        answer: HandshakeAnswer,
    ) -> Result<(), ClientError> {
        let entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or(ClientError::SessionNotFound(session_id))?;
        entry
            .negotiation
            .on_remote(&RemoteDescription::Answer(answer.clone()))?;
        entry.tasks.submit(LinkOp::ApplyAnswer(answer));
        self.apply_buffered_inbound(session_id);
        Ok(())
    }

    fn route_remote_candidate(
        &mut self,
        session_id: SessionId,
        candidate: Candidate,
    ) -> Result<(), ClientError> {
        let entry = self
            .sessions
            .get(&session_id)
            .ok_or(ClientError::SessionNotFound(session_id))?;
        if entry.negotiation.remote_described() {
            entry.tasks.submit(LinkOp::AddCandidate(candidate));
        } else if let Err(e) = self.inbound.push(session_id, candidate, now()) {
            tracing::warn!("Session {}: remote candidate dropped: {}", session_id, e);
        }
        Ok(())
    }

    /// Queue every buffered remote candidate behind the remote description.
    fn apply_buffered_inbound(&mut self, session_id: SessionId) {
        let Some(entry) = self.sessions.get(&session_id) else {
            return;
        };
        let mut candidates = Vec::new();
        if let Some(relay_peer_id) = &entry.session.relay_peer_id {
            candidates.extend(
                self.pre_session
                    .drain(&(entry.session.role, relay_peer_id.clone())),
            );
        }
        candidates.extend(self.inbound.drain(&session_id));
        if candidates.is_empty() {
            return;
        }
        tracing::debug!(
            "Session {}: applying {} buffered candidate(s)",
            session_id,
            candidates.len()
        );
        for candidate in candidates {
            entry.tasks.submit(LinkOp::AddCandidate(candidate));
        }
    }

    /// Send the local description over the relay once both it and the
    /// route exist, then release queued local candidates.
    fn send_local_description(&mut self, session_id: SessionId) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if entry.description_sent {
            return;
        }
        let (Some(target), Some(description)) = (
            entry.session.relay_peer_id.clone(),
            entry.local_description.clone(),
        ) else {
            return;
        };

        let message = entry
            .negotiation
            .describe(self.relay.local_id().clone(), description);
        match self.relay.send(Some(&target), message) {
            Ok(()) => {
                entry.description_sent = true;
                tracing::debug!("Session {}: local description sent to {}", session_id, target);
                self.flush_outbound(session_id);
            }
            Err(e) => tracing::warn!(
                "Session {}: failed to send local description: {}",
                session_id,
                e
            ),
        }
    }

    fn flush_outbound(&mut self, session_id: SessionId) {
        let Some(entry) = self.sessions.get(&session_id) else {
            return;
        };
        let Some(target) = entry.session.relay_peer_id.clone() else {
            return;
        };
        if !entry.description_sent {
            return;
        }
        for candidate in self.outbound.drain(&session_id) {
            let message = RelayMessage::candidate(self.relay.local_id().clone(), candidate);
            if let Err(e) = self.relay.send(Some(&target), message) {
                tracing::warn!("Session {}: failed to send candidate: {}", session_id, e);
            }
        }
    }

    /// Feed one event through a session's state machine and act on it.
    fn drive(&mut self, session_id: SessionId, event: Event) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let actions = entry.session.apply(event, &self.settings.timers);
        for action in actions {
            self.perform(session_id, action);
        }
    }

    fn perform(&mut self, session_id: SessionId, action: Action) {
        match action {
            Action::DrainCandidates => {
                self.apply_buffered_inbound(session_id);
                self.flush_outbound(session_id);
            }
            Action::EmitConnected => {
                let Some(entry) = self.sessions.get(&session_id) else {
                    return;
                };
                let display_name = entry.session.display_name.clone();
                tracing::info!("Session {} connected to '{}'", session_id, display_name);
                self.rejoin_guard.observe_connected();
                self.emit(SessionEvent::Connected {
                    session_id,
                    display_name,
                });
            }
            Action::EmitReconnected => {
                tracing::info!("Session {} reconnected", session_id);
                self.rejoin_guard.observe_connected();
                self.emit(SessionEvent::Reconnected { session_id });
            }
            Action::EmitDisconnected => {
                tracing::info!(
                    "Session {} lost its link, holding for {:?}",
                    session_id,
                    self.settings.timers.grace
                );
                self.emit(SessionEvent::Disconnected { session_id });
            }
            Action::SendGoodbye => {
                if let Some(entry) = self.sessions.get(&session_id) {
                    if let Err(e) = transmit(entry, &Frame::Disconnected) {
                        tracing::debug!("Session {}: goodbye not sent: {}", session_id, e);
                    }
                }
            }
            Action::TearDown(reason) => self.tear_down(session_id, reason),
        }
    }

    /// Close the link, drop buffers and transfers, remove the session.
    fn tear_down(&mut self, session_id: SessionId, reason: TearDownReason) {
        let Some(entry) = self.sessions.remove(&session_id) else {
            return;
        };
        let SessionEntry {
            session,
            link,
            tasks,
            mut reassembler,
            waiter,
            ..
        } = entry;

        tasks.abort();
        link.close();

        let mut candidates = self.inbound.discard(&session_id) + self.outbound.discard(&session_id);
        if let Some(relay_peer_id) = session.relay_peer_id {
            candidates += self.pre_session.discard(&(session.role, relay_peer_id));
        }
        let transfers = reassembler.in_flight();
        reassembler.clear();
        if let Some(waiter) = waiter {
            waiter.fail(ClientError::SessionNotFound(session_id));
        }

        tracing::info!(
            "Session {} removed ({}); dropped {} candidate(s), {} transfer(s)",
            session_id,
            reason,
            candidates,
            transfers
        );
        self.emit(SessionEvent::Removed { session_id, reason });
    }

    fn on_tick(&mut self) {
        let now = now();
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.drive(id, Event::Tick { now });
        }
        for (role, peer) in self
            .pre_session
            .purge_older_than(now, self.settings.timers.stale_after)
        {
            tracing::warn!(
                "Discarded early candidates from {:?} {}: no session followed",
                role,
                peer
            );
        }
    }

    // ----- task reports -----

    fn handle_report(&mut self, report: TaskReport) {
        match report {
            TaskReport::Link { session_id, event } => self.on_link_event(session_id, event),
            TaskReport::LocalDescription { session_id, result } => {
                self.on_local_description(session_id, result)
            }
        }
    }

    fn on_local_description(&mut self, session_id: SessionId, result: Result<String, TransportError>) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            tracing::debug!("Description for removed session {} ignored", session_id);
            return;
        };
        match result {
            Ok(description) => {
                entry.local_description = Some(description.clone());
                if let Some(waiter) = entry.waiter.take() {
                    waiter.succeed(session_id, description);
                }
                self.send_local_description(session_id);
            }
            Err(e) => {
                tracing::warn!("Session {}: handshake failed: {}", session_id, e);
                if let Some(waiter) = entry.waiter.take() {
                    waiter.fail(ClientError::Transport(e));
                }
            }
        }
    }

    fn on_link_event(&mut self, session_id: SessionId, event: LinkEvent) {
        if !self.sessions.contains_key(&session_id) {
            tracing::debug!("Link event for removed session {} ignored", session_id);
            return;
        }
        match event {
            LinkEvent::LocalCandidate(candidate) => self.on_local_candidate(session_id, candidate),
            LinkEvent::StateChanged(state) => {
                if let Some(entry) = self.sessions.get_mut(&session_id) {
                    entry.session.link_state = state;
                }
                tracing::debug!("Session {}: link {:?}", session_id, state);
                match state {
                    LinkState::Connected => self.drive(session_id, Event::LinkRecovered),
                    LinkState::Disconnected | LinkState::Failed | LinkState::Closed => {
                        self.drive(session_id, Event::LinkLost { now: now() })
                    }
                    LinkState::New | LinkState::Connecting => {}
                }
            }
            LinkEvent::ChannelOpen => self.drive(session_id, Event::ChannelOpened),
            LinkEvent::ChannelClosed => self.drive(session_id, Event::LinkLost { now: now() }),
            LinkEvent::Message(bytes) => self.on_frame(session_id, &bytes),
        }
    }

    fn on_local_candidate(&mut self, session_id: SessionId, candidate: Candidate) {
        let Some(entry) = self.sessions.get(&session_id) else {
            return;
        };
        match (&entry.session.relay_peer_id, entry.description_sent) {
            (Some(target), true) => {
                let message = RelayMessage::candidate(self.relay.local_id().clone(), candidate);
                if let Err(e) = self.relay.send(Some(target), message) {
                    tracing::warn!("Session {}: failed to send candidate: {}", session_id, e);
                }
            }
            _ => {
                if let Err(e) = self.outbound.push(session_id, candidate, now()) {
                    tracing::warn!("Session {}: local candidate dropped: {}", session_id, e);
                }
            }
        }
    }

    fn on_frame(&mut self, session_id: SessionId, bytes: &[u8]) {
        let frame = match Frame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Session {}: malformed frame dropped: {}", session_id, e);
                return;
            }
        };
        tracing::debug!("Session {}: received {} frame", session_id, frame.kind_name());

        match frame {
            Frame::RequestData(request) => self.emit(SessionEvent::DataRequested {
                session_id,
                data_type: request.data_type,
                filters: request.filters.unwrap_or_default(),
            }),
            Frame::PushData(push) => self.emit(SessionEvent::Payload {
                session_id,
                kind: PayloadKind::push(push.data_type),
                data: push.data,
            }),
            Frame::Complete(complete) => self.emit(SessionEvent::Payload {
                session_id,
                kind: PayloadKind::response(complete.data_type),
                data: complete.data,
            }),
            Frame::Chunk(chunk) => self.on_chunk(session_id, chunk),
            Frame::RequestDeclined => self.emit(SessionEvent::RequestDeclined { session_id }),
            Frame::PushDeclined(declined) => self.emit(SessionEvent::PushDeclined {
                session_id,
                data_type: declined.data_type,
            }),
            Frame::Disconnected => self.drive(session_id, Event::RemoteGoodbye),
            Frame::Unknown => {
                tracing::debug!("Session {}: unknown frame type ignored", session_id)
            }
        }
    }

    fn on_chunk(&mut self, session_id: SessionId, chunk: sync_types::Chunk) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };
        match entry.reassembler.accept(chunk) {
            Ok(Some(done)) => {
                tracing::debug!(
                    "Session {}: transfer {} complete",
                    session_id,
                    done.transfer_id
                );
                self.emit(SessionEvent::Payload {
                    session_id,
                    kind: done.kind,
                    data: done.payload,
                });
            }
            Ok(None) => {}
            Err(e) => match e.discarded_kind() {
                Some(kind) => {
                    tracing::error!("Session {}: {}", session_id, e);
                    self.emit(SessionEvent::TransferFailed {
                        session_id,
                        kind,
                        error: e.to_string(),
                    });
                }
                None => tracing::warn!("Session {}: chunk dropped: {}", session_id, e),
            },
        }
    }

    // ----- relay -----

    async fn handle_relay(&mut self, message: RelayMessage) {
        if message.sender() == Some(self.relay.local_id()) {
            return;
        }
        match message {
            RelayMessage::Join(join) => self.on_join(join),
            RelayMessage::Offer(describe) => {
                self.on_offer(describe.peer_id, HandshakeOffer(describe.data))
                    .await
            }
            RelayMessage::Answer(describe) => {
                self.on_answer(describe.peer_id, HandshakeAnswer(describe.data))
            }
            RelayMessage::IceCandidate(signal) => {
                self.on_remote_candidate(signal.peer_id, signal.data)
            }
            RelayMessage::Unknown => tracing::debug!("Unknown relay message ignored"),
        }
    }

    fn announce(&self, target: Option<&RelayPeerId>) -> Result<(), ClientError> {
        let message = RelayMessage::join(
            self.settings.role,
            self.relay.local_id().clone(),
            self.settings.peer_name.clone(),
        );
        self.relay.send(target, message)?;
        Ok(())
    }

    fn on_join(&mut self, join: Join) {
        self.peer_names
            .insert(join.peer_id.clone(), join.peer_name.clone());
        match (self.settings.role, join.role) {
            (PeerRole::Host, PeerRole::Client) => self.host_on_client_join(join),
            (PeerRole::Client, PeerRole::Host) => {
                if self.has_live_session() {
                    tracing::debug!("Host {} joined, session already live", join.peer_id);
                } else if let Err(e) = self.announce(Some(&join.peer_id)) {
                    tracing::warn!("Failed to answer host join: {}", e);
                }
            }
            (local, remote) => {
                tracing::debug!("Ignoring join from {:?} {} as {:?}", remote, join.peer_id, local)
            }
        }
    }

    fn has_live_session(&self) -> bool {
        let now = now();
        self.sessions.values().any(|entry| {
            entry.session.join_disposition(now, &self.settings.timers) == JoinDisposition::Ignore
        })
    }

    fn host_on_client_join(&mut self, join: Join) {
        let now = now();
        if let Some(id) = self.session_for_relay(&join.peer_id) {
            let disposition = match self.sessions.get(&id) {
                Some(entry) => entry.session.join_disposition(now, &self.settings.timers),
                None => JoinDisposition::Replace,
            };
            match disposition {
                JoinDisposition::Ignore => {
                    tracing::debug!("Duplicate join from {} ignored", join.peer_id);
                    return;
                }
                JoinDisposition::Replace => {
                    tracing::info!("Replacing session {} for {}", id, join.peer_id);
                    self.tear_down(id, TearDownReason::Replaced);
                }
            }
        }

        let waiting = self.sessions.values_mut().find(|entry| {
            entry.session.relay_peer_id.is_none()
                && entry.session.display_name == join.peer_name
                && entry.session.status.pending_since().is_some()
                && !entry.session.is_stale(now, &self.settings.timers)
        });
        if let Some(entry) = waiting {
            entry.session.relay_peer_id = Some(join.peer_id.clone());
            let id = entry.session.id;
            tracing::info!("Session {} bound to relay id {}", id, join.peer_id);
            self.send_local_description(id);
            return;
        }

        match self.create_session(join.peer_name, Some(join.peer_id)) {
            Ok(id) => {
                if let Some(entry) = self.sessions.get(&id) {
                    entry.tasks.submit(LinkOp::CreateOffer);
                }
            }
            Err(e) => tracing::warn!("Could not open session: {}", e),
        }
    }

    async fn on_offer(&mut self, from: RelayPeerId, offer: HandshakeOffer) {
        if self.settings.role != PeerRole::Client {
            tracing::warn!("Offer from {} dropped: this device is the host", from);
            return;
        }
        if let Some(id) = self.session_for_relay(&from) {
            let duplicate = self.sessions.get(&id).is_some_and(|entry| {
                entry.remote_offer.as_ref() == Some(&offer)
                    && entry.session.join_disposition(now(), &self.settings.timers)
                        == JoinDisposition::Ignore
            });
            if duplicate {
                tracing::debug!("Duplicate offer from {} ignored", from);
                return;
            }
            self.tear_down(id, TearDownReason::Replaced);
        } else if self.is_last_offer(&offer) {
            // Its session is gone, possibly with a previous run.
            tracing::debug!("Offer from {} was already answered, ignored", from);
            return;
        }

        let display_name = self
            .peer_names
            .get(&from)
            .cloned()
            .unwrap_or_else(|| from.to_string());
        if let Err(e) = self.accept_remote_offer(display_name, Some(from), offer.clone()) {
            tracing::warn!("Could not accept offer: {}", e);
            return;
        }
        self.remember_offer(offer).await;
    }

    fn on_answer(&mut self, from: RelayPeerId, answer: HandshakeAnswer) {
        let Some(id) = self.session_for_relay(&from) else {
            tracing::warn!("Answer from {} has no session, dropped", from);
            return;
        };
        if let Err(e) = self.apply_remote_answer(id, answer) {
            tracing::warn!("Session {}: answer rejected: {}", id, e);
        }
    }

    fn on_remote_candidate(&mut self, from: RelayPeerId, candidate: Candidate) {
        match self.session_for_relay(&from) {
            Some(id) => {
                if let Err(e) = self.route_remote_candidate(id, candidate) {
                    tracing::warn!("Candidate from {} discarded: {}", from, e);
                }
            }
            None if self.settings.role == PeerRole::Client => {
                // The offer may still be on its way.
                if let Err(e) = self
                    .pre_session
                    .push((PeerRole::Host, from.clone()), candidate, now())
                {
                    tracing::warn!("Early candidate from {} discarded: {}", from, e);
                }
            }
            None => tracing::warn!("Candidate from {} has no session, discarded", from),
        }
    }

    // ----- rejoin state -----

    async fn load_rejoin_state(&mut self) {
        let Some(file) = &self.settings.rejoin_file else {
            return;
        };
        match file.load().await {
            Ok(Some(state))
                if &state.room == self.relay.room() && state.peer_name == self.settings.peer_name =>
            {
                tracing::debug!("Loaded rejoin state from {}", file.path().display());
                self.rejoin_state = Some(state);
            }
            Ok(Some(state)) => tracing::debug!(
                "Saved state is for '{}' in room {}, starting fresh",
                state.peer_name,
                state.room
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!("Ignoring rejoin state: {}", e),
        }
    }

    fn is_last_offer(&self, offer: &HandshakeOffer) -> bool {
        self.rejoin_state
            .as_ref()
            .and_then(|state| state.last_offer.as_ref())
            == Some(offer)
    }

    async fn remember_offer(&mut self, offer: HandshakeOffer) {
        let Some(file) = &self.settings.rejoin_file else {
            return;
        };
        let state = self.rejoin_state.get_or_insert_with(|| {
            RejoinState::new(self.relay.room().clone(), self.settings.peer_name.clone())
        });
        state.last_offer = Some(offer);
        if let Err(e) = file.save(state).await {
            tracing::warn!("Failed to save rejoin state: {}", e);
        }
    }
}

fn transmit(entry: &SessionEntry, frame: &Frame) -> Result<(), ClientError> {
    let bytes = frame.to_bytes()?;
    entry.link.send(&bytes)?;
    Ok(())
}
