//! In-memory loopback links for testing.
//!
//! A [`LoopbackConnector`] is a switchboard: every link it creates lives in
//! one shared table, an offer names the link that made it, and accepting
//! the offer pairs the two. As with a real peer connection, the channel
//! opens only once both sides hold a remote description and have applied
//! at least one remote candidate, so candidate buffering bugs surface here.
//!
//! Failure injection follows the mock-transport pattern: `fail_next_*`
//! knobs, plus `fail()`/`recover()` on a link and held gathering.

use super::{LinkEvent, PeerConnector, PeerLink, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use sync_core::LinkState;
use sync_types::Candidate;
use tokio::sync::{mpsc, watch};

const OFFER_PREFIX: &str = "loopback-offer:";
const ANSWER_PREFIX: &str = "loopback-answer:";

#[derive(Debug)]
struct LinkSlot {
    state: LinkState,
    open: bool,
    remote_described: bool,
    peer: Option<u64>,
    applied: Vec<Candidate>,
    events: mpsc::UnboundedSender<LinkEvent>,
    gathered: watch::Sender<bool>,
}

impl LinkSlot {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            self.state = state;
            self.emit(LinkEvent::StateChanged(state));
        }
    }
}

#[derive(Debug)]
struct Switchboard {
    next_id: u64,
    links: HashMap<u64, LinkSlot>,
    hold_gathering: bool,
    candidates_per_link: usize,
    fail_next_create: Option<String>,
    fail_next_offer: Option<String>,
}

impl Default for Switchboard {
    fn default() -> Self {
        Self {
            next_id: 1,
            links: HashMap::new(),
            hold_gathering: false,
            candidates_per_link: 2,
            fail_next_create: None,
            fail_next_offer: None,
        }
    }
}

impl Switchboard {
    fn gather(&mut self, id: u64) {
        let count = self.candidates_per_link;
        let hold = self.hold_gathering;
        if let Some(slot) = self.links.get(&id) {
            for n in 0..count {
                slot.emit(LinkEvent::LocalCandidate(Candidate {
                    candidate: format!(
                        "candidate:{}{} 1 udp 2122260223 127.0.0.1 {} typ host",
                        id,
                        n,
                        40000 + id * 10 + n as u64
                    ),
                    sdp_mid: Some("0".into()),
                    sdp_m_line_index: Some(0),
                }));
            }
            if !hold {
                slot.gathered.send_replace(true);
            }
        }
    }

    fn ready(&self, id: u64) -> Option<u64> {
        let slot = self.links.get(&id)?;
        let peer_id = slot.peer?;
        let peer = self.links.get(&peer_id)?;
        let both_ready = [slot, peer].iter().all(|s| {
            s.remote_described && !s.applied.is_empty() && !s.open && !s.state.is_broken()
        });
        both_ready.then_some(peer_id)
    }

    fn try_open(&mut self, id: u64) {
        let Some(peer_id) = self.ready(id) else {
            return;
        };
        for link_id in [id, peer_id] {
            if let Some(slot) = self.links.get_mut(&link_id) {
                slot.open = true;
                slot.set_state(LinkState::Connected);
                slot.emit(LinkEvent::ChannelOpen);
            }
        }
    }

    fn pair_of(&self, id: u64) -> Vec<u64> {
        let mut ids = vec![id];
        if let Some(peer) = self.links.get(&id).and_then(|s| s.peer) {
            ids.push(peer);
        }
        ids
    }
}

fn parse_id(description: &str, prefix: &str) -> Result<u64, TransportError> {
    description
        .strip_prefix(prefix)
        .and_then(|rest| rest.parse().ok())
        .ok_or_else(|| {
            TransportError::HandshakeFailed(format!("unrecognized description {:?}", description))
        })
}

/// Switchboard creating paired in-memory links.
#[derive(Debug, Clone, Default)]
pub struct LoopbackConnector {
    board: Arc<Mutex<Switchboard>>,
}

impl LoopbackConnector {
    /// Create an empty switchboard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of local candidates each link discovers (default 2).
    pub fn set_candidates_per_link(&self, count: usize) {
        self.board.lock().unwrap().candidates_per_link = count;
    }

    /// Keep gathering unsettled on links that gather from now on.
    pub fn hold_gathering(&self) {
        self.board.lock().unwrap().hold_gathering = true;
    }

    /// Settle gathering on every link.
    pub fn release_gathering(&self) {
        let mut board = self.board.lock().unwrap();
        board.hold_gathering = false;
        for slot in board.links.values() {
            slot.gathered.send_replace(true);
        }
    }

    /// Cause the next `create_link()` to fail with the given error.
    pub fn fail_next_create(&self, error: &str) {
        self.board.lock().unwrap().fail_next_create = Some(error.to_string());
    }

    /// Cause the next `create_offer()` on any link to fail.
    pub fn fail_next_offer(&self, error: &str) {
        self.board.lock().unwrap().fail_next_offer = Some(error.to_string());
    }

    /// Every link created so far, oldest first.
    pub fn links(&self) -> Vec<LoopbackLink> {
        let board = self.board.lock().unwrap();
        let mut ids: Vec<u64> = board.links.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .map(|id| LoopbackLink {
                id,
                board: Arc::clone(&self.board),
            })
            .collect()
    }

    /// Links whose data channel is currently open.
    pub fn open_links(&self) -> Vec<LoopbackLink> {
        self.links().into_iter().filter(|l| l.is_open()).collect()
    }
}

impl PeerConnector for LoopbackConnector {
    fn create_link(
        &self,
    ) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>), TransportError> {
        let mut board = self.board.lock().unwrap();
        if let Some(error) = board.fail_next_create.take() {
            return Err(TransportError::CreateFailed(error));
        }

        let id = board.next_id;
        board.next_id += 1;
        let (events, rx) = mpsc::unbounded_channel();
        let (gathered, _) = watch::channel(false);
        board.links.insert(
            id,
            LinkSlot {
                state: LinkState::New,
                open: false,
                remote_described: false,
                peer: None,
                applied: Vec::new(),
                events,
                gathered,
            },
        );

        let link = LoopbackLink {
            id,
            board: Arc::clone(&self.board),
        };
        Ok((Arc::new(link), rx))
    }
}

/// One in-memory link.
#[derive(Debug, Clone)]
pub struct LoopbackLink {
    id: u64,
    board: Arc<Mutex<Switchboard>>,
}

impl LoopbackLink {
    /// Switchboard id of this link.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Switchboard id of the paired link, once paired.
    pub fn peer_id(&self) -> Option<u64> {
        self.board
            .lock()
            .unwrap()
            .links
            .get(&self.id)
            .and_then(|s| s.peer)
    }

    /// Whether the data channel is open.
    pub fn is_open(&self) -> bool {
        self.board
            .lock()
            .unwrap()
            .links
            .get(&self.id)
            .is_some_and(|s| s.open && s.state == LinkState::Connected)
    }

    /// Remote candidates applied so far, in order.
    pub fn applied_candidates(&self) -> Vec<Candidate> {
        self.board
            .lock()
            .unwrap()
            .links
            .get(&self.id)
            .map(|s| s.applied.clone())
            .unwrap_or_default()
    }

    /// Drop the network path on both ends; sends fail until `recover()`.
    pub fn fail(&self) {
        let mut board = self.board.lock().unwrap();
        for id in board.pair_of(self.id) {
            if let Some(slot) = board.links.get_mut(&id) {
                if slot.state != LinkState::Closed {
                    slot.set_state(LinkState::Disconnected);
                }
            }
        }
    }

    /// Restore a path lost by `fail()`.
    pub fn recover(&self) {
        let mut board = self.board.lock().unwrap();
        for id in board.pair_of(self.id) {
            if let Some(slot) = board.links.get_mut(&id) {
                if slot.state == LinkState::Disconnected && slot.open {
                    slot.set_state(LinkState::Connected);
                }
            }
        }
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let mut board = self.board.lock().unwrap();
        if let Some(error) = board.fail_next_offer.take() {
            return Err(TransportError::HandshakeFailed(error));
        }
        let slot = board.links.get_mut(&self.id).ok_or(TransportError::Closed)?;
        if slot.state == LinkState::Closed {
            return Err(TransportError::Closed);
        }
        slot.set_state(LinkState::Connecting);
        board.gather(self.id);
        Ok(format!("{}{}", OFFER_PREFIX, self.id))
    }

    async fn accept_offer(&self, offer: &str) -> Result<String, TransportError> {
        let target = parse_id(offer, OFFER_PREFIX)?;
        let mut board = self.board.lock().unwrap();

        match board.links.get(&target) {
            Some(slot) if slot.state != LinkState::Closed && slot.peer.is_none() => {}
            _ => {
                return Err(TransportError::HandshakeFailed(format!(
                    "offer {} is no longer available",
                    target
                )))
            }
        }

        let slot = board.links.get_mut(&self.id).ok_or(TransportError::Closed)?;
        if slot.state == LinkState::Closed {
            return Err(TransportError::Closed);
        }
        slot.peer = Some(target);
        slot.remote_described = true;
        slot.set_state(LinkState::Connecting);
        if let Some(host) = board.links.get_mut(&target) {
            host.peer = Some(self.id);
        }

        board.gather(self.id);
        board.try_open(self.id);
        Ok(format!("{}{}", ANSWER_PREFIX, self.id))
    }

    async fn apply_answer(&self, answer: &str) -> Result<(), TransportError> {
        let from = parse_id(answer, ANSWER_PREFIX)?;
        let mut board = self.board.lock().unwrap();
        let slot = board.links.get_mut(&self.id).ok_or(TransportError::Closed)?;
        if slot.peer != Some(from) {
            return Err(TransportError::HandshakeFailed(format!(
                "answer from unexpected link {}",
                from
            )));
        }
        slot.remote_described = true;
        board.try_open(self.id);
        Ok(())
    }

    async fn add_candidate(&self, candidate: &Candidate) -> Result<(), TransportError> {
        let mut board = self.board.lock().unwrap();
        let slot = board.links.get_mut(&self.id).ok_or(TransportError::Closed)?;
        if slot.state == LinkState::Closed {
            return Err(TransportError::Closed);
        }
        if !slot.remote_described {
            return Err(TransportError::CandidateRejected(
                "no remote description".into(),
            ));
        }
        slot.applied.push(candidate.clone());
        board.try_open(self.id);
        Ok(())
    }

    async fn gathering_complete(&self) {
        let rx = {
            let board = self.board.lock().unwrap();
            board.links.get(&self.id).map(|s| s.gathered.subscribe())
        };
        if let Some(mut rx) = rx {
            let _ = rx.wait_for(|done| *done).await;
        }
    }

    fn state(&self) -> LinkState {
        self.board
            .lock()
            .unwrap()
            .links
            .get(&self.id)
            .map(|s| s.state)
            .unwrap_or(LinkState::Closed)
    }

    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let board = self.board.lock().unwrap();
        let slot = board.links.get(&self.id).ok_or(TransportError::Closed)?;
        if !slot.open || slot.state != LinkState::Connected {
            return Err(TransportError::NotConnected);
        }
        let peer = slot
            .peer
            .and_then(|p| board.links.get(&p))
            .ok_or(TransportError::NotConnected)?;
        if !peer.open {
            return Err(TransportError::NotConnected);
        }
        peer.emit(LinkEvent::Message(data.to_vec()));
        Ok(())
    }

    fn close(&self) {
        let mut board = self.board.lock().unwrap();
        let Some(slot) = board.links.get_mut(&self.id) else {
            return;
        };
        if slot.state == LinkState::Closed {
            return;
        }
        let was_open = slot.open;
        slot.open = false;
        slot.set_state(LinkState::Closed);
        slot.gathered.send_replace(true);
        let peer = slot.peer;

        if let Some(peer) = peer.and_then(|p| board.links.get_mut(&p)) {
            if was_open && peer.open {
                peer.open = false;
                peer.emit(LinkEvent::ChannelClosed);
            }
            if peer.state != LinkState::Closed {
                peer.set_state(LinkState::Disconnected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain_candidates(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<Candidate> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LinkEvent::LocalCandidate(c) = event {
                out.push(c);
            }
        }
        out
    }

    async fn open_pair(
        connector: &LoopbackConnector,
    ) -> (
        Arc<dyn PeerLink>,
        mpsc::UnboundedReceiver<LinkEvent>,
        Arc<dyn PeerLink>,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (host, mut host_rx) = connector.create_link().unwrap();
        let (client, mut client_rx) = connector.create_link().unwrap();

        let offer = host.create_offer().await.unwrap();
        let answer = client.accept_offer(&offer).await.unwrap();
        host.apply_answer(&answer).await.unwrap();

        for c in drain_candidates(&mut host_rx).await {
            client.add_candidate(&c).await.unwrap();
        }
        for c in drain_candidates(&mut client_rx).await {
            host.add_candidate(&c).await.unwrap();
        }
        (host, host_rx, client, client_rx)
    }

    #[tokio::test]
    async fn handshake_and_candidates_open_channel() {
        let connector = LoopbackConnector::new();
        let (host, _hrx, client, mut client_rx) = open_pair(&connector).await;

        assert_eq!(host.state(), LinkState::Connected);
        assert_eq!(client.state(), LinkState::Connected);
        assert_eq!(connector.open_links().len(), 2);

        host.send(b"hi").unwrap();
        let mut got = None;
        while let Ok(event) = client_rx.try_recv() {
            if let LinkEvent::Message(m) = event {
                got = Some(m);
            }
        }
        assert_eq!(got.as_deref(), Some(&b"hi"[..]));
    }

    #[tokio::test]
    async fn candidate_before_description_is_rejected() {
        let connector = LoopbackConnector::new();
        let (link, _rx) = connector.create_link().unwrap();
        let result = link.add_candidate(&Candidate::new("candidate:x")).await;
        assert!(matches!(result, Err(TransportError::CandidateRejected(_))));
    }

    #[tokio::test]
    async fn send_before_open_fails_fast() {
        let connector = LoopbackConnector::new();
        let (link, _rx) = connector.create_link().unwrap();
        assert_eq!(link.send(b"x"), Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn fail_and_recover_toggle_state_on_both_ends() {
        let connector = LoopbackConnector::new();
        let (host, _hrx, client, _crx) = open_pair(&connector).await;

        connector.links()[0].fail();
        assert_eq!(host.state(), LinkState::Disconnected);
        assert_eq!(client.state(), LinkState::Disconnected);
        assert_eq!(host.send(b"x"), Err(TransportError::NotConnected));

        connector.links()[1].recover();
        assert_eq!(host.state(), LinkState::Connected);
        host.send(b"x").unwrap();
    }

    #[tokio::test]
    async fn close_notifies_peer() {
        let connector = LoopbackConnector::new();
        let (host, _hrx, client, mut client_rx) = open_pair(&connector).await;
        while client_rx.try_recv().is_ok() {}

        host.close();
        assert_eq!(host.state(), LinkState::Closed);
        assert_eq!(client.state(), LinkState::Disconnected);
        assert_eq!(client_rx.try_recv().unwrap(), LinkEvent::ChannelClosed);
    }

    #[tokio::test]
    async fn offer_cannot_be_accepted_twice() {
        let connector = LoopbackConnector::new();
        let (host, _hrx) = connector.create_link().unwrap();
        let (a, _arx) = connector.create_link().unwrap();
        let (b, _brx) = connector.create_link().unwrap();

        let offer = host.create_offer().await.unwrap();
        a.accept_offer(&offer).await.unwrap();
        assert!(b.accept_offer(&offer).await.is_err());
        assert!(b.accept_offer("garbage").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn held_gathering_never_settles_until_released() {
        let connector = LoopbackConnector::new();
        connector.hold_gathering();
        let (link, _rx) = connector.create_link().unwrap();
        link.create_offer().await.unwrap();

        let waited = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            link.gathering_complete(),
        )
        .await;
        assert!(waited.is_err());

        connector.release_gathering();
        link.gathering_complete().await;
    }

    #[tokio::test]
    async fn fail_next_offer_injects_error() {
        let connector = LoopbackConnector::new();
        connector.fail_next_offer("boom");
        let (link, _rx) = connector.create_link().unwrap();
        assert!(matches!(
            link.create_offer().await,
            Err(TransportError::HandshakeFailed(e)) if e == "boom"
        ));
        assert!(link.create_offer().await.is_ok());
    }
}
