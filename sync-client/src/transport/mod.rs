//! Peer link abstraction for scoutsync.
//!
//! This module abstracts the point-to-point connection between two devices
//! (a browser-style peer connection with one data channel, or the
//! in-memory loopback for testing).
//!
//! # Design
//!
//! A link is created synchronously by a [`PeerConnector`] and hands back
//! a receiver of [`LinkEvent`]s. Callback wiring is replaced by that
//! channel: the owner forwards events to its processing loop in order.
//!
//! - `create_offer()` / `accept_offer()` / `apply_answer()` run the handshake
//! - `add_candidate()` applies a remote network-path candidate
//! - `send()` transmits one frame, failing fast if the channel is not open
//! - `close()` tears the link down
//!
//! # Example
//!
//! ```ignore
//! let connector = LoopbackConnector::new();
//! let (host, host_events) = connector.create_link()?;
//! let offer = host.create_offer().await?;
//! ```

mod loopback;

pub use loopback::{LoopbackConnector, LoopbackLink};

use async_trait::async_trait;
use std::sync::Arc;
use sync_core::LinkState;
use sync_types::Candidate;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The link could not be created.
    #[error("link creation failed: {0}")]
    CreateFailed(String),

    /// Generating or applying a session description failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A candidate could not be applied.
    #[error("candidate rejected: {0}")]
    CandidateRejected(String),

    /// The data channel is not open.
    #[error("not connected")]
    NotConnected,

    /// The link was closed.
    #[error("link closed")]
    Closed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Events raised by a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A local network-path candidate was discovered.
    LocalCandidate(Candidate),
    /// The link's transport state changed.
    StateChanged(LinkState),
    /// The data channel opened.
    ChannelOpen,
    /// The data channel closed.
    ChannelClosed,
    /// A frame arrived on the data channel.
    Message(Vec<u8>),
}

/// One point-to-point link with a single data channel.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Generate the local offer (host side).
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Apply a remote offer and generate the answer (client side).
    async fn accept_offer(&self, offer: &str) -> Result<String, TransportError>;

    /// Apply the remote answer (host side).
    async fn apply_answer(&self, answer: &str) -> Result<(), TransportError>;

    /// Apply a remote candidate.
    ///
    /// Fails if no remote description has been applied yet.
    async fn add_candidate(&self, candidate: &Candidate) -> Result<(), TransportError>;

    /// Resolves once local candidate discovery has settled.
    ///
    /// Callers bound the wait themselves; discovery may never settle.
    async fn gathering_complete(&self);

    /// Current transport state.
    fn state(&self) -> LinkState;

    /// Send one frame over the data channel.
    ///
    /// Never blocks: returns [`TransportError::NotConnected`] if the
    /// channel is not open.
    fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the link.
    fn close(&self);
}

/// Factory for links.
pub trait PeerConnector: Send + Sync {
    /// Create a fresh link and the receiver of its events.
    fn create_link(
        &self,
    ) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>), TransportError>;
}
