//! # sync-types
//!
//! Wire format types for scoutsync peer-to-peer record sync.
//!
//! This crate provides the foundational types used across all scoutsync crates:
//! - [`SessionId`], [`TransferId`], [`RelayPeerId`], [`RoomCode`] - Identity types
//! - [`RelayMessage`] - Control messages exchanged through the rendezvous relay
//! - [`Frame`] - Data-channel frames (requests, pushes, chunked payloads)
//! - [`ScoutingRecord`], [`CompositeKey`] - The record model being synced
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod frames;
mod ids;
mod record;
mod relay;

pub use error::SyncError;
pub use frames::{
    Chunk, Complete, DataFilters, DataType, Frame, PayloadKind, PushData, PushDeclined,
    RequestData,
};
pub use ids::{RelayPeerId, RoomCode, SessionId, TransferId};
pub use record::{CompositeKey, KeyParts, ScoutingRecord, KEY_SEPARATOR};
pub use relay::{
    Candidate, Describe, HandshakeAnswer, HandshakeOffer, Join, PeerRole, RelayMessage,
    SignalCandidate,
};
