//! # sync-core
//!
//! Pure logic for scoutsync (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms for peer sync
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time is an argument, never a clock read. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (peer links, relay, record store) is performed by
//! `sync-client`, which interprets the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod candidates;
pub mod chunking;
pub mod conflict;
pub mod negotiation;
pub mod rejoin;
pub mod session;

pub use candidates::{BufferError, CandidateBuffer};
pub use chunking::{ChunkError, Chunker, CompletedPayload, Reassembler};
pub use conflict::{
    classify, diff, fingerprint, merge_incoming, record_to_write, resolve, Bucket, Choice,
    ConflictConfig, ConflictDecision, DiffKind, FieldDiff, LocalSnapshot, Resolution,
};
pub use negotiation::{
    ClientNegotiation, HostNegotiation, Negotiation, NegotiationError, RemoteDescription,
};
pub use rejoin::{RejoinGuard, RejoinState};
pub use session::{
    Action, Event, JoinDisposition, LinkState, PeerSession, SessionStatus, SessionTimers,
    TearDownReason,
};
