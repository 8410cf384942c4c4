//! # sync-client
//!
//! Session registry and record sync for scoutsync.
//!
//! This is the library an application embeds to sync scouting records
//! with nearby devices over direct peer links.
//!
//! ## Features
//!
//! - **Connection registry**: one actor owns every peer session, buffers
//!   early candidates and drives grace and staleness timers
//! - **Chunked transfers**: large payloads are split and reassembled
//!   transparently
//! - **Conflict resolution**: incoming records are bucketed against the
//!   local store; automatic buckets are applied, the rest surface as events
//! - **Pluggable edges**: [`PeerConnector`], [`RelaySender`] and
//!   [`RecordStore`] are traits, with in-memory versions for tests
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{spawn_registry, NodeConfig, RegistrySettings, SyncService};
//!
//! let config = NodeConfig::default();
//! let settings = RegistrySettings::from_config(PeerRole::Host, "pit-lead", &config);
//! let (registry, events) = spawn_registry(settings, connector, relay, relay_inbox);
//! let (sync, mut sync_events) = SyncService::start(registry, events, store, &config);
//!
//! let outcome = sync.request_data(session_id, DataType::Scouting, None).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod registry;
pub mod rejoin;
pub mod relay;
pub mod store;
pub mod sync;
pub mod transport;

mod worker;

pub use config::{ConfigError, NodeConfig, SyncPolicy};
pub use error::ClientError;
pub use registry::{
    spawn_registry, RegistryHandle, RegistrySettings, SessionEvent, SessionSnapshot,
};
pub use rejoin::RejoinFile;
pub use relay::{MemoryRelay, MemoryRelayClient, RelayError, RelaySender};
pub use store::{MemoryStore, RecordStore, StoreError};
pub use sync::{RequestOutcome, SyncEvent, SyncReport, SyncService};
pub use transport::{
    LinkEvent, LoopbackConnector, LoopbackLink, PeerConnector, PeerLink, TransportError,
};
