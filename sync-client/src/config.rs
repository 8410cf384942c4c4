//! Configuration loading for scoutsync nodes.
//!
//! Configuration is loaded from a TOML file. Every section and field is
//! optional and falls back to its default.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use sync_core::{Chunker, ConflictConfig, SessionTimers};

/// Root configuration for a scoutsync node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Session liveness configuration.
    #[serde(default)]
    pub session: SessionConfig,
    /// Chunked transfer configuration.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Conflict resolution configuration.
    #[serde(default)]
    pub conflict: ConflictSection,
    /// Request/push acceptance policy.
    #[serde(default)]
    pub sync: SyncPolicy,
    /// Client rejoin configuration.
    #[serde(default)]
    pub rejoin: RejoinConfig,
}

/// Session liveness configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Pending sessions older than this are torn down (default: 20).
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Disconnected sessions are removed after this (default: 30).
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// Upper bound on waiting for candidate gathering (default: 5).
    #[serde(default = "default_gather_timeout_secs")]
    pub gather_timeout_secs: u64,
    /// Liveness tick interval in milliseconds (default: 1000).
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    /// Per-peer limit on buffered candidates (default: 64).
    #[serde(default = "default_max_buffered_candidates")]
    pub max_buffered_candidates: usize,
}

/// Chunked transfer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size and single-frame threshold in bytes (default: 16384).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Maximum chunks per transfer (default: 4096).
    #[serde(default = "default_max_chunks")]
    pub max_chunks: u32,
    /// How long a data request waits for its response (default: 60).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Conflict resolution configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSection {
    /// Correction timestamps this close count as equal (default: 1000).
    #[serde(default = "default_correction_tolerance_millis")]
    pub correction_tolerance_millis: i64,
}

/// Request/push acceptance policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// Answer incoming data requests (default: true).
    #[serde(default = "default_true")]
    pub accept_requests: bool,
    /// Accept unsolicited pushes (default: true).
    #[serde(default = "default_true")]
    pub accept_pushes: bool,
    /// Write auto-import and auto-replace buckets immediately (default: true).
    #[serde(default = "default_true")]
    pub auto_apply: bool,
}

/// Client rejoin configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinConfig {
    /// Bound on a single rejoin attempt (default: 15).
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Where the last room and offer are persisted (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
}

// Default value functions
fn default_stale_after_secs() -> u64 {
    20
}

fn default_grace_secs() -> u64 {
    30
}

fn default_gather_timeout_secs() -> u64 {
    5
}

fn default_tick_millis() -> u64 {
    1000
}

fn default_max_buffered_candidates() -> usize {
    64
}

fn default_chunk_size() -> usize {
    16 * 1024
}

fn default_max_chunks() -> u32 {
    4096
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_correction_tolerance_millis() -> i64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_attempt_timeout_secs() -> u64 {
    15
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            grace_secs: default_grace_secs(),
            gather_timeout_secs: default_gather_timeout_secs(),
            tick_millis: default_tick_millis(),
            max_buffered_candidates: default_max_buffered_candidates(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_chunks: default_max_chunks(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ConflictSection {
    fn default() -> Self {
        Self {
            correction_tolerance_millis: default_correction_tolerance_millis(),
        }
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            accept_requests: true,
            accept_pushes: true,
            auto_apply: true,
        }
    }
}

impl Default for RejoinConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: default_attempt_timeout_secs(),
            state_path: None,
        }
    }
}

impl SessionConfig {
    /// Liveness windows for the session state machine.
    pub fn timers(&self) -> SessionTimers {
        SessionTimers {
            stale_after: Duration::from_secs(self.stale_after_secs),
            grace: Duration::from_secs(self.grace_secs),
        }
    }

    /// Candidate gathering timeout.
    pub fn gather_timeout(&self) -> Duration {
        Duration::from_secs(self.gather_timeout_secs)
    }

    /// Liveness tick interval, never zero.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(1))
    }
}

impl TransferConfig {
    /// A chunker for outbound payloads.
    pub fn chunker(&self) -> Chunker {
        Chunker::new(self.chunk_size, self.max_chunks)
    }

    /// Data request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ConflictSection {
    /// Resolution tunables.
    pub fn resolver(&self) -> ConflictConfig {
        ConflictConfig {
            correction_tolerance_ms: self.correction_tolerance_millis,
        }
    }
}

impl RejoinConfig {
    /// Rejoin attempt timeout.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// Failed to render configuration.
    #[error("failed to render config: {0}")]
    SerializeError(#[source] toml::ser::Error),
}
