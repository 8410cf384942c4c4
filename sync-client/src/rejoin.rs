//! Persisted rejoin state.

use std::path::{Path, PathBuf};

use sync_core::RejoinState;
use sync_types::RoomCode;

use crate::error::ClientError;

/// JSON file holding a client's [`RejoinState`].
#[derive(Debug, Clone)]
pub struct RejoinFile {
    path: PathBuf,
}

impl RejoinFile {
    /// Use the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the saved state. A missing file is `None`.
    pub async fn load(&self) -> Result<Option<RejoinState>, ClientError> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ClientError::Persistence(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        RejoinState::from_json(&json)
            .map(Some)
            .map_err(|e| ClientError::Persistence(format!("{}: {}", self.path.display(), e)))
    }

    /// Room of the last session, for a client starting back up.
    pub async fn saved_room(&self) -> Result<Option<RoomCode>, ClientError> {
        Ok(self.load().await?.map(|state| state.room))
    }

    /// Write the state, replacing what was there.
    pub async fn save(&self, state: &RejoinState) -> Result<(), ClientError> {
        let json = state
            .to_json()
            .map_err(|e| ClientError::Persistence(e.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ClientError::Persistence(format!("{}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| ClientError::Persistence(format!("{}: {}", self.path.display(), e)))
    }
}
