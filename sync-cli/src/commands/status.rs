//! Show the saved rejoin state.

use anyhow::{Context, Result};
use std::path::Path;
use sync_client::RejoinFile;
use sync_core::RejoinState;

/// Run the status command.
pub async fn run(path: &Path) -> Result<Option<RejoinState>> {
    println!("=== sync-cli status ===");
    println!();

    let state = RejoinFile::new(path)
        .load()
        .await
        .context("Failed to read rejoin state")?;

    match &state {
        Some(state) => {
            println!("Last session:");
            println!("  Room:       {}", state.room);
            println!("  Name:       {}", state.peer_name);
            println!(
                "  Last offer: {}",
                if state.last_offer.is_some() {
                    "saved"
                } else {
                    "none"
                }
            );
        }
        None => {
            println!("Last session: NONE");
            println!();
            println!("No rejoin state at {}", path.display());
        }
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{HandshakeOffer, RoomCode};
    use tempfile::tempdir;

    #[tokio::test]
    async fn nothing_saved_yet() {
        let dir = tempdir().unwrap();
        let state = run(&dir.path().join("rejoin.json")).await.unwrap();
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn reports_saved_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rejoin.json");
        let mut saved = RejoinState::new(RoomCode::parse("902211").unwrap(), "stands-2");
        saved.last_offer = Some(HandshakeOffer("v=0".into()));
        RejoinFile::new(&path).save(&saved).await.unwrap();

        assert_eq!(run(&path).await.unwrap(), Some(saved));
    }

    #[tokio::test]
    async fn corrupt_state_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rejoin.json");
        tokio::fs::write(&path, "{").await.unwrap();
        assert!(run(&path).await.is_err());
    }
}
