//! Room codes.

use anyhow::{Context, Result};
use std::path::Path;
use sync_client::RejoinFile;
use sync_types::RoomCode;

/// Print a fresh room code.
pub fn generate() {
    println!("{}", RoomCode::generate());
}

/// Print the room of the last session, or a fresh code if there is none.
pub async fn resume(rejoin_path: &Path) -> Result<RoomCode> {
    let saved = RejoinFile::new(rejoin_path)
        .saved_room()
        .await
        .context("Failed to read rejoin state")?;
    let room = match saved {
        Some(room) => {
            tracing::info!("Rejoining saved room {}", room);
            room
        }
        None => RoomCode::generate(),
    };
    println!("{}", room);
    Ok(room)
}

/// Validate a code a user typed.
pub fn check(code: &str) -> Result<RoomCode> {
    let room = RoomCode::parse(code).with_context(|| format!("Invalid room code '{}'", code))?;
    println!("{} is a valid room code", room);
    Ok(room)
}
