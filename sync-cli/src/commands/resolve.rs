//! Classify a batch of records against local records.
//!
//! Nothing is written; the command shows where each incoming record would
//! land and which fields differ.

use anyhow::{Context, Result};
use std::path::Path;
use sync_client::NodeConfig;
use sync_core::{resolve, ConflictDecision, DiffKind, LocalSnapshot, Resolution};
use sync_types::ScoutingRecord;

/// Run the resolve command.
pub async fn run(config: &NodeConfig, local: &Path, incoming: &Path) -> Result<Resolution> {
    let local = read_records(local).await?;
    let incoming = read_records(incoming).await?;
    tracing::debug!(
        "Resolving {} incoming against {} local record(s)",
        incoming.len(),
        local.len()
    );

    let resolution = resolve(
        incoming,
        &LocalSnapshot::new(local),
        &config.conflict.resolver(),
    );

    print_bucket("Auto-import", &resolution.auto_import);
    print_bucket("Auto-replace", &resolution.auto_replace);
    print_bucket("Batch review", &resolution.batch_review);
    print_bucket("Manual conflicts", &resolution.manual_conflicts);
    println!("In sync: {}", resolution.in_sync);

    Ok(resolution)
}

async fn read_records(path: &Path) -> Result<Vec<ScoutingRecord>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("{} is not a JSON array of records", path.display()))
}

fn print_bucket(label: &str, decisions: &[ConflictDecision]) {
    println!("{} ({}):", label, decisions.len());
    for decision in decisions {
        let mut line = format!("  {}", decision.incoming.storage_id());
        match decision.is_newer_incoming {
            Some(true) => line.push_str(" [incoming correction is newer]"),
            Some(false) => line.push_str(" [local correction is newer]"),
            None => {}
        }
        println!("{}", line);
        for change in &decision.diff {
            let marker = match change.kind {
                DiffKind::Conflict => "~",
                DiffKind::Added => "+",
            };
            println!(
                "    {} {}: {} -> {}",
                marker, change.field, change.local, change.incoming
            );
        }
    }
}
