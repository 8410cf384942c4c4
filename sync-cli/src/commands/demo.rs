//! In-process sync demo.
//!
//! One host and a few clients share an in-memory relay room and loopback
//! links. Each client holds sample records; the host pulls from every client
//! and reports where the records landed. The host starts out with a draft
//! and a correction of its own so the review buckets are not empty.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use sync_client::{
    spawn_registry, LoopbackConnector, MemoryRelay, MemoryStore, NodeConfig, RecordStore,
    RegistrySettings, RequestOutcome, SessionEvent, SyncEvent, SyncService,
};
use sync_types::{DataType, PeerRole, RelayPeerId, RoomCode, ScoutingRecord, SessionId};
use tokio::sync::mpsc;

const EVENT: &str = "2024demo";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Totals over every client.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DemoSummary {
    /// Sessions the host opened
    pub sessions: usize,
    /// Records written without asking
    pub applied: usize,
    /// Draft-vs-draft records left for review
    pub batch_review: usize,
    /// Records that would override a local correction
    pub manual_conflicts: usize,
    /// Records the host already had
    pub in_sync: usize,
    /// Records in the host store afterwards
    pub stored: usize,
}

struct Peer {
    sync: Arc<SyncService>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
}

/// Run the demo command.
pub async fn run(config: &NodeConfig, clients: usize, records: usize) -> Result<DemoSummary> {
    if clients == 0 {
        anyhow::bail!("The demo needs at least one client");
    }

    // Never touch a real rejoin file from the demo.
    let mut config = config.clone();
    config.rejoin.state_path = None;

    let relay = MemoryRelay::new();
    let connector = LoopbackConnector::new();
    let room = RoomCode::generate();
    println!("Room {}: host and {} client(s)", room, clients);

    let host_store = Arc::new(MemoryStore::with_records(host_records(records)));
    let mut host = start_peer(
        &relay,
        &connector,
        &room,
        PeerRole::Host,
        "host",
        Arc::clone(&host_store),
        &config,
    );

    let mut peers = Vec::with_capacity(clients);
    for i in 0..clients {
        let store = Arc::new(MemoryStore::with_records(client_records(i, records)));
        peers.push(start_peer(
            &relay,
            &connector,
            &room,
            PeerRole::Client,
            &format!("scout-{}", i + 1),
            store,
            &config,
        ));
    }

    let sessions = tokio::time::timeout(CONNECT_TIMEOUT, wait_for_sessions(&mut host, clients))
        .await
        .context("Clients did not connect in time")??;

    let mut summary = DemoSummary {
        sessions: sessions.len(),
        ..Default::default()
    };
    for (session_id, name) in &sessions {
        let outcome = host
            .sync
            .request_data(*session_id, DataType::Scouting, None)
            .await
            .with_context(|| format!("Pull from {} failed", name))?;
        let RequestOutcome::Scouting(report) = outcome else {
            anyhow::bail!("{} answered with non-scouting data", name);
        };
        let resolution = &report.resolution;
        println!(
            "{:<10} imported {}, replaced {}, review {}, conflicts {}, in sync {}",
            name,
            resolution.auto_import.len(),
            resolution.auto_replace.len(),
            resolution.batch_review.len(),
            resolution.manual_conflicts.len(),
            resolution.in_sync
        );
        summary.applied += report.applied;
        summary.batch_review += resolution.batch_review.len();
        summary.manual_conflicts += resolution.manual_conflicts.len();
        summary.in_sync += resolution.in_sync;
    }

    for (session_id, _) in &sessions {
        if let Err(e) = host.sync.registry().close_session(*session_id).await {
            tracing::debug!("Session {} already gone: {}", session_id, e);
        }
    }
    host.sync.registry().shutdown();
    for peer in &peers {
        peer.sync.registry().shutdown();
    }

    summary.stored = host_store.len();
    println!(
        "Applied {} record(s) from {} session(s), {} already in sync",
        summary.applied, summary.sessions, summary.in_sync
    );
    println!(
        "Host now holds {} record(s); {} await review",
        summary.stored,
        summary.batch_review + summary.manual_conflicts
    );
    Ok(summary)
}

fn start_peer(
    relay: &MemoryRelay,
    connector: &LoopbackConnector,
    room: &RoomCode,
    role: PeerRole,
    name: &str,
    store: Arc<MemoryStore>,
    config: &NodeConfig,
) -> Peer {
    let (relay_client, inbox) = relay.join(room.clone(), RelayPeerId::new(name));
    let (registry, session_events) = spawn_registry(
        RegistrySettings::from_config(role, name, config),
        Arc::new(connector.clone()),
        Arc::new(relay_client),
        inbox,
    );
    let (sync, events) = SyncService::start(
        registry,
        session_events,
        store as Arc<dyn RecordStore>,
        config,
    );
    Peer { sync, events }
}

async fn wait_for_sessions(host: &mut Peer, clients: usize) -> Result<Vec<(SessionId, String)>> {
    let mut sessions = Vec::with_capacity(clients);
    while sessions.len() < clients {
        let event = host
            .events
            .recv()
            .await
            .context("Host stopped before clients connected")?;
        if let SyncEvent::Session(SessionEvent::Connected {
            session_id,
            display_name,
        }) = event
        {
            tracing::info!("{} connected", display_name);
            sessions.push((session_id, display_name));
        }
    }
    sessions.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(sessions)
}

fn sample(match_number: usize, team: usize, alliance: &str) -> ScoutingRecord {
    ScoutingRecord::new(
        EVENT,
        format!("qm{}", match_number),
        format!("frc{}", team),
        alliance,
        1_700_000_000_000 + (match_number * 1_000) as i64,
    )
    .with_field("autoPoints", (team % 7) as u64)
    .with_field("teleopPoints", (team % 23) as u64)
    .with_field("climbed", team % 2 == 0)
}

/// Client `i` scouts team `1000 + i` across `count` matches.
fn client_records(i: usize, count: usize) -> Vec<ScoutingRecord> {
    let alliance = if i % 2 == 0 { "red" } else { "blue" };
    (1..=count).map(|m| sample(m, 1000 + i, alliance)).collect()
}

/// The host already holds two of the first client's matches: a draft of
/// match 1 that disagrees, and a correction of match 2.
fn host_records(count: usize) -> Vec<ScoutingRecord> {
    let mut records = Vec::new();
    if count >= 1 {
        records.push(sample(1, 1000, "red").with_field("teleopPoints", 0u64));
    }
    if count >= 2 {
        records.push(
            sample(2, 1000, "red")
                .with_field("teleopPoints", 99u64)
                .corrected(1_700_000_500_000, "lead"),
        );
    }
    records
}
