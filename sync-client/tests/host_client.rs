//! Host and client nodes syncing records end to end over the in-memory
//! relay and loopback links.

use std::sync::Arc;
use std::time::Duration;

use scoutsync_client::{
    spawn_registry, ClientError, LoopbackConnector, MemoryRelay, MemoryStore, NodeConfig,
    RecordStore, RegistrySettings, RejoinFile, RequestOutcome, SessionEvent, SyncEvent,
    SyncService,
};
use sync_core::{Bucket, TearDownReason};
use sync_types::{
    Chunk, DataFilters, DataType, Frame, PeerRole, RelayPeerId, RoomCode, ScoutingRecord,
    SessionId, TransferId,
};
use tokio::sync::mpsc;

struct Node {
    sync: Arc<SyncService>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    store: Arc<MemoryStore>,
}

impl Node {
    async fn next(&mut self) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(30), self.events.recv())
            .await
            .expect("no event in time")
            .expect("sync service stopped")
    }

    async fn connected(&mut self) -> SessionId {
        loop {
            if let SyncEvent::Session(SessionEvent::Connected { session_id, .. }) =
                self.next().await
            {
                return session_id;
            }
        }
    }
}

fn room() -> RoomCode {
    RoomCode::parse("271828").unwrap()
}

fn node(
    relay: &MemoryRelay,
    connector: &LoopbackConnector,
    role: PeerRole,
    name: &str,
    store: MemoryStore,
    config: NodeConfig,
) -> Node {
    node_in(room(), relay, connector, role, name, store, config)
}

fn node_in(
    room: RoomCode,
    relay: &MemoryRelay,
    connector: &LoopbackConnector,
    role: PeerRole,
    name: &str,
    store: MemoryStore,
    config: NodeConfig,
) -> Node {
    let (relay_client, inbox) = relay.join(room, RelayPeerId::new(name));
    let (registry, session_events) = spawn_registry(
        RegistrySettings::from_config(role, name, &config),
        Arc::new(connector.clone()),
        Arc::new(relay_client),
        inbox,
    );
    let store = Arc::new(store);
    let (sync, events) = SyncService::start(
        registry,
        session_events,
        Arc::clone(&store) as Arc<dyn RecordStore>,
        &config,
    );
    Node {
        sync,
        events,
        store,
    }
}

async fn pair(
    host_store: MemoryStore,
    host_config: NodeConfig,
    client_store: MemoryStore,
    client_config: NodeConfig,
) -> (Node, SessionId, Node, SessionId) {
    let relay = MemoryRelay::new();
    let connector = LoopbackConnector::new();
    let mut host = node(&relay, &connector, PeerRole::Host, "pit", host_store, host_config);
    let mut client = node(
        &relay,
        &connector,
        PeerRole::Client,
        "stands-3",
        client_store,
        client_config,
    );
    let host_sid = host.connected().await;
    let client_sid = client.connected().await;
    (host, host_sid, client, client_sid)
}

fn record(match_key: &str, team: &str) -> ScoutingRecord {
    ScoutingRecord::new("2024txhou", match_key, team, "red", 10_000)
        .with_field("autoPoints", 6)
        .with_field("climb", "deep")
}

#[tokio::test]
async fn pushed_records_land_in_host_store() {
    let (mut host, _, client, client_sid) = pair(
        MemoryStore::new(),
        NodeConfig::default(),
        MemoryStore::new(),
        NodeConfig::default(),
    )
    .await;

    let records = vec![record("qm1", "118"), record("qm1", "148"), record("qm2", "118")];
    client.sync.push_records(client_sid, &records).await.unwrap();

    loop {
        if let SyncEvent::Resolved { report, .. } = host.next().await {
            assert_eq!(report.resolution.auto_import.len(), 3);
            assert_eq!(report.applied, 3);
            break;
        }
    }
    assert_eq!(host.store.len(), 3);
    assert!(host
        .store
        .get("2024txhou::qm2::118::red")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn host_pulls_filtered_records_from_client() {
    let client_store = MemoryStore::with_records([
        record("qm1", "118"),
        record("qm1", "148"),
        record("qm2", "118"),
    ]);
    let (host, host_sid, _client, _) = pair(
        MemoryStore::new(),
        NodeConfig::default(),
        client_store,
        NodeConfig::default(),
    )
    .await;

    let filters = DataFilters {
        team_keys: vec!["118".into()],
        ..Default::default()
    };
    let outcome = host
        .sync
        .request_data(host_sid, DataType::Scouting, Some(filters))
        .await
        .unwrap();

    let RequestOutcome::Scouting(report) = outcome else {
        panic!("expected scouting outcome, got {:?}", outcome);
    };
    assert_eq!(report.applied, 2);
    assert_eq!(host.store.len(), 2);
    assert!(host.store.snapshot().iter().all(|r| r.team_key == "118"));
}

#[tokio::test]
async fn correction_on_both_sides_needs_a_person() {
    let local = record("qm5", "2468")
        .with_field("autoPoints", 3)
        .corrected(20_000, "lead");
    let incoming = record("qm5", "2468")
        .with_field("autoPoints", 9)
        .corrected(90_000, "drive-coach");

    let (mut host, _, client, client_sid) = pair(
        MemoryStore::with_records([local]),
        NodeConfig::default(),
        MemoryStore::new(),
        NodeConfig::default(),
    )
    .await;
    client
        .sync
        .push_records(client_sid, &[incoming])
        .await
        .unwrap();

    let report = loop {
        if let SyncEvent::Resolved { report, .. } = host.next().await {
            break report;
        }
    };
    assert_eq!(report.applied, 0);
    assert_eq!(report.resolution.manual_conflicts.len(), 1);
    assert_eq!(
        report.resolution.manual_conflicts[0].bucket,
        Bucket::ManualConflict
    );
    assert_eq!(
        report.resolution.manual_conflicts[0].is_newer_incoming,
        Some(true)
    );

    let stored = host
        .store
        .get("2024txhou::qm5::2468::red")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.data["autoPoints"], 3);
}

#[tokio::test]
async fn declined_request_fails_fast() {
    let mut client_config = NodeConfig::default();
    client_config.sync.accept_requests = false;
    let (host, host_sid, _client, _) = pair(
        MemoryStore::new(),
        NodeConfig::default(),
        MemoryStore::with_records([record("qm1", "118")]),
        client_config,
    )
    .await;

    let result = host
        .sync
        .request_data(host_sid, DataType::Scouting, None)
        .await;
    assert!(matches!(result, Err(ClientError::RequestDeclined)));
    assert!(host.store.is_empty());
}

#[tokio::test]
async fn declined_push_is_reported_to_sender() {
    let mut host_config = NodeConfig::default();
    host_config.sync.accept_pushes = false;
    let (host, _, mut client, client_sid) = pair(
        MemoryStore::new(),
        host_config,
        MemoryStore::new(),
        NodeConfig::default(),
    )
    .await;

    client
        .sync
        .push_records(client_sid, &[record("qm9", "999")])
        .await
        .unwrap();

    loop {
        if let SyncEvent::PushDeclined { data_type, .. } = client.next().await {
            assert_eq!(data_type, DataType::Scouting);
            break;
        }
    }
    assert!(host.store.is_empty());
}

#[tokio::test]
async fn application_answers_other_data_types() {
    let (host, host_sid, mut client, _) = pair(
        MemoryStore::new(),
        NodeConfig::default(),
        MemoryStore::new(),
        NodeConfig::default(),
    )
    .await;

    let answering = tokio::spawn(async move {
        loop {
            if let SyncEvent::DataRequested {
                session_id,
                data_type,
                ..
            } = client.next().await
            {
                assert_eq!(data_type, DataType::PitScouting);
                client
                    .sync
                    .respond(
                        session_id,
                        data_type,
                        serde_json::json!([{ "team": "118", "drivetrain": "swerve" }]),
                    )
                    .await
                    .unwrap();
                return client;
            }
        }
    });

    let outcome = host
        .sync
        .request_data(host_sid, DataType::PitScouting, None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RequestOutcome::Data(serde_json::json!([{ "team": "118", "drivetrain": "swerve" }]))
    );
    answering.await.unwrap();
}

#[tokio::test]
async fn unreadable_response_fails_the_request() {
    let (host, host_sid, mut client, _) = pair(
        MemoryStore::new(),
        NodeConfig::default(),
        MemoryStore::new(),
        NodeConfig::default(),
    )
    .await;

    let answering = tokio::spawn(async move {
        loop {
            if let SyncEvent::DataRequested { session_id, .. } = client.next().await {
                let transfer_id = TransferId::new();
                // "{not" + " json"
                for (index, data) in ["e25vdA==", "IGpzb24="].into_iter().enumerate() {
                    let frame = Frame::Chunk(Chunk {
                        transfer_id,
                        chunk_index: index as u32,
                        total_chunks: 2,
                        data: data.into(),
                        data_type: DataType::PitScouting,
                        push: false,
                    });
                    client
                        .sync
                        .registry()
                        .send_frame(session_id, frame)
                        .await
                        .unwrap();
                }
                return client;
            }
        }
    });

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        host.sync
            .request_data(host_sid, DataType::PitScouting, None),
    )
    .await
    .expect("request should fail without waiting for the timeout");
    assert!(matches!(result, Err(ClientError::InvalidPayload(_))));
    answering.await.unwrap();

    // The slot is free again.
    let again = host
        .sync
        .request_data(host_sid, DataType::PitScouting, None);
    let pending = tokio::time::timeout(Duration::from_millis(200), again).await;
    assert!(pending.is_err(), "second request should be waiting, not rejected");
}

#[tokio::test]
async fn closing_a_session_reaches_the_peer() {
    let (mut host, host_sid, mut client, client_sid) = pair(
        MemoryStore::new(),
        NodeConfig::default(),
        MemoryStore::new(),
        NodeConfig::default(),
    )
    .await;

    host.sync.registry().close_session(host_sid).await.unwrap();

    loop {
        if let SyncEvent::Session(SessionEvent::Removed { session_id, reason }) =
            host.next().await
        {
            assert_eq!(session_id, host_sid);
            assert_eq!(reason, TearDownReason::LocalClose);
            break;
        }
    }
    loop {
        if let SyncEvent::Session(SessionEvent::Removed { session_id, reason }) =
            client.next().await
        {
            assert_eq!(session_id, client_sid);
            assert_eq!(reason, TearDownReason::RemoteClose);
            break;
        }
    }

    let result = client
        .sync
        .push_records(client_sid, &[record("qm1", "1")])
        .await;
    assert!(matches!(result, Err(ClientError::SessionNotFound(_))));
}

#[tokio::test]
async fn restarted_client_rejoins_saved_room() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("rejoin.json");
    let mut client_config = NodeConfig::default();
    client_config.rejoin.state_path = Some(path.clone());

    let relay = MemoryRelay::new();
    let connector = LoopbackConnector::new();
    let mut host = node(
        &relay,
        &connector,
        PeerRole::Host,
        "pit",
        MemoryStore::new(),
        NodeConfig::default(),
    );
    let mut client = node(
        &relay,
        &connector,
        PeerRole::Client,
        "stands-3",
        MemoryStore::new(),
        client_config.clone(),
    );
    let first = host.connected().await;
    client.connected().await;
    let before = RejoinFile::new(&path).load().await.unwrap().unwrap();

    client.sync.registry().shutdown();
    drop(client);
    loop {
        if let SyncEvent::Session(SessionEvent::Removed { session_id, .. }) = host.next().await {
            assert_eq!(session_id, first);
            break;
        }
    }

    let saved_room = RejoinFile::new(&path).saved_room().await.unwrap().unwrap();
    assert_eq!(saved_room, room());
    let mut client = node_in(
        saved_room,
        &relay,
        &connector,
        PeerRole::Client,
        "stands-3",
        MemoryStore::new(),
        client_config,
    );

    let second = host.connected().await;
    assert_ne!(second, first);
    let client_sid = client.connected().await;

    client
        .sync
        .push_records(client_sid, &[record("qm9", "118")])
        .await
        .unwrap();
    loop {
        if let SyncEvent::Resolved { session_id, report } = host.next().await {
            assert_eq!(session_id, second);
            assert_eq!(report.applied, 1);
            break;
        }
    }
    assert_eq!(host.store.len(), 1);

    let after = RejoinFile::new(&path).load().await.unwrap().unwrap();
    assert_ne!(after.last_offer, before.last_offer);
}
