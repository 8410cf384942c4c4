//! Record sync on top of the registry.
//!
//! [`SyncService`] turns session payloads into store writes:
//! - pushed scouting records are resolved against the local store and the
//!   automatic buckets applied
//! - data requests from the remote are answered (or declined by policy)
//! - our own requests wait for the matching response
//!
//! All resolve-and-apply work for one batch happens under a single gate,
//! so two concurrent syncs never interleave writes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use sync_core::{
    record_to_write, resolve, Choice, ConflictConfig, ConflictDecision, LocalSnapshot, Resolution,
};
use sync_types::{
    DataFilters, DataType, Frame, KeyParts, PayloadKind, PushDeclined, RequestData,
    ScoutingRecord, SessionId,
};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::{NodeConfig, SyncPolicy};
use crate::error::ClientError;
use crate::registry::{RegistryHandle, SessionEvent};
use crate::store::RecordStore;

/// Outcome of resolving one batch of incoming records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Every decision, by bucket
    pub resolution: Resolution,
    /// Records written automatically
    pub applied: usize,
}

/// What a data request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Scouting records, resolved against the store.
    Scouting(SyncReport),
    /// Any other data type, untouched.
    Data(Value),
}

/// Notifications for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A session lifecycle change.
    Session(SessionEvent),
    /// Pushed scouting records were resolved.
    Resolved {
        /// Source session
        session_id: SessionId,
        /// Resolution and writes
        report: SyncReport,
    },
    /// A non-scouting payload was pushed.
    Data {
        /// Source session
        session_id: SessionId,
        /// Content type
        data_type: DataType,
        /// The payload
        data: Value,
    },
    /// The remote asked for data the application must supply via
    /// [`SyncService::respond`].
    DataRequested {
        /// Source session
        session_id: SessionId,
        /// Requested content type
        data_type: DataType,
        /// Selection
        filters: DataFilters,
    },
    /// The remote refused a push.
    PushDeclined {
        /// Source session
        session_id: SessionId,
        /// Content type that was refused
        data_type: DataType,
    },
    /// An incoming payload could not be used.
    Failed {
        /// Source session
        session_id: SessionId,
        /// What went wrong
        error: String,
    },
}

type Waiting = oneshot::Sender<Result<Value, ClientError>>;

/// Record sync service.
pub struct SyncService {
    registry: RegistryHandle,
    store: Arc<dyn RecordStore>,
    policy: SyncPolicy,
    resolver: ConflictConfig,
    request_timeout: Duration,
    pending: DashMap<(SessionId, DataType), Waiting>,
    gate: Mutex<()>,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("policy", &self.policy)
            .field("resolver", &self.resolver)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl SyncService {
    /// Start the service over a registry's session events.
    pub fn start(
        registry: RegistryHandle,
        session_events: mpsc::UnboundedReceiver<SessionEvent>,
        store: Arc<dyn RecordStore>,
        config: &NodeConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            registry,
            store,
            policy: config.sync.clone(),
            resolver: config.conflict.resolver(),
            request_timeout: config.transfer.request_timeout(),
            pending: DashMap::new(),
            gate: Mutex::new(()),
            events,
        });
        tokio::spawn(Arc::clone(&service).dispatch(session_events));
        (service, events_rx)
    }

    /// The registry this service runs on.
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Ask a peer for data and wait for the response.
    ///
    /// Scouting responses are resolved against the store before returning.
    pub async fn request_data(
        &self,
        session_id: SessionId,
        data_type: DataType,
        filters: Option<DataFilters>,
    ) -> Result<RequestOutcome, ClientError> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry((session_id, data_type)) {
            Entry::Occupied(_) => return Err(ClientError::RequestPending(data_type)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        let frame = Frame::RequestData(RequestData { filters, data_type });
        if let Err(e) = self.registry.send_frame(session_id, frame).await {
            self.pending.remove(&(session_id, data_type));
            return Err(e);
        }
        tracing::debug!("Session {}: requested {}", session_id, data_type);

        let data = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(ClientError::PeerUnreachable),
            Err(_) => {
                self.pending.remove(&(session_id, data_type));
                tracing::warn!(
                    "Session {}: no {} response after {:?}",
                    session_id,
                    data_type,
                    self.request_timeout
                );
                return Err(ClientError::PeerUnreachable);
            }
        };

        match data_type {
            DataType::Scouting => {
                let records = parse_records(data)?;
                Ok(RequestOutcome::Scouting(self.sync_records(records).await?))
            }
            _ => Ok(RequestOutcome::Data(data)),
        }
    }

    /// Push an arbitrary payload.
    pub async fn push_data(
        &self,
        session_id: SessionId,
        data_type: DataType,
        data: Value,
    ) -> Result<(), ClientError> {
        self.registry
            .send(session_id, data, PayloadKind::push(data_type))
            .await
    }

    /// Push scouting records.
    pub async fn push_records(
        &self,
        session_id: SessionId,
        records: &[ScoutingRecord],
    ) -> Result<(), ClientError> {
        let data =
            serde_json::to_value(records).map_err(|e| ClientError::InvalidPayload(e.to_string()))?;
        self.push_data(session_id, DataType::Scouting, data).await
    }

    /// Answer a [`SyncEvent::DataRequested`].
    pub async fn respond(
        &self,
        session_id: SessionId,
        data_type: DataType,
        data: Value,
    ) -> Result<(), ClientError> {
        self.registry
            .send(session_id, data, PayloadKind::response(data_type))
            .await
    }

    /// Resolve incoming records against one consistent store snapshot and,
    /// if configured, write the automatic buckets.
    pub async fn sync_records(
        &self,
        incoming: Vec<ScoutingRecord>,
    ) -> Result<SyncReport, ClientError> {
        let _gate = self.gate.lock().await;
        let snapshot = self.snapshot_for(&incoming).await?;
        let resolution = resolve(incoming, &snapshot, &self.resolver);
        let applied = if self.policy.auto_apply {
            self.write_automatic(&resolution).await?
        } else {
            0
        };
        tracing::info!(
            "Resolved {} record(s): {} imported, {} replaced, {} to review, {} conflicts, {} in sync",
            resolution.decisions() + resolution.in_sync,
            resolution.auto_import.len(),
            resolution.auto_replace.len(),
            resolution.batch_review.len(),
            resolution.manual_conflicts.len(),
            resolution.in_sync
        );
        Ok(SyncReport {
            resolution,
            applied,
        })
    }

    /// Write the auto-import and auto-replace buckets.
    pub async fn apply_automatic(&self, resolution: &Resolution) -> Result<usize, ClientError> {
        let _gate = self.gate.lock().await;
        self.write_automatic(resolution).await
    }

    /// Apply the user's choice for one decision. Returns true if a record
    /// was written.
    pub async fn apply_choice(
        &self,
        decision: &ConflictDecision,
        choice: Choice,
    ) -> Result<bool, ClientError> {
        let _gate = self.gate.lock().await;
        match record_to_write(decision, choice) {
            Some(record) => {
                self.store.put(record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply one choice to a whole batch of decisions.
    pub async fn apply_batch(
        &self,
        decisions: &[ConflictDecision],
        choice: Choice,
    ) -> Result<usize, ClientError> {
        let _gate = self.gate.lock().await;
        let records: Vec<ScoutingRecord> = decisions
            .iter()
            .filter_map(|d| record_to_write(d, choice))
            .collect();
        let written = records.len();
        self.store.put_many(records).await?;
        Ok(written)
    }

    async fn write_automatic(&self, resolution: &Resolution) -> Result<usize, ClientError> {
        let records: Vec<ScoutingRecord> = resolution
            .auto_import
            .iter()
            .chain(&resolution.auto_replace)
            .filter_map(|d| record_to_write(d, Choice::TakeIncoming))
            .collect();
        let written = records.len();
        if written > 0 {
            self.store.put_many(records).await?;
        }
        Ok(written)
    }

    /// Local records any incoming record could match: one batched id
    /// lookup, then a composite-key query for each id that missed.
    async fn snapshot_for(&self, incoming: &[ScoutingRecord]) -> Result<LocalSnapshot, ClientError> {
        let ids: Vec<String> = incoming.iter().map(ScoutingRecord::storage_id).collect();
        let mut local = self.store.get_many(&ids).await?;
        let found: HashSet<String> = local.iter().map(ScoutingRecord::storage_id).collect();

        for record in incoming {
            if !found.contains(&record.storage_id()) {
                let matches = self
                    .store
                    .query_by_composite_key(&KeyParts::of(record))
                    .await?;
                local.extend(matches);
            }
        }
        Ok(LocalSnapshot::new(local))
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn fail_pending(&self, session_id: SessionId, make: impl Fn() -> ClientError) {
        let keys: Vec<(SessionId, DataType)> = self
            .pending
            .iter()
            .map(|e| *e.key())
            .filter(|(id, _)| *id == session_id)
            .collect();
        for key in keys {
            if let Some((_, waiting)) = self.pending.remove(&key) {
                let _ = waiting.send(Err(make()));
            }
        }
    }

    async fn dispatch(self: Arc<Self>, mut session_events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = session_events.recv().await {
            match event {
                SessionEvent::Payload {
                    session_id,
                    kind,
                    data,
                } if kind.push => self.on_push(session_id, kind.data_type, data).await,
                SessionEvent::Payload {
                    session_id,
                    kind,
                    data,
                } => match self.pending.remove(&(session_id, kind.data_type)) {
                    Some((_, waiting)) => {
                        let _ = waiting.send(Ok(data));
                    }
                    None => tracing::warn!(
                        "Session {}: unrequested {} response dropped",
                        session_id,
                        kind.data_type
                    ),
                },
                SessionEvent::DataRequested {
                    session_id,
                    data_type,
                    filters,
                } => self.on_request(session_id, data_type, filters).await,
                SessionEvent::RequestDeclined { session_id } => {
                    tracing::info!("Session {}: request declined", session_id);
                    self.fail_pending(session_id, || ClientError::RequestDeclined);
                }
                SessionEvent::PushDeclined {
                    session_id,
                    data_type,
                } => {
                    tracing::info!("Session {}: push of {} declined", session_id, data_type);
                    self.emit(SyncEvent::PushDeclined {
                        session_id,
                        data_type,
                    });
                }
                SessionEvent::TransferFailed {
                    session_id,
                    kind,
                    error,
                } => {
                    if !kind.push {
                        if let Some((_, waiting)) =
                            self.pending.remove(&(session_id, kind.data_type))
                        {
                            let _ = waiting.send(Err(ClientError::InvalidPayload(error.clone())));
                        }
                    }
                    self.emit(SyncEvent::Failed { session_id, error })
                }
                SessionEvent::Removed { session_id, .. } => {
                    self.fail_pending(session_id, || ClientError::PeerUnreachable);
                    self.emit(SyncEvent::Session(event));
                }
                SessionEvent::Connected { .. }
                | SessionEvent::Reconnected { .. }
                | SessionEvent::Disconnected { .. } => self.emit(SyncEvent::Session(event)),
            }
        }
        tracing::debug!("Sync dispatcher stopped");
    }

    async fn on_push(&self, session_id: SessionId, data_type: DataType, data: Value) {
        if !self.policy.accept_pushes {
            tracing::info!("Session {}: declining push of {}", session_id, data_type);
            let frame = Frame::PushDeclined(PushDeclined { data_type });
            if let Err(e) = self.registry.send_frame(session_id, frame).await {
                tracing::warn!("Session {}: decline not sent: {}", session_id, e);
            }
            return;
        }
        if data_type != DataType::Scouting {
            self.emit(SyncEvent::Data {
                session_id,
                data_type,
                data,
            });
            return;
        }

        let result = match parse_records(data) {
            Ok(records) => self.sync_records(records).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(report) => self.emit(SyncEvent::Resolved { session_id, report }),
            Err(e) => {
                tracing::warn!("Session {}: pushed records not synced: {}", session_id, e);
                self.emit(SyncEvent::Failed {
                    session_id,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn on_request(&self, session_id: SessionId, data_type: DataType, filters: DataFilters) {
        if !self.policy.accept_requests {
            tracing::info!("Session {}: declining request for {}", session_id, data_type);
            if let Err(e) = self
                .registry
                .send_frame(session_id, Frame::RequestDeclined)
                .await
            {
                tracing::warn!("Session {}: decline not sent: {}", session_id, e);
            }
            return;
        }
        if data_type != DataType::Scouting {
            self.emit(SyncEvent::DataRequested {
                session_id,
                data_type,
                filters,
            });
            return;
        }

        if let Err(e) = self.answer_scouting(session_id, &filters).await {
            tracing::warn!("Session {}: request not answered: {}", session_id, e);
        }
    }

    async fn answer_scouting(
        &self,
        session_id: SessionId,
        filters: &DataFilters,
    ) -> Result<(), ClientError> {
        let records: Vec<ScoutingRecord> = self
            .store
            .query_by_composite_key(&KeyParts::default())
            .await?
            .into_iter()
            .filter(|r| filters.matches(r))
            .collect();
        tracing::debug!("Session {}: answering with {} record(s)", session_id, records.len());
        let data =
            serde_json::to_value(&records).map_err(|e| ClientError::InvalidPayload(e.to_string()))?;
        self.respond(session_id, DataType::Scouting, data).await
    }
}

fn parse_records(data: Value) -> Result<Vec<ScoutingRecord>, ClientError> {
    serde_json::from_value(data).map_err(|e| ClientError::InvalidPayload(e.to_string()))
}
