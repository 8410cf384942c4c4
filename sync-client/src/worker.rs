//! Per-session task pair.
//!
//! Every session gets two tasks: a pump that forwards link events to the
//! registry in order, and a worker that runs link operations one at a time.
//! Neither touches registry state; both report back over a channel the
//! registry drains alongside its commands.

use std::sync::Arc;
use std::time::Duration;

use sync_types::{Candidate, HandshakeAnswer, HandshakeOffer, SessionId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::transport::{LinkEvent, PeerLink, TransportError};

/// Operations run against a link, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkOp {
    /// Generate the local offer.
    CreateOffer,
    /// Apply a remote offer and generate the answer.
    AcceptOffer(HandshakeOffer),
    /// Apply the remote answer.
    ApplyAnswer(HandshakeAnswer),
    /// Apply one remote candidate.
    AddCandidate(Candidate),
}

/// What the tasks tell the registry.
#[derive(Debug)]
pub(crate) enum TaskReport {
    /// An event raised by the link.
    Link {
        session_id: SessionId,
        event: LinkEvent,
    },
    /// The local offer or answer is ready, or failed.
    LocalDescription {
        session_id: SessionId,
        result: Result<String, TransportError>,
    },
}

/// Handles to a session's tasks.
#[derive(Debug)]
pub(crate) struct SessionTasks {
    ops: mpsc::UnboundedSender<LinkOp>,
    pump: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl SessionTasks {
    /// Queue an operation behind those already submitted.
    pub(crate) fn submit(&self, op: LinkOp) {
        if self.ops.send(op).is_err() {
            tracing::debug!("Link worker already stopped, operation dropped");
        }
    }

    /// Stop both tasks.
    pub(crate) fn abort(&self) {
        self.pump.abort();
        self.worker.abort();
    }
}

/// Spawn the pump and worker for one session.
pub(crate) fn spawn_session_tasks(
    session_id: SessionId,
    link: Arc<dyn PeerLink>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    reports: mpsc::UnboundedSender<TaskReport>,
    gather_timeout: Duration,
) -> SessionTasks {
    let pump_reports = reports.clone();
    let pump = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if pump_reports
                .send(TaskReport::Link { session_id, event })
                .is_err()
            {
                break;
            }
        }
    });

    let (ops, mut ops_rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(async move {
        while let Some(op) = ops_rx.recv().await {
            match op {
                LinkOp::CreateOffer => {
                    let result = link.create_offer().await;
                    if result.is_ok() {
                        wait_for_gathering(session_id, link.as_ref(), gather_timeout).await;
                    }
                    let _ = reports.send(TaskReport::LocalDescription { session_id, result });
                }
                LinkOp::AcceptOffer(offer) => {
                    let result = link.accept_offer(&offer.0).await;
                    if result.is_ok() {
                        wait_for_gathering(session_id, link.as_ref(), gather_timeout).await;
                    }
                    let _ = reports.send(TaskReport::LocalDescription { session_id, result });
                }
                LinkOp::ApplyAnswer(answer) => {
                    if let Err(e) = link.apply_answer(&answer.0).await {
                        tracing::warn!("Session {}: failed to apply answer: {}", session_id, e);
                    }
                }
                LinkOp::AddCandidate(candidate) => {
                    if let Err(e) = link.add_candidate(&candidate).await {
                        tracing::warn!("Session {}: candidate not applied: {}", session_id, e);
                    }
                }
            }
        }
    });

    SessionTasks { ops, pump, worker }
}

async fn wait_for_gathering(session_id: SessionId, link: &dyn PeerLink, limit: Duration) {
    if tokio::time::timeout(limit, link.gathering_complete())
        .await
        .is_err()
    {
        tracing::debug!(
            "Session {}: candidate gathering still running after {:?}, proceeding",
            session_id,
            limit
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackConnector, PeerConnector};

    #[tokio::test(start_paused = true)]
    async fn offer_waits_for_gathering_up_to_limit() {
        let connector = LoopbackConnector::new();
        connector.hold_gathering();
        let (link, events) = connector.create_link().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = SessionId::new();

        let tasks = spawn_session_tasks(id, link, events, tx, Duration::from_secs(5));
        tasks.submit(LinkOp::CreateOffer);

        let started = tokio::time::Instant::now();
        let mut description = None;
        while let Some(cmd) = rx.recv().await {
            if let TaskReport::LocalDescription { result, .. } = cmd {
                description = Some(result);
                break;
            }
        }
        assert!(description.unwrap().unwrap().starts_with("loopback-offer:"));
        assert!(started.elapsed() >= Duration::from_secs(5));
        tasks.abort();
    }

    #[tokio::test]
    async fn pump_forwards_events_in_order() {
        let connector = LoopbackConnector::new();
        connector.set_candidates_per_link(3);
        let (link, events) = connector.create_link().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = SessionId::new();

        let tasks = spawn_session_tasks(id, link, events, tx, Duration::from_secs(5));
        tasks.submit(LinkOp::CreateOffer);

        let mut candidates = Vec::new();
        while candidates.len() < 3 {
            if let Some(TaskReport::Link {
                session_id,
                event: LinkEvent::LocalCandidate(c),
            }) = rx.recv().await
            {
                assert_eq!(session_id, id);
                candidates.push(c);
            }
        }
        let ports: Vec<&str> = candidates
            .iter()
            .map(|c| c.candidate.split(' ').nth(5).unwrap())
            .collect();
        assert_eq!(ports, vec!["40010", "40011", "40012"]);
        tasks.abort();
    }

    #[tokio::test]
    async fn candidate_failure_does_not_stop_worker() {
        let connector = LoopbackConnector::new();
        let (link, events) = connector.create_link().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tasks = spawn_session_tasks(SessionId::new(), link, events, tx, Duration::from_secs(1));
        tasks.submit(LinkOp::AddCandidate(Candidate::new("candidate:early")));
        tasks.submit(LinkOp::CreateOffer);

        loop {
            if let Some(TaskReport::LocalDescription { result, .. }) = rx.recv().await {
                assert!(result.is_ok());
                break;
            }
        }
        tasks.abort();
    }
}
