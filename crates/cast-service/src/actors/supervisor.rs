//! `SessionSupervisor` - owns every `SessionActor`.
//!
//! Opens sessions on connect, closes them on disconnect, routes engine
//! transport events to the owning session and drains all actors on shutdown.

use super::metrics::{ActorMetrics, ActorType};
use super::session::{SessionActor, SessionActorHandle};
use crate::coordinator::{ClosureReport, ProducerConsumerCoordinator};
use crate::engine::MediaEngine;
use crate::errors::CastError;
use crate::signaling::protocol::ServerEvent;
use common::types::{ConnectionState, SessionId, TransportId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a closing session actor may take to finish.
const SESSION_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

struct ManagedSession {
    handle: SessionActorHandle,
    task_handle: JoinHandle<()>,
}

pub struct SessionSupervisor {
    coordinator: Arc<ProducerConsumerCoordinator>,
    metrics: Arc<ActorMetrics>,
    cancel_token: CancellationToken,
    sessions: RwLock<HashMap<SessionId, ManagedSession>>,
    accepting_new: AtomicBool,
}

impl SessionSupervisor {
    /// Session actors get child tokens of `cancel_token`.
    pub fn new(
        coordinator: Arc<ProducerConsumerCoordinator>,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            metrics,
            cancel_token,
            sessions: RwLock::new(HashMap::new()),
            accepting_new: AtomicBool::new(true),
        }
    }

    /// Register a session for a new connection and spawn its actor.
    ///
    /// The `connected` event is queued on `outbox` before this returns.
    pub fn open_session(
        &self,
        display_name: &str,
        outbox: mpsc::Sender<ServerEvent>,
    ) -> Result<SessionActorHandle, CastError> {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(CastError::Internal("server is shutting down".to_string()));
        }

        let session_id = SessionId::new();
        self.coordinator
            .open_session(session_id, display_name, outbox)?;

        let (handle, task_handle) = SessionActor::spawn(
            session_id,
            display_name.to_string(),
            Arc::clone(&self.coordinator),
            self.cancel_token.child_token(),
        );

        self.sessions.write().insert(
            session_id,
            ManagedSession {
                handle: handle.clone(),
                task_handle,
            },
        );

        info!(
            target: "cast.actor.supervisor",
            session_id = %session_id,
            total_sessions = self.session_count(),
            "Session actor spawned"
        );
        Ok(handle)
    }

    /// Close a session and wait for its actor to exit. Idempotent.
    pub async fn end_session(&self, session_id: SessionId) -> ClosureReport {
        let Some(managed) = self.sessions.write().remove(&session_id) else {
            debug!(target: "cast.actor.supervisor", session_id = %session_id, "Session already ended");
            return ClosureReport::default();
        };
        let report = match managed.handle.close().await {
            Ok(report) => report,
            Err(e) => {
                debug!(target: "cast.actor.supervisor", session_id = %session_id, error = %e, "Session actor did not answer close");
                ClosureReport::default()
            }
        };

        self.join(session_id, managed.task_handle).await;
        report
    }

    /// Route an engine state report to the session owning the transport.
    ///
    /// Never waits on a session mailbox. Returns false when no session owns
    /// the transport.
    pub async fn route_transport_state(
        &self,
        transport_id: TransportId,
        state: ConnectionState,
    ) -> bool {
        let Some(owner) = self.coordinator.registry().transport_owner(transport_id) else {
            return false;
        };
        let handle = self.sessions.read().get(&owner).map(|m| m.handle.clone());

        match handle {
            Some(handle) => {
                if let Err(e) = handle.transport_state(transport_id, state) {
                    debug!(target: "cast.actor.supervisor", session_id = %owner, transport_id = %transport_id, error = %e, "Session gone before state delivery");
                }
                true
            }
            None => {
                // Registered but the actor already ended: apply directly
                self.coordinator
                    .transport_state_changed(owner, transport_id, state)
                    .await;
                true
            }
        }
    }

    /// Deliver a close for every registered transport the engine no longer
    /// reports as live. Returns how many were found.
    pub async fn reconcile_transports(&self, engine: &dyn MediaEngine) -> usize {
        let mut closed = 0;
        for (_, transport_id) in self.coordinator.registry().transports() {
            let state = engine
                .transport_state(transport_id)
                .unwrap_or(ConnectionState::Closed);
            if state.is_terminal() {
                self.route_transport_state(transport_id, state).await;
                closed += 1;
            }
        }
        closed
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting_new.load(Ordering::SeqCst)
    }

    /// Stop accepting sessions, cancel every actor and wait for them.
    pub async fn shutdown(&self) {
        self.accepting_new.store(false, Ordering::SeqCst);

        let drained: Vec<(SessionId, ManagedSession)> = self.sessions.write().drain().collect();
        info!(
            target: "cast.actor.supervisor",
            session_count = drained.len(),
            "Shutting down session actors"
        );

        for (_, managed) in &drained {
            managed.handle.cancel();
        }
        for (session_id, managed) in drained {
            self.join(session_id, managed.task_handle).await;
        }

        info!(target: "cast.actor.supervisor", "Session actors stopped");
    }

    async fn join(&self, session_id: SessionId, task_handle: JoinHandle<()>) {
        match tokio::time::timeout(SESSION_JOIN_TIMEOUT, task_handle).await {
            Ok(Ok(())) => {
                debug!(target: "cast.actor.supervisor", session_id = %session_id, "Session actor completed cleanly");
            }
            Ok(Err(join_error)) => {
                if join_error.is_panic() {
                    error!(
                        target: "cast.actor.supervisor",
                        session_id = %session_id,
                        error = ?join_error,
                        "Session actor panicked"
                    );
                    self.metrics.record_panic(ActorType::Session);
                }
                // The actor never released its resources
                if let Err(e) = self.coordinator.close_session(session_id).await {
                    debug!(target: "cast.actor.supervisor", session_id = %session_id, error = %e, "Session already released");
                }
            }
            Err(_) => {
                warn!(target: "cast.actor.supervisor", session_id = %session_id, "Session actor shutdown timed out");
            }
        }
    }
}
