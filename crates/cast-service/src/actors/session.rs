//! `SessionActor` - one actor per signaling connection.
//!
//! Requests from a participant are processed one at a time through the
//! actor's mailbox, so every mutation of a session's resources has a single
//! writer. Other sessions proceed concurrently in their own actors.
//!
//! # Lifecycle
//!
//! 1. Spawned by the `SessionSupervisor` after the session is registered
//! 2. Runs until `Close`, cancellation, or every handle is dropped
//! 3. On exit the session and all of its resources are released

use super::messages::{notify, SessionMessage};
use super::metrics::{ActorType, MailboxMonitor};
use crate::coordinator::{ClosureReport, ProducerConsumerCoordinator};
use crate::errors::CastError;
use crate::signaling::protocol::SignalingRequest;
use common::types::{ConnectionState, SessionId, TransportId};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 64;

/// Handle to a `SessionActor`.
#[derive(Clone, Debug)]
pub struct SessionActorHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    session_id: SessionId,
}

impl SessionActorHandle {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Run a signaling request and return its serialized result.
    pub async fn request(&self, request: SignalingRequest) -> Result<Value, CastError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::Request {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|e| CastError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CastError::Internal(format!("response receive failed: {e}")))?
    }

    /// Forward an engine connection state for one of this session's transports.
    ///
    /// Does not wait for room in the mailbox.
    pub fn transport_state(
        &self,
        transport_id: TransportId,
        state: ConnectionState,
    ) -> Result<(), CastError> {
        notify(
            &self.sender,
            SessionMessage::TransportState {
                transport_id,
                state,
            },
        )
    }

    /// Release the session and wait for the cascade to finish.
    pub async fn close(&self) -> Result<ClosureReport, CastError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::Close { respond_to: tx })
            .await
            .map_err(|e| CastError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CastError::Internal(format!("response receive failed: {e}")))?
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the actor has been told to stop.
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await;
    }
}

pub struct SessionActor {
    session_id: SessionId,
    display_name: String,
    coordinator: Arc<ProducerConsumerCoordinator>,
    receiver: mpsc::Receiver<SessionMessage>,
    cancel_token: CancellationToken,
    mailbox: MailboxMonitor,
    released: bool,
}

impl SessionActor {
    /// Spawn the actor for an already registered session.
    pub fn spawn(
        session_id: SessionId,
        display_name: String,
        coordinator: Arc<ProducerConsumerCoordinator>,
        cancel_token: CancellationToken,
    ) -> (SessionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);

        let actor = Self {
            session_id,
            display_name,
            coordinator,
            receiver,
            cancel_token: cancel_token.clone(),
            mailbox: MailboxMonitor::new(ActorType::Session, session_id.to_string()),
            released: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionActorHandle {
            sender,
            cancel_token,
            session_id,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "cast.actor.session",
        fields(session_id = %self.session_id, display_name = %self.display_name)
    )]
    async fn run(mut self) {
        debug!(target: "cast.actor.session", session_id = %self.session_id, "SessionActor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "cast.actor.session", session_id = %self.session_id, "SessionActor received cancellation signal");
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_processed(self.receiver.len());

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(target: "cast.actor.session", session_id = %self.session_id, "SessionActor channel closed, exiting");
                            break;
                        }
                    }
                }
            }
        }

        if !self.released {
            if let Err(e) = self.release().await {
                debug!(target: "cast.actor.session", session_id = %self.session_id, error = %e, "Session already released");
            }
        }

        info!(
            target: "cast.actor.session",
            session_id = %self.session_id,
            messages_processed = self.mailbox.messages_processed(),
            "SessionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: SessionMessage) -> bool {
        match message {
            SessionMessage::Request {
                request,
                respond_to,
            } => {
                let result = self.dispatch(request).await;
                if respond_to.send(result).is_err() {
                    // Caller timed out or the socket closed
                    debug!(target: "cast.actor.session", session_id = %self.session_id, "Request caller went away");
                }
                false
            }

            SessionMessage::TransportState {
                transport_id,
                state,
            } => {
                let report = self
                    .coordinator
                    .transport_state_changed(self.session_id, transport_id, state)
                    .await;
                if !report.producers_closed.is_empty() || report.consumers_freed > 0 {
                    info!(
                        target: "cast.actor.session",
                        session_id = %self.session_id,
                        transport_id = %transport_id,
                        producers = report.producers_closed.len(),
                        consumers = report.consumers_freed,
                        "Transport closed by engine"
                    );
                }
                false
            }

            SessionMessage::Close { respond_to } => {
                let result = self.release().await;
                let _ = respond_to.send(result);
                true
            }
        }
    }

    async fn release(&mut self) -> Result<ClosureReport, CastError> {
        self.released = true;
        self.coordinator.close_session(self.session_id).await
    }

    async fn dispatch(&self, request: SignalingRequest) -> Result<Value, CastError> {
        let method = request.method();
        let result = match request {
            SignalingRequest::GetRtpCapabilities => to_value(self.coordinator.rtp_capabilities()),
            SignalingRequest::CreateWebRtcTransport(params) => to_value(
                self.coordinator
                    .create_transport(self.session_id, params.direction)
                    .await?,
            ),
            SignalingRequest::TransportConnect(params) => {
                let transport_id = self
                    .coordinator
                    .connect_transport(self.session_id, params.transport_id, params.dtls_parameters)
                    .await?;
                Ok(json!({ "transportId": transport_id }))
            }
            SignalingRequest::GetExistingProducers => to_value(self.coordinator.list_producers()),
            SignalingRequest::Produce(params) => {
                to_value(self.coordinator.produce(self.session_id, params).await?)
            }
            SignalingRequest::Consume(params) => {
                to_value(self.coordinator.consume(self.session_id, params).await?)
            }
        };

        if let Err(e) = &result {
            warn!(target: "cast.actor.session", session_id = %self.session_id, method, error = %e, "Request failed");
        }
        result
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, CastError> {
    serde_json::to_value(value)
        .map_err(|e| CastError::Internal(format!("response serialization failed: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::{LocalMediaEngine, MediaEngine};
    use crate::registry::ResourceRegistry;
    use crate::signaling::protocol::{CreateTransportParams, ServerEvent};
    use crate::transport::{TransportLifecycle, LOOPBACK};
    use common::types::TransportDirection;

    fn coordinator() -> Arc<ProducerConsumerCoordinator> {
        let engine: Arc<dyn MediaEngine> = Arc::new(LocalMediaEngine::new());
        let registry = Arc::new(ResourceRegistry::new());
        let transports =
            TransportLifecycle::new(Arc::clone(&engine), Arc::clone(&registry), LOOPBACK, LOOPBACK);
        Arc::new(ProducerConsumerCoordinator::new(engine, registry, transports))
    }

    fn spawn(
        coordinator: &Arc<ProducerConsumerCoordinator>,
    ) -> (SessionActorHandle, JoinHandle<()>, mpsc::Receiver<ServerEvent>) {
        let id = SessionId::new();
        let (tx, rx) = mpsc::channel(16);
        coordinator.open_session(id, "alice", tx).unwrap();
        let (handle, task) = SessionActor::spawn(
            id,
            "alice".to_string(),
            Arc::clone(coordinator),
            CancellationToken::new(),
        );
        (handle, task, rx)
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let coordinator = coordinator();
        let (handle, _task, _rx) = spawn(&coordinator);

        let caps = handle
            .request(SignalingRequest::GetRtpCapabilities)
            .await
            .unwrap();
        assert!(caps["codecs"].as_array().is_some_and(|c| !c.is_empty()));

        let transport = handle
            .request(SignalingRequest::CreateWebRtcTransport(CreateTransportParams {
                direction: TransportDirection::Send,
            }))
            .await
            .unwrap();
        assert!(transport["id"].is_string());
        assert!(transport["iceParameters"].is_object());
    }

    #[tokio::test]
    async fn test_close_releases_session() {
        let coordinator = coordinator();
        let (handle, task, _rx) = spawn(&coordinator);
        let session_id = handle.session_id();

        handle.close().await.unwrap();
        task.await.unwrap();

        assert!(!coordinator.registry().contains_session(session_id));
        assert!(handle.request(SignalingRequest::GetRtpCapabilities).await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_releases_session() {
        let coordinator = coordinator();
        let (handle, task, _rx) = spawn(&coordinator);
        let session_id = handle.session_id();

        handle.cancel();
        task.await.unwrap();

        assert!(handle.is_cancelled());
        assert!(!coordinator.registry().contains_session(session_id));
    }
}
