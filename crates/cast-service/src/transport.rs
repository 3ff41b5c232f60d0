//! Transport lifecycle: creation, connect handshake and closure.
//!
//! Participant transports are registered in their session. Plain transports
//! belong to the compositing bridge and are never registered here.

use crate::engine::{ConnectParams, MediaEngine, TransportDescriptor, TransportOptions};
use crate::errors::CastError;
use crate::registry::{ResourceRegistry, TransportClosure, TransportRecord};
use common::types::{ConnectionState, SessionId, TransportDirection, TransportId};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Loopback address bridge transports listen on and send to.
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// What a connection state report did to the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum StateOutcome {
    /// Non-terminal state recorded.
    Updated(ConnectionState),
    /// Terminal state: the transport and its dependents were removed.
    Closed(TransportClosure),
    /// The transport was already gone.
    Ignored,
}

#[derive(Clone)]
pub struct TransportLifecycle {
    engine: Arc<dyn MediaEngine>,
    registry: Arc<ResourceRegistry>,
    listen_ip: IpAddr,
    announced_ip: IpAddr,
}

impl TransportLifecycle {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        registry: Arc<ResourceRegistry>,
        listen_ip: IpAddr,
        announced_ip: IpAddr,
    ) -> Self {
        Self {
            engine,
            registry,
            listen_ip,
            announced_ip,
        }
    }

    /// Create a participant transport and register it in the session.
    #[instrument(skip_all, name = "cast.transport.create", fields(session_id = %session_id, direction = %direction))]
    pub async fn create_transport(
        &self,
        session_id: SessionId,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, CastError> {
        if direction == TransportDirection::Plain {
            return Err(CastError::InvalidRequest(
                "participants cannot open plain transports".to_string(),
            ));
        }
        if !self.registry.contains_session(session_id) {
            return Err(CastError::NotFound(format!("session {session_id}")));
        }

        let descriptor = self
            .engine
            .create_transport(TransportOptions::webrtc(self.listen_ip, self.announced_ip))
            .await?;

        let record = TransportRecord {
            id: descriptor.id,
            direction,
            state: ConnectionState::New,
        };
        if let Err(e) = self.registry.insert_transport(session_id, record) {
            // Session left while the engine call was in flight
            self.engine.close_transport(descriptor.id).await;
            return Err(e);
        }

        info!(
            target: "cast.transport",
            session_id = %session_id,
            transport_id = %descriptor.id,
            direction = %direction,
            "Transport created"
        );
        Ok(descriptor)
    }

    /// Create an engine-local plain transport for the bridge.
    pub async fn create_plain_transport(&self) -> Result<TransportDescriptor, CastError> {
        self.engine
            .create_transport(TransportOptions::plain(LOOPBACK))
            .await
    }

    /// Forward a participant's DTLS parameters to the engine.
    #[instrument(skip_all, name = "cast.transport.connect", fields(session_id = %session_id, transport_id = %transport_id))]
    pub async fn connect_transport(
        &self,
        session_id: SessionId,
        transport_id: TransportId,
        dtls_parameters: Value,
    ) -> Result<TransportId, CastError> {
        self.registry.transport(session_id, transport_id)?;

        self.engine
            .connect_transport(transport_id, ConnectParams::Dtls { dtls_parameters })
            .await?;

        debug!(target: "cast.transport", session_id = %session_id, transport_id = %transport_id, "Transport connected");
        Ok(transport_id)
    }

    /// Point a bridge transport at the encoder's loopback ports.
    pub async fn connect_plain(
        &self,
        transport_id: TransportId,
        port: u16,
        rtcp_port: u16,
    ) -> Result<(), CastError> {
        self.engine
            .connect_transport(
                transport_id,
                ConnectParams::Plain {
                    ip: LOOPBACK,
                    port,
                    rtcp_port,
                },
            )
            .await
    }

    /// Apply an engine-reported connection state to a participant transport.
    ///
    /// `Closed` removes the transport, closes it in the engine and returns
    /// the producers and consumers that went with it. Repeating a close is a
    /// no-op.
    pub async fn apply_state(
        &self,
        session_id: SessionId,
        transport_id: TransportId,
        state: ConnectionState,
    ) -> StateOutcome {
        if state.is_terminal() {
            return match self.close_transport(session_id, transport_id).await {
                Some(closure) => StateOutcome::Closed(closure),
                None => StateOutcome::Ignored,
            };
        }

        match self
            .registry
            .set_transport_state(session_id, transport_id, state)
        {
            Ok(state) => StateOutcome::Updated(state),
            Err(e) if e.is_not_found() => StateOutcome::Ignored,
            Err(e) => {
                warn!(target: "cast.transport", transport_id = %transport_id, error = %e, "Rejected state change");
                StateOutcome::Ignored
            }
        }
    }

    /// Remove a participant transport and close it in the engine.
    ///
    /// Returns `None` if it was already gone.
    pub async fn close_transport(
        &self,
        session_id: SessionId,
        transport_id: TransportId,
    ) -> Option<TransportClosure> {
        let closure = match self.registry.remove_transport(session_id, transport_id) {
            Ok(closure) => closure,
            Err(e) => {
                debug!(target: "cast.transport", transport_id = %transport_id, error = %e, "Transport already closed");
                return None;
            }
        };

        // Closes producers and consumers on the transport inside the engine
        self.engine.close_transport(transport_id).await;

        info!(
            target: "cast.transport",
            session_id = %session_id,
            transport_id = %transport_id,
            producers = closure.producers.len(),
            consumers = closure.consumers.len(),
            "Transport closed"
        );
        Some(closure)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::LocalMediaEngine;
    use crate::signaling::protocol::ServerEvent;
    use tokio::sync::mpsc;

    fn setup() -> (TransportLifecycle, Arc<LocalMediaEngine>, Arc<ResourceRegistry>) {
        let engine = Arc::new(LocalMediaEngine::new());
        let registry = Arc::new(ResourceRegistry::new());
        let lifecycle = TransportLifecycle::new(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            Arc::clone(&registry),
            LOOPBACK,
            LOOPBACK,
        );
        (lifecycle, engine, registry)
    }

    fn join(registry: &ResourceRegistry) -> (SessionId, mpsc::Receiver<ServerEvent>) {
        let id = SessionId::new();
        let (tx, rx) = mpsc::channel(8);
        registry.create_session(id, "tester", tx).unwrap();
        (id, rx)
    }

    #[tokio::test]
    async fn test_create_registers_transport() {
        let (lifecycle, engine, registry) = setup();
        let (session, _rx) = join(&registry);

        let descriptor = lifecycle
            .create_transport(session, TransportDirection::Send)
            .await
            .unwrap();

        let record = registry.transport(session, descriptor.id).unwrap();
        assert_eq!(record.direction, TransportDirection::Send);
        assert_eq!(record.state, ConnectionState::New);
        assert_eq!(engine.transport_count(), 1);
    }

    #[tokio::test]
    async fn test_create_for_unknown_session_fails() {
        let (lifecycle, engine, _registry) = setup();
        let err = lifecycle
            .create_transport(SessionId::new(), TransportDirection::Recv)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(engine.transport_count(), 0);
    }

    #[tokio::test]
    async fn test_plain_direction_rejected_for_participants() {
        let (lifecycle, _engine, registry) = setup();
        let (session, _rx) = join(&registry);
        let err = lifecycle
            .create_transport(session, TransportDirection::Plain)
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_connect_unknown_transport_is_not_found() {
        let (lifecycle, _engine, registry) = setup();
        let (session, _rx) = join(&registry);
        let err = lifecycle
            .connect_transport(session, TransportId::new(), serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_connect_scoped_to_owning_session() {
        let (lifecycle, _engine, registry) = setup();
        let (alice, _a) = join(&registry);
        let (bob, _b) = join(&registry);
        let descriptor = lifecycle
            .create_transport(alice, TransportDirection::Send)
            .await
            .unwrap();

        let err = lifecycle
            .connect_transport(bob, descriptor.id, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        assert_eq!(
            lifecycle
                .connect_transport(alice, descriptor.id, serde_json::json!({"role": "client"}))
                .await
                .unwrap(),
            descriptor.id
        );
    }

    #[tokio::test]
    async fn test_closed_state_closes_once() {
        let (lifecycle, engine, registry) = setup();
        let (session, _rx) = join(&registry);
        let descriptor = lifecycle
            .create_transport(session, TransportDirection::Send)
            .await
            .unwrap();

        assert_eq!(
            lifecycle
                .apply_state(session, descriptor.id, ConnectionState::Connected)
                .await,
            StateOutcome::Updated(ConnectionState::Connected)
        );

        let outcome = lifecycle
            .apply_state(session, descriptor.id, ConnectionState::Closed)
            .await;
        assert!(matches!(outcome, StateOutcome::Closed(_)));
        assert_eq!(engine.transport_count(), 0);

        assert_eq!(
            lifecycle
                .apply_state(session, descriptor.id, ConnectionState::Closed)
                .await,
            StateOutcome::Ignored
        );
    }
}
