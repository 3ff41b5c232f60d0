//! Engine event router.
//!
//! Drains the engine's event stream and delivers each transport state report
//! to the actor that owns the transport: a session for participant transports,
//! the bridge for plain transports. Delivery never waits on an actor's
//! mailbox. An engine death is fatal: readiness is dropped and the root token
//! is cancelled.
//!
//! When the stream lags, the dropped reports are recovered by asking the
//! engine for the state of every registered transport and bridge leg.

use super::supervisor::SessionSupervisor;
use crate::bridge::BridgeActorHandle;
use crate::engine::{EngineEvent, MediaEngine};
use crate::observability::HealthState;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Why the router stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterExit {
    Shutdown,
    EngineDied(String),
}

pub struct EngineEventRouter {
    engine: Arc<dyn MediaEngine>,
    supervisor: Arc<SessionSupervisor>,
    bridge: BridgeActorHandle,
    health: Arc<HealthState>,
    cancel_token: CancellationToken,
}

impl EngineEventRouter {
    /// `cancel_token` should be the root token: an engine death cancels it.
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        supervisor: Arc<SessionSupervisor>,
        bridge: BridgeActorHandle,
        health: Arc<HealthState>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            engine,
            supervisor,
            bridge,
            health,
            cancel_token,
        }
    }

    /// Subscribe now and route on a background task.
    ///
    /// Subscribing before the spawn guarantees no event emitted after this
    /// call returns is missed.
    pub fn spawn(self) -> JoinHandle<RouterExit> {
        let events = self.engine.subscribe();
        tokio::spawn(self.run(events))
    }

    #[instrument(skip_all, name = "cast.engine.router")]
    async fn run(self, mut events: tokio::sync::broadcast::Receiver<EngineEvent>) -> RouterExit {
        debug!(target: "cast.engine", "Engine event router started");

        loop {
            let event = tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "cast.engine", "Engine event router cancelled");
                    return RouterExit::Shutdown;
                }
                event = events.recv() => event,
            };

            match event {
                Ok(EngineEvent::TransportStateChanged { id, state }) => {
                    if self.supervisor.route_transport_state(id, state).await {
                        continue;
                    }
                    if let Err(e) = self.bridge.transport_state(id, state) {
                        debug!(target: "cast.engine", transport_id = %id, error = %e, "Bridge gone before state delivery");
                    }
                }
                Ok(EngineEvent::Died { reason }) => {
                    error!(target: "cast.engine", reason = %reason, "Media engine died, shutting down");
                    self.health.set_not_ready();
                    self.cancel_token.cancel();
                    return RouterExit::EngineDied(reason);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "cast.engine", skipped, "Engine events lagged, reconciling transports");
                    self.reconcile().await;
                }
                Err(RecvError::Closed) => {
                    info!(target: "cast.engine", "Engine event stream closed");
                    return RouterExit::Shutdown;
                }
            }
        }
    }

    async fn reconcile(&self) {
        let closed = self
            .supervisor
            .reconcile_transports(self.engine.as_ref())
            .await;
        if let Err(e) = self.bridge.reconcile() {
            debug!(target: "cast.engine", error = %e, "Bridge gone before reconcile");
        }
        info!(target: "cast.engine", closed, "Transports reconciled with engine");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::actors::metrics::ActorMetrics;
    use crate::bridge::encoder::FfmpegLauncher;
    use crate::bridge::{BridgeActor, BridgeSettings};
    use crate::coordinator::ProducerConsumerCoordinator;
    use crate::engine::LocalMediaEngine;
    use crate::registry::ResourceRegistry;
    use crate::transport::{TransportLifecycle, LOOPBACK};
    use crate::signaling::protocol::{ProduceParams, ServerEvent};
    use common::rtp::{RtpCodecParameters, RtpParameters};
    use common::types::{ConnectionState, MediaKind, TransportDirection};
    use serde_json::{Map, Value};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        engine: Arc<LocalMediaEngine>,
        coordinator: Arc<ProducerConsumerCoordinator>,
        supervisor: Arc<SessionSupervisor>,
        bridge: BridgeActorHandle,
        health: Arc<HealthState>,
        root: CancellationToken,
    }

    fn settings() -> BridgeSettings {
        let dir = std::env::temp_dir().join(format!("cast-router-{}", uuid::Uuid::new_v4()));
        BridgeSettings {
            required_participants: 2,
            sdp_path: dir.join("stream.sdp"),
            hls_dir: dir.join("hls"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            hls_segment_seconds: 2,
            hls_window_size: 5,
            rtp_base_port: 5004,
            encoder_ready_timeout: Duration::from_secs(1),
            encoder_spawn_attempts: 1,
            encoder_warmup: Duration::from_millis(10),
            auto_stop: false,
        }
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(LocalMediaEngine::new());
        let dyn_engine: Arc<dyn MediaEngine> = engine.clone();
        let registry = Arc::new(ResourceRegistry::new());
        let transports = TransportLifecycle::new(
            Arc::clone(&dyn_engine),
            Arc::clone(&registry),
            LOOPBACK,
            LOOPBACK,
        );
        let coordinator = Arc::new(ProducerConsumerCoordinator::new(
            Arc::clone(&dyn_engine),
            registry,
            transports,
        ));
        let root = CancellationToken::new();
        let supervisor = Arc::new(SessionSupervisor::new(
            Arc::clone(&coordinator),
            ActorMetrics::new(),
            root.child_token(),
        ));
        let (bridge, _task) = BridgeActor::spawn(
            settings(),
            Arc::clone(&coordinator),
            dyn_engine,
            Arc::new(FfmpegLauncher),
            root.child_token(),
        );
        let health = Arc::new(HealthState::new());
        health.set_ready();

        Fixture {
            engine,
            coordinator,
            supervisor,
            bridge,
            health,
            root,
        }
    }

    fn router(f: &Fixture) -> EngineEventRouter {
        EngineEventRouter::new(
            f.engine.clone(),
            Arc::clone(&f.supervisor),
            f.bridge.clone(),
            Arc::clone(&f.health),
            f.root.clone(),
        )
    }

    #[tokio::test]
    async fn test_closed_state_reaches_owning_session() {
        let f = fixture();
        let router = router(&f).spawn();

        let (tx, _rx) = mpsc::channel(8);
        let handle = f.supervisor.open_session("alice", tx).unwrap();
        let transport = f
            .coordinator
            .create_transport(handle.session_id(), TransportDirection::Send)
            .await
            .unwrap();

        f.engine
            .report_transport_state(transport.id, ConnectionState::Closed);

        tokio::time::timeout(Duration::from_secs(2), async {
            while f
                .coordinator
                .registry()
                .transport(handle.session_id(), transport.id)
                .is_ok()
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("transport should be removed");

        f.root.cancel();
        assert_eq!(router.await.unwrap(), RouterExit::Shutdown);
    }

    #[tokio::test]
    async fn test_engine_death_cancels_root() {
        let f = fixture();
        let router = router(&f).spawn();

        f.engine.report_fatal("worker crashed");

        let exit = tokio::time::timeout(Duration::from_secs(2), router)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, RouterExit::EngineDied("worker crashed".to_string()));
        assert!(f.root.is_cancelled());
        assert!(!f.health.is_ready());
    }

    fn opus() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48_000,
                channels: Some(2),
                parameters: Map::new(),
                rtcp_feedback: Vec::new(),
            }],
            header_extensions: Vec::new(),
            encodings: Vec::new(),
            rtcp: None,
        }
    }

    #[tokio::test]
    async fn test_lagged_stream_still_cascades_engine_close() {
        let f = fixture();
        let (alice_tx, _alice_rx) = mpsc::channel(16);
        let (bob_tx, mut bob_rx) = mpsc::channel(16);
        let alice = f.supervisor.open_session("alice", alice_tx).unwrap();
        let bob = f.supervisor.open_session("bob", bob_tx).unwrap();

        let send = f
            .coordinator
            .create_transport(alice.session_id(), TransportDirection::Send)
            .await
            .unwrap();
        let producer = f
            .coordinator
            .produce(
                alice.session_id(),
                ProduceParams {
                    transport_id: send.id,
                    kind: MediaKind::Audio,
                    rtp_parameters: opus(),
                    app_data: Value::Null,
                },
            )
            .await
            .unwrap();
        let recv = f
            .coordinator
            .create_transport(bob.session_id(), TransportDirection::Recv)
            .await
            .unwrap();

        let router = router(&f).spawn();

        // The close is pushed out of the event buffer before the router runs
        f.engine
            .report_transport_state(send.id, ConnectionState::Closed);
        for _ in 0..300 {
            f.engine
                .report_transport_state(recv.id, ConnectionState::Connecting);
        }

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match bob_rx.recv().await {
                    Some(ServerEvent::ProducerClosed { producer_id }) => break producer_id,
                    Some(_) => {}
                    None => panic!("bob's outbox closed"),
                }
            }
        })
        .await
        .expect("bob should be told the producer closed");

        assert_eq!(closed, producer.id);
        assert!(f.coordinator.registry().producer(producer.id).is_err());
        assert!(f
            .coordinator
            .registry()
            .transport(bob.session_id(), recv.id)
            .is_ok());
        assert!(f.coordinator.list_producers().is_empty());

        f.root.cancel();
        assert_eq!(router.await.unwrap(), RouterExit::Shutdown);
    }
}
