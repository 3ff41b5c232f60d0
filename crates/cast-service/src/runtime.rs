//! Assembly of the running service.
//!
//! `CastRuntime::start` wires the registry, coordinator, actors and engine
//! event router around one `MediaEngine`; `shutdown` tears them down in the
//! order the process needs: readiness off, bridge stopped (encoder killed),
//! session actors drained, root token cancelled.

use crate::actors::{ActorMetrics, ActorType, EngineEventRouter, RouterExit, SessionSupervisor};
use crate::bridge::encoder::EncoderLauncher;
use crate::bridge::{BridgeActor, BridgeSettings};
use crate::config::Config;
use crate::coordinator::ProducerConsumerCoordinator;
use crate::engine::MediaEngine;
use crate::observability::HealthState;
use crate::registry::ResourceRegistry;
use crate::routes::{build_routes, AppState};
use crate::transport::TransportLifecycle;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long the bridge actor may take to exit after cancellation.
const BRIDGE_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CastRuntime {
    state: Arc<AppState>,
    actor_metrics: Arc<ActorMetrics>,
    cancel_token: CancellationToken,
    bridge_task: JoinHandle<()>,
    router_task: JoinHandle<RouterExit>,
}

impl CastRuntime {
    /// Spawn every actor and mark the service ready.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(
        config: Config,
        engine: Arc<dyn MediaEngine>,
        launcher: Arc<dyn EncoderLauncher>,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let registry = Arc::new(ResourceRegistry::new());
        let transports = TransportLifecycle::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            config.listen_ip,
            config.announced_ip,
        );
        let coordinator = Arc::new(ProducerConsumerCoordinator::new(
            Arc::clone(&engine),
            registry,
            transports,
        ));

        let actor_metrics = ActorMetrics::new();
        let supervisor = Arc::new(SessionSupervisor::new(
            Arc::clone(&coordinator),
            Arc::clone(&actor_metrics),
            cancel_token.child_token(),
        ));
        let (bridge, bridge_task) = BridgeActor::spawn(
            BridgeSettings::from(&config),
            Arc::clone(&coordinator),
            Arc::clone(&engine),
            launcher,
            cancel_token.child_token(),
        );

        let health = Arc::new(HealthState::new());
        let router_task = EngineEventRouter::new(
            engine,
            Arc::clone(&supervisor),
            bridge.clone(),
            Arc::clone(&health),
            cancel_token.clone(),
        )
        .spawn();

        health.set_ready();
        info!(
            target: "cast.runtime",
            required_participants = config.required_participants,
            auto_stop = config.auto_stop,
            "Actor system initialized"
        );

        let state = Arc::new(AppState {
            coordinator,
            supervisor,
            bridge,
            health,
            config,
            metrics_handle,
        });

        Self {
            state,
            actor_metrics,
            cancel_token,
            bridge_task,
            router_task,
        }
    }

    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    #[must_use]
    pub fn router(&self) -> Router {
        build_routes(Arc::clone(&self.state))
    }

    /// Root token. Cancelled on shutdown or when the engine dies.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Tear everything down and report why the engine router stopped.
    pub async fn shutdown(self) -> RouterExit {
        info!(target: "cast.runtime", "Shutting down");
        self.state.health.set_not_ready();

        match self.state.bridge.stop().await {
            Ok(previous) => {
                debug!(target: "cast.runtime", previous = %previous, "Bridge stopped");
            }
            Err(e) => debug!(target: "cast.runtime", error = %e, "Bridge already gone"),
        }

        self.state.supervisor.shutdown().await;
        self.cancel_token.cancel();

        match tokio::time::timeout(BRIDGE_JOIN_TIMEOUT, self.bridge_task).await {
            Ok(Ok(())) => {}
            Ok(Err(join_error)) => {
                if join_error.is_panic() {
                    error!(target: "cast.runtime", error = ?join_error, "Bridge actor panicked");
                    self.actor_metrics.record_panic(ActorType::Bridge);
                }
            }
            Err(_) => warn!(target: "cast.runtime", "Bridge actor shutdown timed out"),
        }

        let exit = match self.router_task.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(target: "cast.runtime", error = %e, "Engine event router failed");
                RouterExit::Shutdown
            }
        };

        info!(target: "cast.runtime", exit = ?exit, "Shutdown complete");
        exit
    }
}
