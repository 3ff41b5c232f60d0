//! HTTP routes for the cast service.
//!
//! Defines the Axum router and application state.

use crate::actors::SessionSupervisor;
use crate::bridge::BridgeActorHandle;
use crate::config::Config;
use crate::coordinator::ProducerConsumerCoordinator;
use crate::handlers;
use crate::observability::{health_router, HealthState};
use crate::signaling::websocket_handler;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ProducerConsumerCoordinator>,

    pub supervisor: Arc<SessionSupervisor>,

    /// Compositing bridge.
    pub bridge: BridgeActorHandle,

    pub health: Arc<HealthState>,

    /// Service configuration.
    pub config: Config,

    /// `None` when no recorder is installed (tests); `/metrics` is then absent.
    pub metrics_handle: Option<PrometheusHandle>,
}

/// Build the application routes.
///
/// - `/ws` - participant signaling
/// - `/watch` - start (`POST`), stop (`DELETE`) and inspect (`GET`) compositing
/// - `/health`, `/ready` - liveness and readiness
/// - `/metrics` - Prometheus scrape
/// - everything else is served from the public directory (HLS output included)
pub fn build_routes(state: Arc<AppState>) -> Router {
    let public_dir = state.config.public_dir.clone();
    let health = health_router(Arc::clone(&state.health));
    let metrics_handle = state.metrics_handle.clone();

    let mut app = Router::new()
        .route("/ws", get(websocket_handler))
        .route(
            "/watch",
            get(handlers::watch_status)
                .post(handlers::start_watch)
                .delete(handlers::stop_watch),
        )
        .with_state(state)
        .merge(health);

    if let Some(handle) = metrics_handle {
        app = app.merge(
            Router::new()
                .route("/metrics", get(handlers::metrics_handler))
                .with_state(handle),
        );
    }

    // Layer order (bottom-to-top execution):
    // 1. CorsLayer - browser clients on other origins
    // 2. TraceLayer - log request details
    app.fallback_service(ServeDir::new(public_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
