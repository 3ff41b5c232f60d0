//! Cast Service
//!
//! WebSocket signaling for participants plus HTTP control of the compositing
//! bridge, served from one listener (default: 0.0.0.0:8002).
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing (pretty or JSON)
//! 3. Initialize Prometheus metrics recorder
//! 4. Create the media engine and start the actor system
//! 5. Bind the listener, then serve
//! 6. Wait for SIGINT/SIGTERM or engine death
//!
//! An engine death exits non-zero so a process supervisor restarts us.

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cast_service::actors::RouterExit;
use cast_service::bridge::encoder::FfmpegLauncher;
use cast_service::config::Config;
use cast_service::engine::{LocalMediaEngine, MediaEngine};
use cast_service::observability::init_metrics_recorder;
use cast_service::runtime::CastRuntime;
use common::config::LogFormat;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long open HTTP connections get to finish after shutdown begins.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration first: it selects the log format
    let config = Config::from_env()?;
    init_tracing(&config);

    info!("Starting Cast Service");
    info!(
        bind_address = %config.bind_address,
        announced_ip = %config.announced_ip,
        required_participants = config.required_participants,
        request_timeout_ms = config.request_timeout.as_millis(),
        sdp_path = %config.sdp_path.display(),
        hls_dir = %config.hls_dir.display(),
        ffmpeg_path = %config.ffmpeg_path.display(),
        rtp_base_port = config.rtp_base_port,
        auto_stop = config.auto_stop,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let engine: Arc<dyn MediaEngine> = Arc::new(LocalMediaEngine::new());
    let bind_address: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    let runtime = CastRuntime::start(
        config,
        engine,
        Arc::new(FfmpegLauncher),
        Some(prometheus_handle),
    );
    let app = runtime.router();

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %bind_address, "Failed to bind listener");
            format!("Failed to bind to {bind_address}: {e}")
        })?;
    info!(addr = %bind_address, "Listener bound successfully");

    let server_token = runtime.cancel_token().child_token();
    let server_shutdown = server_token.clone();
    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_shutdown.cancelled().await;
            info!("HTTP server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server failed");
        }
    });

    info!("Cast Service running - press Ctrl+C to shutdown");
    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
        }
        () = runtime.cancel_token().cancelled() => {
            warn!("Root token cancelled, shutting down");
        }
    }

    let exit = runtime.shutdown().await;
    server_token.cancel();
    if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, server)
        .await
        .is_err()
    {
        warn!("HTTP server did not drain in time");
    }

    match exit {
        RouterExit::Shutdown => {
            info!("Cast Service shutdown complete");
            Ok(())
        }
        RouterExit::EngineDied(reason) => {
            error!(reason = %reason, "Exiting after media engine failure");
            Err(format!("media engine died: {reason}").into())
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.observability.log_filter.clone().into());
    let registry = tracing_subscriber::registry().with(filter);

    match config.observability.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
