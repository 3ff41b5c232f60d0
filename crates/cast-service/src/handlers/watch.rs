//! `/watch` handlers: control of the compositing bridge.
//!
//! ```text
//! POST   /watch  -> 200 {"status": "running", "streams": 4}
//!                   409 {"error": "BadRequestError", "code": "WAITING_FOR_PEERS", ...}
//!                   409 {"error": "BadRequestError", "code": "CANCELLED", ...}
//! DELETE /watch  -> 200 {"status": "idle", "previous": "running"}
//! GET    /watch  -> 200 {"phase": "running", "streams": 4, "jobId": .., "startedAt": ..}
//! ```

use crate::bridge::state::{BridgePhase, BridgeStatus};
use crate::errors::CastError;
use crate::routes::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartResponse {
    pub status: BridgePhase,
    pub streams: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopResponse {
    pub status: BridgePhase,
    pub previous: BridgePhase,
}

/// Start compositing. Starting while a job is active is a no-op.
#[instrument(skip_all, name = "cast.watch.start")]
pub async fn start_watch(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StartResponse>, CastError> {
    match state.bridge.start().await {
        Ok(status) => Ok(Json(StartResponse {
            status: status.phase,
            streams: status.streams,
        })),
        Err(CastError::AlreadyRunning) => {
            let status = state.bridge.status();
            info!(target: "cast.watch", phase = %status.phase, "Compositing already active");
            Ok(Json(StartResponse {
                status: status.phase,
                streams: status.streams,
            }))
        }
        Err(e) => Err(e),
    }
}

/// Stop compositing. A no-op when idle.
///
/// `previous` is the phase seen when the stop was issued. A stop that cancels
/// a start finds the bridge already idle once it is applied.
#[instrument(skip_all, name = "cast.watch.stop")]
pub async fn stop_watch(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StopResponse>, CastError> {
    let observed = state.bridge.status().phase;
    let applied = state.bridge.stop().await?;
    let previous = if applied == BridgePhase::Idle {
        observed
    } else {
        applied
    };
    Ok(Json(StopResponse {
        status: state.bridge.status().phase,
        previous,
    }))
}

/// Current bridge status, read from the published snapshot.
pub async fn watch_status(State(state): State<Arc<AppState>>) -> Json<BridgeStatus> {
    Json(state.bridge.status())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_shapes() {
        let start = serde_json::to_value(StartResponse {
            status: BridgePhase::Running,
            streams: 4,
        })
        .ok();
        assert_eq!(
            start,
            Some(serde_json::json!({"status": "running", "streams": 4}))
        );

        let stop = serde_json::to_value(StopResponse {
            status: BridgePhase::Idle,
            previous: BridgePhase::Running,
        })
        .ok();
        assert_eq!(
            stop,
            Some(serde_json::json!({"status": "idle", "previous": "running"}))
        );
    }
}
