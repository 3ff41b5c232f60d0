//! WebSocket signaling endpoint.
//!
//! `GET /ws?username=<name>` upgrades to a socket bound to one session. The
//! socket is split: a writer task drains the session's event queue and the
//! request replies, while the read loop decodes frames and hands each request
//! to the session actor under the per-call timeout. Closing the socket, or a
//! frame that cannot be attributed to a request, ends the session.

use super::protocol::{ClientFrame, ResponseFrame, ServerEvent, SignalingRequest};
use crate::actors::SessionActorHandle;
use crate::errors::CastError;
use crate::observability::metrics;
use crate::routes::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Server events queued per connection before new ones are dropped.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

const REPLY_QUEUE_CAPACITY: usize = 64;

/// Signaling frames are small; the axum default (64 MiB) is not.
const MAX_FRAME_BYTES: usize = 256 * 1024;

const MAX_USERNAME_CHARS: usize = 64;

const DEFAULT_USERNAME: &str = "Anonymous";

/// How long the writer may take to flush after the session ended.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub username: Option<String>,
}

/// A decoded inbound text frame.
#[derive(Debug)]
pub(crate) enum Inbound {
    Request {
        id: u64,
        request: SignalingRequest,
    },
    /// Attributable to a request id but not executable.
    Rejected { id: u64, error: CastError },
    /// Not a request frame at all.
    Malformed(String),
}

pub(crate) fn decode_frame(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return Inbound::Malformed(format!("not JSON: {e}")),
    };
    let Some(id) = value.get("id").and_then(Value::as_u64) else {
        return Inbound::Malformed("frame has no numeric id".to_string());
    };

    let frame: ClientFrame = match serde_json::from_value(value) {
        Ok(frame) => frame,
        Err(e) => {
            return Inbound::Rejected {
                id,
                error: CastError::InvalidRequest(format!("malformed frame: {e}")),
            }
        }
    };

    match SignalingRequest::parse(&frame.method, frame.params) {
        Ok(request) => Inbound::Request { id, request },
        Err(error) => Inbound::Rejected { id, error },
    }
}

pub(crate) fn display_name(query: &WsQuery) -> String {
    let name: String = query
        .username
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .chars()
        .take(MAX_USERNAME_CHARS)
        .collect();
    if name.is_empty() {
        DEFAULT_USERNAME.to_string()
    } else {
        name
    }
}

/// Upgrade handler for `/ws`.
pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let username = display_name(&query);
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, username))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, username: String) {
    let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(EVENT_QUEUE_CAPACITY);
    let (reply_tx, reply_rx) = mpsc::channel::<ResponseFrame>(REPLY_QUEUE_CAPACITY);

    let (mut sink, mut stream) = socket.split();

    let session = match state.supervisor.open_session(&username, event_tx) {
        Ok(session) => session,
        Err(e) => {
            warn!(target: "cast.signaling", username = %username, error = %e, "Rejected connection");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    let session_id = session.session_id();
    info!(target: "cast.signaling", session_id = %session_id, username = %username, "Signaling connection opened");

    let mut writer = tokio::spawn(write_loop(sink, event_rx, reply_rx));
    let request_timeout = state.config.request_timeout;

    loop {
        let message = tokio::select! {
            () = session.cancelled() => {
                debug!(target: "cast.signaling", session_id = %session_id, "Session cancelled, closing connection");
                break;
            }
            message = stream.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match message {
            Ok(Message::Text(text)) => match decode_frame(&text) {
                Inbound::Request { id, request } => {
                    spawn_request(&session, id, request, reply_tx.clone(), request_timeout);
                }
                Inbound::Rejected { id, error } => {
                    debug!(target: "cast.signaling", session_id = %session_id, id, error = %error, "Rejected frame");
                    metrics::record_signaling_request("invalid", "error", Duration::ZERO);
                    if reply_tx.send(ResponseFrame::err(id, &error)).await.is_err() {
                        break;
                    }
                }
                Inbound::Malformed(reason) => {
                    warn!(target: "cast.signaling", session_id = %session_id, reason = %reason, "Protocol error, closing connection");
                    break;
                }
            },
            Ok(Message::Binary(_)) => {
                warn!(target: "cast.signaling", session_id = %session_id, "Binary frame, closing connection");
                break;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                debug!(target: "cast.signaling", session_id = %session_id, error = %e, "Socket error");
                break;
            }
        }
    }

    let report = state.supervisor.end_session(session_id).await;
    drop(reply_tx);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    info!(
        target: "cast.signaling",
        session_id = %session_id,
        producers_closed = report.producers_closed.len(),
        consumers_freed = report.consumers_freed,
        "Signaling connection closed"
    );
}

/// Run one request on the session actor and queue its reply.
fn spawn_request(
    session: &SessionActorHandle,
    id: u64,
    request: SignalingRequest,
    replies: mpsc::Sender<ResponseFrame>,
    request_timeout: Duration,
) {
    let session = session.clone();
    tokio::spawn(async move {
        let method = request.method();
        let started = Instant::now();

        let outcome = tokio::time::timeout(request_timeout, session.request(request)).await;
        let (frame, status) = match outcome {
            Ok(Ok(result)) => (ResponseFrame::ok(id, result), "success"),
            Ok(Err(e)) => (ResponseFrame::err(id, &e), "error"),
            Err(_) => {
                warn!(
                    target: "cast.signaling",
                    session_id = %session.session_id(),
                    method,
                    timeout_ms = request_timeout.as_millis(),
                    "Request timed out"
                );
                let error = CastError::Timeout(format!("{method} exceeded its deadline"));
                (ResponseFrame::err(id, &error), "timeout")
            }
        };

        metrics::record_signaling_request(method, status, started.elapsed());
        let _ = replies.send(frame).await;
    });
}

/// Serialize events and replies onto the socket until both queues close.
async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut events: mpsc::Receiver<ServerEvent>,
    mut replies: mpsc::Receiver<ResponseFrame>,
) {
    loop {
        let encoded = tokio::select! {
            Some(event) = events.recv() => serde_json::to_string(&event),
            Some(reply) = replies.recv() => serde_json::to_string(&reply),
            else => break,
        };

        match encoded {
            Ok(text) => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(target: "cast.signaling", error = %e, "Socket write failed");
                    break;
                }
            }
            Err(e) => warn!(target: "cast.signaling", error = %e, "Failed to encode frame"),
        }
    }

    let _ = sink.close().await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::signaling::protocol::CreateTransportParams;
    use common::types::TransportDirection;

    #[test]
    fn test_decode_request() {
        let inbound = decode_frame(
            r#"{"id": 3, "method": "create-webrtc-transport", "params": {"direction": "send"}}"#,
        );
        match inbound {
            Inbound::Request { id, request } => {
                assert_eq!(id, 3);
                assert_eq!(
                    request,
                    SignalingRequest::CreateWebRtcTransport(CreateTransportParams {
                        direction: TransportDirection::Send
                    })
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_method_is_rejected_with_id() {
        match decode_frame(r#"{"id": 9, "method": "teleport"}"#) {
            Inbound::Rejected { id, error } => {
                assert_eq!(id, 9);
                assert_eq!(error.error_code(), "INVALID_REQUEST");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_params_are_rejected_with_id() {
        match decode_frame(r#"{"id": 4, "method": "produce", "params": {"kind": "audio"}}"#) {
            Inbound::Rejected { id, .. } => assert_eq!(id, 4),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_frames_without_id_are_malformed() {
        assert!(matches!(decode_frame("not json"), Inbound::Malformed(_)));
        assert!(matches!(
            decode_frame(r#"{"method": "produce"}"#),
            Inbound::Malformed(_)
        ));
        assert!(matches!(
            decode_frame(r#"{"id": "seven", "method": "produce"}"#),
            Inbound::Malformed(_)
        ));
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(&WsQuery::default()), "Anonymous");
        assert_eq!(
            display_name(&WsQuery {
                username: Some("  alice ".to_string())
            }),
            "alice"
        );
        let long = WsQuery {
            username: Some("x".repeat(200)),
        };
        assert_eq!(display_name(&long).chars().count(), 64);
    }
}
