//! Message types for actor communication.
//!
//! Request-reply messages carry a `oneshot` sender; notifications do not.

use crate::bridge::state::{BridgePhase, BridgeStatus};
use crate::coordinator::ClosureReport;
use crate::errors::CastError;
use crate::signaling::protocol::SignalingRequest;
use common::types::{ConnectionState, TransportId};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Messages sent to a `SessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    /// A signaling request from the participant.
    Request {
        request: SignalingRequest,
        /// Serialized result for the response frame.
        respond_to: oneshot::Sender<Result<Value, CastError>>,
    },

    /// The engine reported a connection state for one of the session's
    /// transports.
    TransportState {
        transport_id: TransportId,
        state: ConnectionState,
    },

    /// The participant disconnected; release everything the session owns.
    Close {
        respond_to: oneshot::Sender<Result<ClosureReport, CastError>>,
    },
}

/// Messages sent to the `BridgeActor`.
#[derive(Debug)]
pub enum BridgeMessage {
    /// Start compositing.
    Start {
        respond_to: oneshot::Sender<Result<BridgeStatus, CastError>>,
    },

    /// Stop compositing and return to idle.
    Stop {
        /// Phase the bridge was in when the stop was applied.
        respond_to: oneshot::Sender<BridgePhase>,
    },

    /// The engine reported a state for a bridge-owned transport.
    TransportState {
        transport_id: TransportId,
        state: ConnectionState,
    },

    /// The encoder of job `job_id` exited.
    EncoderExited {
        job_id: Uuid,
        exit_code: Option<i32>,
    },

    /// Engine events were missed; re-check every leg against the engine.
    Reconcile,
}

/// Queue a notification without waiting on the mailbox.
///
/// When the mailbox is full the message is handed to a task that waits for
/// room, so the caller is never held up by a busy actor.
pub(crate) fn notify<M>(sender: &mpsc::Sender<M>, message: M) -> Result<(), CastError>
where
    M: Send + 'static,
{
    match sender.try_send(message) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(message)) => {
            let sender = sender.clone();
            tokio::spawn(async move {
                let _ = sender.send(message).await;
            });
            Ok(())
        }
        Err(TrySendError::Closed(_)) => {
            Err(CastError::Internal("actor mailbox closed".to_string()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_full_mailbox_does_not_wait() {
        let (tx, mut rx) = mpsc::channel(1);
        notify(&tx, 1).unwrap();
        notify(&tx, 2).unwrap();

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_notify_closed_mailbox_errors() {
        let (tx, rx) = mpsc::channel::<u8>(1);
        drop(rx);
        assert!(notify(&tx, 1).is_err());
    }
}
