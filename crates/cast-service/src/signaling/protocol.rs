//! Signaling wire protocol.
//!
//! Client frames are JSON text `{"id": 7, "method": "produce", "params": {..}}`.
//! The server answers `{"id": 7, "result": ..}` or
//! `{"id": 7, "error": {"code": .., "message": ..}}` and pushes events as
//! `{"event": "new-producer", "data": {..}}`.

use crate::errors::CastError;
use common::rtp::{RtpCapabilities, RtpParameters};
use common::types::{ConsumerId, MediaKind, ProducerId, SessionId, TransportDirection, TransportId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A raw request frame before method dispatch.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportParams {
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnectParams {
    pub transport_id: TransportId,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceParams {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeParams {
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
}

/// A typed signaling request.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingRequest {
    GetRtpCapabilities,
    CreateWebRtcTransport(CreateTransportParams),
    TransportConnect(TransportConnectParams),
    GetExistingProducers,
    Produce(ProduceParams),
    Consume(ConsumeParams),
}

impl SignalingRequest {
    /// Decode `params` for `method`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for unknown methods or malformed params.
    pub fn parse(method: &str, params: Value) -> Result<Self, CastError> {
        fn decode<T: serde::de::DeserializeOwned>(
            method: &str,
            params: Value,
        ) -> Result<T, CastError> {
            serde_json::from_value(params)
                .map_err(|e| CastError::InvalidRequest(format!("invalid params for {method}: {e}")))
        }

        match method {
            "get-rtp-capabilities" => Ok(Self::GetRtpCapabilities),
            "create-webrtc-transport" => decode(method, params).map(Self::CreateWebRtcTransport),
            "transport-connect" => decode(method, params).map(Self::TransportConnect),
            "get-existing-producers" => Ok(Self::GetExistingProducers),
            "produce" => decode(method, params).map(Self::Produce),
            "consume" => decode(method, params).map(Self::Consume),
            other => Err(CastError::InvalidRequest(format!("unknown method {other}"))),
        }
    }

    /// Method name, used as a bounded metric label.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::GetRtpCapabilities => "get-rtp-capabilities",
            Self::CreateWebRtcTransport(_) => "create-webrtc-transport",
            Self::TransportConnect(_) => "transport-connect",
            Self::GetExistingProducers => "get-existing-producers",
            Self::Produce(_) => "produce",
            Self::Consume(_) => "consume",
        }
    }
}

/// A producer as announced to participants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerView {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: Value,
}

/// Entry of the late-joiner producer listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub app_data: Value,
}

/// A consumer as returned to the participant that requested it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerView {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: Value,
}

/// Server-pushed events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Connected {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    NewProducer(ProducerView),
    ProducerClosed {
        #[serde(rename = "producerId")]
        producer_id: ProducerId,
    },
}

impl ServerEvent {
    /// Event name, used as a bounded metric label.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::NewProducer(_) => "new-producer",
            ServerEvent::ProducerClosed { .. } => "producer-closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Reply to a request frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    #[must_use]
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn err(id: u64, error: &CastError) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorBody {
                code: error.error_code(),
                message: error.client_message(),
            }),
        }
    }
}
