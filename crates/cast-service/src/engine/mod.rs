//! Media engine contract.
//!
//! The orchestrator never touches ICE, DTLS, SRTP or congestion control. It
//! drives an engine through [`MediaEngine`] and reacts to the engine's
//! [`EngineEvent`] stream. [`LocalMediaEngine`] is the signaling-only engine
//! the binary ships with.

pub mod local;

pub use local::LocalMediaEngine;

use crate::errors::CastError;
use async_trait::async_trait;
use common::rtp::{RtpCapabilities, RtpParameters};
use common::types::{ConnectionState, ConsumerId, MediaKind, ProducerId, TransportId};
use serde::Serialize;
use serde_json::Value;
use std::net::IpAddr;
use tokio::sync::broadcast;

/// Options for a new engine transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOptions {
    /// Participant-facing transport with ICE/DTLS.
    WebRtc {
        listen_ip: IpAddr,
        announced_ip: Option<IpAddr>,
        enable_udp: bool,
        enable_tcp: bool,
        prefer_udp: bool,
        enable_sctp: bool,
    },
    /// Engine-local RTP endpoint without ICE/DTLS (compositing bridge).
    Plain {
        listen_ip: IpAddr,
        rtcp_mux: bool,
        comedia: bool,
    },
}

impl TransportOptions {
    /// Participant transport options: UDP preferred, TCP and SCTP enabled.
    #[must_use]
    pub fn webrtc(listen_ip: IpAddr, announced_ip: IpAddr) -> Self {
        TransportOptions::WebRtc {
            listen_ip,
            announced_ip: Some(announced_ip),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            enable_sctp: true,
        }
    }

    /// Loopback plain transport with separate RTCP, as the encoder expects.
    #[must_use]
    pub fn plain(listen_ip: IpAddr) -> Self {
        TransportOptions::Plain {
            listen_ip,
            rtcp_mux: false,
            comedia: false,
        }
    }
}

/// Local address of a plain transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTuple {
    pub local_ip: IpAddr,
    pub local_port: u16,
}

/// What the engine hands back for a new transport.
///
/// WebRTC transports carry ICE/DTLS/SCTP parameters for the remote side;
/// plain transports carry their local tuple.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: TransportId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_parameters: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ice_candidates: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtls_parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tuple: Option<PlainTuple>,
}

/// Remote parameters completing a transport's connect handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectParams {
    Dtls {
        dtls_parameters: Value,
    },
    Plain {
        ip: IpAddr,
        port: u16,
        rtcp_port: u16,
    },
}

/// A consumer as created by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerDescriptor {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

/// Asynchronous notifications from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A transport's connection (DTLS) state changed.
    TransportStateChanged {
        id: TransportId,
        state: ConnectionState,
    },
    /// The engine hit an unrecoverable failure. Fatal to the whole server.
    Died { reason: String },
}

/// Contract of the media-routing engine.
///
/// Close operations are idempotent: closing an unknown or already-closed
/// resource is a no-op. Closing a transport closes its producers and
/// consumers inside the engine; closing a producer closes its consumers.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Codecs the router can negotiate.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> Result<TransportDescriptor, CastError>;

    async fn connect_transport(
        &self,
        id: TransportId,
        params: ConnectParams,
    ) -> Result<(), CastError>;

    /// Start receiving media on `transport_id`.
    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, CastError>;

    /// Whether an endpoint with `capabilities` can decode `producer_id`.
    fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool;

    /// Start sending `producer_id` out of `transport_id`.
    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerDescriptor, CastError>;

    async fn resume_consumer(&self, id: ConsumerId) -> Result<(), CastError>;

    async fn close_transport(&self, id: TransportId);

    async fn close_producer(&self, id: ProducerId);

    async fn close_consumer(&self, id: ConsumerId);

    /// Current connection state of a transport, `None` once the engine has
    /// released it. Used to resynchronise after missed events.
    fn transport_state(&self, id: TransportId) -> Option<ConnectionState>;

    /// Subscribe to engine events. Each call returns an independent receiver.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

/// Default router codecs: Opus stereo and VP8.
#[must_use]
pub fn default_router_capabilities() -> RtpCapabilities {
    use common::rtp::RtpCodecCapability;
    use serde_json::{json, Map};

    let mut vp8_parameters = Map::new();
    vp8_parameters.insert("x-google-start-bitrate".to_string(), json!(1000));

    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: Some(100),
                clock_rate: 48_000,
                channels: Some(2),
                parameters: Map::new(),
                rtcp_feedback: vec![json!({"type": "transport-cc"})],
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: Some(101),
                clock_rate: 90_000,
                channels: None,
                parameters: vp8_parameters,
                rtcp_feedback: vec![
                    json!({"type": "nack"}),
                    json!({"type": "nack", "parameter": "pli"}),
                    json!({"type": "ccm", "parameter": "fir"}),
                    json!({"type": "goog-remb"}),
                    json!({"type": "transport-cc"}),
                ],
            },
        ],
        header_extensions: Vec::new(),
    }
}
