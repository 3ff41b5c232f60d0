//! Signaling-only media engine.
//!
//! `LocalMediaEngine` allocates identities, validates parameters, performs
//! codec matching and emits transport state events, but forwards no media.
//! It keeps the orchestrator runnable end to end without a native media
//! stack and backs every test in this workspace.

use super::{
    default_router_capabilities, ConnectParams, ConsumerDescriptor, EngineEvent, MediaEngine,
    PlainTuple, TransportDescriptor, TransportOptions,
};
use crate::errors::CastError;
use async_trait::async_trait;
use common::rtp::{RtpCapabilities, RtpParameters};
use common::types::{ConnectionState, ConsumerId, MediaKind, ProducerId, TransportId};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Event channel capacity.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Port range handed out to transports.
const MIN_PORT: u16 = 40_000;
const MAX_PORT: u16 = 49_999;

#[derive(Debug)]
struct LocalTransport {
    plain: bool,
    state: ConnectionState,
    remote: Option<(IpAddr, u16, u16)>,
}

#[derive(Debug)]
struct LocalProducer {
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Debug)]
struct LocalConsumer {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Debug)]
struct EngineState {
    transports: HashMap<TransportId, LocalTransport>,
    producers: HashMap<ProducerId, LocalProducer>,
    consumers: HashMap<ConsumerId, LocalConsumer>,
    next_port: u16,
    next_mid: u32,
}

impl EngineState {
    fn allocate_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if port >= MAX_PORT { MIN_PORT } else { port + 1 };
        port
    }

    fn remove_producer(&mut self, id: ProducerId) {
        if self.producers.remove(&id).is_some() {
            self.consumers.retain(|_, c| c.producer_id != id);
        }
    }
}

/// Signaling-only [`MediaEngine`].
#[derive(Debug)]
pub struct LocalMediaEngine {
    capabilities: RtpCapabilities,
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

impl Default for LocalMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMediaEngine {
    /// Engine with the default router codecs (Opus, VP8).
    #[must_use]
    pub fn new() -> Self {
        Self::with_capabilities(default_router_capabilities())
    }

    #[must_use]
    pub fn with_capabilities(capabilities: RtpCapabilities) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            capabilities,
            state: Mutex::new(EngineState {
                transports: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
                next_port: MIN_PORT,
                next_mid: 0,
            }),
            events,
        }
    }

    /// Record a connection state reported by the network side and publish it.
    ///
    /// Unknown transports and backwards moves are ignored.
    pub fn report_transport_state(&self, id: TransportId, state: ConnectionState) {
        {
            let mut inner = self.state.lock();
            let Some(transport) = inner.transports.get_mut(&id) else {
                debug!(target: "cast.engine", transport_id = %id, "State report for unknown transport");
                return;
            };
            match transport.state.transition(state) {
                Ok(next) => transport.state = next,
                Err(e) => {
                    warn!(target: "cast.engine", transport_id = %id, error = %e, "Ignoring state report");
                    return;
                }
            }
        }
        self.publish(EngineEvent::TransportStateChanged { id, state });
    }

    /// Publish an unrecoverable engine failure.
    pub fn report_fatal(&self, reason: impl Into<String>) {
        self.publish(EngineEvent::Died {
            reason: reason.into(),
        });
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.state.lock().transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.state.lock().producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Paused flag of a live consumer.
    #[must_use]
    pub fn consumer_paused(&self, id: ConsumerId) -> Option<bool> {
        self.state.lock().consumers.get(&id).map(|c| c.paused)
    }

    /// Remote tuple a plain transport was connected to.
    #[must_use]
    pub fn plain_remote(&self, id: TransportId) -> Option<(IpAddr, u16, u16)> {
        self.state.lock().transports.get(&id).and_then(|t| t.remote)
    }

    fn publish(&self, event: EngineEvent) {
        // No subscribers is fine: nothing is listening yet.
        let _ = self.events.send(event);
    }
}

fn fingerprint() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn random_ssrc() -> u32 {
    let (high, _) = Uuid::new_v4().as_u64_pair();
    u32::try_from(high >> 32).unwrap_or_default()
}

#[async_trait]
impl MediaEngine for LocalMediaEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> Result<TransportDescriptor, CastError> {
        let id = TransportId::new();
        let mut inner = self.state.lock();

        let descriptor = match options {
            TransportOptions::WebRtc {
                listen_ip,
                announced_ip,
                enable_udp,
                enable_tcp,
                prefer_udp,
                enable_sctp,
            } => {
                if !enable_udp && !enable_tcp {
                    return Err(CastError::Engine(
                        "transport needs UDP or TCP enabled".to_string(),
                    ));
                }
                let ip = announced_ip.unwrap_or(listen_ip);
                let mut candidates = Vec::new();
                if enable_udp {
                    let priority = if prefer_udp { 1_076_302_079_u32 } else { 1_076_276_479 };
                    candidates.push(json!({
                        "foundation": "udpcandidate",
                        "priority": priority,
                        "ip": ip.to_string(),
                        "protocol": "udp",
                        "port": inner.allocate_port(),
                        "type": "host",
                    }));
                }
                if enable_tcp {
                    candidates.push(json!({
                        "foundation": "tcpcandidate",
                        "priority": 1_076_276_479_u32,
                        "ip": ip.to_string(),
                        "protocol": "tcp",
                        "port": inner.allocate_port(),
                        "type": "host",
                        "tcpType": "passive",
                    }));
                }

                inner.transports.insert(
                    id,
                    LocalTransport {
                        plain: false,
                        state: ConnectionState::New,
                        remote: None,
                    },
                );

                TransportDescriptor {
                    id,
                    ice_parameters: Some(json!({
                        "usernameFragment": Uuid::new_v4().simple().to_string(),
                        "password": Uuid::new_v4().simple().to_string(),
                        "iceLite": true,
                    })),
                    ice_candidates: candidates,
                    dtls_parameters: Some(json!({
                        "role": "auto",
                        "fingerprints": [{"algorithm": "sha-256", "value": fingerprint()}],
                    })),
                    sctp_parameters: enable_sctp.then(|| {
                        json!({"port": 5000, "OS": 1024, "MIS": 1024, "maxMessageSize": 262_144})
                    }),
                    tuple: None,
                }
            }
            TransportOptions::Plain { listen_ip, .. } => {
                let local_port = inner.allocate_port();
                inner.transports.insert(
                    id,
                    LocalTransport {
                        plain: true,
                        state: ConnectionState::New,
                        remote: None,
                    },
                );
                TransportDescriptor {
                    id,
                    ice_parameters: None,
                    ice_candidates: Vec::new(),
                    dtls_parameters: None,
                    sctp_parameters: None,
                    tuple: Some(PlainTuple {
                        local_ip: listen_ip,
                        local_port,
                    }),
                }
            }
        };

        debug!(target: "cast.engine", transport_id = %id, "Transport created");
        Ok(descriptor)
    }

    async fn connect_transport(
        &self,
        id: TransportId,
        params: ConnectParams,
    ) -> Result<(), CastError> {
        let events = {
            let mut inner = self.state.lock();
            let transport = inner
                .transports
                .get_mut(&id)
                .filter(|t| !t.state.is_terminal())
                .ok_or_else(|| CastError::NotFound(format!("transport {id}")))?;
            if transport.state != ConnectionState::New {
                return Err(CastError::InvalidRequest(
                    "transport already connected".to_string(),
                ));
            }

            match (params, transport.plain) {
                (ConnectParams::Dtls { dtls_parameters }, false) => {
                    if !dtls_parameters.is_object() {
                        return Err(CastError::InvalidRequest(
                            "dtlsParameters must be an object".to_string(),
                        ));
                    }
                    transport.state = ConnectionState::Connected;
                    vec![ConnectionState::Connecting, ConnectionState::Connected]
                }
                (
                    ConnectParams::Plain {
                        ip,
                        port,
                        rtcp_port,
                    },
                    true,
                ) => {
                    transport.remote = Some((ip, port, rtcp_port));
                    transport.state = ConnectionState::Connected;
                    Vec::new()
                }
                _ => {
                    return Err(CastError::InvalidRequest(
                        "connect parameters do not match transport type".to_string(),
                    ))
                }
            }
        };

        for state in events {
            self.publish(EngineEvent::TransportStateChanged { id, state });
        }
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, CastError> {
        let codec = rtp_parameters
            .primary_codec()
            .ok_or_else(|| CastError::InvalidRequest("rtpParameters has no codecs".to_string()))?;
        if !codec
            .mime_type
            .to_ascii_lowercase()
            .starts_with(kind.as_str())
        {
            return Err(CastError::InvalidRequest(format!(
                "codec {} does not carry {kind}",
                codec.mime_type
            )));
        }
        if self.capabilities.find_match(kind, codec).is_none() {
            return Err(CastError::InvalidRequest(format!(
                "unsupported codec {}",
                codec.mime_type
            )));
        }

        let mut inner = self.state.lock();
        if !inner
            .transports
            .get(&transport_id)
            .is_some_and(|t| !t.state.is_terminal())
        {
            return Err(CastError::NotFound(format!("transport {transport_id}")));
        }

        let id = ProducerId::new();
        inner.producers.insert(
            id,
            LocalProducer {
                transport_id,
                kind,
                rtp_parameters,
            },
        );
        Ok(id)
    }

    fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool {
        let inner = self.state.lock();
        inner.producers.get(&producer_id).is_some_and(|p| {
            p.rtp_parameters
                .primary_codec()
                .is_some_and(|codec| capabilities.find_match(p.kind, codec).is_some())
        })
    }

    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerDescriptor, CastError> {
        let mut inner = self.state.lock();
        if !inner
            .transports
            .get(&transport_id)
            .is_some_and(|t| !t.state.is_terminal())
        {
            return Err(CastError::NotFound(format!("transport {transport_id}")));
        }
        let producer = inner
            .producers
            .get(&producer_id)
            .ok_or_else(|| CastError::NotFound(format!("producer {producer_id}")))?;

        let codec = producer
            .rtp_parameters
            .primary_codec()
            .ok_or_else(|| CastError::Engine("producer has no codecs".to_string()))?;
        let capability = capabilities
            .find_match(producer.kind, codec)
            .ok_or_else(|| CastError::IncompatibleCapabilities(codec.mime_type.clone()))?;

        let mut consumer_codec = codec.clone();
        if let Some(pt) = capability.preferred_payload_type {
            consumer_codec.payload_type = pt;
        }
        let cname = producer
            .rtp_parameters
            .rtcp
            .as_ref()
            .and_then(|rtcp| rtcp.get("cname"))
            .cloned()
            .unwrap_or_else(|| Value::String("duocast".to_string()));
        let kind = producer.kind;

        let mid = inner.next_mid;
        inner.next_mid = mid.wrapping_add(1);

        let rtp_parameters = RtpParameters {
            mid: Some(mid.to_string()),
            codecs: vec![consumer_codec],
            header_extensions: Vec::new(),
            encodings: vec![json!({ "ssrc": random_ssrc() })],
            rtcp: Some(json!({ "cname": cname, "reducedSize": true })),
        };

        let id = ConsumerId::new();
        inner.consumers.insert(
            id,
            LocalConsumer {
                transport_id,
                producer_id,
                paused,
            },
        );

        Ok(ConsumerDescriptor {
            id,
            producer_id,
            kind,
            rtp_parameters,
            paused,
        })
    }

    async fn resume_consumer(&self, id: ConsumerId) -> Result<(), CastError> {
        let mut inner = self.state.lock();
        let consumer = inner
            .consumers
            .get_mut(&id)
            .ok_or_else(|| CastError::NotFound(format!("consumer {id}")))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_transport(&self, id: TransportId) {
        let mut inner = self.state.lock();
        if inner.transports.remove(&id).is_none() {
            return;
        }
        let producers: Vec<ProducerId> = inner
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == id)
            .map(|(pid, _)| *pid)
            .collect();
        for producer_id in producers {
            inner.remove_producer(producer_id);
        }
        inner.consumers.retain(|_, c| c.transport_id != id);
    }

    async fn close_producer(&self, id: ProducerId) {
        self.state.lock().remove_producer(id);
    }

    async fn close_consumer(&self, id: ConsumerId) {
        self.state.lock().consumers.remove(&id);
    }

    fn transport_state(&self, id: TransportId) -> Option<ConnectionState> {
        self.state.lock().transports.get(&id).map(|t| t.state)
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use common::rtp::RtpCodecParameters;
    use serde_json::Map;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn opus_parameters() -> RtpParameters {
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

    async fn webrtc(engine: &LocalMediaEngine) -> TransportId {
        engine
            .create_transport(TransportOptions::webrtc(LOCALHOST, LOCALHOST))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_webrtc_descriptor_has_handshake_parameters() {
        let engine = LocalMediaEngine::new();
        let descriptor = engine
            .create_transport(TransportOptions::webrtc(LOCALHOST, LOCALHOST))
            .await
            .unwrap();

        assert!(descriptor.ice_parameters.is_some());
        assert!(descriptor.dtls_parameters.is_some());
        assert!(descriptor.sctp_parameters.is_some());
        assert_eq!(descriptor.ice_candidates.len(), 2);
        assert_eq!(descriptor.ice_candidates[0]["protocol"], "udp");
        assert!(descriptor.tuple.is_none());
    }

    #[tokio::test]
    async fn test_dtls_connect_emits_states() {
        let engine = LocalMediaEngine::new();
        let mut events = engine.subscribe();
        let id = webrtc(&engine).await;

        engine
            .connect_transport(
                id,
                ConnectParams::Dtls {
                    dtls_parameters: json!({"role": "client", "fingerprints": []}),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::TransportStateChanged {
                id,
                state: ConnectionState::Connecting
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::TransportStateChanged {
                id,
                state: ConnectionState::Connected
            }
        );

        // Second connect is rejected
        let err = engine
            .connect_transport(
                id,
                ConnectParams::Dtls {
                    dtls_parameters: json!({}),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_plain_connect_records_remote() {
        let engine = LocalMediaEngine::new();
        let descriptor = engine
            .create_transport(TransportOptions::plain(LOCALHOST))
            .await
            .unwrap();
        assert!(descriptor.tuple.is_some());

        engine
            .connect_transport(
                descriptor.id,
                ConnectParams::Plain {
                    ip: LOCALHOST,
                    port: 5004,
                    rtcp_port: 5005,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            engine.plain_remote(descriptor.id),
            Some((LOCALHOST, 5004, 5005))
        );
    }

    #[tokio::test]
    async fn test_produce_rejects_unsupported_codec() {
        let engine = LocalMediaEngine::new();
        let transport = webrtc(&engine).await;

        let mut params = opus_parameters();
        params.codecs[0].mime_type = "audio/PCMU".to_string();
        params.codecs[0].clock_rate = 8000;
        let err = engine
            .produce(transport, MediaKind::Audio, params)
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::InvalidRequest(_)));

        let err = engine
            .produce(transport, MediaKind::Video, opus_parameters())
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_consume_uses_capability_payload_type() {
        let engine = LocalMediaEngine::new();
        let send = webrtc(&engine).await;
        let recv = webrtc(&engine).await;
        let producer = engine
            .produce(send, MediaKind::Audio, opus_parameters())
            .await
            .unwrap();

        let caps = engine.rtp_capabilities();
        assert!(engine.can_consume(producer, &caps));

        let consumer = engine.consume(recv, producer, &caps, false).await.unwrap();
        assert_eq!(consumer.kind, MediaKind::Audio);
        assert_eq!(consumer.rtp_parameters.codecs[0].payload_type, 100);
        assert!(!consumer.paused);
    }

    #[tokio::test]
    async fn test_consume_incompatible() {
        let engine = LocalMediaEngine::new();
        let send = webrtc(&engine).await;
        let recv = webrtc(&engine).await;
        let producer = engine
            .produce(send, MediaKind::Audio, opus_parameters())
            .await
            .unwrap();

        let empty = RtpCapabilities::default();
        assert!(!engine.can_consume(producer, &empty));
        let err = engine
            .consume(recv, producer, &empty, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::IncompatibleCapabilities(_)));
    }

    #[tokio::test]
    async fn test_close_transport_cascades() {
        let engine = LocalMediaEngine::new();
        let send = webrtc(&engine).await;
        let recv = webrtc(&engine).await;
        let producer = engine
            .produce(send, MediaKind::Audio, opus_parameters())
            .await
            .unwrap();
        let caps = engine.rtp_capabilities();
        engine.consume(recv, producer, &caps, false).await.unwrap();
        assert_eq!(engine.consumer_count(), 1);

        engine.close_transport(send).await;
        assert_eq!(engine.producer_count(), 0);
        assert_eq!(engine.consumer_count(), 0);

        // Idempotent
        engine.close_transport(send).await;
        assert_eq!(engine.transport_count(), 1);
        assert_eq!(engine.transport_state(send), None);
        assert_eq!(engine.transport_state(recv), Some(ConnectionState::New));
    }

    #[tokio::test]
    async fn test_report_state_ignores_backwards_moves() {
        let engine = LocalMediaEngine::new();
        let mut events = engine.subscribe();
        let id = webrtc(&engine).await;

        engine.report_transport_state(id, ConnectionState::Closed);
        engine.report_transport_state(id, ConnectionState::Connected);
        engine.report_fatal("worker died");

        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::TransportStateChanged {
                id,
                state: ConnectionState::Closed
            }
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::Died { .. }
        ));
    }
}
