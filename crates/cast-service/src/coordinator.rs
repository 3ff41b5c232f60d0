//! Producer/consumer coordination.
//!
//! Handles "start sending" and "start receiving" requests, stamps producer
//! ownership, fans stream-availability events out to the other sessions and
//! cascades closure: a closed producer takes every consumer bound to it down
//! and is announced as `producer-closed`.
//!
//! The compositing bridge learns about closures through
//! [`ProducerConsumerCoordinator::subscribe`] rather than being called
//! directly, so the bridge can react between its own steps.

use crate::engine::{MediaEngine, TransportDescriptor};
use crate::errors::CastError;
use crate::registry::{
    ConsumerRecord, NewProducer, ProducerRecord, ResourceRegistry, TransportClosure,
};
use crate::signaling::protocol::{
    ConsumeParams, ConsumerView, ProduceParams, ProducerSummary, ProducerView, ServerEvent,
};
use crate::transport::{StateOutcome, TransportLifecycle};
use common::rtp::RtpCapabilities;
use common::types::{
    ConnectionState, ProducerId, SessionId, TransportDirection, TransportId,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};

/// Capacity of the resource event channel.
const RESOURCE_EVENT_CAPACITY: usize = 256;

/// Resource changes other components react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    ProducerClosed {
        producer_id: ProducerId,
        session_id: SessionId,
    },
    SessionClosed {
        session_id: SessionId,
    },
}

/// What a closure cascade removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClosureReport {
    /// Producers closed, each announced once as `producer-closed`.
    pub producers_closed: Vec<ProducerId>,
    /// Consumers owned by the closed transport or session.
    pub consumers_freed: usize,
    /// Consumers in any session bound to a closed producer.
    pub dependent_consumers_closed: usize,
}

impl ClosureReport {
    fn absorb(&mut self, other: ClosureReport) {
        self.producers_closed.extend(other.producers_closed);
        self.consumers_freed += other.consumers_freed;
        self.dependent_consumers_closed += other.dependent_consumers_closed;
    }
}

pub struct ProducerConsumerCoordinator {
    engine: Arc<dyn MediaEngine>,
    registry: Arc<ResourceRegistry>,
    transports: TransportLifecycle,
    events: broadcast::Sender<ResourceEvent>,
}

impl ProducerConsumerCoordinator {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        registry: Arc<ResourceRegistry>,
        transports: TransportLifecycle,
    ) -> Self {
        let (events, _) = broadcast::channel(RESOURCE_EVENT_CAPACITY);
        Self {
            engine,
            registry,
            transports,
            events,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn transports(&self) -> &TransportLifecycle {
        &self.transports
    }

    /// Subscribe to producer and session closures.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> RtpCapabilities {
        self.engine.rtp_capabilities()
    }

    /// Register a new session and greet it with `connected`.
    pub fn open_session(
        &self,
        session_id: SessionId,
        display_name: &str,
        outbox: mpsc::Sender<ServerEvent>,
    ) -> Result<(), CastError> {
        self.registry
            .create_session(session_id, display_name, outbox)?;
        self.registry
            .send_to(session_id, ServerEvent::Connected { session_id })?;
        info!(target: "cast.coordinator", session_id = %session_id, display_name = %display_name, "Session opened");
        Ok(())
    }

    pub async fn create_transport(
        &self,
        session_id: SessionId,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, CastError> {
        self.transports.create_transport(session_id, direction).await
    }

    pub async fn connect_transport(
        &self,
        session_id: SessionId,
        transport_id: TransportId,
        dtls_parameters: Value,
    ) -> Result<TransportId, CastError> {
        self.transports
            .connect_transport(session_id, transport_id, dtls_parameters)
            .await
    }

    /// Start receiving a participant's stream and announce it to everyone else.
    #[instrument(skip_all, name = "cast.coordinator.produce", fields(session_id = %session_id, kind = %params.kind))]
    pub async fn produce(
        &self,
        session_id: SessionId,
        params: ProduceParams,
    ) -> Result<ProducerView, CastError> {
        let transport = self.registry.transport(session_id, params.transport_id)?;
        if transport.direction != TransportDirection::Send {
            return Err(CastError::InvalidRequest(
                "produce requires a send transport".to_string(),
            ));
        }
        let username = self.registry.display_name(session_id)?;

        let producer_id = self
            .engine
            .produce(params.transport_id, params.kind, params.rtp_parameters.clone())
            .await?;

        let record = match self.registry.insert_producer(
            session_id,
            NewProducer {
                id: producer_id,
                transport_id: params.transport_id,
                kind: params.kind,
                rtp_parameters: params.rtp_parameters,
                app_data: stamp_app_data(params.app_data, session_id, &username),
            },
        ) {
            Ok(record) => record,
            Err(e) => {
                // Transport or session went away during the engine call
                self.engine.close_producer(producer_id).await;
                return Err(e);
            }
        };

        let view = record.view();
        let delivery = self
            .registry
            .broadcast_except(Some(session_id), &ServerEvent::NewProducer(view.clone()));

        info!(
            target: "cast.coordinator",
            session_id = %session_id,
            producer_id = %producer_id,
            kind = %record.kind,
            username = %username,
            notified = delivery.delivered,
            "Producer created"
        );
        Ok(view)
    }

    /// Start sending an existing producer's media to a participant.
    #[instrument(skip_all, name = "cast.coordinator.consume", fields(session_id = %session_id, producer_id = %params.producer_id))]
    pub async fn consume(
        &self,
        session_id: SessionId,
        params: ConsumeParams,
    ) -> Result<ConsumerView, CastError> {
        let transport = self.registry.transport(session_id, params.transport_id)?;
        if transport.direction != TransportDirection::Recv {
            return Err(CastError::InvalidRequest(
                "consume requires a recv transport".to_string(),
            ));
        }
        let producer = self.registry.producer(params.producer_id)?;
        if !self
            .engine
            .can_consume(producer.id, &params.rtp_capabilities)
        {
            warn!(target: "cast.coordinator", session_id = %session_id, producer_id = %producer.id, "Cannot consume producer");
            return Err(CastError::IncompatibleCapabilities(format!(
                "producer {}",
                producer.id
            )));
        }
        let username = self.registry.display_name(session_id)?;

        let consumer = self
            .engine
            .consume(
                params.transport_id,
                producer.id,
                &params.rtp_capabilities,
                false,
            )
            .await?;

        let record = ConsumerRecord {
            id: consumer.id,
            producer_id: producer.id,
            transport_id: params.transport_id,
            kind: consumer.kind,
            paused: consumer.paused,
        };
        if let Err(e) = self.registry.insert_consumer(session_id, record) {
            self.engine.close_consumer(consumer.id).await;
            return Err(e);
        }

        // The producer may have closed while the engine call was in flight
        if self.registry.producer(producer.id).is_err() {
            self.registry.remove_consumers_of(producer.id);
            self.engine.close_consumer(consumer.id).await;
            return Err(CastError::NotFound(format!("producer {}", producer.id)));
        }

        debug!(target: "cast.coordinator", session_id = %session_id, consumer_id = %consumer.id, producer_id = %producer.id, "Consumer created");
        Ok(ConsumerView {
            id: consumer.id,
            producer_id: producer.id,
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
            app_data: stamp_app_data(Value::Null, session_id, &username),
        })
    }

    /// Every live producer, for late joiners.
    #[must_use]
    pub fn list_producers(&self) -> Vec<ProducerSummary> {
        self.registry
            .list_producers()
            .iter()
            .map(ProducerRecord::summary)
            .collect()
    }

    /// Explicitly close one of the session's producers.
    pub async fn close_producer(
        &self,
        session_id: SessionId,
        producer_id: ProducerId,
    ) -> Result<ClosureReport, CastError> {
        let record = self.registry.remove_producer(session_id, producer_id)?;
        Ok(self.cascade_producers(vec![record]).await)
    }

    /// React to an engine-reported connection state of a participant transport.
    pub async fn transport_state_changed(
        &self,
        session_id: SessionId,
        transport_id: TransportId,
        state: ConnectionState,
    ) -> ClosureReport {
        match self
            .transports
            .apply_state(session_id, transport_id, state)
            .await
        {
            StateOutcome::Closed(closure) => self.cascade_transport(closure).await,
            StateOutcome::Updated(_) | StateOutcome::Ignored => ClosureReport::default(),
        }
    }

    /// Close a participant transport and everything built on it. Idempotent.
    pub async fn close_transport(
        &self,
        session_id: SessionId,
        transport_id: TransportId,
    ) -> ClosureReport {
        match self
            .transports
            .close_transport(session_id, transport_id)
            .await
        {
            Some(closure) => self.cascade_transport(closure).await,
            None => ClosureReport::default(),
        }
    }

    /// Tear down a session: every transport, producer and consumer it owned.
    #[instrument(skip_all, name = "cast.coordinator.close_session", fields(session_id = %session_id))]
    pub async fn close_session(&self, session_id: SessionId) -> Result<ClosureReport, CastError> {
        let closure = self.registry.remove_session(session_id)?;

        for transport in &closure.transports {
            self.engine.close_transport(transport.id).await;
        }
        for consumer in &closure.consumers {
            self.engine.close_consumer(consumer.id).await;
        }

        let mut report = ClosureReport {
            consumers_freed: closure.consumers.len(),
            ..ClosureReport::default()
        };
        report.absorb(self.cascade_producers(closure.producers).await);

        let _ = self.events.send(ResourceEvent::SessionClosed { session_id });

        info!(
            target: "cast.coordinator",
            session_id = %session_id,
            display_name = %closure.display_name,
            transports = closure.transports.len(),
            producers = report.producers_closed.len(),
            consumers = report.consumers_freed,
            "Session closed"
        );
        Ok(report)
    }

    async fn cascade_transport(&self, closure: TransportClosure) -> ClosureReport {
        for consumer in &closure.consumers {
            self.engine.close_consumer(consumer.id).await;
        }
        let mut report = ClosureReport {
            consumers_freed: closure.consumers.len(),
            ..ClosureReport::default()
        };
        report.absorb(self.cascade_producers(closure.producers).await);
        report
    }

    /// Close producers already removed from the registry: close every
    /// consumer bound to them and announce each closure once.
    async fn cascade_producers(&self, producers: Vec<ProducerRecord>) -> ClosureReport {
        let mut report = ClosureReport::default();

        for producer in producers {
            self.engine.close_producer(producer.id).await;

            for (owner, consumer) in self.registry.remove_consumers_of(producer.id) {
                debug!(target: "cast.coordinator", session_id = %owner, consumer_id = %consumer.id, producer_id = %producer.id, "Consumer closed with producer");
                self.engine.close_consumer(consumer.id).await;
                report.dependent_consumers_closed += 1;
            }

            self.registry.broadcast_except(
                Some(producer.session_id),
                &ServerEvent::ProducerClosed {
                    producer_id: producer.id,
                },
            );
            let _ = self.events.send(ResourceEvent::ProducerClosed {
                producer_id: producer.id,
                session_id: producer.session_id,
            });

            info!(target: "cast.coordinator", session_id = %producer.session_id, producer_id = %producer.id, "Producer closed");
            report.producers_closed.push(producer.id);
        }

        report
    }
}

/// Merge client app data with the server-owned identity fields.
fn stamp_app_data(app_data: Value, session_id: SessionId, username: &str) -> Value {
    let mut map = match app_data {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    map.insert("clientId".to_string(), json!(session_id));
    map.insert("username".to_string(), json!(username));
    Value::Object(map)
}
