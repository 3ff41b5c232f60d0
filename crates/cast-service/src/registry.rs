//! In-memory store of live sessions and the resources each one owns.
//!
//! The registry holds no policy. It inserts, looks up and removes records,
//! and on removal hands back everything that hung off the removed record so
//! the caller can close it in the engine and notify peers. Missing records
//! are reported as [`CastError::NotFound`]: requests routinely race a
//! disconnect and callers decide whether that matters.
//!
//! Locks are held only for the map operation itself, never across an await.

use crate::errors::CastError;
use crate::observability::metrics;
use crate::signaling::protocol::{ProducerSummary, ProducerView, ServerEvent};
use common::rtp::RtpParameters;
use common::types::{
    ConnectionState, ConsumerId, MediaKind, ProducerId, SessionId, TransportDirection,
    TransportId,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct TransportRecord {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub id: ProducerId,
    pub session_id: SessionId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: Value,
    /// Registration order across all sessions.
    pub seq: u64,
}

impl ProducerRecord {
    #[must_use]
    pub fn view(&self) -> ProducerView {
        ProducerView {
            id: self.id,
            kind: self.kind,
            rtp_parameters: self.rtp_parameters.clone(),
            app_data: self.app_data.clone(),
        }
    }

    #[must_use]
    pub fn summary(&self) -> ProducerSummary {
        ProducerSummary {
            id: self.id,
            kind: self.kind,
            app_data: self.app_data.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub paused: bool,
}

/// New producer data; the registry assigns the owner and sequence number.
#[derive(Debug, Clone)]
pub struct NewProducer {
    pub id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: Value,
}

/// Everything removed together with a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportClosure {
    pub transport: TransportRecord,
    pub producers: Vec<ProducerRecord>,
    pub consumers: Vec<ConsumerRecord>,
}

/// Everything removed together with a session.
#[derive(Debug, Clone)]
pub struct SessionClosure {
    pub session_id: SessionId,
    pub display_name: String,
    pub transports: Vec<TransportRecord>,
    pub producers: Vec<ProducerRecord>,
    pub consumers: Vec<ConsumerRecord>,
}

/// Outcome of fanning an event out to sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug)]
struct SessionRecord {
    display_name: String,
    outbox: mpsc::Sender<ServerEvent>,
    transports: HashMap<TransportId, TransportRecord>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, SessionRecord>,
    next_seq: u64,
}

impl RegistryInner {
    fn session(&self, id: SessionId) -> Result<&SessionRecord, CastError> {
        self.sessions
            .get(&id)
            .ok_or_else(|| CastError::NotFound(format!("session {id}")))
    }

    fn session_mut(&mut self, id: SessionId) -> Result<&mut SessionRecord, CastError> {
        self.sessions
            .get_mut(&id)
            .ok_or_else(|| CastError::NotFound(format!("session {id}")))
    }
}

/// Authoritative store of sessions, transports, producers and consumers.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    inner: RwLock<RegistryInner>,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Register a session and the queue its events are delivered to.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if the id is already registered.
    pub fn create_session(
        &self,
        id: SessionId,
        display_name: impl Into<String>,
        outbox: mpsc::Sender<ServerEvent>,
    ) -> Result<(), CastError> {
        let mut inner = self.inner.write();
        if inner.sessions.contains_key(&id) {
            return Err(CastError::InvalidRequest(format!(
                "session {id} already exists"
            )));
        }
        inner.sessions.insert(
            id,
            SessionRecord {
                display_name: display_name.into(),
                outbox,
                transports: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
            },
        );
        metrics::set_sessions_active(inner.sessions.len());
        Ok(())
    }

    #[must_use]
    pub fn contains_session(&self, id: SessionId) -> bool {
        self.inner.read().sessions.contains_key(&id)
    }

    pub fn display_name(&self, id: SessionId) -> Result<String, CastError> {
        Ok(self.inner.read().session(id)?.display_name.clone())
    }

    /// Remove a session, returning every resource it owned.
    pub fn remove_session(&self, id: SessionId) -> Result<SessionClosure, CastError> {
        let mut inner = self.inner.write();
        let record = inner
            .sessions
            .remove(&id)
            .ok_or_else(|| CastError::NotFound(format!("session {id}")))?;
        metrics::set_sessions_active(inner.sessions.len());
        metrics::set_producers_active(count_producers(&inner));

        let mut producers: Vec<ProducerRecord> = record.producers.into_values().collect();
        producers.sort_by_key(|p| p.seq);

        Ok(SessionClosure {
            session_id: id,
            display_name: record.display_name,
            transports: record.transports.into_values().collect(),
            producers,
            consumers: record.consumers.into_values().collect(),
        })
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    pub fn insert_transport(
        &self,
        session_id: SessionId,
        record: TransportRecord,
    ) -> Result<(), CastError> {
        let mut inner = self.inner.write();
        inner
            .session_mut(session_id)?
            .transports
            .insert(record.id, record);
        Ok(())
    }

    pub fn transport(
        &self,
        session_id: SessionId,
        transport_id: TransportId,
    ) -> Result<TransportRecord, CastError> {
        self.inner
            .read()
            .session(session_id)?
            .transports
            .get(&transport_id)
            .cloned()
            .ok_or_else(|| CastError::NotFound(format!("transport {transport_id}")))
    }

    /// Apply a monotonic connection state change. Returns the new state.
    pub fn set_transport_state(
        &self,
        session_id: SessionId,
        transport_id: TransportId,
        state: ConnectionState,
    ) -> Result<ConnectionState, CastError> {
        let mut inner = self.inner.write();
        let transport = inner
            .session_mut(session_id)?
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| CastError::NotFound(format!("transport {transport_id}")))?;
        transport.state = transport.state.transition(state)?;
        Ok(transport.state)
    }

    /// Session owning `transport_id`, if any.
    #[must_use]
    pub fn transport_owner(&self, transport_id: TransportId) -> Option<SessionId> {
        self.inner
            .read()
            .sessions
            .iter()
            .find(|(_, s)| s.transports.contains_key(&transport_id))
            .map(|(id, _)| *id)
    }

    /// Every registered participant transport with its owner.
    #[must_use]
    pub fn transports(&self) -> Vec<(SessionId, TransportId)> {
        self.inner
            .read()
            .sessions
            .iter()
            .flat_map(|(session_id, s)| s.transports.keys().map(|id| (*session_id, *id)))
            .collect()
    }

    /// Remove a transport together with the producers and consumers on it.
    pub fn remove_transport(
        &self,
        session_id: SessionId,
        transport_id: TransportId,
    ) -> Result<TransportClosure, CastError> {
        let mut inner = self.inner.write();
        let session = inner.session_mut(session_id)?;
        let mut transport = session
            .transports
            .remove(&transport_id)
            .ok_or_else(|| CastError::NotFound(format!("transport {transport_id}")))?;
        transport.state = ConnectionState::Closed;

        let producer_ids: Vec<ProducerId> = session
            .producers
            .values()
            .filter(|p| p.transport_id == transport_id)
            .map(|p| p.id)
            .collect();
        let mut producers: Vec<ProducerRecord> = producer_ids
            .iter()
            .filter_map(|id| session.producers.remove(id))
            .collect();
        producers.sort_by_key(|p| p.seq);

        let consumer_ids: Vec<ConsumerId> = session
            .consumers
            .values()
            .filter(|c| c.transport_id == transport_id)
            .map(|c| c.id)
            .collect();
        let consumers = consumer_ids
            .iter()
            .filter_map(|id| session.consumers.remove(id))
            .collect();

        metrics::set_producers_active(count_producers(&inner));

        Ok(TransportClosure {
            transport,
            producers,
            consumers,
        })
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    /// Register a producer on one of the session's live transports.
    pub fn insert_producer(
        &self,
        session_id: SessionId,
        producer: NewProducer,
    ) -> Result<ProducerRecord, CastError> {
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        let session = inner.session_mut(session_id)?;
        if !session.transports.contains_key(&producer.transport_id) {
            return Err(CastError::NotFound(format!(
                "transport {}",
                producer.transport_id
            )));
        }

        let record = ProducerRecord {
            id: producer.id,
            session_id,
            transport_id: producer.transport_id,
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters,
            app_data: producer.app_data,
            seq,
        };
        session.producers.insert(record.id, record.clone());
        inner.next_seq = seq + 1;

        metrics::set_producers_active(count_producers(&inner));
        Ok(record)
    }

    /// Look up a producer in any session.
    pub fn producer(&self, producer_id: ProducerId) -> Result<ProducerRecord, CastError> {
        self.inner
            .read()
            .sessions
            .values()
            .find_map(|s| s.producers.get(&producer_id).cloned())
            .ok_or_else(|| CastError::NotFound(format!("producer {producer_id}")))
    }

    pub fn remove_producer(
        &self,
        session_id: SessionId,
        producer_id: ProducerId,
    ) -> Result<ProducerRecord, CastError> {
        let mut inner = self.inner.write();
        let record = inner
            .session_mut(session_id)?
            .producers
            .remove(&producer_id)
            .ok_or_else(|| CastError::NotFound(format!("producer {producer_id}")))?;
        metrics::set_producers_active(count_producers(&inner));
        Ok(record)
    }

    /// All live producers in registration order.
    #[must_use]
    pub fn list_producers(&self) -> Vec<ProducerRecord> {
        let inner = self.inner.read();
        let mut producers: Vec<ProducerRecord> = inner
            .sessions
            .values()
            .flat_map(|s| s.producers.values().cloned())
            .collect();
        producers.sort_by_key(|p| p.seq);
        producers
    }

    /// Number of sessions with at least one live producer.
    #[must_use]
    pub fn producing_session_count(&self) -> usize {
        self.inner
            .read()
            .sessions
            .values()
            .filter(|s| !s.producers.is_empty())
            .count()
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    /// Register a consumer on one of the session's live transports.
    pub fn insert_consumer(
        &self,
        session_id: SessionId,
        record: ConsumerRecord,
    ) -> Result<(), CastError> {
        let mut inner = self.inner.write();
        let session = inner.session_mut(session_id)?;
        if !session.transports.contains_key(&record.transport_id) {
            return Err(CastError::NotFound(format!(
                "transport {}",
                record.transport_id
            )));
        }
        session.consumers.insert(record.id, record);
        Ok(())
    }

    pub fn consumer(
        &self,
        session_id: SessionId,
        consumer_id: ConsumerId,
    ) -> Result<ConsumerRecord, CastError> {
        self.inner
            .read()
            .session(session_id)?
            .consumers
            .get(&consumer_id)
            .cloned()
            .ok_or_else(|| CastError::NotFound(format!("consumer {consumer_id}")))
    }

    /// Remove every consumer, in any session, bound to `producer_id`.
    pub fn remove_consumers_of(
        &self,
        producer_id: ProducerId,
    ) -> Vec<(SessionId, ConsumerRecord)> {
        let mut inner = self.inner.write();
        let mut removed = Vec::new();
        for (session_id, session) in &mut inner.sessions {
            let ids: Vec<ConsumerId> = session
                .consumers
                .values()
                .filter(|c| c.producer_id == producer_id)
                .map(|c| c.id)
                .collect();
            for id in ids {
                if let Some(record) = session.consumers.remove(&id) {
                    removed.push((*session_id, record));
                }
            }
        }
        removed
    }

    // ------------------------------------------------------------------
    // Event delivery
    // ------------------------------------------------------------------

    /// Queue `event` for one session without waiting.
    pub fn send_to(&self, session_id: SessionId, event: ServerEvent) -> Result<(), CastError> {
        let inner = self.inner.read();
        let session = inner.session(session_id)?;
        match session.outbox.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                warn!(target: "cast.registry", session_id = %session_id, event = event.name(), "Event queue full, dropping event");
                metrics::record_event_dropped(event.name());
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                Err(CastError::NotFound(format!("session {session_id}")))
            }
        }
    }

    /// Queue `event` for every session except `exclude`.
    ///
    /// A full queue drops the event for that session only.
    pub fn broadcast_except(&self, exclude: Option<SessionId>, event: &ServerEvent) -> Delivery {
        let inner = self.inner.read();
        let mut delivery = Delivery::default();
        for (session_id, session) in &inner.sessions {
            if Some(*session_id) == exclude {
                continue;
            }
            match session.outbox.try_send(event.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(target: "cast.registry", session_id = %session_id, event = event.name(), "Event queue full, dropping event");
                    metrics::record_event_dropped(event.name());
                    delivery.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(target: "cast.registry", session_id = %session_id, "Session outbox closed during broadcast");
                    delivery.dropped += 1;
                }
            }
        }
        delivery
    }
}

fn count_producers(inner: &RegistryInner) -> usize {
    inner.sessions.values().map(|s| s.producers.len()).sum()
}
