//! Cast Service Library
//!
//! Signaling and orchestration server for Duocast: participants publish
//! audio/video through a selective forwarding media engine, receive each
//! other's media, and on demand all published media is composited into a
//! single HLS stream by an external encoder.
//!
//! # Architecture
//!
//! ```text
//! WebSocket /ws ──> SessionActor (one per participant) ──┐
//!                                                        ├─> ProducerConsumerCoordinator
//! HTTP /watch ────> BridgeActor (single job) ────────────┘        │
//!                        │                                ResourceRegistry
//!                        └─> encoder process (SDP in, HLS out)    │
//! MediaEngine events ──> EngineEventRouter ──> owning actor  TransportLifecycle
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per session**: each participant's requests run through
//!   one actor mailbox; sessions proceed concurrently.
//! - **Single compositing job**: bridge transitions are serialized in the
//!   bridge actor; a stop cancels an in-flight start between steps.
//! - **Engine behind a trait**: the orchestrator never depends on a concrete
//!   ICE/DTLS/SRTP implementation.
//!
//! # Modules
//!
//! - [`actors`] - Session actors, supervisor and engine event router
//! - [`bridge`] - Compositing job, session descriptor and encoder control
//! - [`coordinator`] - Produce/consume orchestration and closure cascades
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with stable error codes

pub mod actors;
pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod observability;
pub mod registry;
pub mod routes;
pub mod runtime;
pub mod signaling;
pub mod transport;
