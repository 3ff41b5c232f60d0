//! Test utilities for the cast service.
//!
//! - [`MockEncoder`]: scripted encoder launcher, no process spawned
//! - [`TestCastServer`]: real service on an ephemeral port, backed by the
//!   local media engine
//! - [`SignalingClient`]: WebSocket participant speaking the request/event
//!   protocol
//! - [`fixtures`]: RTP parameters, capabilities and a temporary workspace

pub mod fixtures;
pub mod mock_encoder;
pub mod server_harness;

pub use fixtures::TestWorkspace;
pub use mock_encoder::{MockEncoder, MockEncoderBuilder, MOCK_EXIT_CODE};
pub use server_harness::{RpcError, SignalingClient, TestCastServer, TestCastServerBuilder};
