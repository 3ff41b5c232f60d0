//! Participant signaling over WebSocket.

pub mod protocol;
pub mod websocket;

pub use protocol::{ClientFrame, ResponseFrame, ServerEvent, SignalingRequest};
pub use websocket::{websocket_handler, WsQuery};
