//! Common error types for Duocast components.

use crate::types::ConnectionState;
use thiserror::Error;

/// Common errors that can occur across Duocast components
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Codec mime type is not of the form `kind/name`
    #[error("Invalid mime type: {0}")]
    InvalidMimeType(String),

    /// Connection state moved backwards or out of a terminal state
    #[error("Invalid connection state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// Identifier could not be parsed
    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}

/// Result type alias using `CommonError`
pub type Result<T> = std::result::Result<T, CommonError>;
