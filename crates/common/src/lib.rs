//! Common types shared across Duocast components.

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for common data types
pub mod types;

/// Module for RTP parameter and capability types
pub mod rtp;

/// Module for common configuration
pub mod config;
