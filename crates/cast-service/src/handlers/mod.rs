//! HTTP request handlers for the cast service.

pub mod metrics;
pub mod watch;

pub use metrics::metrics_handler;
pub use watch::{start_watch, stop_watch, watch_status};
