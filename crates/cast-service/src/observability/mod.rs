//! Observability for the cast service.
//!
//! Instrumentation uses `#[instrument(skip_all)]` with explicit fields. Log
//! targets are `cast.*` (`cast.actor.session`, `cast.bridge`,
//! `cast.encoder`, `cast.signaling`, ...).
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `cast_sessions_active` | Gauge | none |
//! | `cast_producers_active` | Gauge | none |
//! | `cast_actor_mailbox_depth` | Gauge | `actor_type` |
//! | `cast_signaling_requests_total` | Counter | `method`, `status` |
//! | `cast_signaling_latency_seconds` | Histogram | `method` |
//! | `cast_events_dropped_total` | Counter | `event` |
//! | `cast_bridge_starts_total` | Counter | `outcome` |
//! | `cast_bridge_start_duration_seconds` | Histogram | none |
//! | `cast_bridge_streams` | Gauge | none |
//! | `cast_encoder_spawn_attempts_total` | Counter | `outcome` |
//! | `cast_encoder_exits_total` | Counter | `expected` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
