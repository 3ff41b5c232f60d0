//! Compositing job state.
//!
//! `BridgeState` has one variant per lifecycle phase and each variant carries
//! only what is valid in it: there are no encoder handles before `Linking`
//! and no descriptor before `Starting`.

use super::descriptor::StreamDescriptor;
use super::encoder::EncoderHandle;
use chrono::{DateTime, Utc};
use common::rtp::RtpParameters;
use common::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Externally visible phase of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgePhase {
    Idle,
    Preparing,
    Starting,
    Linking,
    Running,
    Terminating,
}

impl BridgePhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            BridgePhase::Idle => "idle",
            BridgePhase::Preparing => "preparing",
            BridgePhase::Starting => "starting",
            BridgePhase::Linking => "linking",
            BridgePhase::Running => "running",
            BridgePhase::Terminating => "terminating",
        }
    }

    /// True while a job occupies the slot.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self, BridgePhase::Idle)
    }
}

impl fmt::Display for BridgePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published on the bridge's watch channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub phase: BridgePhase,
    /// Streams in the current descriptor.
    pub streams: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl BridgeStatus {
    #[must_use]
    pub fn idle() -> Self {
        Self {
            phase: BridgePhase::Idle,
            streams: 0,
            job_id: None,
            started_at: None,
        }
    }
}

/// One producer pulled into the job: a plain transport plus a consumer on it.
#[derive(Debug, Clone)]
pub struct BridgeLeg {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub transport_id: TransportId,
    pub consumer_id: ConsumerId,
    /// Consumer-side parameters; the payload type the encoder will see.
    pub rtp_parameters: RtpParameters,
    /// False once the producer closed and the leg was released.
    pub active: bool,
}

/// The single compositing job.
#[derive(Debug, Default)]
pub enum BridgeState {
    #[default]
    Idle,
    Preparing {
        job_id: Uuid,
        legs: Vec<BridgeLeg>,
    },
    Starting {
        job_id: Uuid,
        legs: Vec<BridgeLeg>,
        descriptor: StreamDescriptor,
    },
    Linking {
        job_id: Uuid,
        legs: Vec<BridgeLeg>,
        descriptor: StreamDescriptor,
        encoder: EncoderHandle,
    },
    Running {
        job_id: Uuid,
        legs: Vec<BridgeLeg>,
        descriptor: StreamDescriptor,
        encoder: EncoderHandle,
        started_at: DateTime<Utc>,
    },
    Terminating {
        job_id: Uuid,
    },
}

impl BridgeState {
    #[must_use]
    pub fn phase(&self) -> BridgePhase {
        match self {
            BridgeState::Idle => BridgePhase::Idle,
            BridgeState::Preparing { .. } => BridgePhase::Preparing,
            BridgeState::Starting { .. } => BridgePhase::Starting,
            BridgeState::Linking { .. } => BridgePhase::Linking,
            BridgeState::Running { .. } => BridgePhase::Running,
            BridgeState::Terminating { .. } => BridgePhase::Terminating,
        }
    }

    #[must_use]
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            BridgeState::Idle => None,
            BridgeState::Preparing { job_id, .. }
            | BridgeState::Starting { job_id, .. }
            | BridgeState::Linking { job_id, .. }
            | BridgeState::Running { job_id, .. }
            | BridgeState::Terminating { job_id } => Some(*job_id),
        }
    }

    pub fn legs_mut(&mut self) -> Option<&mut Vec<BridgeLeg>> {
        match self {
            BridgeState::Preparing { legs, .. }
            | BridgeState::Starting { legs, .. }
            | BridgeState::Linking { legs, .. }
            | BridgeState::Running { legs, .. } => Some(legs),
            BridgeState::Idle | BridgeState::Terminating { .. } => None,
        }
    }

    #[must_use]
    pub fn status(&self) -> BridgeStatus {
        let (streams, started_at) = match self {
            BridgeState::Starting { descriptor, .. } | BridgeState::Linking { descriptor, .. } => {
                (descriptor.entries.len(), None)
            }
            BridgeState::Running {
                descriptor,
                started_at,
                ..
            } => (descriptor.entries.len(), Some(*started_at)),
            _ => (0, None),
        };
        BridgeStatus {
            phase: self.phase(),
            streams,
            job_id: self.job_id(),
            started_at,
        }
    }

    /// Take the state out, leaving `Terminating` for the same job (or `Idle`).
    pub fn take_for_teardown(&mut self) -> BridgeState {
        let next = match self.job_id() {
            Some(job_id) => BridgeState::Terminating { job_id },
            None => BridgeState::Idle,
        };
        std::mem::replace(self, next)
    }
}
