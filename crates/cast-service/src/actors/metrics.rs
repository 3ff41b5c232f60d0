//! Actor mailbox and panic accounting.
//!
//! Each actor samples its own receiver after handling a message. The depth is
//! the number of messages still queued behind it, so a busy actor shows up
//! as a growing gauge rather than a constant 1.

use crate::observability::metrics as prom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `SessionActor` (one per signaling connection).
    Session,
    /// `BridgeActor` (singleton).
    Bridge,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Session => "session",
            ActorType::Bridge => "bridge",
        }
    }

    /// Backlog above which the actor logs a warning: half its mailbox.
    #[must_use]
    pub const fn backlog_threshold(&self) -> usize {
        match self {
            ActorType::Session => 32,
            ActorType::Bridge => 16,
        }
    }
}

/// Depth sampler for one actor's mailbox. Owned by the actor itself.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    peak_depth: usize,
    messages_processed: u64,
    backlogged: bool,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            peak_depth: 0,
            messages_processed: 0,
            backlogged: false,
        }
    }

    /// Record one handled message and the number still queued.
    pub fn record_processed(&mut self, queued: usize) {
        self.messages_processed += 1;
        self.peak_depth = self.peak_depth.max(queued);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), queued);

        let over = queued > self.actor_type.backlog_threshold();
        if over && !self.backlogged {
            warn!(
                target: "cast.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = queued,
                "Mailbox backlog"
            );
        } else if !over && self.backlogged {
            debug!(
                target: "cast.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                "Mailbox backlog cleared"
            );
        }
        self.backlogged = over;
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed
    }

    #[must_use]
    pub fn is_backlogged(&self) -> bool {
        self.backlogged
    }
}

/// Process-wide actor counters.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    actor_panics: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record an actor task that panicked.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "cast.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected"
        );
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.actor_panics.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_tracks_queued_depth() {
        let mut monitor = MailboxMonitor::new(ActorType::Session, "s-1");
        monitor.record_processed(0);
        monitor.record_processed(5);
        monitor.record_processed(2);

        assert_eq!(monitor.messages_processed(), 3);
        assert_eq!(monitor.peak_depth(), 5);
        assert!(!monitor.is_backlogged());
    }

    #[test]
    fn test_backlog_flag_follows_threshold() {
        let mut monitor = MailboxMonitor::new(ActorType::Bridge, "bridge");
        let threshold = ActorType::Bridge.backlog_threshold();

        monitor.record_processed(threshold);
        assert!(!monitor.is_backlogged());
        monitor.record_processed(threshold + 1);
        assert!(monitor.is_backlogged());
        monitor.record_processed(1);
        assert!(!monitor.is_backlogged());
    }

    #[test]
    fn test_panic_count() {
        let metrics = ActorMetrics::new();
        metrics.record_panic(ActorType::Session);
        metrics.record_panic(ActorType::Bridge);
        assert_eq!(metrics.panic_count(), 2);
    }
}
