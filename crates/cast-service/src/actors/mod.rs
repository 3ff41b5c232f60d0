//! Actor model for the cast service.
//!
//! ```text
//! SessionSupervisor (singleton)
//! └── supervises N SessionActors
//!     └── SessionActor (one per signaling connection)
//!         └── serializes that participant's requests
//! BridgeActor (singleton, see `crate::bridge`)
//! └── owns the compositing job and its encoder
//! EngineEventRouter
//! └── routes engine transport events to the owning actor
//! ```
//!
//! Each actor owns a bounded mailbox and a `CancellationToken` derived from
//! the root token, so cancelling the root drains the whole tree.

pub mod messages;
pub mod metrics;
pub mod router;
pub mod session;
pub mod supervisor;

pub use messages::{BridgeMessage, SessionMessage};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use router::{EngineEventRouter, RouterExit};
pub use session::{SessionActor, SessionActorHandle};
pub use supervisor::SessionSupervisor;
