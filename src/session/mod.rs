//! Session processing state machine.
//!
//! Covers the per-session turn record, the concurrent registry, the
//! generation guard, the watchdog, the cleanup protocol, the event-delivery
//! path, and the coordinator that ties them together.

pub mod cleanup;
pub mod coordinator;
pub mod events;
pub mod generation;
pub mod registry;
pub mod state;
pub mod watchdog;

pub use cleanup::{CleanupContext, CleanupOutcome, EndReason, SendAttempt};
pub use coordinator::{DispatchOutcome, SessionCoordinator};
pub use generation::TurnTicket;
pub use registry::SessionRegistry;
pub use state::SessionEntry;
