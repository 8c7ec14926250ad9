//! Generation guard for asynchronous completions.
//!
//! A [`TurnTicket`] is captured before any asynchronous hand-off (arming a
//! watchdog, deferring a UI dispatch, waiting on a runtime callback). When
//! the callback finally runs it must present the ticket; if the session has
//! started a newer turn in the meantime the callback is dropped.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::state::SessionEntry;

/// Captured `(session, generation)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnTicket {
    session_id: String,
    generation: u64,
}

impl TurnTicket {
    /// Construct a ticket.
    #[must_use]
    pub fn new(session_id: String, generation: u64) -> Self {
        Self {
            session_id,
            generation,
        }
    }

    /// Session the ticket was captured for.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Generation at capture time.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `entry` is still on the captured generation.
    #[must_use]
    pub fn is_current(&self, entry: &SessionEntry) -> bool {
        entry.id() == self.session_id && entry.generation() == self.generation
    }
}

/// Run `callback` only if `ticket` still matches the session's generation.
///
/// Returns `None` (and leaves the session untouched) when the ticket is
/// stale. Callbacks that end the turn should use
/// [`end_processing_if_current`](super::cleanup::end_processing_if_current)
/// instead, which performs the same check under the turn lock.
pub fn run_if_current<T>(
    entry: &SessionEntry,
    ticket: &TurnTicket,
    callback: impl FnOnce(&SessionEntry) -> T,
) -> Option<T> {
    if ticket.is_current(entry) {
        Some(callback(entry))
    } else {
        debug!(
            session_id = entry.id(),
            captured = ticket.generation(),
            current = entry.generation(),
            "dropping stale callback"
        );
        None
    }
}
