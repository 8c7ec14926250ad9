//! Durable chat history port.
//!
//! The cleanup protocol flushes buffered assistant output through
//! [`HistoryStore::append_message`]. Appends are synchronous and assumed to
//! always succeed; real persistence (debounced disk writes) lives behind an
//! implementation of this trait outside the crate.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::models::history::{ChatMessage, MessageRole};

/// Append-only per-session message history.
///
/// Implementations must be [`Send`] and [`Sync`]: appends happen from the
/// event pump, watchdog tasks, and user commands.
pub trait HistoryStore: Send + Sync {
    /// Append one entry to a session's history.
    fn append_message(&self, session_id: &str, role: MessageRole, content: &str);

    /// All entries for a session, oldest first.
    fn messages(&self, session_id: &str) -> Vec<ChatMessage>;

    /// The most recent entry whose role is not [`MessageRole::Tool`].
    fn last_non_tool_message(&self, session_id: &str) -> Option<ChatMessage> {
        self.messages(session_id)
            .into_iter()
            .rev()
            .find(|m| m.role != MessageRole::Tool)
    }

    /// The most recent assistant entry.
    fn last_assistant_message(&self, session_id: &str) -> Option<ChatMessage> {
        self.messages(session_id)
            .into_iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
    }
}

/// Process-local [`HistoryStore`] backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    entries: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl InMemoryHistory {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for InMemoryHistory {
    fn append_message(&self, session_id: &str, role: MessageRole, content: &str) {
        let message = ChatMessage::new(session_id.to_owned(), role, content.to_owned());
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_owned())
            .or_default()
            .push(message);
    }

    fn messages(&self, session_id: &str) -> Vec<ChatMessage> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    fn last_non_tool_message(&self, session_id: &str) -> Option<ChatMessage> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)?
            .iter()
            .rev()
            .find(|m| m.role != MessageRole::Tool)
            .cloned()
    }
}
