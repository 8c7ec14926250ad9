//! Concurrent session registry.
//!
//! Maps session identifiers to their [`SessionEntry`]. The registry is an
//! explicitly owned value handed to every component that needs lookups;
//! there is no global instance. Lookups, inserts, and removals are safe from
//! any task, but mutating a found entry is reserved for the event-delivery
//! path and the cleanup protocol.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::state::SessionEntry;
use crate::models::session::{ProcessingSnapshot, SessionHost};
use crate::{AppError, Result};

/// Shared map type alias for session entries.
type EntryMap = Arc<RwLock<HashMap<String, Arc<SessionEntry>>>>;

/// Cheaply cloneable handle to the shared session map.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: EntryMap,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new idle session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyExists` if `session_id` is already registered.
    pub fn insert(&self, session_id: &str, host: SessionHost) -> Result<Arc<SessionEntry>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(session_id) {
            return Err(AppError::AlreadyExists(format!("session {session_id}")));
        }
        let entry = Arc::new(SessionEntry::new(session_id, host));
        sessions.insert(session_id.to_owned(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Look up a session.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Look up a session, failing if it is unknown.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `session_id` is not registered.
    pub fn require(&self, session_id: &str) -> Result<Arc<SessionEntry>> {
        self.get(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))
    }

    /// Remove a session, returning its entry if it was registered.
    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
    }

    /// Registered session identifiers.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Read-only snapshots of every registered session.
    #[must_use]
    pub fn snapshots(&self) -> Vec<ProcessingSnapshot> {
        let entries: Vec<Arc<SessionEntry>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries.iter().map(|e| e.snapshot()).collect()
    }
}
