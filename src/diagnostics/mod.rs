//! Structured diagnostic records for turn and reflection lifecycle events.
//!
//! Provides the [`DiagnosticLogger`] trait and associated types. The primary
//! implementation, [`JsonlDiagnosticWriter`], appends JSONL records to
//! daily-rotating files. [`metrics`] aggregates per-session usage counters.

pub mod metrics;
pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type classification for diagnostic entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A new turn (send or resume) began.
    TurnStarted,
    /// The cleanup protocol ended a turn.
    TurnEnded,
    /// The watchdog judged a session stuck.
    WatchdogFired,
    /// An asynchronous callback was dropped by the generation guard.
    StaleCallbackDropped,
    /// A reflection iteration was evaluated.
    ReflectionIteration,
    /// A reflection loop terminated.
    ReflectionFinished,
}

/// A structured record of one lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticEntry {
    /// ISO 8601 timestamp with timezone.
    pub timestamp: DateTime<Utc>,
    /// Event classification.
    pub kind: DiagnosticKind,
    /// Associated session identifier.
    pub session_id: Option<String>,
    /// Associated orchestration group identifier.
    pub group_id: Option<String>,
    /// Trigger name (for `turn_ended` and `stale_callback_dropped`).
    pub trigger: Option<String>,
    /// Turn generation the event applies to.
    pub generation: Option<u64>,
    /// Free-form detail.
    pub detail: Option<String>,
}

impl DiagnosticEntry {
    /// Construct a minimal entry for the given kind.
    #[must_use]
    pub fn new(kind: DiagnosticKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            session_id: None,
            group_id: None,
            trigger: None,
            generation: None,
            detail: None,
        }
    }

    /// Set the session identifier.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the orchestration group identifier.
    #[must_use]
    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Set the trigger name.
    #[must_use]
    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    /// Set the turn generation.
    #[must_use]
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Set the free-form detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Writes diagnostic entries to a persistent store.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait DiagnosticLogger: Send + Sync {
    /// Record a single entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn log_entry(&self, entry: DiagnosticEntry) -> crate::Result<()>;
}

pub use writer::JsonlDiagnosticWriter;
