//! Per-session processing state.
//!
//! A [`SessionEntry`] is the canonical record of one session's in-flight
//! turn. Fields the watchdog and UI read from other tasks are atomics; every
//! write happens while holding the entry's turn lock, which is taken only by
//! the event-delivery path and the cleanup protocol. Holding that lock is
//! what makes one trigger win when several race to end the same turn.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;

use super::generation::TurnTicket;
use super::watchdog::WatchdogHandle;
use crate::models::session::{ProcessingPhase, ProcessingSnapshot, SessionHost};

/// Lock-protected turn fields that nothing reads from a timer context.
#[derive(Default)]
pub(crate) struct TurnState {
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) tool_call_count: u32,
    pub(crate) phase: ProcessingPhase,
    pub(crate) current_response: String,
    pub(crate) watchdog: Option<WatchdogHandle>,
}

/// Live processing state for one session.
pub struct SessionEntry {
    id: String,
    host: SessionHost,
    epoch: Instant,
    is_processing: AtomicBool,
    is_resumed: AtomicBool,
    has_used_tools: AtomicBool,
    active_tool_calls: AtomicU32,
    generation: AtomicU64,
    last_event_ms: AtomicU64,
    turn: Mutex<TurnState>,
    processing_tx: watch::Sender<bool>,
}

impl SessionEntry {
    /// Create an idle entry.
    #[must_use]
    pub fn new(id: impl Into<String>, host: SessionHost) -> Self {
        let (processing_tx, _) = watch::channel(false);
        Self {
            id: id.into(),
            host,
            epoch: Instant::now(),
            is_processing: AtomicBool::new(false),
            is_resumed: AtomicBool::new(false),
            has_used_tools: AtomicBool::new(false),
            active_tool_calls: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            last_event_ms: AtomicU64::new(0),
            turn: Mutex::new(TurnState::default()),
            processing_tx,
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hosting mode.
    #[must_use]
    pub fn host(&self) -> SessionHost {
        self.host
    }

    /// Whether a turn is in flight.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::SeqCst)
    }

    /// Whether a mid-turn resume is still catching up.
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.is_resumed.load(Ordering::SeqCst)
    }

    /// Whether any tool ran during the current turn.
    #[must_use]
    pub fn has_used_tools_this_turn(&self) -> bool {
        self.has_used_tools.load(Ordering::SeqCst)
    }

    /// Tools executing in the current reasoning round.
    #[must_use]
    pub fn active_tool_call_count(&self) -> u32 {
        self.active_tool_calls.load(Ordering::SeqCst)
    }

    /// Current turn generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Ticket for the current generation.
    #[must_use]
    pub fn ticket(&self) -> TurnTicket {
        TurnTicket::new(self.id.clone(), self.generation())
    }

    /// Time since the last inbound event (or turn start).
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let now_ms = self.ticks();
        let last = self.last_event_ms.load(Ordering::SeqCst);
        Duration::from_millis(now_ms.saturating_sub(last))
    }

    /// Record inbound activity for watchdog staleness checks.
    pub fn touch(&self) {
        self.last_event_ms.store(self.ticks(), Ordering::SeqCst);
    }

    /// Subscribe to `is_processing` transitions.
    #[must_use]
    pub fn subscribe_processing(&self) -> watch::Receiver<bool> {
        self.processing_tx.subscribe()
    }

    /// Copy the current state for display.
    #[must_use]
    pub fn snapshot(&self) -> ProcessingSnapshot {
        let turn = self.lock_turn();
        ProcessingSnapshot {
            session_id: self.id.clone(),
            host: self.host,
            is_processing: self.is_processing(),
            is_resumed: self.is_resumed(),
            has_used_tools_this_turn: self.has_used_tools_this_turn(),
            active_tool_call_count: self.active_tool_call_count(),
            processing_started_at: turn.started_at,
            tool_call_count: turn.tool_call_count,
            processing_phase: turn.phase,
            processing_generation: self.generation(),
            current_response: turn.current_response.clone(),
        }
    }

    fn ticks(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    // ── Writers: callers must hold the turn lock ─────────────

    pub(crate) fn lock_turn(&self) -> MutexGuard<'_, TurnState> {
        self.turn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new turn: bump the generation and enter processing.
    pub(crate) fn begin_turn(&self, turn: &mut TurnState, resumed: bool) -> TurnTicket {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.active_tool_calls.store(0, Ordering::SeqCst);
        self.has_used_tools.store(false, Ordering::SeqCst);
        self.is_resumed.store(resumed, Ordering::SeqCst);
        turn.started_at = Some(Utc::now());
        turn.tool_call_count = 0;
        turn.phase = if resumed {
            ProcessingPhase::Thinking
        } else {
            ProcessingPhase::Sending
        };
        self.touch();
        self.set_processing(true);
        TurnTicket::new(self.id.clone(), generation)
    }

    pub(crate) fn set_processing(&self, value: bool) {
        self.is_processing.store(value, Ordering::SeqCst);
        self.processing_tx.send_replace(value);
    }

    pub(crate) fn set_resumed(&self, value: bool) {
        self.is_resumed.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_used_tools(&self, value: bool) {
        self.has_used_tools.store(value, Ordering::SeqCst);
    }

    pub(crate) fn reset_active_tools(&self) {
        self.active_tool_calls.store(0, Ordering::SeqCst);
    }

    pub(crate) fn tool_started(&self) {
        self.active_tool_calls.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn tool_finished(&self) {
        // Saturate: the count may already have been reset by a new round.
        let _ = self
            .active_tool_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("is_processing", &self.is_processing())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}
