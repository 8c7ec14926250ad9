//! Turn cleanup protocol.
//!
//! [`end_processing`] is the only code allowed to take a session out of
//! processing. Every termination path (idle signal, runtime error, watchdog,
//! user abort, send failure, remote turn end) funnels through it with an
//! [`EndReason`], and the whole sequence runs under the session's turn lock
//! so that only one trigger can end a given turn.
//!
//! Sequence:
//!
//! 1. Flush the buffered response into history (with replay dedup).
//! 2. Cancel the watchdog.
//! 3. Zero the active tool-call count.
//! 4. Clear the sticky tools-used flag.
//! 5. Clear the resumed flag when no tool activity remains.
//! 6. Clear processing, start time, tool count, and phase.
//! 7. Emit a diagnostic record tagged with the trigger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::generation::TurnTicket;
use super::state::{SessionEntry, TurnState};
use super::watchdog::WatchdogTier;
use crate::diagnostics::metrics::MetricsCollector;
use crate::diagnostics::{DiagnosticEntry, DiagnosticKind, DiagnosticLogger};
use crate::history::HistoryStore;
use crate::models::history::MessageRole;
use crate::models::session::{ProcessingPhase, SessionHost};

/// Which dispatch attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAttempt {
    /// The initial send, when no reconnect was possible.
    FirstAttempt,
    /// The retry after a successful reconnect.
    Retry,
}

/// Termination cause handed to the cleanup protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The runtime reported the session idle.
    NormalCompletion,
    /// The runtime reported a failure.
    AgentError {
        /// Runtime-provided failure description.
        message: String,
    },
    /// No qualifying activity within the active watchdog tier.
    WatchdogTimeout {
        /// Seconds since the last event when the watchdog fired.
        idle_seconds: u64,
        /// Tier that was in force.
        tier: WatchdogTier,
    },
    /// The user asked to stop the turn.
    UserAbort {
        /// Where the aborted session is hosted.
        host: SessionHost,
    },
    /// Prompt dispatch failed before the turn began.
    SendFailure {
        /// Attempt that failed.
        attempt: SendAttempt,
        /// Transport error description.
        message: String,
    },
    /// A remotely hosted session signalled turn completion on its own channel.
    RemoteTurnEnd,
}

impl EndReason {
    /// Stable trigger name used in logs and diagnostic records.
    #[must_use]
    pub fn trigger_name(&self) -> &'static str {
        match self {
            Self::NormalCompletion => "normal_completion",
            Self::AgentError { .. } => "agent_error",
            Self::WatchdogTimeout { .. } => "watchdog_timeout",
            Self::UserAbort {
                host: SessionHost::Local,
            } => "user_abort_local",
            Self::UserAbort {
                host: SessionHost::Remote,
            } => "user_abort_remote",
            Self::SendFailure {
                attempt: SendAttempt::FirstAttempt,
                ..
            } => "send_failure_first_attempt",
            Self::SendFailure {
                attempt: SendAttempt::Retry,
                ..
            } => "send_failure_retry",
            Self::RemoteTurnEnd => "remote_turn_end",
        }
    }
}

/// Result of a cleanup request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// This trigger ended the turn.
    Ended {
        /// Trigger name.
        trigger: &'static str,
        /// Generation of the turn that ended.
        generation: u64,
        /// Whether buffered output was appended to history.
        flushed: bool,
    },
    /// The session was not processing; nothing to do.
    AlreadyIdle,
    /// The caller's ticket belongs to a turn that already ended.
    StaleGeneration {
        /// Generation the caller captured.
        captured: u64,
        /// Generation in force when the callback ran.
        current: u64,
    },
    /// The terminal event was emitted before the current turn started.
    StaleEvent {
        /// Event emission time.
        emitted_at: DateTime<Utc>,
        /// Start of the turn that is in flight.
        turn_started_at: DateTime<Utc>,
    },
}

impl CleanupOutcome {
    /// Whether this call performed the cleanup.
    #[must_use]
    pub fn ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }
}

/// Collaborators the cleanup protocol writes to.
#[derive(Clone)]
pub struct CleanupContext {
    history: Arc<dyn HistoryStore>,
    diagnostics: Option<Arc<dyn DiagnosticLogger>>,
    metrics: Arc<MetricsCollector>,
}

impl CleanupContext {
    /// Bundle the flush target and optional diagnostic sink.
    #[must_use]
    pub fn new(
        history: Arc<dyn HistoryStore>,
        diagnostics: Option<Arc<dyn DiagnosticLogger>>,
    ) -> Self {
        Self {
            history,
            diagnostics,
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    /// Flush target.
    #[must_use]
    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    /// Per-session turn and tool counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Write a diagnostic record; failures are logged, never propagated.
    pub fn record(&self, entry: DiagnosticEntry) {
        if let Some(ref sink) = self.diagnostics {
            if let Err(err) = sink.log_entry(entry) {
                warn!(%err, "failed to write diagnostic record");
            }
        }
    }
}

impl std::fmt::Debug for CleanupContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupContext")
            .field("diagnostics", &self.diagnostics.is_some())
            .finish_non_exhaustive()
    }
}

/// End the session's current turn, whatever generation it is on.
pub fn end_processing(
    entry: &SessionEntry,
    reason: EndReason,
    ctx: &CleanupContext,
) -> CleanupOutcome {
    run_cleanup(entry, TurnGuard::Any, reason, ctx)
}

/// End the turn only if it is still the one `ticket` was captured for.
///
/// Used by deferred callbacks (watchdog fires, delayed runtime
/// completions). A mismatch means a new turn started after the callback was
/// scheduled, so the call is a no-op.
pub fn end_processing_if_current(
    entry: &SessionEntry,
    ticket: &TurnTicket,
    reason: EndReason,
    ctx: &CleanupContext,
) -> CleanupOutcome {
    run_cleanup(entry, TurnGuard::Generation(ticket.generation()), reason, ctx)
}

/// End the turn in response to a runtime event emitted at `emitted_at`.
///
/// An event emitted before the in-flight turn started belongs to an earlier
/// turn (queued before a new send, or delivered late after an abort) and is
/// dropped.
pub fn end_processing_for_event(
    entry: &SessionEntry,
    emitted_at: DateTime<Utc>,
    reason: EndReason,
    ctx: &CleanupContext,
) -> CleanupOutcome {
    run_cleanup(entry, TurnGuard::EmittedAt(emitted_at), reason, ctx)
}

#[derive(Debug, Clone, Copy)]
enum TurnGuard {
    Any,
    Generation(u64),
    EmittedAt(DateTime<Utc>),
}

fn run_cleanup(
    entry: &SessionEntry,
    guard: TurnGuard,
    reason: EndReason,
    ctx: &CleanupContext,
) -> CleanupOutcome {
    let trigger = reason.trigger_name();
    let mut turn = entry.lock_turn();

    let generation = entry.generation();
    if let TurnGuard::Generation(captured) = guard {
        if captured != generation {
            drop(turn);
            debug!(
                session_id = entry.id(),
                trigger,
                captured,
                current = generation,
                "ignoring cleanup from a previous turn"
            );
            ctx.record(
                DiagnosticEntry::new(DiagnosticKind::StaleCallbackDropped)
                    .with_session(entry.id())
                    .with_trigger(trigger)
                    .with_generation(captured),
            );
            return CleanupOutcome::StaleGeneration {
                captured,
                current: generation,
            };
        }
    }

    if !entry.is_processing() {
        debug!(session_id = entry.id(), trigger, "session already idle");
        return CleanupOutcome::AlreadyIdle;
    }

    if let (TurnGuard::EmittedAt(emitted_at), Some(turn_started_at)) = (guard, turn.started_at) {
        if emitted_at < turn_started_at {
            drop(turn);
            debug!(
                session_id = entry.id(),
                trigger,
                %emitted_at,
                %turn_started_at,
                "ignoring terminal event from before the current turn"
            );
            ctx.record(
                DiagnosticEntry::new(DiagnosticKind::StaleCallbackDropped)
                    .with_session(entry.id())
                    .with_trigger(trigger)
                    .with_generation(generation)
                    .with_detail(format!("event emitted at {emitted_at}")),
            );
            return CleanupOutcome::StaleEvent {
                emitted_at,
                turn_started_at,
            };
        }
    }

    // 1. Nothing may be cleared before the buffered output is durable.
    let flushed = flush_turn_boundary(entry, &mut turn, ctx.history.as_ref());

    // 2.
    if let Some(watchdog) = turn.watchdog.take() {
        watchdog.cancel();
    }

    // 3. + 4.
    entry.reset_active_tools();
    entry.set_used_tools(false);

    // 5.
    if entry.active_tool_call_count() == 0 && !entry.has_used_tools_this_turn() {
        entry.set_resumed(false);
    } else {
        warn!(
            session_id = entry.id(),
            "tool activity observed during cleanup, keeping resumed flag"
        );
    }

    // 6.
    let started_at = turn.started_at.take();
    turn.tool_call_count = 0;
    turn.phase = ProcessingPhase::Idle;
    entry.set_processing(false);
    drop(turn);

    // 7.
    info!(
        session_id = entry.id(),
        trigger, generation, flushed, "turn ended"
    );
    let mut record = DiagnosticEntry::new(DiagnosticKind::TurnEnded)
        .with_session(entry.id())
        .with_trigger(trigger)
        .with_generation(generation);
    if let EndReason::AgentError { ref message } | EndReason::SendFailure { ref message, .. } =
        reason
    {
        record = record.with_detail(message.clone());
    }
    ctx.record(record);
    ctx.metrics
        .record_turn(entry.id(), started_at, Utc::now(), trigger);

    CleanupOutcome::Ended {
        trigger,
        generation,
        flushed,
    }
}

/// Move `current_response` into history unless it replays the latest
/// non-tool entry.
///
/// Step 1 of the cleanup sequence, and the sub-turn boundary flush the event
/// path runs at `turn_end` and before each `tool_start`. The caller holds the
/// turn lock. Returns `true` when a new history entry was written.
pub(crate) fn flush_turn_boundary(
    entry: &SessionEntry,
    turn: &mut TurnState,
    history: &dyn HistoryStore,
) -> bool {
    if turn.current_response.trim().is_empty() {
        turn.current_response.clear();
        return false;
    }

    let content = std::mem::take(&mut turn.current_response);
    let duplicate = history
        .last_non_tool_message(entry.id())
        .is_some_and(|last| last.content == content);

    if duplicate {
        debug!(
            session_id = entry.id(),
            "discarding buffered response identical to last history entry"
        );
        return false;
    }

    history.append_message(entry.id(), MessageRole::Assistant, &content);
    true
}
