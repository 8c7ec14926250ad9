//! Event-delivery path.
//!
//! Applies one runtime [`AgentEvent`] to its session. Events for a session
//! arrive in order from a single consumer (see
//! [`SessionCoordinator::spawn_event_pump`](super::coordinator::SessionCoordinator::spawn_event_pump)),
//! and each state change happens under the session's turn lock.
//!
//! | Event | Effect while processing |
//! |-------|-------------------------|
//! | `turn_start` | new reasoning round: active tool count back to 0 |
//! | `turn_end` | sub-turn boundary flush |
//! | `tool_start` | boundary flush, count tool, set sticky tools-used flag |
//! | `tool_end` | decrement active tool count |
//! | `assistant_message_delta` | append to the buffered response |
//! | `session_idle` | cleanup with `NormalCompletion` |
//! | `session_error` | cleanup with `AgentError` |
//!
//! Terminal events emitted before the in-flight turn started are dropped;
//! they belong to a turn that already ended. Applied events feed the
//! session's metrics.

use tracing::debug;

use super::cleanup::{
    end_processing_for_event, flush_turn_boundary, CleanupContext, CleanupOutcome, EndReason,
};
use super::state::SessionEntry;
use crate::models::event::{AgentEvent, AgentEventKind};
use crate::models::history::MessageRole;
use crate::models::session::ProcessingPhase;

/// What applying an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    /// The event updated the in-flight turn.
    Applied,
    /// The session was idle; only the activity timestamp was updated.
    IgnoredIdle,
    /// The event was a terminal signal routed to the cleanup protocol.
    Cleanup(CleanupOutcome),
}

/// Apply one event to `entry`.
pub fn apply_event(
    entry: &SessionEntry,
    event: &AgentEvent,
    ctx: &CleanupContext,
) -> EventDisposition {
    entry.touch();

    let terminal = match event.kind {
        AgentEventKind::SessionIdle => Some(EndReason::NormalCompletion),
        AgentEventKind::SessionError { ref message } => Some(EndReason::AgentError {
            message: message.clone(),
        }),
        _ => None,
    };
    if let Some(reason) = terminal {
        let outcome = end_processing_for_event(entry, event.timestamp, reason, ctx);
        if outcome.ended() {
            ctx.metrics().record_event(event);
        }
        return EventDisposition::Cleanup(outcome);
    }

    let mut turn = entry.lock_turn();
    if !entry.is_processing() {
        debug!(
            session_id = entry.id(),
            kind = ?event.kind,
            "event for idle session ignored"
        );
        return EventDisposition::IgnoredIdle;
    }

    match event.kind {
        AgentEventKind::TurnStart => {
            entry.reset_active_tools();
            turn.phase = ProcessingPhase::Thinking;
        }
        AgentEventKind::TurnEnd => {
            flush_turn_boundary(entry, &mut turn, ctx.history().as_ref());
        }
        AgentEventKind::ToolStart { ref tool_name, .. } => {
            flush_turn_boundary(entry, &mut turn, ctx.history().as_ref());
            entry.tool_started();
            entry.set_used_tools(true);
            turn.tool_call_count += 1;
            turn.phase = ProcessingPhase::RunningTools;
            ctx.history()
                .append_message(entry.id(), MessageRole::Tool, tool_name);
        }
        AgentEventKind::ToolEnd { .. } => {
            entry.tool_finished();
        }
        AgentEventKind::AssistantMessageDelta { ref content } => {
            turn.current_response.push_str(content);
            turn.phase = ProcessingPhase::Streaming;
        }
        AgentEventKind::SessionIdle | AgentEventKind::SessionError { .. } => {}
    }
    drop(turn);

    ctx.metrics().record_event(event);
    EventDisposition::Applied
}
