//! Per-session usage metrics built from the event stream.
//!
//! The event path feeds every applied [`AgentEvent`] to the collector and
//! the cleanup protocol reports each ended turn. The resulting
//! [`SessionMetrics`] answer "how many turns, which tools, how many
//! failures, how long" for one session without replaying history.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::event::{AgentEvent, AgentEventKind};

/// Tool calls running at least this long count as long-running.
pub const LONG_RUNNING_TOOL_MS: i64 = 60_000;

/// Error messages are truncated to this many characters.
const ERROR_PREVIEW_CHARS: usize = 300;

/// A runtime-reported failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Truncated runtime message.
    pub message: String,
    /// Event emission time.
    pub timestamp: DateTime<Utc>,
}

/// Aggregated counters for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMetrics {
    /// Session identifier.
    pub session_id: String,
    /// Turns ended by the cleanup protocol.
    pub turns: u64,
    /// Ended turns keyed by trigger name.
    pub turns_by_trigger: BTreeMap<String, u64>,
    /// Reasoning rounds (`turn_end` events).
    pub reasoning_rounds: u64,
    /// Tool calls started.
    pub tool_calls: u64,
    /// Tool calls started, keyed by tool name.
    pub tool_calls_by_name: BTreeMap<String, u64>,
    /// Tool calls that reported failure.
    pub tool_failures: u64,
    /// Tool calls that ran for at least [`LONG_RUNNING_TOOL_MS`].
    pub long_running_tools: u64,
    /// Runtime failures, oldest first.
    pub errors: Vec<ErrorRecord>,
    /// Summed duration of ended turns.
    pub total_turn_ms: i64,
    /// Longest single turn.
    pub longest_turn_ms: i64,
}

impl SessionMetrics {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            ..Self::default()
        }
    }

    /// Mean duration of ended turns, or 0 before the first one.
    #[must_use]
    pub fn average_turn_ms(&self) -> i64 {
        match i64::try_from(self.turns) {
            Ok(turns) if turns > 0 => self.total_turn_ms / turns,
            _ => 0,
        }
    }
}

struct SessionTally {
    metrics: SessionMetrics,
    open_tools: HashMap<String, DateTime<Utc>>,
}

/// Thread-safe collector keyed by session identifier.
#[derive(Default)]
pub struct MetricsCollector {
    sessions: Mutex<HashMap<String, SessionTally>>,
}

impl MetricsCollector {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one applied runtime event.
    pub fn record_event(&self, event: &AgentEvent) {
        let mut sessions = self.lock();
        let tally = tally_for(&mut sessions, &event.session_id);
        let metrics = &mut tally.metrics;

        match event.kind {
            AgentEventKind::TurnEnd => metrics.reasoning_rounds += 1,
            AgentEventKind::ToolStart {
                ref tool_call_id,
                ref tool_name,
            } => {
                metrics.tool_calls += 1;
                *metrics
                    .tool_calls_by_name
                    .entry(tool_name.clone())
                    .or_insert(0) += 1;
                if let Some(id) = tool_call_id {
                    tally.open_tools.insert(id.clone(), event.timestamp);
                }
            }
            AgentEventKind::ToolEnd {
                ref tool_call_id,
                success,
            } => {
                if !success {
                    metrics.tool_failures += 1;
                }
                let started = tool_call_id
                    .as_ref()
                    .and_then(|id| tally.open_tools.remove(id));
                if let Some(started) = started {
                    if (event.timestamp - started).num_milliseconds() >= LONG_RUNNING_TOOL_MS {
                        metrics.long_running_tools += 1;
                    }
                }
            }
            AgentEventKind::SessionError { ref message } => {
                metrics.errors.push(ErrorRecord {
                    message: message.chars().take(ERROR_PREVIEW_CHARS).collect(),
                    timestamp: event.timestamp,
                });
            }
            AgentEventKind::TurnStart
            | AgentEventKind::AssistantMessageDelta { .. }
            | AgentEventKind::SessionIdle => {}
        }
    }

    /// Count one ended turn. `started_at` is `None` when the turn never
    /// recorded a start time; the turn still counts but adds no duration.
    pub fn record_turn(
        &self,
        session_id: &str,
        started_at: Option<DateTime<Utc>>,
        ended_at: DateTime<Utc>,
        trigger: &str,
    ) {
        let mut sessions = self.lock();
        let tally = tally_for(&mut sessions, session_id);
        let metrics = &mut tally.metrics;

        metrics.turns += 1;
        *metrics
            .turns_by_trigger
            .entry(trigger.to_owned())
            .or_insert(0) += 1;
        if let Some(started_at) = started_at {
            let elapsed = (ended_at - started_at).num_milliseconds().max(0);
            metrics.total_turn_ms += elapsed;
            metrics.longest_turn_ms = metrics.longest_turn_ms.max(elapsed);
        }
        // Tools still open when a turn ends never report completion.
        tally.open_tools.clear();
    }

    /// Metrics for one session, if it has recorded anything.
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<SessionMetrics> {
        self.lock().get(session_id).map(|t| t.metrics.clone())
    }

    /// Metrics for every session, ordered by session identifier.
    #[must_use]
    pub fn all(&self) -> Vec<SessionMetrics> {
        let mut all: Vec<SessionMetrics> =
            self.lock().values().map(|t| t.metrics.clone()).collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        all
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionTally>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn tally_for<'a>(
    sessions: &'a mut HashMap<String, SessionTally>,
    session_id: &str,
) -> &'a mut SessionTally {
    sessions
        .entry(session_id.to_owned())
        .or_insert_with(|| SessionTally {
            metrics: SessionMetrics::new(session_id),
            open_tools: HashMap::new(),
        })
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("sessions", &self.lock().len())
            .finish()
    }
}
