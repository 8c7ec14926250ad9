//! Inbound agent runtime events.
//!
//! One [`AgentEvent`] is one NDJSON line on the runtime bridge:
//!
//! ```json
//! {"session_id":"w1","timestamp":"2026-01-01T00:00:00Z","type":"tool_start","tool_name":"bash"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event emitted by the agent runtime for one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentEvent {
    /// Session the event belongs to.
    pub session_id: String,
    /// Runtime-side emission time; defaults to receipt time when absent.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    #[serde(flatten)]
    pub kind: AgentEventKind,
}

impl AgentEvent {
    /// Construct an event stamped with the current time.
    #[must_use]
    pub fn new(session_id: impl Into<String>, kind: AgentEventKind) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Event payload variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEventKind {
    /// A reasoning round started inside the current turn.
    TurnStart,
    /// A reasoning round finished; the turn may continue with another round.
    TurnEnd,
    /// A tool call began executing.
    ToolStart {
        /// Runtime-assigned call identifier.
        #[serde(default)]
        tool_call_id: Option<String>,
        /// Tool name (e.g. `bash`, `edit`).
        tool_name: String,
    },
    /// A tool call finished.
    ToolEnd {
        /// Runtime-assigned call identifier.
        #[serde(default)]
        tool_call_id: Option<String>,
        /// Whether the tool reported success.
        #[serde(default = "default_success")]
        success: bool,
    },
    /// Incremental assistant output.
    AssistantMessageDelta {
        /// Text fragment to append to the in-flight response.
        content: String,
    },
    /// The session finished its turn and is idle.
    SessionIdle,
    /// The runtime reported a failure for the session.
    SessionError {
        /// Runtime-provided failure description.
        message: String,
    },
}

fn default_success() -> bool {
    true
}
