//! Session hosting and read-only processing state views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the agent behind a session runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionHost {
    /// Agent runtime is hosted by this process.
    Local,
    /// Agent runtime is hosted elsewhere and reached through a bridge.
    Remote,
}

/// Coarse UI phase of an in-flight turn. Not used for correctness.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPhase {
    /// No turn in flight.
    #[default]
    Idle,
    /// Prompt handed to the runtime, nothing heard back yet.
    Sending,
    /// A reasoning round has started.
    Thinking,
    /// Assistant text is streaming.
    Streaming,
    /// One or more tools are executing.
    RunningTools,
}

impl ProcessingPhase {
    /// Numeric phase indicator (0 = idle).
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Sending => 1,
            Self::Thinking => 2,
            Self::Streaming => 3,
            Self::RunningTools => 4,
        }
    }
}

/// Point-in-time copy of one session's processing state, for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingSnapshot {
    /// Session identifier.
    pub session_id: String,
    /// Hosting mode.
    pub host: SessionHost,
    /// A turn is in flight.
    pub is_processing: bool,
    /// A mid-turn resume is still catching up.
    pub is_resumed: bool,
    /// Any tool ran during the current turn.
    pub has_used_tools_this_turn: bool,
    /// Tools executing in the current reasoning round.
    pub active_tool_call_count: u32,
    /// When the current turn started.
    pub processing_started_at: Option<DateTime<Utc>>,
    /// Cumulative tool calls in the current turn.
    pub tool_call_count: u32,
    /// Coarse UI phase.
    pub processing_phase: ProcessingPhase,
    /// Turn generation counter.
    pub processing_generation: u64,
    /// Buffered assistant output not yet flushed to history.
    pub current_response: String,
}
