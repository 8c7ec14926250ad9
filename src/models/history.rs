//! Durable chat history entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author of a history entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Prompt sent to the agent.
    User,
    /// Agent output.
    Assistant,
    /// Tool invocation marker.
    Tool,
    /// System notice (errors, timeouts).
    System,
}

/// One appended history entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// Unique record identifier.
    pub id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Entry author.
    pub role: MessageRole,
    /// Entry text.
    pub content: String,
    /// Append timestamp.
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Construct a new entry with a generated identifier.
    #[must_use]
    pub fn new(session_id: String, role: MessageRole, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            role,
            content,
            created_at: Utc::now(),
        }
    }
}
