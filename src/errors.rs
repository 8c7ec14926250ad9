//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// Turn-level failures (agent error, send failure, watchdog timeout) never
/// appear here: they are absorbed by the cleanup protocol and surface only
/// as a status change plus a diagnostic record.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Requested session or orchestration group does not exist.
    NotFound(String),
    /// A session or group with the same identifier is already registered.
    AlreadyExists(String),
    /// The session already has a turn in flight.
    Busy(String),
    /// Agent runtime or transport failure.
    Runtime(String),
    /// Reflection loop setup or driver failure.
    Orchestration(String),
    /// NDJSON framing or message parse failure.
    Protocol(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Self::Busy(msg) => write!(f, "busy: {msg}"),
            Self::Runtime(msg) => write!(f, "runtime: {msg}"),
            Self::Orchestration(msg) => write!(f, "orchestration: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
