//! NDJSON stdio bridge to an external agent runtime.
//!
//! Outbound commands are written one JSON object per line:
//!
//! ```json
//! {"command":"send_prompt","session_id":"w1","prompt":"..."}
//! {"command":"reconnect","session_id":"w1"}
//! {"command":"abort","session_id":"w1"}
//! ```
//!
//! Inbound lines are [`AgentEvent`]s. Malformed or oversized lines are
//! logged and skipped; they do not stop the reader.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::NdjsonCodec;
use super::{AgentRuntime, RuntimeFuture};
use crate::models::event::AgentEvent;
use crate::{AppError, Result};

/// Outbound command envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RuntimeCommand {
    /// Deliver a prompt.
    SendPrompt {
        /// Target session.
        session_id: String,
        /// Prompt text.
        prompt: String,
    },
    /// Re-establish the session's connection.
    Reconnect {
        /// Target session.
        session_id: String,
    },
    /// Stop the current turn.
    Abort {
        /// Target session.
        session_id: String,
    },
}

/// [`AgentRuntime`] that queues commands for a writer task.
#[derive(Debug, Clone)]
pub struct NdjsonRuntime {
    command_tx: mpsc::Sender<RuntimeCommand>,
}

impl NdjsonRuntime {
    /// Wrap the sending half of the writer task's channel.
    #[must_use]
    pub fn new(command_tx: mpsc::Sender<RuntimeCommand>) -> Self {
        Self { command_tx }
    }

    async fn enqueue(&self, command: RuntimeCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| AppError::Runtime("runtime bridge closed".into()))
    }
}

impl AgentRuntime for NdjsonRuntime {
    fn send_prompt<'a>(&'a self, session_id: &'a str, prompt: &'a str) -> RuntimeFuture<'a> {
        Box::pin(self.enqueue(RuntimeCommand::SendPrompt {
            session_id: session_id.to_owned(),
            prompt: prompt.to_owned(),
        }))
    }

    fn reconnect<'a>(&'a self, session_id: &'a str) -> RuntimeFuture<'a> {
        Box::pin(self.enqueue(RuntimeCommand::Reconnect {
            session_id: session_id.to_owned(),
        }))
    }

    fn abort<'a>(&'a self, session_id: &'a str) -> RuntimeFuture<'a> {
        Box::pin(self.enqueue(RuntimeCommand::Abort {
            session_id: session_id.to_owned(),
        }))
    }
}

/// Parse one inbound line.
///
/// Returns `Ok(None)` for blank lines.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if the line is not a valid event.
pub fn parse_event_line(line: &str) -> Result<Option<AgentEvent>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

/// Reader task: decode NDJSON events from `input` and forward them.
///
/// Exits on EOF, cancellation, an I/O error, or when `event_tx` closes.
///
/// # Errors
///
/// Currently always returns `Ok(())`; framing and parse errors are logged
/// and skipped.
pub async fn run_reader<R>(
    input: R,
    event_tx: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(input, NdjsonCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("runtime reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("runtime reader: EOF");
                        break;
                    }
                    Some(Err(AppError::Protocol(ref msg))) => {
                        warn!(error = msg.as_str(), "runtime reader: framing error, skipping");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "runtime reader: I/O error, stopping");
                        break;
                    }
                    Some(Ok(line)) => match parse_event_line(&line) {
                        Ok(Some(event)) => {
                            if event_tx.send(event).await.is_err() {
                                debug!("runtime reader: event channel closed, stopping");
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "runtime reader: unparseable event, skipping");
                        }
                    },
                }
            }
        }
    }

    Ok(())
}

/// Writer task: serialise queued commands as NDJSON onto `output`.
///
/// # Errors
///
/// Returns [`AppError::Runtime`] if a write to `output` fails.
pub async fn run_writer<W>(
    mut output: W,
    mut command_rx: mpsc::Receiver<RuntimeCommand>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("runtime writer: cancellation received, stopping");
                break;
            }

            command = command_rx.recv() => {
                let Some(command) = command else {
                    debug!("runtime writer: command channel closed, stopping");
                    break;
                };
                let mut bytes = serde_json::to_vec(&command)?;
                bytes.push(b'\n');
                output.write_all(&bytes).await.map_err(|e| {
                    warn!(error = %e, "runtime writer: write failed");
                    AppError::Runtime(format!("write failed: {e}"))
                })?;
                output
                    .flush()
                    .await
                    .map_err(|e| AppError::Runtime(format!("flush failed: {e}")))?;
            }
        }
    }

    Ok(())
}
