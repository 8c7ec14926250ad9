//! Session turn coordination.
//!
//! [`SessionCoordinator`] is the entry point for everything that starts or
//! stops a turn: sending prompts, resuming mid-turn, user aborts, remote
//! turn-end signals, and the runtime event stream. It arms a watchdog for
//! every turn it starts and routes every ending through the cleanup
//! protocol.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::cleanup::{
    end_processing, end_processing_if_current, CleanupContext, CleanupOutcome, EndReason,
    SendAttempt,
};
use super::events::{apply_event, EventDisposition};
use super::generation::TurnTicket;
use super::registry::SessionRegistry;
use super::state::SessionEntry;
use super::watchdog::Watchdog;
use crate::config::WatchdogConfig;
use crate::diagnostics::metrics::SessionMetrics;
use crate::diagnostics::{DiagnosticEntry, DiagnosticKind};
use crate::history::HistoryStore;
use crate::models::event::AgentEvent;
use crate::models::history::MessageRole;
use crate::models::session::{ProcessingSnapshot, SessionHost};
use crate::runtime::AgentRuntime;
use crate::{AppError, Result};

/// Result of dispatching a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The runtime accepted the prompt; the turn is in flight.
    Started(TurnTicket),
    /// Dispatch failed and the turn was already cleaned up.
    Failed {
        /// Cleanup trigger name.
        trigger: &'static str,
        /// Transport error description.
        message: String,
    },
}

impl DispatchOutcome {
    /// Ticket of the started turn, if any.
    #[must_use]
    pub fn ticket(&self) -> Option<&TurnTicket> {
        match self {
            Self::Started(ticket) => Some(ticket),
            Self::Failed { .. } => None,
        }
    }
}

/// Owner of session turn lifecycles.
pub struct SessionCoordinator {
    registry: SessionRegistry,
    runtime: Arc<dyn AgentRuntime>,
    cleanup: CleanupContext,
    watchdog: WatchdogConfig,
}

impl SessionCoordinator {
    /// Build a coordinator over an explicitly owned registry.
    #[must_use]
    pub fn new(
        registry: SessionRegistry,
        runtime: Arc<dyn AgentRuntime>,
        cleanup: CleanupContext,
        watchdog: WatchdogConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            cleanup,
            watchdog,
        }
    }

    /// Session registry.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Durable history the cleanup protocol flushes into.
    #[must_use]
    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        self.cleanup.history()
    }

    /// Cleanup collaborators, for callers that end turns directly.
    #[must_use]
    pub fn cleanup_context(&self) -> &CleanupContext {
        &self.cleanup
    }

    /// Register a new idle session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyExists` if the identifier is taken.
    pub fn open_session(&self, session_id: &str, host: SessionHost) -> Result<Arc<SessionEntry>> {
        let entry = self.registry.insert(session_id, host)?;
        info!(session_id, ?host, "session opened");
        Ok(entry)
    }

    /// Close a session, ending any in-flight turn first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is unknown.
    pub fn close_session(&self, session_id: &str) -> Result<()> {
        let entry = self
            .registry
            .remove(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
        if entry.is_processing() {
            end_processing(
                &entry,
                EndReason::UserAbort { host: entry.host() },
                &self.cleanup,
            );
        }
        info!(session_id, "session closed");
        Ok(())
    }

    /// Start a turn by sending `prompt`.
    ///
    /// A failed dispatch is retried once after a reconnect. Either failure
    /// ends the turn through the cleanup protocol and is reported as
    /// [`DispatchOutcome::Failed`], not as an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session, or
    /// `AppError::Busy` if a turn is already in flight.
    pub async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<DispatchOutcome> {
        let entry = self.registry.require(session_id)?;
        let ticket = self.start_turn(&entry, false)?;
        self.history()
            .append_message(session_id, MessageRole::User, prompt);

        let span = info_span!("send_prompt", session_id, generation = ticket.generation());
        async {
            let Err(first) = self.runtime.send_prompt(session_id, prompt).await else {
                debug!("prompt dispatched");
                return Ok(DispatchOutcome::Started(ticket));
            };
            warn!(error = %first, "prompt dispatch failed, reconnecting");

            let (attempt, err) = match self.runtime.reconnect(session_id).await {
                Err(reconnect_err) => {
                    warn!(error = %reconnect_err, "reconnect failed");
                    (SendAttempt::FirstAttempt, first)
                }
                Ok(()) => match self.runtime.send_prompt(session_id, prompt).await {
                    Ok(()) => {
                        info!("prompt dispatched after reconnect");
                        return Ok(DispatchOutcome::Started(ticket));
                    }
                    Err(retry_err) => (SendAttempt::Retry, retry_err),
                },
            };

            let message = err.to_string();
            let reason = EndReason::SendFailure {
                attempt,
                message: message.clone(),
            };
            let trigger = reason.trigger_name();
            end_processing_if_current(&entry, &ticket, reason, &self.cleanup);
            Ok::<_, AppError>(DispatchOutcome::Failed { trigger, message })
        }
        .instrument(span)
        .await
    }

    /// Re-enter processing for a session whose turn was still running when
    /// it was last seen (e.g. after reopening the app).
    ///
    /// The resumed flag keeps the watchdog on the tool tier until the turn
    /// ends. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session, or
    /// `AppError::Busy` if a turn is already in flight.
    pub fn resume_session(&self, session_id: &str) -> Result<TurnTicket> {
        let entry = self.registry.require(session_id)?;
        let ticket = self.start_turn(&entry, true)?;
        info!(session_id, generation = ticket.generation(), "session resumed mid-turn");
        Ok(ticket)
    }

    /// Stop the session's current turn at the user's request.
    ///
    /// The runtime is asked to abort first; a failure there is logged and
    /// does not prevent local cleanup.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn abort_turn(&self, session_id: &str) -> Result<CleanupOutcome> {
        let entry = self.registry.require(session_id)?;
        if let Err(err) = self.runtime.abort(session_id).await {
            warn!(session_id, %err, "runtime abort failed, cleaning up locally");
        }
        Ok(end_processing(
            &entry,
            EndReason::UserAbort { host: entry.host() },
            &self.cleanup,
        ))
    }

    /// A remotely hosted session reported turn completion on its own channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub fn remote_turn_ended(&self, session_id: &str) -> Result<CleanupOutcome> {
        let entry = self.registry.require(session_id)?;
        Ok(end_processing(&entry, EndReason::RemoteTurnEnd, &self.cleanup))
    }

    /// Apply one runtime event. Events for unknown sessions are dropped.
    pub fn handle_event(&self, event: &AgentEvent) -> Option<EventDisposition> {
        let Some(entry) = self.registry.get(&event.session_id) else {
            debug!(session_id = %event.session_id, "event for unknown session dropped");
            return None;
        };
        Some(apply_event(&entry, event, &self.cleanup))
    }

    /// Spawn the single consumer that applies runtime events in arrival order.
    #[must_use]
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<AgentEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(
            async move {
                loop {
                    let event = tokio::select! {
                        () = cancel.cancelled() => {
                            info!("event pump shutting down");
                            break;
                        }
                        maybe_event = rx.recv() => {
                            if let Some(e) = maybe_event { e } else {
                                info!("event channel closed");
                                break;
                            }
                        }
                    };
                    coordinator.handle_event(&event);
                }
            }
            .instrument(info_span!("event_pump")),
        )
    }

    /// Read-only view of a session's processing state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub fn snapshot(&self, session_id: &str) -> Result<ProcessingSnapshot> {
        Ok(self.registry.require(session_id)?.snapshot())
    }

    /// Usage counters for a session, including closed ones.
    #[must_use]
    pub fn session_metrics(&self, session_id: &str) -> Option<SessionMetrics> {
        self.cleanup.metrics().session(session_id)
    }

    /// Suspend until the session leaves processing.
    ///
    /// Returns immediately if it is already idle. With `timeout` set, gives
    /// up after that long; without it, the session's watchdog bounds the wait.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session,
    /// `AppError::Runtime` if the session is closed while waiting, or
    /// `AppError::Orchestration` if the timeout elapses.
    pub async fn wait_until_idle(&self, session_id: &str, timeout: Option<Duration>) -> Result<()> {
        let entry = self.registry.require(session_id)?;
        let mut rx = entry.subscribe_processing();
        drop(entry);

        let wait = async move {
            rx.wait_for(|processing| !*processing)
                .await
                .map(|_| ())
                .map_err(|_| AppError::Runtime(format!("session {session_id} closed")))
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                AppError::Orchestration(format!(
                    "session {session_id} still processing after {}s",
                    limit.as_secs()
                ))
            })?,
            None => wait.await,
        }
    }

    /// Latest assistant output recorded for a session.
    #[must_use]
    pub fn last_response(&self, session_id: &str) -> Option<String> {
        self.history()
            .last_assistant_message(session_id)
            .map(|m| m.content)
    }

    fn start_turn(&self, entry: &Arc<SessionEntry>, resumed: bool) -> Result<TurnTicket> {
        let mut turn = entry.lock_turn();
        if entry.is_processing() {
            return Err(AppError::Busy(format!(
                "session {} already has a turn in flight",
                entry.id()
            )));
        }

        let ticket = entry.begin_turn(&mut turn, resumed);
        if let Some(stale) = turn.watchdog.take() {
            stale.cancel();
        }
        turn.watchdog = Some(
            Watchdog::new(
                entry,
                ticket.clone(),
                self.watchdog.clone(),
                self.cleanup.clone(),
            )
            .spawn(),
        );
        drop(turn);

        self.cleanup.record(
            DiagnosticEntry::new(DiagnosticKind::TurnStarted)
                .with_session(entry.id())
                .with_generation(ticket.generation())
                .with_detail(if resumed { "resume" } else { "send" }),
        );
        Ok(ticket)
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("registry", &self.registry)
            .field("watchdog", &self.watchdog)
            .finish_non_exhaustive()
    }
}
