//! Shared helpers for coordinator and reflection integration tests.
//!
//! Provides a scripted [`AgentRuntime`] that answers prompts by pushing
//! events through the coordinator's event pump, and a diagnostics sink that
//! keeps records in memory.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agent_conductor::config::WatchdogConfig;
use agent_conductor::diagnostics::{DiagnosticEntry, DiagnosticKind, DiagnosticLogger};
use agent_conductor::history::InMemoryHistory;
use agent_conductor::models::event::{AgentEvent, AgentEventKind};
use agent_conductor::runtime::{AgentRuntime, RuntimeFuture};
use agent_conductor::session::{CleanupContext, SessionCoordinator, SessionRegistry};
use agent_conductor::AppError;

/// Produces the assistant reply for `(session, prompt)`; `None` leaves the
/// turn hanging.
pub type Responder = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

/// Responder that never answers.
pub fn silent() -> Responder {
    Arc::new(|_, _| None)
}

/// Scripted runtime. Replies arrive as `turn_start`, one delta,
/// `turn_end`, `session_idle`.
pub struct FakeRuntime {
    events: mpsc::Sender<AgentEvent>,
    responder: Responder,
    send_failures: AtomicU32,
    reconnect_fails: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeRuntime {
    /// Make the next `count` `send_prompt` calls fail.
    pub fn fail_sends(&self, count: u32) {
        self.send_failures.store(count, Ordering::SeqCst);
    }

    /// Make every `reconnect` call fail.
    pub fn fail_reconnects(&self) {
        self.reconnect_fails.store(true, Ordering::SeqCst);
    }

    /// Calls received so far, as `"<method>:<session>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn log(&self, method: &str, session_id: &str) {
        self.calls
            .lock()
            .expect("calls lock")
            .push(format!("{method}:{session_id}"));
    }
}

impl AgentRuntime for FakeRuntime {
    fn send_prompt<'a>(&'a self, session_id: &'a str, prompt: &'a str) -> RuntimeFuture<'a> {
        Box::pin(async move {
            self.log("send", session_id);
            let failing = self
                .send_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(AppError::Runtime("transport down".into()));
            }

            if let Some(reply) = (self.responder)(session_id, prompt) {
                let tx = self.events.clone();
                let id = session_id.to_owned();
                tokio::spawn(async move {
                    for kind in [
                        AgentEventKind::TurnStart,
                        AgentEventKind::AssistantMessageDelta { content: reply },
                        AgentEventKind::TurnEnd,
                        AgentEventKind::SessionIdle,
                    ] {
                        if tx.send(AgentEvent::new(id.clone(), kind)).await.is_err() {
                            return;
                        }
                    }
                });
            }
            Ok(())
        })
    }

    fn reconnect<'a>(&'a self, session_id: &'a str) -> RuntimeFuture<'a> {
        Box::pin(async move {
            self.log("reconnect", session_id);
            if self.reconnect_fails.load(Ordering::SeqCst) {
                Err(AppError::Runtime("host unreachable".into()))
            } else {
                Ok(())
            }
        })
    }

    fn abort<'a>(&'a self, session_id: &'a str) -> RuntimeFuture<'a> {
        Box::pin(async move {
            self.log("abort", session_id);
            Ok(())
        })
    }
}

/// Diagnostics sink that keeps every record.
#[derive(Default)]
pub struct RecordingDiagnostics {
    entries: Mutex<Vec<DiagnosticEntry>>,
}

impl RecordingDiagnostics {
    /// Every record so far.
    pub fn entries(&self) -> Vec<DiagnosticEntry> {
        self.entries.lock().expect("entries lock").clone()
    }

    /// Records of one kind.
    pub fn of_kind(&self, kind: DiagnosticKind) -> Vec<DiagnosticEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    /// Trigger names of every `turn_ended` record, in order.
    pub fn end_triggers(&self) -> Vec<String> {
        self.of_kind(DiagnosticKind::TurnEnded)
            .into_iter()
            .filter_map(|e| e.trigger)
            .collect()
    }
}

impl DiagnosticLogger for RecordingDiagnostics {
    fn log_entry(&self, entry: DiagnosticEntry) -> agent_conductor::Result<()> {
        self.entries.lock().expect("entries lock").push(entry);
        Ok(())
    }
}

/// A coordinator wired to a [`FakeRuntime`] with its event pump running.
pub struct Harness {
    pub coordinator: Arc<SessionCoordinator>,
    pub runtime: Arc<FakeRuntime>,
    pub history: Arc<InMemoryHistory>,
    pub diagnostics: Arc<RecordingDiagnostics>,
    pub cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Build a harness with default watchdog timeouts. Must run inside a tokio
/// runtime.
pub fn harness(responder: Responder) -> Harness {
    harness_with(responder, WatchdogConfig::default())
}

/// Build a harness with explicit watchdog settings.
pub fn harness_with(responder: Responder, watchdog: WatchdogConfig) -> Harness {
    let (event_tx, event_rx) = mpsc::channel(64);
    let runtime = Arc::new(FakeRuntime {
        events: event_tx,
        responder,
        send_failures: AtomicU32::new(0),
        reconnect_fails: AtomicBool::new(false),
        calls: Mutex::new(Vec::new()),
    });
    let history = Arc::new(InMemoryHistory::new());
    let diagnostics = Arc::new(RecordingDiagnostics::default());

    let runtime_port: Arc<dyn AgentRuntime> = runtime.clone();
    let sink: Arc<dyn DiagnosticLogger> = diagnostics.clone();
    let coordinator = Arc::new(SessionCoordinator::new(
        SessionRegistry::new(),
        runtime_port,
        CleanupContext::new(history.clone(), Some(sink)),
        watchdog,
    ));

    let cancel = CancellationToken::new();
    let _pump = coordinator.spawn_event_pump(event_rx, cancel.clone());

    Harness {
        coordinator,
        runtime,
        history,
        diagnostics,
        cancel,
    }
}

/// Apply an event directly, bypassing the pump.
pub fn deliver(harness: &Harness, session_id: &str, kind: AgentEventKind) {
    harness
        .coordinator
        .handle_event(&AgentEvent::new(session_id, kind));
}
