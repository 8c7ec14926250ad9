//! Per-turn watchdog with tiered inactivity timeouts.
//!
//! Each turn gets a [`Watchdog`] armed when processing begins. It polls the
//! session's last-event time and ends the turn through the cleanup protocol
//! when the session has been silent for longer than the active tier:
//!
//! | Tier | Applies when | Default |
//! |------|--------------|---------|
//! | [`WatchdogTier::Tool`] | tools running, tools used this turn, or resume catch-up | 600s |
//! | [`WatchdogTier::Inactivity`] | otherwise | 120s |
//!
//! The active tool count is reset at every reasoning round, so it alone
//! under-reports; the sticky tools-used flag keeps long builds and test runs
//! on the tool tier between rounds.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Instrument};

use super::cleanup::{end_processing_if_current, CleanupContext, CleanupOutcome, EndReason};
use super::generation::TurnTicket;
use super::state::SessionEntry;
use crate::config::WatchdogConfig;
use crate::diagnostics::{DiagnosticEntry, DiagnosticKind};

/// Timeout tier selected from inferred tool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogTier {
    /// No tool activity inferred.
    Inactivity,
    /// Tools are, or recently were, in play.
    Tool,
}

impl WatchdogTier {
    /// Pick the tier from the three tool-activity signals.
    #[must_use]
    pub fn select(active_tool_calls: u32, is_resumed: bool, has_used_tools: bool) -> Self {
        if active_tool_calls > 0 || is_resumed || has_used_tools {
            Self::Tool
        } else {
            Self::Inactivity
        }
    }

    /// Pick the tier for a session's current state.
    #[must_use]
    pub fn for_entry(entry: &SessionEntry) -> Self {
        Self::select(
            entry.active_tool_call_count(),
            entry.is_resumed(),
            entry.has_used_tools_this_turn(),
        )
    }

    /// Idle limit for this tier.
    #[must_use]
    pub fn timeout(self, config: &WatchdogConfig) -> Duration {
        match self {
            Self::Inactivity => Duration::from_secs(config.inactivity_timeout_seconds),
            Self::Tool => Duration::from_secs(config.tool_timeout_seconds),
        }
    }
}

/// Result of one staleness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Idle time is within the tier.
    Healthy {
        /// Time since the last event.
        idle: Duration,
        /// Tier in force.
        tier: WatchdogTier,
    },
    /// Idle time reached the tier limit.
    TimedOut {
        /// Time since the last event.
        idle: Duration,
        /// Tier in force.
        tier: WatchdogTier,
    },
}

/// Check a session against its active tier.
#[must_use]
pub fn evaluate(entry: &SessionEntry, config: &WatchdogConfig) -> WatchdogVerdict {
    let idle = entry.idle_for();
    let tier = WatchdogTier::for_entry(entry);
    if idle >= tier.timeout(config) {
        WatchdogVerdict::TimedOut { idle, tier }
    } else {
        WatchdogVerdict::Healthy { idle, tier }
    }
}

/// End the turn `ticket` names with `WatchdogTimeout`.
///
/// The `watchdog_fired` diagnostic is written only when this call ended the
/// turn; if another trigger won under the turn lock, or a newer turn is in
/// flight, nothing is recorded.
pub fn fire_watchdog(
    entry: &SessionEntry,
    ticket: &TurnTicket,
    idle: Duration,
    tier: WatchdogTier,
    cleanup: &CleanupContext,
) -> CleanupOutcome {
    let idle_seconds = idle.as_secs();
    let outcome = end_processing_if_current(
        entry,
        ticket,
        EndReason::WatchdogTimeout { idle_seconds, tier },
        cleanup,
    );
    if outcome.ended() {
        warn!(session_id = entry.id(), idle_seconds, ?tier, "session stuck, turn ended");
        cleanup.record(
            DiagnosticEntry::new(DiagnosticKind::WatchdogFired)
                .with_session(entry.id())
                .with_generation(ticket.generation())
                .with_detail(format!("{tier:?} tier, idle {idle_seconds}s")),
        );
    } else {
        debug!(session_id = entry.id(), ?outcome, "turn already ended by another trigger");
    }
    outcome
}

/// Builder for a per-turn watchdog.
///
/// Call [`spawn`](Self::spawn) to start the background poll task.
pub struct Watchdog {
    entry: Weak<SessionEntry>,
    ticket: TurnTicket,
    config: WatchdogConfig,
    cleanup: CleanupContext,
    cancel: CancellationToken,
}

impl Watchdog {
    /// Construct a watchdog for the turn identified by `ticket` (does not start it).
    #[must_use]
    pub fn new(
        entry: &Arc<SessionEntry>,
        ticket: TurnTicket,
        config: WatchdogConfig,
        cleanup: CleanupContext,
    ) -> Self {
        Self {
            entry: Arc::downgrade(entry),
            ticket,
            config,
            cleanup,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the background poll task and return a handle for cancelling it.
    #[must_use]
    pub fn spawn(self) -> WatchdogHandle {
        let cancel = self.cancel.clone();
        let span = info_span!(
            "watchdog",
            session_id = self.ticket.session_id(),
            generation = self.ticket.generation()
        );
        tokio::spawn(self.run().instrument(span));

        WatchdogHandle { cancel }
    }

    async fn run(self) {
        let period = self.config.poll_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("watchdog cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let Some(entry) = self.entry.upgrade() else {
                debug!("session dropped, watchdog exiting");
                return;
            };

            if !self.ticket.is_current(&entry) || !entry.is_processing() {
                debug!("turn already over, watchdog exiting");
                return;
            }

            match evaluate(&entry, &self.config) {
                WatchdogVerdict::Healthy { idle, tier } => {
                    trace!(idle_secs = idle.as_secs(), ?tier, "session healthy");
                }
                WatchdogVerdict::TimedOut { idle, tier } => {
                    fire_watchdog(&entry, &self.ticket, idle, tier, &self.cleanup);
                    return;
                }
            }
        }
    }
}

/// Handle returned from [`Watchdog::spawn`].
///
/// Cancelling is idempotent; dropping the handle cancels the task.
pub struct WatchdogHandle {
    cancel: CancellationToken,
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl WatchdogHandle {
    /// Stop the poll task. A no-op if it already fired or was cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
