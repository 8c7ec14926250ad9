#![forbid(unsafe_code)]

//! `agent-conductor`: session turn coordinator and reflection loop driver.
//!
//! Talks to an external agent runtime over NDJSON on stdin/stdout: commands
//! go out on stdout, agent events come in on stdin. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conductor::config::GlobalConfig;
use agent_conductor::diagnostics::{DiagnosticLogger, JsonlDiagnosticWriter};
use agent_conductor::history::{HistoryStore, InMemoryHistory};
use agent_conductor::models::session::SessionHost;
use agent_conductor::orchestrator::{ReflectionGroups, ReflectionRequest};
use agent_conductor::runtime::ndjson::{self, NdjsonRuntime};
use agent_conductor::session::{CleanupContext, SessionCoordinator, SessionRegistry};
use agent_conductor::{AppError, Result};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conductor", about = "Agent session coordinator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Session to open at startup. Repeatable.
    #[arg(long = "session")]
    sessions: Vec<String>,

    /// Run one reflection loop toward this goal.
    #[arg(long, requires = "orchestrator")]
    goal: Option<String>,

    /// Session that plans each reflection iteration.
    #[arg(long)]
    orchestrator: Option<String>,

    /// Worker session for the reflection loop. Repeatable.
    #[arg(long = "worker")]
    workers: Vec<String>,

    /// Dedicated evaluator session.
    #[arg(long)]
    evaluator: Option<String>,

    /// Iteration cap for the reflection loop.
    #[arg(long)]
    max_iterations: Option<u32>,
}

impl Cli {
    fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        let named = self
            .sessions
            .iter()
            .chain(self.orchestrator.iter())
            .chain(self.workers.iter())
            .chain(self.evaluator.iter());
        for id in named {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-conductor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match args.config {
        Some(ref path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    info!(?config.watchdog, "configuration loaded");

    let diagnostics: Option<Arc<dyn DiagnosticLogger>> = match config.diagnostics.log_dir {
        Some(ref dir) => Some(Arc::new(JsonlDiagnosticWriter::new(dir.clone())?)),
        None => None,
    };

    // ── Wire runtime bridge and coordinator ─────────────
    let ct = CancellationToken::new();
    let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistory::new());
    let coordinator = Arc::new(SessionCoordinator::new(
        SessionRegistry::new(),
        Arc::new(NdjsonRuntime::new(command_tx)),
        CleanupContext::new(history, diagnostics),
        config.watchdog.clone(),
    ));

    for id in args.session_ids() {
        coordinator.open_session(&id, SessionHost::Local)?;
    }

    let reader_ct = ct.clone();
    let reader_handle = tokio::spawn(async move {
        if let Err(err) = ndjson::run_reader(tokio::io::stdin(), event_tx, reader_ct).await {
            error!(%err, "runtime reader failed");
        }
    });
    let writer_ct = ct.clone();
    let writer_handle = tokio::spawn(async move {
        if let Err(err) = ndjson::run_writer(tokio::io::stdout(), command_rx, writer_ct).await {
            error!(%err, "runtime writer failed");
        }
    });
    let pump_handle = coordinator.spawn_event_pump(event_rx, ct.clone());

    info!("agent-conductor ready");

    // ── Run reflection or wait for shutdown ─────────────
    if let (Some(goal), Some(orchestrator)) = (args.goal, args.orchestrator) {
        let groups = ReflectionGroups::new(Arc::clone(&coordinator), config.reflection.clone());
        let group_id = groups.start_reflection(ReflectionRequest {
            goal,
            max_iterations: args.max_iterations,
            orchestrator,
            workers: args.workers,
            evaluator: args.evaluator,
        })?;

        let mut finished = Box::pin(groups.await_reflection(&group_id));
        tokio::select! {
            () = shutdown_signal() => {
                info!("shutdown signal received, stopping reflection");
                groups.stop_reflection(&group_id)?;
                close_all(&coordinator);
                report(finished.await);
            }
            summary = &mut finished => report(summary),
        }
    } else {
        shutdown_signal().await;
        info!("shutdown signal received");
    }

    // ── Graceful shutdown ───────────────────────────────
    close_all(&coordinator);
    ct.cancel();
    let _ = tokio::join!(reader_handle, writer_handle, pump_handle);
    info!("agent-conductor shut down");

    Ok(())
}

fn report(summary: Result<agent_conductor::models::reflection::ReflectionSummary>) {
    match summary {
        Ok(summary) => match serde_json::to_string(&summary) {
            Ok(json) => info!(summary = %json, "reflection finished"),
            Err(err) => warn!(%err, "failed to serialize reflection summary"),
        },
        Err(err) => error!(%err, "reflection did not finish cleanly"),
    }
}

/// Close every open session, ending in-flight turns and their watchdogs,
/// then log each session's usage counters.
fn close_all(coordinator: &SessionCoordinator) {
    for id in coordinator.registry().ids() {
        if let Err(err) = coordinator.close_session(&id) {
            warn!(session_id = %id, %err, "failed to close session");
        }
        if let Some(metrics) = coordinator.session_metrics(&id) {
            match serde_json::to_string(&metrics) {
                Ok(json) => info!(session_id = %id, metrics = %json, "session metrics"),
                Err(err) => warn!(session_id = %id, %err, "failed to serialize session metrics"),
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
