//! Reflection loop driver.
//!
//! Drives one orchestrator session and a set of worker sessions toward a
//! goal:
//!
//! ```text
//! Idle → Planning → Dispatching → Collecting → Evaluating ─┬→ Planning (feedback)
//!                                                          ├→ Completed
//!                                                          ├→ Stalled
//!                                                          └→ Exhausted
//! ```
//!
//! Each phase suspends the driver until the sessions involved leave
//! processing; the session watchdog bounds every wait. Pause and stop
//! requests are honoured only between phases, before entering Planning or
//! Dispatching, so a worker is never left mid-dispatch without tracking.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::dispatch::{build_planning_prompt, PlanParser, TaskAssignment};
use super::evaluation::{build_evaluation_prompt, EvaluationParser};
use super::stall::{observe_synthesis, StallCheck};
use super::trend;
use crate::config::ReflectionConfig;
use crate::diagnostics::{DiagnosticEntry, DiagnosticKind};
use crate::models::history::MessageRole;
use crate::models::reflection::{
    EvaluationResult, ReflectionOutcome, ReflectionPhase, ReflectionState, ReflectionSummary,
};
use crate::session::{DispatchOutcome, SessionCoordinator};
use crate::{AppError, Result};

/// Parameters for starting a reflection loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectionRequest {
    /// Goal the workers are driven toward.
    pub goal: String,
    /// Iteration cap; the configured default when `None`.
    pub max_iterations: Option<u32>,
    /// Session that plans each iteration.
    pub orchestrator: String,
    /// Sessions that execute the plan.
    pub workers: Vec<String>,
    /// Dedicated evaluator session; the orchestrator evaluates when `None`.
    pub evaluator: Option<String>,
}

impl ReflectionRequest {
    /// Every session the loop drives: orchestrator, workers, evaluator.
    #[must_use]
    pub fn members(&self) -> Vec<String> {
        let mut members = Vec::with_capacity(self.workers.len() + 2);
        members.push(self.orchestrator.clone());
        members.extend(self.workers.iter().cloned());
        if let Some(ref evaluator) = self.evaluator {
            members.push(evaluator.clone());
        }
        members
    }
}

/// Control surface for a running loop.
#[derive(Debug, Clone)]
pub struct ReflectionHandle {
    group_id: String,
    members: Arc<[String]>,
    state_rx: watch::Receiver<ReflectionState>,
    pause_tx: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
}

impl ReflectionHandle {
    /// Orchestration group identifier.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Sessions the loop drives.
    #[must_use]
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Freeze the loop at the next phase boundary.
    pub fn pause(&self) {
        self.pause_tx.send_replace(true);
    }

    /// Let a paused loop continue.
    pub fn resume(&self) {
        self.pause_tx.send_replace(false);
    }

    /// Whether a pause is requested.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Stop the loop at the next phase boundary.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Latest published state.
    #[must_use]
    pub fn state(&self) -> ReflectionState {
        let mut state = self.state_rx.borrow().clone();
        if !state.phase.is_terminal() {
            state.is_paused = self.is_paused();
        }
        state
    }
}

/// Driver for one orchestration group. Owns its [`ReflectionState`].
pub struct ReflectionController {
    coordinator: Arc<SessionCoordinator>,
    config: ReflectionConfig,
    orchestrator: String,
    workers: Vec<String>,
    state: ReflectionState,
    state_tx: watch::Sender<ReflectionState>,
    pause_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    plans: PlanParser,
    verdicts: EvaluationParser,
}

impl ReflectionController {
    /// Validate `request` and build a driver plus its control handle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Orchestration` if there are no workers, the
    /// orchestrator is also listed as a worker, or the iteration cap is
    /// zero; `AppError::NotFound` if any named session is not registered.
    pub fn new(
        coordinator: Arc<SessionCoordinator>,
        request: ReflectionRequest,
        config: ReflectionConfig,
    ) -> Result<(Self, ReflectionHandle)> {
        if request.workers.is_empty() {
            return Err(AppError::Orchestration(
                "a reflection group needs at least one worker".into(),
            ));
        }
        if request.workers.contains(&request.orchestrator) {
            return Err(AppError::Orchestration(
                "the orchestrator cannot also be a worker".into(),
            ));
        }
        let max_iterations = request
            .max_iterations
            .unwrap_or(config.default_max_iterations);
        if max_iterations == 0 {
            return Err(AppError::Orchestration(
                "max_iterations must be greater than zero".into(),
            ));
        }

        let registry = coordinator.registry();
        registry.require(&request.orchestrator)?;
        for worker in &request.workers {
            registry.require(worker)?;
        }
        if let Some(ref evaluator) = request.evaluator {
            registry.require(evaluator)?;
        }

        let members: Arc<[String]> = request.members().into();
        let state = ReflectionState::new(
            request.goal,
            max_iterations,
            request.evaluator,
            config.stall_window,
        );
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let handle = ReflectionHandle {
            group_id: state.group_id.clone(),
            members,
            state_rx,
            pause_tx: Arc::new(pause_tx),
            cancel: cancel.clone(),
        };

        let controller = Self {
            coordinator,
            config,
            orchestrator: request.orchestrator,
            workers: request.workers,
            state,
            state_tx,
            pause_rx,
            cancel,
            plans: PlanParser::new()?,
            verdicts: EvaluationParser::new()?,
        };
        Ok((controller, handle))
    }

    /// Run the loop to completion.
    pub async fn run(mut self) -> ReflectionSummary {
        let span = info_span!("reflection", group_id = %self.state.group_id);
        async move {
            info!(
                goal = %self.state.goal,
                workers = self.workers.len(),
                max_iterations = self.state.max_iterations,
                "reflection loop started"
            );
            self.state.is_active = true;
            self.publish();

            let outcome = self.drive().await;
            self.finish(outcome).await
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) -> ReflectionOutcome {
        let mut feedback: Option<EvaluationResult> = None;

        loop {
            if let Some(outcome) = self.gate().await {
                return outcome;
            }
            self.enter(ReflectionPhase::Planning);
            let planning_prompt =
                build_planning_prompt(&self.state.goal, &self.workers, feedback.as_ref());
            let orchestrator = self.orchestrator.clone();
            let plan = match self.run_turn(&orchestrator, &planning_prompt).await {
                Ok(plan) => plan,
                Err(err) => {
                    warn!(%err, "planning turn failed, dispatching goal directly");
                    String::new()
                }
            };

            if let Some(outcome) = self.gate().await {
                return outcome;
            }
            self.enter(ReflectionPhase::Dispatching);
            let plan = if plan.trim().is_empty() {
                self.state.goal.clone()
            } else {
                plan
            };
            let assignments = self.plans.assign(&plan, &self.workers);
            let dispatched = self.dispatch(&assignments).await;

            self.enter(ReflectionPhase::Collecting);
            let synthesis = self.collect(&dispatched).await;

            let check = observe_synthesis(
                &mut self.state,
                &synthesis,
                self.config.stall_threshold,
            );
            self.publish();
            if let StallCheck::Stalled { .. } = check {
                return ReflectionOutcome::Stalled;
            }

            self.enter(ReflectionPhase::Evaluating);
            let result = self.evaluate(&synthesis).await;
            let goal_met = result.goal_met;
            self.record(result.clone());
            self.snapshot().await;

            if goal_met {
                return ReflectionOutcome::Completed;
            }
            if self.state.current_iteration >= self.state.max_iterations {
                return ReflectionOutcome::Exhausted;
            }
            feedback = Some(result);
        }
    }

    /// Pause/stop checkpoint run before Planning and Dispatching.
    async fn gate(&mut self) -> Option<ReflectionOutcome> {
        if self.cancel.is_cancelled() {
            return Some(ReflectionOutcome::Cancelled);
        }
        if !*self.pause_rx.borrow() {
            return None;
        }

        info!("reflection paused");
        self.state.is_paused = true;
        self.publish();

        let cancel = &self.cancel;
        let pause_rx = &mut self.pause_rx;
        let resumed = tokio::select! {
            () = cancel.cancelled() => false,
            ok = async { pause_rx.wait_for(|paused| !*paused).await.is_ok() } => ok,
        };

        self.state.is_paused = false;
        self.publish();
        if resumed && !self.cancel.is_cancelled() {
            info!("reflection resumed");
            None
        } else {
            Some(ReflectionOutcome::Cancelled)
        }
    }

    /// Send each assignment; returns the workers that started, with their
    /// history offsets.
    async fn dispatch(&self, assignments: &[TaskAssignment]) -> Vec<(String, usize)> {
        let mut dispatched = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let prompt = assignment.prompt(&self.state.goal);
            match self.start_turn(&assignment.worker, &prompt).await {
                Ok(offset) => dispatched.push((assignment.worker.clone(), offset)),
                Err(err) => {
                    warn!(worker = %assignment.worker, %err, "worker dispatch failed");
                }
            }
        }
        debug!(dispatched = dispatched.len(), "workers dispatched");
        dispatched
    }

    async fn collect(&self, dispatched: &[(String, usize)]) -> String {
        let timeout = self.config.collect_timeout();
        let waits = dispatched
            .iter()
            .map(|(worker, _)| self.coordinator.wait_until_idle(worker, timeout));
        let results = join_all(waits).await;

        let mut sections = Vec::with_capacity(dispatched.len());
        for ((worker, offset), result) in dispatched.iter().zip(results) {
            let body = match result {
                Ok(()) => {
                    let output = self.output_since(worker, *offset);
                    if output.trim().is_empty() {
                        "(no output)".to_owned()
                    } else {
                        output
                    }
                }
                Err(err) => {
                    warn!(%worker, %err, "worker did not finish");
                    format!("(no output: {err})")
                }
            };
            sections.push(format!("### @{worker}\n{body}"));
        }
        sections.join("\n\n")
    }

    async fn evaluate(&self, synthesis: &str) -> EvaluationResult {
        let iteration = self.state.current_iteration + 1;
        let evaluator = self
            .state
            .evaluator_session
            .clone()
            .unwrap_or_else(|| self.orchestrator.clone());
        let prompt = build_evaluation_prompt(&self.state.goal, iteration, synthesis);

        let (score, goal_met, rationale) = match self.run_turn(&evaluator, &prompt).await {
            Ok(response) => {
                let verdict = self.verdicts.parse(&response);
                if !verdict.parsed {
                    warn!(iteration, "evaluator score unparseable, recording zero");
                }
                let goal_met = verdict.goal_met_with(self.config.goal_met_score);
                (verdict.score, goal_met, verdict.rationale)
            }
            Err(err) => {
                warn!(iteration, %err, "evaluation turn failed, recording zero");
                (0.0, false, format!("evaluation failed: {err}"))
            }
        };

        EvaluationResult {
            iteration,
            score,
            rationale,
            evaluator,
            goal_met,
            timestamp: Utc::now(),
        }
    }

    fn record(&mut self, result: EvaluationResult) {
        self.state.current_iteration = result.iteration;
        self.state.goal_met = result.goal_met;
        self.state.evaluation_history.push(result);
        let trend = trend::classify(&self.state.evaluation_history, self.config.trend_delta);

        if let Some(last) = self.state.last_evaluation() {
            info!(
                iteration = last.iteration,
                score = last.score,
                goal_met = last.goal_met,
                ?trend,
                "iteration evaluated"
            );
            self.coordinator.cleanup_context().record(
                DiagnosticEntry::new(DiagnosticKind::ReflectionIteration)
                    .with_group(self.state.group_id.clone())
                    .with_session(last.evaluator.clone())
                    .with_detail(format!(
                        "iteration {} score {:.2} trend {trend:?}",
                        last.iteration, last.score
                    )),
            );
        }
        self.publish();
    }

    async fn finish(mut self, outcome: ReflectionOutcome) -> ReflectionSummary {
        self.state.phase = outcome.into();
        self.state.is_active = false;
        self.state.is_paused = false;
        self.publish();
        self.snapshot().await;

        let trend = trend::classify(&self.state.evaluation_history, self.config.trend_delta);
        info!(
            ?outcome,
            iterations = self.state.current_iteration,
            ?trend,
            "reflection loop finished"
        );
        self.coordinator.cleanup_context().record(
            DiagnosticEntry::new(DiagnosticKind::ReflectionFinished)
                .with_group(self.state.group_id.clone())
                .with_detail(format!(
                    "{outcome:?} after {} iteration(s)",
                    self.state.current_iteration
                )),
        );

        ReflectionSummary {
            group_id: self.state.group_id.clone(),
            outcome,
            iterations: self.state.current_iteration,
            final_score: self.state.last_evaluation().map(|e| e.score),
            trend,
            evaluations: self.state.evaluation_history.clone(),
        }
    }

    fn enter(&mut self, phase: ReflectionPhase) {
        debug!(?phase, "phase transition");
        self.state.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    /// Start a turn on `session`, waiting out any turn already in flight.
    ///
    /// Returns the history length before the prompt was recorded, so the
    /// caller can read back only what this turn produced.
    async fn start_turn(&self, session: &str, prompt: &str) -> Result<usize> {
        self.coordinator
            .wait_until_idle(session, self.config.collect_timeout())
            .await?;
        let offset = self.coordinator.history().messages(session).len();
        match self.coordinator.send_prompt(session, prompt).await? {
            DispatchOutcome::Started(_) => Ok(offset),
            DispatchOutcome::Failed { message, .. } => Err(AppError::Runtime(message)),
        }
    }

    /// Run one full turn and return the assistant output it produced.
    async fn run_turn(&self, session: &str, prompt: &str) -> Result<String> {
        let offset = self.start_turn(session, prompt).await?;
        self.coordinator
            .wait_until_idle(session, self.config.collect_timeout())
            .await?;
        Ok(self.output_since(session, offset))
    }

    fn output_since(&self, session: &str, offset: usize) -> String {
        self.coordinator
            .history()
            .messages(session)
            .into_iter()
            .skip(offset)
            .filter(|m| m.role == MessageRole::Assistant)
            .map(|m| m.content)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    async fn snapshot(&self) {
        let Some(ref dir) = self.config.snapshot_dir else {
            return;
        };
        if let Err(err) = write_snapshot(dir, &self.state).await {
            warn!(%err, "failed to write reflection snapshot");
        }
    }
}

async fn write_snapshot(dir: &Path, state: &ReflectionState) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let json = serde_json::to_vec_pretty(state)?;
    tokio::fs::write(dir.join(format!("{}.json", state.group_id)), json).await?;
    Ok(())
}
