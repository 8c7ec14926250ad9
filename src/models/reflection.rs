//! Reflection loop state, evaluation history, and outcome models.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Driver state for one orchestration group.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionPhase {
    /// Created, driver not yet started.
    #[default]
    Idle,
    /// Orchestrator is producing a plan.
    Planning,
    /// Plan is being handed out to workers.
    Dispatching,
    /// Waiting for workers to finish.
    Collecting,
    /// Evaluator is scoring the synthesis.
    Evaluating,
    /// Goal met.
    Completed,
    /// Synthesis output repeated.
    Stalled,
    /// Iteration cap reached.
    Exhausted,
    /// Stopped externally.
    Cancelled,
}

impl ReflectionPhase {
    /// Whether the loop has finished.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Stalled | Self::Exhausted | Self::Cancelled
        )
    }
}

/// Direction of evaluation scores over the trailing window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualityTrend {
    /// Score rose by more than the trend delta.
    Improving,
    /// Score moved by no more than the trend delta.
    #[default]
    Stable,
    /// Score fell by more than the trend delta.
    Degrading,
}

/// One evaluator verdict. Never mutated after insertion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationResult {
    /// Iteration the verdict belongs to (1-based).
    pub iteration: u32,
    /// Quality score in `[0, 1]`.
    pub score: f64,
    /// Evaluator explanation.
    pub rationale: String,
    /// Session that produced the verdict.
    pub evaluator: String,
    /// Whether the evaluator judged the goal satisfied.
    pub goal_met: bool,
    /// Recording time.
    pub timestamp: DateTime<Utc>,
}

/// Bounded window of recent synthesis hashes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashWindow {
    capacity: usize,
    hashes: VecDeque<String>,
}

impl HashWindow {
    /// Empty window retaining at most `capacity` hashes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            hashes: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Whether `hash` is currently in the window.
    #[must_use]
    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.iter().any(|h| h == hash)
    }

    /// Append `hash`, evicting the oldest entry when full.
    pub fn push(&mut self, hash: String) {
        if self.hashes.len() == self.capacity {
            self.hashes.pop_front();
        }
        self.hashes.push_back(hash);
    }

    /// Hashes currently retained, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hashes.iter().map(String::as_str)
    }

    /// Number of retained hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Whether the window is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Mutable record of one orchestration group's progress.
///
/// Owned by the group's driver loop; everyone else reads clones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReflectionState {
    /// Orchestration group identifier.
    pub group_id: String,
    /// Goal the workers are driven toward.
    pub goal: String,
    /// Iteration cap.
    pub max_iterations: u32,
    /// Completed evaluation rounds.
    pub current_iteration: u32,
    /// Driver is running.
    pub is_active: bool,
    /// Evaluator judged the goal satisfied.
    pub goal_met: bool,
    /// Synthesis output repeated on consecutive checks.
    pub is_stalled: bool,
    /// Operator froze the loop between iterations.
    pub is_paused: bool,
    /// Dedicated evaluator session, if any.
    pub evaluator_session: Option<String>,
    /// Append-only evaluator verdicts.
    pub evaluation_history: Vec<EvaluationResult>,
    /// Recent synthesis hashes.
    pub response_hash_window: HashWindow,
    /// Consecutive syntheses whose hash was already in the window.
    pub consecutive_stalls: u32,
    /// Current driver phase.
    pub phase: ReflectionPhase,
    /// Loop start time.
    pub started_at: DateTime<Utc>,
}

impl ReflectionState {
    /// Construct a fresh, inactive state with a generated group identifier.
    #[must_use]
    pub fn new(
        goal: String,
        max_iterations: u32,
        evaluator_session: Option<String>,
        stall_window: usize,
    ) -> Self {
        Self {
            group_id: Uuid::new_v4().to_string(),
            goal,
            max_iterations,
            current_iteration: 0,
            is_active: false,
            goal_met: false,
            is_stalled: false,
            is_paused: false,
            evaluator_session,
            evaluation_history: Vec::new(),
            response_hash_window: HashWindow::new(stall_window),
            consecutive_stalls: 0,
            phase: ReflectionPhase::Idle,
            started_at: Utc::now(),
        }
    }

    /// Most recent evaluation, if any.
    #[must_use]
    pub fn last_evaluation(&self) -> Option<&EvaluationResult> {
        self.evaluation_history.last()
    }
}

/// Why a reflection loop stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionOutcome {
    /// Goal met.
    Completed,
    /// Synthesis output stopped changing.
    Stalled,
    /// Iteration cap reached without meeting the goal.
    Exhausted,
    /// Stopped externally.
    Cancelled,
}

impl From<ReflectionOutcome> for ReflectionPhase {
    fn from(outcome: ReflectionOutcome) -> Self {
        match outcome {
            ReflectionOutcome::Completed => Self::Completed,
            ReflectionOutcome::Stalled => Self::Stalled,
            ReflectionOutcome::Exhausted => Self::Exhausted,
            ReflectionOutcome::Cancelled => Self::Cancelled,
        }
    }
}

/// Completion report for a finished loop. Non-convergence is reported
/// here, never as an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReflectionSummary {
    /// Orchestration group identifier.
    pub group_id: String,
    /// Termination cause.
    pub outcome: ReflectionOutcome,
    /// Evaluation rounds completed.
    pub iterations: u32,
    /// Score of the last evaluation, if any.
    pub final_score: Option<f64>,
    /// Trend over the trailing window at termination.
    pub trend: QualityTrend,
    /// Full evaluator history.
    pub evaluations: Vec<EvaluationResult>,
}
