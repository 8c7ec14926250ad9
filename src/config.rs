//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Shortest inactivity tier allowed; resumed sessions routinely go 30-60s
/// between tool events.
pub const MIN_INACTIVITY_TIMEOUT_SECONDS: u64 = 120;

/// Watchdog poll interval and timeout tiers (seconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WatchdogConfig {
    /// Interval between staleness checks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Idle limit when no tool activity is inferred for the turn.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_seconds: u64,
    /// Idle limit when tools are running, have run this turn, or the
    /// session is catching up after a resume.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_seconds: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            inactivity_timeout_seconds: default_inactivity_timeout(),
            tool_timeout_seconds: default_tool_timeout(),
        }
    }
}

impl WatchdogConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

fn default_poll_interval() -> u64 {
    15
}

fn default_inactivity_timeout() -> u64 {
    MIN_INACTIVITY_TIMEOUT_SECONDS
}

fn default_tool_timeout() -> u64 {
    600
}

/// Reflection loop tuning.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ReflectionConfig {
    /// Iteration cap used when a caller does not supply one.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
    /// Number of recent synthesis hashes retained for repetition checks.
    #[serde(default = "default_stall_window")]
    pub stall_window: usize,
    /// Consecutive repeats that mark the loop as stalled.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,
    /// Score delta that separates `Improving`/`Degrading` from `Stable`.
    #[serde(default = "default_trend_delta")]
    pub trend_delta: f64,
    /// Score at or above which the goal counts as met when the evaluator
    /// gives no explicit verdict.
    #[serde(default = "default_goal_met_score")]
    pub goal_met_score: f64,
    /// Upper bound on waiting for one session to go idle; 0 means unbounded
    /// (the session's own watchdog is the liveness backstop).
    #[serde(default)]
    pub collect_timeout_seconds: u64,
    /// Directory for best-effort JSON snapshots of reflection state.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            stall_window: default_stall_window(),
            stall_threshold: default_stall_threshold(),
            trend_delta: default_trend_delta(),
            goal_met_score: default_goal_met_score(),
            collect_timeout_seconds: 0,
            snapshot_dir: None,
        }
    }
}

impl ReflectionConfig {
    /// Collection timeout, or `None` when waits are unbounded.
    #[must_use]
    pub fn collect_timeout(&self) -> Option<Duration> {
        (self.collect_timeout_seconds > 0).then(|| Duration::from_secs(self.collect_timeout_seconds))
    }
}

fn default_max_iterations() -> u32 {
    5
}

fn default_stall_window() -> usize {
    3
}

fn default_stall_threshold() -> u32 {
    2
}

fn default_trend_delta() -> f64 {
    0.1
}

fn default_goal_met_score() -> f64 {
    0.9
}

/// Diagnostic record output.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DiagnosticsConfig {
    /// Directory for daily-rotating JSONL diagnostic files; disabled when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Watchdog tiers.
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// Reflection loop tuning.
    #[serde(default)]
    pub reflection: ReflectionConfig,
    /// Diagnostic record output.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let watchdog = &self.watchdog;
        if watchdog.poll_interval_seconds == 0 {
            return Err(AppError::Config(
                "watchdog.poll_interval_seconds must be greater than zero".into(),
            ));
        }

        if watchdog.inactivity_timeout_seconds < MIN_INACTIVITY_TIMEOUT_SECONDS {
            return Err(AppError::Config(format!(
                "watchdog.inactivity_timeout_seconds must be at least {MIN_INACTIVITY_TIMEOUT_SECONDS}"
            )));
        }

        if watchdog.tool_timeout_seconds < watchdog.inactivity_timeout_seconds {
            return Err(AppError::Config(
                "watchdog.tool_timeout_seconds must not be shorter than the inactivity timeout"
                    .into(),
            ));
        }

        let reflection = &self.reflection;
        if reflection.default_max_iterations == 0 {
            return Err(AppError::Config(
                "reflection.default_max_iterations must be greater than zero".into(),
            ));
        }

        if reflection.stall_window == 0 || reflection.stall_threshold == 0 {
            return Err(AppError::Config(
                "reflection.stall_window and stall_threshold must be greater than zero".into(),
            ));
        }

        for (name, value) in [
            ("trend_delta", reflection.trend_delta),
            ("goal_met_score", reflection.goal_met_score),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(AppError::Config(format!(
                    "reflection.{name} must be within (0, 1]"
                )));
            }
        }

        Ok(())
    }
}
