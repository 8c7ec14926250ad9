//! Evaluation score trend classification.

use crate::models::reflection::{EvaluationResult, QualityTrend};

/// Number of trailing evaluations considered.
pub const TREND_WINDOW: usize = 3;

/// Classify the latest score against the oldest one in the trailing window.
///
/// With fewer than two evaluations the trend is `Stable` by definition.
#[must_use]
pub fn classify(history: &[EvaluationResult], delta: f64) -> QualityTrend {
    let scores: Vec<f64> = history.iter().map(|e| e.score).collect();
    classify_scores(&scores, delta)
}

/// Score-only form of [`classify`].
#[must_use]
pub fn classify_scores(scores: &[f64], delta: f64) -> QualityTrend {
    if scores.len() < 2 {
        return QualityTrend::Stable;
    }
    let window = &scores[scores.len().saturating_sub(TREND_WINDOW)..];
    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        return QualityTrend::Stable;
    };

    let change = last - first;
    if change > delta {
        QualityTrend::Improving
    } else if change < -delta {
        QualityTrend::Degrading
    } else {
        QualityTrend::Stable
    }
}
