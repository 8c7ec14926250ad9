//! Evaluator prompt construction and verdict parsing.
//!
//! The evaluator is asked to answer in a fixed line format:
//!
//! ```text
//! SCORE: 0.72
//! GOAL_MET: no
//! RATIONALE: tests still fail on ...
//! ```
//!
//! Scores given as percentages (`72%`) or out of ten (`7/10`) are
//! normalised. A response with no readable score becomes a zero score whose
//! rationale records the parse failure; it never stops the loop.

use regex::Regex;

use crate::{AppError, Result};

const EXCERPT_CHARS: usize = 200;

/// Verdict extracted from an evaluator response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvaluation {
    /// Score clamped to `[0, 1]`.
    pub score: f64,
    /// Explicit goal verdict, if the evaluator gave one.
    pub goal_met: Option<bool>,
    /// Evaluator explanation.
    pub rationale: String,
    /// Whether a score line was found.
    pub parsed: bool,
}

impl ParsedEvaluation {
    /// Whether the goal counts as met: the explicit verdict if present,
    /// otherwise `score >= threshold`.
    #[must_use]
    pub fn goal_met_with(&self, threshold: f64) -> bool {
        self.goal_met.unwrap_or(self.parsed && self.score >= threshold)
    }
}

/// Build the prompt sent to the evaluator session.
#[must_use]
pub fn build_evaluation_prompt(goal: &str, iteration: u32, synthesis: &str) -> String {
    format!(
        "You are evaluating iteration {iteration} of a multi-agent effort.\n\n\
         GOAL:\n{goal}\n\n\
         COMBINED WORKER OUTPUT:\n{synthesis}\n\n\
         Judge how completely the output satisfies the goal. Reply with exactly these lines:\n\
         SCORE: <number between 0.0 and 1.0>\n\
         GOAL_MET: <yes|no>\n\
         RATIONALE: <what is done, what is missing, what to do next>"
    )
}

/// Compiled patterns for evaluator responses.
#[derive(Debug, Clone)]
pub struct EvaluationParser {
    score: Regex,
    goal_met: Regex,
    rationale: Regex,
}

impl EvaluationParser {
    /// Compile the response patterns.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Orchestration` if a pattern fails to compile.
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|err| AppError::Orchestration(format!("invalid evaluation pattern: {err}")))
        };
        Ok(Self {
            score: compile(
                r"(?im)^[ \t*#>-]*score\**[ \t]*[:=][ \t]*\**[ \t]*([0-9]+(?:\.[0-9]+)?)[ \t]*(%|/[ \t]*100\b|/[ \t]*10\b)?",
            )?,
            goal_met: compile(
                r"(?im)^[ \t*#>-]*goal[_ ]met\**[ \t]*[:=][ \t]*\**[ \t]*(yes|no|true|false)\b",
            )?,
            rationale: compile(r"(?ims)^[ \t*#>-]*rationale\**[ \t]*[:=][ \t]*(.+)")?,
        })
    }

    /// Extract a verdict from `response`.
    #[must_use]
    pub fn parse(&self, response: &str) -> ParsedEvaluation {
        let goal_met = self.goal_met.captures(response).map(|caps| {
            let word = caps[1].to_ascii_lowercase();
            word == "yes" || word == "true"
        });

        let score = self.score.captures(response).and_then(|caps| {
            let raw: f64 = caps[1].parse().ok()?;
            let scale = match caps.get(2).map(|m| m.as_str().replace(char::is_whitespace, "")) {
                Some(ref suffix) if suffix == "%" || suffix == "/100" => 100.0,
                Some(ref suffix) if suffix == "/10" => 10.0,
                _ if raw > 1.0 && raw <= 10.0 => 10.0,
                _ if raw > 10.0 => 100.0,
                _ => 1.0,
            };
            Some((raw / scale).clamp(0.0, 1.0))
        });

        let Some(score) = score else {
            return ParsedEvaluation {
                score: 0.0,
                goal_met,
                rationale: format!(
                    "evaluator response could not be parsed: {}",
                    excerpt(response)
                ),
                parsed: false,
            };
        };

        let rationale = self
            .rationale
            .captures(response)
            .map_or_else(|| response.trim().to_owned(), |caps| caps[1].trim().to_owned());

        ParsedEvaluation {
            score,
            goal_met,
            rationale,
            parsed: true,
        }
    }
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= EXCERPT_CHARS {
        return trimmed.to_owned();
    }
    let mut cut: String = trimmed.chars().take(EXCERPT_CHARS).collect();
    cut.push('…');
    cut
}
