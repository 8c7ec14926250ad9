//! Planning prompts and plan-to-worker assignment.
//!
//! The orchestrator is asked to write its plan as task lines:
//!
//! ```text
//! @worker-1: implement the parser
//! @worker-2: write tests for the parser
//! TASK: update the changelog
//! ```
//!
//! Lines that follow a task line without starting a new one are appended to
//! that task. Tasks addressed to a known worker go to it; the rest are dealt
//! out round-robin. A plan with no task lines is broadcast to every worker.

use regex::Regex;

use crate::models::reflection::EvaluationResult;
use crate::{AppError, Result};

/// Tasks handed to one worker for one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAssignment {
    /// Worker session identifier.
    pub worker: String,
    /// Task texts, in plan order.
    pub tasks: Vec<String>,
}

impl TaskAssignment {
    /// Prompt sent to the worker.
    #[must_use]
    pub fn prompt(&self, goal: &str) -> String {
        let mut prompt = format!("Overall goal:\n{goal}\n\nYour assignment:\n");
        if let [only] = self.tasks.as_slice() {
            prompt.push_str(only);
        } else {
            for (i, task) in self.tasks.iter().enumerate() {
                prompt.push_str(&format!("{}. {task}\n", i + 1));
            }
        }
        prompt.push_str("\n\nReport what you did and the result when finished.");
        prompt
    }
}

/// Build the prompt sent to the orchestrator at the start of an iteration.
#[must_use]
pub fn build_planning_prompt(
    goal: &str,
    workers: &[String],
    feedback: Option<&EvaluationResult>,
) -> String {
    let roster = workers
        .iter()
        .map(|w| format!("@{w}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut prompt = format!(
        "You coordinate these workers: {roster}.\n\nGOAL:\n{goal}\n\n"
    );
    if let Some(eval) = feedback {
        prompt.push_str(&format!(
            "The previous iteration ({}) scored {:.2}. Evaluator feedback:\n{}\n\n\
             Plan the next iteration to close the remaining gaps.\n\n",
            eval.iteration, eval.score, eval.rationale
        ));
    }
    prompt.push_str(
        "Write one line per task in the form `@worker: task`, or `TASK: task` to let \
         the system choose a worker. Put nothing else on task lines.",
    );
    prompt
}

/// Compiled patterns for orchestrator plans.
#[derive(Debug, Clone)]
pub struct PlanParser {
    addressed: Regex,
    unaddressed: Regex,
}

#[derive(Debug)]
struct ParsedTask {
    target: Option<String>,
    text: String,
}

impl PlanParser {
    /// Compile the plan patterns.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Orchestration` if a pattern fails to compile.
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|err| AppError::Orchestration(format!("invalid plan pattern: {err}")))
        };
        Ok(Self {
            addressed: compile(r"^[ \t*>-]*@([A-Za-z0-9_.\-]+)[ \t]*:[ \t]*(.*)$")?,
            unaddressed: compile(r"(?i)^[ \t*>-]*task[ \t]*[0-9]*[ \t]*:[ \t]*(.*)$")?,
        })
    }

    /// Split `plan` into per-worker assignments.
    ///
    /// Returns an empty list when `workers` is empty.
    #[must_use]
    pub fn assign(&self, plan: &str, workers: &[String]) -> Vec<TaskAssignment> {
        if workers.is_empty() {
            return Vec::new();
        }

        let tasks = self.parse_tasks(plan);
        if tasks.is_empty() {
            let plan = plan.trim();
            if plan.is_empty() {
                return Vec::new();
            }
            return workers
                .iter()
                .map(|w| TaskAssignment {
                    worker: w.clone(),
                    tasks: vec![plan.to_owned()],
                })
                .collect();
        }

        let mut buckets: Vec<Vec<String>> = vec![Vec::new(); workers.len()];
        let mut cursor = 0usize;
        for task in tasks {
            let index = task
                .target
                .as_deref()
                .and_then(|name| workers.iter().position(|w| w == name))
                .unwrap_or_else(|| {
                    let i = cursor % workers.len();
                    cursor += 1;
                    i
                });
            buckets[index].push(task.text);
        }

        workers
            .iter()
            .zip(buckets)
            .filter(|(_, tasks)| !tasks.is_empty())
            .map(|(w, tasks)| TaskAssignment {
                worker: w.clone(),
                tasks,
            })
            .collect()
    }

    fn parse_tasks(&self, plan: &str) -> Vec<ParsedTask> {
        let mut tasks: Vec<ParsedTask> = Vec::new();
        for line in plan.lines() {
            if let Some(caps) = self.addressed.captures(line) {
                tasks.push(ParsedTask {
                    target: Some(caps[1].to_owned()),
                    text: caps[2].trim().to_owned(),
                });
            } else if let Some(caps) = self.unaddressed.captures(line) {
                tasks.push(ParsedTask {
                    target: None,
                    text: caps[1].trim().to_owned(),
                });
            } else if let Some(current) = tasks.last_mut() {
                if !line.trim().is_empty() {
                    if !current.text.is_empty() {
                        current.text.push('\n');
                    }
                    current.text.push_str(line.trim_end());
                }
            }
        }
        tasks.retain(|t| !t.text.is_empty());
        tasks
    }
}
