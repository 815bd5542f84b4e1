//! Deterministic collaborators driven by a YAML scenario
//!
//! A scenario names a root task and, per task id, how each collaborator
//! behaves: the classifier's mode, the planner's subtasks and answers, a
//! sequence of executor steps (the last one repeats) and a sequence of review
//! scores. Pairwise similarities are listed separately; an entry without a
//! value makes the similarity check fail for that pair.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Candidate, Classifier, CollabError, ExecutionGrant, Executor, Planner, RawOutcome, RawResult, Scorer};
use crate::domain::{Budget, Mode, Subtask, TaskDescriptor};
use crate::protocol::ValidatedPlan;

fn default_cost() -> Budget {
    Budget::from_units(1.0)
}

fn default_confidence() -> f64 {
    1.0
}

/// One scripted execution
///
/// The first of `clarify`, `fail`, `blocked` that is set decides the outcome;
/// otherwise the step completes with `output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScriptedStep {
    #[serde(default)]
    pub output: Option<String>,

    #[serde(default)]
    pub clarify: Option<String>,

    #[serde(default)]
    pub fail: Option<String>,

    #[serde(default)]
    pub blocked: Option<String>,

    /// Draft handed up alongside a clarification or failure
    #[serde(default)]
    pub partial: Option<String>,

    #[serde(default = "default_cost")]
    pub cost: Budget,

    #[serde(default = "default_confidence")]
    pub confidence: f64,

    #[serde(default)]
    pub insights: Vec<String>,

    /// Simulated execution time
    #[serde(default)]
    pub delay_ms: u64,
}

impl Default for ScriptedStep {
    fn default() -> Self {
        Self {
            output: None,
            clarify: None,
            fail: None,
            blocked: None,
            partial: None,
            cost: default_cost(),
            confidence: default_confidence(),
            insights: Vec::new(),
            delay_ms: 0,
        }
    }
}

impl ScriptedStep {
    fn outcome(&self, task: &TaskDescriptor) -> RawOutcome {
        if let Some(question) = &self.clarify {
            return RawOutcome::NeedsClarification {
                question: question.clone(),
                partial: self.partial.clone(),
            };
        }
        if let Some(reason) = &self.fail {
            return RawOutcome::Failed {
                reason: reason.clone(),
                partial: self.partial.clone(),
            };
        }
        if let Some(reason) = &self.blocked {
            return RawOutcome::Blocked { reason: reason.clone() };
        }
        RawOutcome::Completed {
            output: self.output.clone().unwrap_or_else(|| format!("{}: done", task.title)),
        }
    }
}

/// Scripted behaviour for one task id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScriptedTask {
    #[serde(default)]
    pub mode: Mode,

    #[serde(default)]
    pub subtasks: Vec<Subtask>,

    /// Makes the planner itself fail for this task
    #[serde(default)]
    pub planner_error: Option<String>,

    /// Answers to child clarifications, keyed by exact question text
    #[serde(default)]
    pub answers: HashMap<String, String>,

    #[serde(default)]
    pub default_answer: Option<String>,

    #[serde(default)]
    pub steps: Vec<ScriptedStep>,

    /// Review scores in call order; the last one repeats
    #[serde(default)]
    pub scores: Vec<f64>,

    /// Simulated planning time
    #[serde(default)]
    pub plan_delay_ms: u64,
}

/// Similarity between two task ids' outputs; `value: null` makes the check fail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEntry {
    pub between: [String; 2],
    pub value: Option<f64>,
}

/// A complete scripted run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Scenario {
    pub root: TaskDescriptor,

    #[serde(default)]
    pub budget: Option<Budget>,

    /// Load level reported to the governor
    #[serde(default)]
    pub pressure: f64,

    #[serde(default)]
    pub tasks: HashMap<String, ScriptedTask>,

    #[serde(default)]
    pub similarities: Vec<SimilarityEntry>,
}

impl Scenario {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse scenario")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(?path, "Scenario::load: called");
        let content = fs::read_to_string(path).context(format!("Failed to read scenario {}", path.display()))?;
        Self::from_yaml(&content).context(format!("Invalid scenario {}", path.display()))
    }

    /// Validate every scripted plan; returns one message per problem
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut problems = Vec::new();
        let mut ids: Vec<&String> = self.tasks.keys().collect();
        ids.sort();
        for id in ids {
            let task = &self.tasks[id];
            if task.mode == Mode::Delegate
                && task.planner_error.is_none()
                && let Err(e) = ValidatedPlan::new(task.subtasks.clone())
            {
                problems.push(format!("{}: {}", id, e));
            }
            for score in &task.scores {
                if !(0.0..=1.0).contains(score) {
                    problems.push(format!("{}: score {} outside [0, 1]", id, score));
                }
            }
        }
        for entry in &self.similarities {
            if let Some(v) = entry.value
                && !(0.0..=1.0).contains(&v)
            {
                problems.push(format!(
                    "similarity {}/{}: {} outside [0, 1]",
                    entry.between[0], entry.between[1], v
                ));
            }
        }
        if problems.is_empty() { Ok(()) } else { Err(problems) }
    }
}

#[derive(Default)]
struct Counters {
    executions: HashMap<String, usize>,
    reviews: HashMap<String, usize>,
    seen: HashMap<String, Vec<TaskDescriptor>>,
}

/// Planner, classifier, executor and scorer backed by a [`Scenario`]
pub struct ScriptedCollaborators {
    scenario: Scenario,
    counters: Mutex<Counters>,
}

impl ScriptedCollaborators {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Number of times `task_id` was executed
    pub fn executions(&self, task_id: &str) -> usize {
        self.counters.lock().executions.get(task_id).copied().unwrap_or(0)
    }

    /// Descriptors the executor received for `task_id`, in call order
    pub fn seen(&self, task_id: &str) -> Vec<TaskDescriptor> {
        self.counters.lock().seen.get(task_id).cloned().unwrap_or_default()
    }

    fn task(&self, id: &str) -> Option<&ScriptedTask> {
        self.scenario.tasks.get(id)
    }
}

#[async_trait]
impl Planner for ScriptedCollaborators {
    async fn decompose(&self, task: &TaskDescriptor) -> Result<Vec<Subtask>, CollabError> {
        debug!(task_id = %task.id, "ScriptedCollaborators::decompose: called");
        let scripted = self.task(&task.id).ok_or_else(|| CollabError::NotScripted(task.id.clone()))?;
        if scripted.plan_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(scripted.plan_delay_ms)).await;
        }
        if let Some(reason) = &scripted.planner_error {
            return Err(CollabError::Unavailable(reason.clone()));
        }
        Ok(scripted.subtasks.clone())
    }

    async fn answer(&self, task: &TaskDescriptor, question: &str) -> Result<Option<String>, CollabError> {
        debug!(task_id = %task.id, %question, "ScriptedCollaborators::answer: called");
        Ok(self
            .task(&task.id)
            .and_then(|t| t.answers.get(question).cloned().or_else(|| t.default_answer.clone())))
    }
}

#[async_trait]
impl Classifier for ScriptedCollaborators {
    async fn classify(&self, task: &TaskDescriptor) -> Result<Mode, CollabError> {
        let mode = self.task(&task.id).map(|t| t.mode).unwrap_or_default();
        debug!(task_id = %task.id, %mode, "ScriptedCollaborators::classify: called");
        Ok(mode)
    }
}

#[async_trait]
impl Executor for ScriptedCollaborators {
    async fn execute(&self, task: &TaskDescriptor, grant: &ExecutionGrant) -> Result<RawResult, CollabError> {
        debug!(task_id = %task.id, spendable = %grant.spendable, attempt = grant.attempt, "ScriptedCollaborators::execute: called");
        let index = {
            let mut counters = self.counters.lock();
            counters.seen.entry(task.id.clone()).or_default().push(task.clone());
            let count = counters.executions.entry(task.id.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };

        let step = self
            .task(&task.id)
            .and_then(|t| t.steps.get(index).or_else(|| t.steps.last()))
            .cloned()
            .unwrap_or_default();

        if step.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
        }

        Ok(RawResult {
            outcome: step.outcome(task),
            cost: step.cost,
            confidence: step.confidence,
            insights: step.insights.clone(),
        })
    }
}

#[async_trait]
impl Scorer for ScriptedCollaborators {
    async fn score(&self, task: &TaskDescriptor, _output: &str) -> Result<f64, CollabError> {
        let index = {
            let mut counters = self.counters.lock();
            let count = counters.reviews.entry(task.id.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let score = self
            .task(&task.id)
            .and_then(|t| t.scores.get(index).or_else(|| t.scores.last()))
            .copied()
            .unwrap_or(1.0);
        debug!(task_id = %task.id, score, "ScriptedCollaborators::score: called");
        Ok(score)
    }

    async fn similarity(&self, a: Candidate<'_>, b: Candidate<'_>) -> Result<f64, CollabError> {
        debug!(a = a.task_id, b = b.task_id, "ScriptedCollaborators::similarity: called");
        let entry = self.scenario.similarities.iter().find(|e| {
            (e.between[0] == a.task_id && e.between[1] == b.task_id)
                || (e.between[0] == b.task_id && e.between[1] == a.task_id)
        });
        match entry {
            Some(SimilarityEntry { value: Some(v), .. }) => Ok(*v),
            Some(SimilarityEntry { value: None, .. }) => Err(CollabError::Unavailable(format!(
                "no similarity for {} and {}",
                a.task_id, b.task_id
            ))),
            None => Ok(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
root:
  id: report
  title: Quarterly report
budget: 100
tasks:
  report:
    mode: delegate
    subtasks:
      - id: revenue
        title: Revenue figures
      - id: costs
        title: Cost figures
    answers:
      "Which quarter?": Q3
  revenue:
    steps:
      - clarify: "Which quarter?"
        partial: draft
        cost: 1
      - output: "Revenue was 4.2M"
        cost: 9
        insights: ["fiscal year starts in February"]
    scores: [0.4, 0.9]
similarities:
  - between: [revenue, costs]
    value: 0.2
  - between: [costs, audit]
    value: null
"#;

    fn grant() -> ExecutionGrant {
        ExecutionGrant {
            spendable: Budget::from_units(10.0),
            time_allowance: Duration::from_secs(1),
            attempt: 0,
        }
    }

    fn script() -> ScriptedCollaborators {
        ScriptedCollaborators::new(Scenario::from_yaml(SCENARIO).unwrap())
    }

    #[test]
    fn test_parse_and_validate() {
        let scenario = Scenario::from_yaml(SCENARIO).unwrap();
        assert_eq!(scenario.budget, Some(Budget::from_units(100.0)));
        assert_eq!(scenario.tasks["report"].mode, Mode::Delegate);
        assert!(scenario.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_bad_plan() {
        let yaml = r#"
root: { id: r, title: R }
tasks:
  r:
    mode: delegate
    subtasks:
      - { id: a, title: A, depends-on: [b] }
      - { id: b, title: B, depends-on: [a] }
"#;
        let problems = Scenario::from_yaml(yaml).unwrap().validate().unwrap_err();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].starts_with("r:"));
    }

    #[tokio::test]
    async fn test_steps_advance_then_repeat() {
        let script = script();
        let task = TaskDescriptor::new("revenue", "Revenue figures");

        let first = script.execute(&task, &grant()).await.unwrap();
        assert!(matches!(first.outcome, RawOutcome::NeedsClarification { .. }));
        assert_eq!(first.cost, Budget::from_units(1.0));

        let second = script.execute(&task, &grant()).await.unwrap();
        assert_eq!(
            second.outcome,
            RawOutcome::Completed {
                output: "Revenue was 4.2M".into()
            }
        );
        assert_eq!(second.insights.len(), 1);

        let third = script.execute(&task, &grant()).await.unwrap();
        assert_eq!(third.outcome, second.outcome);
        assert_eq!(script.executions("revenue"), 3);
    }

    #[tokio::test]
    async fn test_unscripted_task_completes_by_default() {
        let script = script();
        let task = TaskDescriptor::new("costs", "Cost figures");
        let result = script.execute(&task, &grant()).await.unwrap();
        assert_eq!(
            result.outcome,
            RawOutcome::Completed {
                output: "Cost figures: done".into()
            }
        );
        assert_eq!(script.classify(&task).await.unwrap(), Mode::Solo);
    }

    #[tokio::test]
    async fn test_planner_answers_and_decomposes() {
        let script = script();
        let report = TaskDescriptor::new("report", "Quarterly report");
        assert_eq!(script.decompose(&report).await.unwrap().len(), 2);
        assert_eq!(script.answer(&report, "Which quarter?").await.unwrap(), Some("Q3".into()));
        assert_eq!(script.answer(&report, "Which year?").await.unwrap(), None);
        assert!(script.decompose(&TaskDescriptor::new("nope", "Nope")).await.is_err());
    }

    #[tokio::test]
    async fn test_scores_and_similarities() {
        let script = script();
        let revenue = TaskDescriptor::new("revenue", "Revenue figures");
        assert_eq!(script.score(&revenue, "x").await.unwrap(), 0.4);
        assert_eq!(script.score(&revenue, "x").await.unwrap(), 0.9);
        assert_eq!(script.score(&revenue, "x").await.unwrap(), 0.9);

        let a = Candidate {
            task_id: "costs",
            output: "a",
        };
        let b = Candidate {
            task_id: "revenue",
            output: "b",
        };
        let c = Candidate {
            task_id: "audit",
            output: "c",
        };
        assert_eq!(script.similarity(a, b).await.unwrap(), 0.2);
        assert!(script.similarity(a, c).await.is_err());
        assert_eq!(script.similarity(b, c).await.unwrap(), 1.0);
    }
}
