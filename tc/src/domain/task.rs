//! Task descriptors handed to cells and the subtasks planners produce

use serde::{Deserialize, Serialize};

use super::id::CorrelationId;
use super::priority::Priority;

fn default_weight() -> f64 {
    1.0
}

/// How a cell chooses to work a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Solo,
    Delegate,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Solo => write!(f, "solo"),
            Self::Delegate => write!(f, "delegate"),
        }
    }
}

/// The work a cell is asked to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: String,
    pub title: String,

    #[serde(default)]
    pub body: String,

    /// Acceptance criteria the scorer checks results against
    #[serde(default)]
    pub criteria: Vec<String>,

    /// Accumulated context: clarification answers, sibling insights, parent notes
    #[serde(default)]
    pub context: Vec<String>,

    #[serde(default)]
    pub correlation: CorrelationId,
}

impl TaskDescriptor {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: String::new(),
            criteria: Vec::new(),
            context: Vec::new(),
            correlation: CorrelationId::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_criteria(mut self, criteria: Vec<String>) -> Self {
        self.criteria = criteria;
        self
    }

    /// Derive the descriptor a child cell receives for `subtask`
    pub fn for_subtask(&self, subtask: &Subtask) -> TaskDescriptor {
        let mut context = Vec::with_capacity(self.context.len() + 1);
        context.push(format!("part of: {}", self.title));
        context.extend(self.context.iter().cloned());
        TaskDescriptor {
            id: subtask.id.clone(),
            title: subtask.title.clone(),
            body: subtask.body.clone(),
            criteria: subtask.criteria.clone(),
            context,
            correlation: self.correlation,
        }
    }

    pub fn add_context(&mut self, note: impl Into<String>) {
        self.context.push(note.into());
    }
}

/// One node of a planner's decomposition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Subtask {
    pub id: String,
    pub title: String,

    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub priority: Priority,

    /// Suggested complexity; numerator of the child's allocation fraction
    #[serde(default = "default_weight")]
    pub weight: f64,

    #[serde(default)]
    pub criteria: Vec<String>,

    /// Ids of sibling subtasks that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Subtask {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: String::new(),
            priority: Priority::Normal,
            weight: default_weight(),
            criteria: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }
}
