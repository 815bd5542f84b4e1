//! What cells hand back to their parents: results, escalations and conflict reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::budget::Budget;
use super::id::CellId;
use super::task::Mode;

/// Best-so-far output kept while a child is still working or after it gave up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub source: CellId,
    pub output: String,
    pub confidence: f64,
}

/// Why a cell escalated instead of returning a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EscalationKind {
    ExecutionFailed,
    Blocked,
    ChildFailed,
    ChildUnresponsive,
    AllChildrenFailed,
    BudgetCritical,
    ConvergenceExhausted,
    ConflictUnresolved,
    ClarificationUnanswered,
}

impl std::fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExecutionFailed => "execution-failed",
            Self::Blocked => "blocked",
            Self::ChildFailed => "child-failed",
            Self::ChildUnresponsive => "child-unresponsive",
            Self::AllChildrenFailed => "all-children-failed",
            Self::BudgetCritical => "budget-critical",
            Self::ConvergenceExhausted => "convergence-exhausted",
            Self::ConflictUnresolved => "conflict-unresolved",
            Self::ClarificationUnanswered => "clarification-unanswered",
        };
        write!(f, "{}", s)
    }
}

/// An upward-travelling failure notice; also the unit of the escalation trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub origin: CellId,
    pub task_id: String,
    pub kind: EscalationKind,
    pub reason: String,
    pub partial: Option<PartialResult>,
    pub raised_at: DateTime<Utc>,
}

impl Escalation {
    pub fn new(origin: CellId, task_id: impl Into<String>, kind: EscalationKind, reason: impl Into<String>) -> Self {
        Self {
            origin,
            task_id: task_id.into(),
            kind,
            reason: reason.into(),
            partial: None,
            raised_at: Utc::now(),
        }
    }

    pub fn with_partial(mut self, partial: Option<PartialResult>) -> Self {
        self.partial = partial;
        self
    }
}

/// A finished unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellResult {
    pub cell_id: CellId,
    pub task_id: String,
    pub mode: Mode,
    pub output: String,
    pub confidence: f64,

    /// Set when any part was synthesized from partials or dropped
    pub degraded: bool,

    /// Budget spent by this cell and everything below it
    pub consumed: Budget,

    #[serde(default)]
    pub conflicts: Vec<ConflictReport>,

    #[serde(default)]
    pub trail: Vec<Escalation>,

    /// Delegation rounds run (zero for solo work)
    #[serde(default)]
    pub rounds: u32,
}

/// Terminal hand-back of `WorkCell::process`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum CellOutcome {
    Result(CellResult),
    Escalation(Escalation),
}

impl CellOutcome {
    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    pub fn result(&self) -> Option<&CellResult> {
        match self {
            Self::Result(r) => Some(r),
            Self::Escalation(_) => None,
        }
    }

    pub fn escalation(&self) -> Option<&Escalation> {
        match self {
            Self::Result(_) => None,
            Self::Escalation(e) => Some(e),
        }
    }
}

/// Rule that decided a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    HigherScore,
    ShallowerDepth,
    EarlierSpawn,
    LowerId,
}

impl std::fmt::Display for TieBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HigherScore => write!(f, "higher score"),
            Self::ShallowerDepth => write!(f, "shallower depth"),
            Self::EarlierSpawn => write!(f, "earlier spawn"),
            Self::LowerId => write!(f, "lower id"),
        }
    }
}

/// How a conflict ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Resolution {
    Resolved {
        winner: CellId,
        loser: CellId,
        winner_score: f64,
        loser_score: f64,
        rule: TieBreak,
        rationale: String,
    },
    Unresolved {
        reason: String,
    },
}

/// Record of two accepted results that disagree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub id: Uuid,

    /// Cell whose episode detected the conflict
    pub detected_by: CellId,
    pub disputants: [CellId; 2],
    pub subtasks: [String; 2],

    /// Measured similarity, absent when the similarity check itself failed
    pub similarity: Option<f64>,
    pub threshold: f64,
    pub resolution: Resolution,

    /// Output of the overruled result, retained verbatim
    pub losing_output: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ConflictReport {
    pub fn is_resolved(&self) -> bool {
        matches!(self.resolution, Resolution::Resolved { .. })
    }

    pub fn winner(&self) -> Option<&CellId> {
        match &self.resolution {
            Resolution::Resolved { winner, .. } => Some(winner),
            Resolution::Unresolved { .. } => None,
        }
    }
}
