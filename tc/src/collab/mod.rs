//! Narrow interfaces to everything the kernel does not do itself
//!
//! Planning, classification, execution and scoring are pluggable. The kernel
//! only sees these traits; `scripted` provides a deterministic implementation
//! driven by a YAML scenario.

mod audit;
mod pressure;
mod scripted;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Budget, Mode, Subtask, TaskDescriptor};

pub use audit::{
    AuditRecord, AuditSink, EpisodeRecord, JsonlAuditSink, MemoryAuditSink, NullAuditSink, SlotFailure,
    SubmissionRecord, read_audit_log,
};
pub use pressure::{LoadMonitor, StaticPressure};
pub use scripted::{Scenario, ScriptedCollaborators, ScriptedStep, ScriptedTask, SimilarityEntry};

/// Errors raised by collaborator implementations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollabError {
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    #[error("Nothing scripted for {0}")]
    NotScripted(String),
}

/// What a solo cell may spend on one execution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionGrant {
    pub spendable: Budget,
    pub time_allowance: Duration,
    pub attempt: u32,
}

/// How an execution ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RawOutcome {
    Completed {
        output: String,
    },
    NeedsClarification {
        question: String,
        partial: Option<String>,
    },
    Failed {
        reason: String,
        partial: Option<String>,
    },
    Blocked {
        reason: String,
    },
}

/// Executor output before review
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    pub outcome: RawOutcome,
    pub cost: Budget,

    /// Executor's own confidence in the output
    pub confidence: f64,

    /// Findings worth sharing with siblings
    pub insights: Vec<String>,
}

/// One side of a similarity comparison
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate<'a> {
    pub task_id: &'a str,
    pub output: &'a str,
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Break a task into subtasks
    async fn decompose(&self, task: &TaskDescriptor) -> Result<Vec<Subtask>, CollabError>;

    /// Answer a child's clarification question; `None` when this level cannot
    async fn answer(&self, task: &TaskDescriptor, question: &str) -> Result<Option<String>, CollabError>;
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, task: &TaskDescriptor) -> Result<Mode, CollabError>;
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &TaskDescriptor, grant: &ExecutionGrant) -> Result<RawResult, CollabError>;
}

#[async_trait]
pub trait Scorer: Send + Sync {
    /// Score an output against the task's criteria, in `[0, 1]`
    async fn score(&self, task: &TaskDescriptor, output: &str) -> Result<f64, CollabError>;

    /// How much two outputs agree, in `[0, 1]`
    async fn similarity(&self, a: Candidate<'_>, b: Candidate<'_>) -> Result<f64, CollabError>;
}

/// The reasoning collaborators one kernel uses
#[derive(Clone)]
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub classifier: Arc<dyn Classifier>,
    pub executor: Arc<dyn Executor>,
    pub scorer: Arc<dyn Scorer>,
}

impl Collaborators {
    /// Use one scripted implementation for every role
    pub fn scripted(script: Arc<ScriptedCollaborators>) -> Self {
        Self {
            planner: script.clone(),
            classifier: script.clone(),
            executor: script.clone(),
            scorer: script,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
