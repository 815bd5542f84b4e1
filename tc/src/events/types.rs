//! Event types for kernel activity streaming
//!
//! These events represent the observable life of a submission:
//! - Cell lifecycle (started, mode chosen, finished)
//! - Mirrored progress, insight and escalation traffic
//! - Governor decisions (deferrals, critical escalations, kills)
//! - Clarifications nobody in the chain could answer
//! - Episode completion

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::Envelope;
use crate::domain::{Budget, CellId, CellStatus, Mode};

/// Kernel event vocabulary
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum KernelEvent {
    /// A cell started work
    CellStarted {
        cell_id: CellId,
        parent: Option<CellId>,
        depth: u32,
        budget: Budget,
        title: String,
    },
    /// A cell decided between solo work and delegation
    ModeChosen { cell_id: CellId, mode: Mode },
    /// A cell reached a terminal status
    CellFinished {
        cell_id: CellId,
        status: CellStatus,
        spent: Budget,
    },
    /// Copy of a progress, insight, escalate, blocked or conflict envelope
    Message { envelope: Box<Envelope> },
    /// Admission was pushed back by load pressure
    AdmissionDeferred {
        cell_id: CellId,
        retry_after_ms: u64,
        attempt: u32,
    },
    /// A cell crossed its high-water mark without progress
    BudgetCritical { cell_id: CellId, utilization: f64 },
    /// The governor killed a cell to shed load
    CellKilled { cell_id: CellId },
    /// A clarification reached the root and nobody could answer it
    ClarificationUnanswered {
        cell_id: CellId,
        subtask: String,
        question: String,
    },
    /// A delegation episode closed
    EpisodeFinished {
        cell_id: CellId,
        rounds: u32,
        accepted: usize,
        failed: usize,
        conflicts: usize,
        degraded: bool,
        timestamp: DateTime<Utc>,
    },
}

impl KernelEvent {
    /// Short name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CellStarted { .. } => "cell-started",
            Self::ModeChosen { .. } => "mode-chosen",
            Self::CellFinished { .. } => "cell-finished",
            Self::Message { .. } => "message",
            Self::AdmissionDeferred { .. } => "admission-deferred",
            Self::BudgetCritical { .. } => "budget-critical",
            Self::CellKilled { .. } => "cell-killed",
            Self::ClarificationUnanswered { .. } => "clarification-unanswered",
            Self::EpisodeFinished { .. } => "episode-finished",
        }
    }

    /// The cell this event is about
    pub fn cell_id(&self) -> &CellId {
        match self {
            Self::CellStarted { cell_id, .. }
            | Self::ModeChosen { cell_id, .. }
            | Self::CellFinished { cell_id, .. }
            | Self::AdmissionDeferred { cell_id, .. }
            | Self::BudgetCritical { cell_id, .. }
            | Self::CellKilled { cell_id }
            | Self::ClarificationUnanswered { cell_id, .. }
            | Self::EpisodeFinished { cell_id, .. } => cell_id,
            Self::Message { envelope } => envelope.sender(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = KernelEvent::ModeChosen {
            cell_id: CellId::from_string("abc123-cell-root"),
            mode: Mode::Delegate,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"mode-chosen\""));
        assert!(json.contains("\"mode\":\"delegate\""));
    }

    #[test]
    fn test_event_accessors() {
        let event = KernelEvent::CellKilled {
            cell_id: CellId::from_string("abc123-cell-leaf"),
        };
        assert_eq!(event.event_type(), "cell-killed");
        assert_eq!(event.cell_id().as_str(), "abc123-cell-leaf");
    }
}
