//! Cell lifecycle status

use serde::{Deserialize, Serialize};

/// Lifecycle status of a work cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CellStatus {
    #[default]
    Pending,
    Running,
    AwaitingChildren,
    Done,
    Failed,
    Aborted,
}

impl CellStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Aborted)
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: CellStatus) -> bool {
        use CellStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Aborted)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Aborted)
                | (Running, AwaitingChildren)
                | (AwaitingChildren, Done)
                | (AwaitingChildren, Failed)
                | (AwaitingChildren, Aborted)
        )
    }
}

impl std::fmt::Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::AwaitingChildren => write!(f, "awaiting-children"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}
