//! Kernel error taxonomy

use thiserror::Error;

use crate::domain::{Budget, CellId, CellStatus};

/// Which budget dimension ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Compute,
    Time,
    Communication,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compute => write!(f, "compute"),
            Self::Time => write!(f, "time"),
            Self::Communication => write!(f, "communication"),
        }
    }
}

/// Coarse grouping used when deciding how far an error travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Resource,
    Input,
    External,
    Processing,
    Internal,
}

/// Errors raised by the kernel
#[derive(Debug, Clone, Error, PartialEq)]
pub enum KernelError {
    #[error("{resource} budget exhausted for {unit}: requested {requested}, available {available}")]
    BudgetExhausted {
        unit: CellId,
        resource: ResourceKind,
        requested: Budget,
        available: Budget,
    },

    #[error("Plan invalid: {0}")]
    PlanInvalid(String),

    #[error("Child {unit} unresponsive, aborted after {waited_ms}ms")]
    ChildUnresponsive { unit: CellId, waited_ms: u64 },

    #[error("Conflict between {left} and {right} unresolved: {reason}")]
    ConflictUnresolved { left: CellId, right: CellId, reason: String },

    #[error("Convergence exhausted for subtask {subtask} ({category}) after {attempts} attempts")]
    ConvergenceExhausted {
        subtask: String,
        category: String,
        attempts: u32,
    },

    #[error("All {count} children failed")]
    AllChildrenFailed { count: usize },

    #[error("Cell {unit} aborted: {reason}")]
    Aborted { unit: CellId, reason: String },

    #[error("Invalid status transition for {unit}: {from} -> {to}")]
    InvalidTransition { unit: CellId, from: CellStatus, to: CellStatus },

    #[error("Unknown cell {0}")]
    UnknownUnit(CellId),

    #[error("Admission rejected for {unit}: {reason}")]
    AdmissionRejected { unit: CellId, reason: String },

    #[error("{collaborator} failed: {message}")]
    Collaborator { collaborator: &'static str, message: String },
}

impl KernelError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BudgetExhausted { .. } | Self::AdmissionRejected { .. } => ErrorCategory::Resource,
            Self::PlanInvalid(_) => ErrorCategory::Input,
            Self::Collaborator { .. } | Self::ChildUnresponsive { .. } => ErrorCategory::External,
            Self::ConflictUnresolved { .. }
            | Self::ConvergenceExhausted { .. }
            | Self::AllChildrenFailed { .. }
            | Self::Aborted { .. } => ErrorCategory::Processing,
            Self::InvalidTransition { .. } | Self::UnknownUnit(_) => ErrorCategory::Internal,
        }
    }

    /// Fatal errors end the whole active chain instead of travelling one hop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PlanInvalid(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    pub fn aborted(unit: &CellId, reason: impl Into<String>) -> Self {
        Self::Aborted {
            unit: unit.clone(),
            reason: reason.into(),
        }
    }

    pub fn collaborator(collaborator: &'static str, error: impl std::fmt::Display) -> Self {
        Self::Collaborator {
            collaborator,
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_plan_invalid_is_fatal() {
        assert!(KernelError::PlanInvalid("cycle".into()).is_fatal());
        assert!(!KernelError::AllChildrenFailed { count: 3 }.is_fatal());
        assert!(!KernelError::aborted(&CellId::from_string("x"), "parent").is_fatal());
    }

    #[test]
    fn test_categories() {
        let exhausted = KernelError::BudgetExhausted {
            unit: CellId::from_string("x"),
            resource: ResourceKind::Compute,
            requested: Budget::from_units(2.0),
            available: Budget::from_units(1.0),
        };
        assert_eq!(exhausted.category(), ErrorCategory::Resource);
        assert_eq!(KernelError::PlanInvalid("x".into()).category(), ErrorCategory::Input);
        assert_eq!(
            KernelError::UnknownUnit(CellId::from_string("x")).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_display_includes_amounts() {
        let err = KernelError::BudgetExhausted {
            unit: CellId::from_string("abc123-cell-x"),
            resource: ResourceKind::Time,
            requested: Budget::from_units(2.5),
            available: Budget::from_millis(500),
        };
        assert_eq!(
            err.to_string(),
            "time budget exhausted for abc123-cell-x: requested 2.500, available 0.500"
        );
    }
}
