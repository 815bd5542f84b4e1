//! TaskCell - recursive, budget-governed task delegation kernel
//!
//! A submitted task is worked by a tree of cells. Each cell either solves its
//! task alone or decomposes it and delegates the pieces to child cells, all
//! under one strictly conserved budget.
//!
//! # Core Concepts
//!
//! - **Conserved Budget**: every unit is either spent, reserved, delegated or returned
//! - **Guaranteed Termination**: depth limits, round limits and a convergence veto
//! - **Explicit Delivery**: every send lands in a mailbox or reports why it did not
//! - **Deterministic Conflicts**: a total order decides which sibling result wins
//!
//! # Modules
//!
//! - [`budget`] - Budget ledgers and the resource governor
//! - [`bus`] - Envelopes, mailboxes and routing
//! - [`cell`] - Work cells and the arena
//! - [`protocol`] - Delegation episodes
//! - [`convergence`] - Retry signatures and veto
//! - [`collab`] - Planner, classifier, executor, scorer and audit interfaces
//! - [`kernel`] - Submission boundary
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod budget;
pub mod bus;
pub mod cell;
pub mod cli;
pub mod collab;
pub mod config;
pub mod convergence;
pub mod domain;
pub mod error;
pub mod events;
pub mod kernel;
pub mod protocol;

// Re-export commonly used types
pub use budget::{Admission, BudgetLedger, GovernorConfig, ResourceGovernor};
pub use bus::{BusConfig, Direction, Envelope, MessageBus, Payload, SendOutcome};
pub use cell::{CellArena, CellConfig, WorkCell};
pub use collab::{
    AuditRecord, AuditSink, Classifier, Collaborators, Executor, JsonlAuditSink, LoadMonitor, MemoryAuditSink,
    NullAuditSink, Planner, Scenario, Scorer, ScriptedCollaborators, StaticPressure,
};
pub use config::{AuditConfig, Config};
pub use convergence::{ConvergenceDetector, Signature};
pub use domain::{
    Budget, CellId, CellOutcome, CellResult, CellStatus, ConflictReport, Escalation, EscalationKind, Mode, Subtask,
    TaskDescriptor,
};
pub use error::{ErrorCategory, KernelError, ResourceKind};
pub use events::{EventBus, KernelEvent};
pub use kernel::Kernel;
pub use protocol::{ProtocolConfig, ValidatedPlan};
