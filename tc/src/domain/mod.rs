//! Domain types shared by every kernel component

mod budget;
mod id;
mod outcome;
mod priority;
mod status;
mod task;

pub use budget::Budget;
pub use id::{CellId, CorrelationId, EnvelopeId, PeerGroupId, generate_id, slugify};
pub use outcome::{CellOutcome, CellResult, ConflictReport, Escalation, EscalationKind, PartialResult, Resolution, TieBreak};
pub use priority::Priority;
pub use status::CellStatus;
pub use task::{Mode, Subtask, TaskDescriptor};
