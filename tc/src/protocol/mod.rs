//! Delegation protocol
//!
//! A delegating cell decomposes its task into a validated plan, spawns one
//! child per ready subtask, reviews what comes back, re-delegates retryable
//! failures until the convergence detector vetoes them, resolves conflicts
//! between accepted siblings and synthesizes the survivors.

mod config;
mod conflict;
mod core;
mod episode;
mod plan;

pub use config::ProtocolConfig;
pub use conflict::{Contender, Verdict, resolve, resolved_report, unresolved_report};
pub(crate) use core::run_episode;
pub use episode::{Contribution, Episode, EpisodeSummary, FailureKind, RunningChild, Slot, SlotState};
pub use plan::ValidatedPlan;
