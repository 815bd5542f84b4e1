//! Budget accounting and the resource governor

mod config;
mod governor;
mod ledger;

pub use config::GovernorConfig;
pub use governor::{Admission, ChildBudget, EscalationSignal, GovernorStats, Recommendation, ResourceGovernor};
pub use ledger::BudgetLedger;
