//! ResourceGovernor - admission, allocation, reclamation and escalation
//!
//! The governor owns every ledger in the tree. Cells never touch ledgers
//! directly; each mutation goes through one of the methods here while the
//! internal lock is held, so parent and child books always move together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::GovernorConfig;
use super::ledger::BudgetLedger;
use crate::bus::{CommunicationMeter, Direction};
use crate::collab::LoadMonitor;
use crate::domain::{Budget, CellId};
use crate::error::{KernelError, ResourceKind};

/// Answer to an admission request
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Ledger opened and booked against the parent
    Admitted,
    /// Load is too high; ask again after `retry_after`
    Deferred { retry_after: Duration, attempt: u32 },
    /// Admission would break an invariant or load never eased
    Rejected(String),
}

/// Sizing of a prospective child allocation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildBudget {
    pub amount: Budget,
    pub fraction: f64,
    pub discount: f64,
    pub depth: u32,
}

/// What the governor suggests doing about a critical cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Recommendation {
    RequestTopup(Budget),
    ForceSynthesis,
}

/// Emitted once when a cell burns past the high-water mark without progress
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationSignal {
    pub unit: CellId,
    pub utilization: f64,
    pub consumed: Budget,
    pub allocated: Budget,
    pub recommendation: Recommendation,
}

/// Governor counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GovernorStats {
    pub admitted: u64,
    pub deferred: u64,
    pub rejected: u64,
    pub reclaimed: Budget,
    pub escalations: u64,
    pub topups: u64,
    pub kills: u64,
}

struct Account {
    ledger: BudgetLedger,
    parent: Option<CellId>,
    depth: u32,
    cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct GovernorInner {
    accounts: HashMap<CellId, Account>,
    stats: GovernorStats,
}

/// Sole mutator of budget ledgers
pub struct ResourceGovernor {
    config: GovernorConfig,
    load: Arc<dyn LoadMonitor>,
    inner: Mutex<GovernorInner>,
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig, load: Arc<dyn LoadMonitor>) -> Self {
        debug!(?config, "ResourceGovernor::new: called");
        Self {
            config,
            load,
            inner: Mutex::new(GovernorInner::default()),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Admit a parentless cell with the whole submission budget
    pub fn open_root(&self, unit: &CellId, total: Budget, attempt: u32) -> Admission {
        debug!(%unit, %total, attempt, "ResourceGovernor::open_root: called");
        self.admit(unit, None, total, attempt)
    }

    /// Admit `unit` with `requested` budget drawn from `parent`
    ///
    /// Invariant violations are rejected outright; load pressure defers with
    /// exponential backoff until `max_admission_attempts` is reached.
    pub fn admit(&self, unit: &CellId, parent: Option<&CellId>, requested: Budget, attempt: u32) -> Admission {
        debug!(%unit, ?parent, %requested, attempt, "ResourceGovernor::admit: called");
        let mut inner = self.inner.lock();

        if inner.accounts.contains_key(unit) {
            inner.stats.rejected += 1;
            return Admission::Rejected(format!("{} already holds a ledger", unit));
        }

        let depth = match parent {
            Some(parent_id) => match inner.accounts.get(parent_id) {
                Some(account) => {
                    let available = account.ledger.available();
                    if requested > available {
                        inner.stats.rejected += 1;
                        warn!(%unit, %requested, %available, "ResourceGovernor::admit: exceeds parent pool");
                        return Admission::Rejected(format!(
                            "requested {} exceeds available {} of parent {}",
                            requested, available, parent_id
                        ));
                    }
                    account.depth + 1
                }
                None => {
                    inner.stats.rejected += 1;
                    return Admission::Rejected(format!("parent {} holds no ledger", parent_id));
                }
            },
            None => 0,
        };

        let pressure = self.load.current_pressure();
        if pressure > self.config.pressure_threshold {
            if attempt + 1 >= self.config.max_admission_attempts {
                inner.stats.rejected += 1;
                warn!(%unit, pressure, attempt, "ResourceGovernor::admit: pressure persisted, rejecting");
                return Admission::Rejected(format!(
                    "load pressure {:.2} above {:.2} after {} attempts",
                    pressure,
                    self.config.pressure_threshold,
                    attempt + 1
                ));
            }
            inner.stats.deferred += 1;
            let jitter = rand::rng().random_range(0..=self.config.base_backoff_ms / 2);
            let retry_after = self.config.backoff(attempt) + Duration::from_millis(jitter);
            debug!(%unit, pressure, ?retry_after, "ResourceGovernor::admit: deferred");
            return Admission::Deferred {
                retry_after,
                attempt: attempt + 1,
            };
        }

        if let Some(parent_id) = parent
            && let Some(account) = inner.accounts.get_mut(parent_id)
            && let Err(available) = account.ledger.book_child(requested)
        {
            inner.stats.rejected += 1;
            return Admission::Rejected(format!("requested {} exceeds available {}", requested, available));
        }

        inner.accounts.insert(
            unit.clone(),
            Account {
                ledger: BudgetLedger::new(requested, self.config.reserve_fraction),
                parent: parent.cloned(),
                depth,
                cancel: None,
            },
        );
        inner.stats.admitted += 1;
        info!(%unit, %requested, depth, "Admitted cell");
        Admission::Admitted
    }

    /// Size a child allocation as `fraction` of the parent's available pool, depth-discounted
    pub fn allocate_child_budget(&self, parent: &CellId, fraction: f64) -> Result<ChildBudget, KernelError> {
        debug!(%parent, fraction, "ResourceGovernor::allocate_child_budget: called");
        let inner = self.inner.lock();
        let account = inner
            .accounts
            .get(parent)
            .ok_or_else(|| KernelError::UnknownUnit(parent.clone()))?;

        let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
        let discount = self.config.depth_discount.powi(account.depth as i32);
        let amount = account.ledger.available().scale(fraction).scale(discount);
        Ok(ChildBudget {
            amount,
            fraction,
            discount,
            depth: account.depth + 1,
        })
    }

    /// Charge own execution cost. An overrun exhausts the ledger and is reported, never clamped.
    pub fn charge(&self, unit: &CellId, cost: Budget) -> Result<Budget, KernelError> {
        debug!(%unit, %cost, "ResourceGovernor::charge: called");
        let mut inner = self.inner.lock();
        let account = inner
            .accounts
            .get_mut(unit)
            .ok_or_else(|| KernelError::UnknownUnit(unit.clone()))?;

        match account.ledger.consume(cost) {
            Ok(()) => Ok(account.ledger.available()),
            Err(available) => {
                account.ledger.exhaust();
                warn!(%unit, %cost, %available, "ResourceGovernor::charge: overrun");
                Err(KernelError::BudgetExhausted {
                    unit: unit.clone(),
                    resource: ResourceKind::Compute,
                    requested: cost,
                    available,
                })
            }
        }
    }

    /// Mark a cell's whole pool consumed (time allowance ran out)
    pub fn exhaust(&self, unit: &CellId) {
        debug!(%unit, "ResourceGovernor::exhaust: called");
        if let Some(account) = self.inner.lock().accounts.get_mut(unit) {
            account.ledger.exhaust();
        }
    }

    /// Draw messaging cost from the sender's reserve; upward traffic passes free once it runs dry
    pub fn meter_communication(&self, unit: &CellId, cost: Budget, direction: Direction) -> Result<(), KernelError> {
        debug!(%unit, %cost, ?direction, "ResourceGovernor::meter_communication: called");
        if cost.is_zero() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let account = inner
            .accounts
            .get_mut(unit)
            .ok_or_else(|| KernelError::UnknownUnit(unit.clone()))?;

        if account.ledger.spend_communication(cost) || direction == Direction::Upward {
            return Ok(());
        }
        Err(KernelError::BudgetExhausted {
            unit: unit.clone(),
            resource: ResourceKind::Communication,
            requested: cost,
            available: account.ledger.communication_remaining(),
        })
    }

    /// Settle `child` (and any live descendants, deepest first) into its parent
    ///
    /// Returns the child's unused budget. The parent keeps what the child spent
    /// and gets the rest back in its available pool.
    pub fn reclaim_surplus(&self, child: &CellId) -> Result<Budget, KernelError> {
        debug!(%child, "ResourceGovernor::reclaim_surplus: called");
        let mut inner = self.inner.lock();
        if !inner.accounts.contains_key(child) {
            return Err(KernelError::UnknownUnit(child.clone()));
        }
        let surplus = settle(&mut inner.accounts, child);
        inner.stats.reclaimed = inner.stats.reclaimed.saturating_add(surplus);
        info!(%child, %surplus, "Reclaimed surplus");
        Ok(surplus)
    }

    /// Fire once per high-water crossing that happens without intervening progress
    pub fn escalate_if_critical(&self, unit: &CellId) -> Option<EscalationSignal> {
        debug!(%unit, "ResourceGovernor::escalate_if_critical: called");
        let mut inner = self.inner.lock();

        let (parent, topup, utilization, consumed, allocated) = {
            let account = inner.accounts.get(unit)?;
            if account.ledger.is_critical_latched()
                || !account.ledger.crossed_without_progress(self.config.high_water_mark)
            {
                return None;
            }
            (
                account.parent.clone(),
                account.ledger.allocated().scale(self.config.topup_fraction),
                account.ledger.utilization(),
                account.ledger.consumed(),
                account.ledger.allocated(),
            )
        };

        let parent_can_cover = parent
            .as_ref()
            .and_then(|p| inner.accounts.get(p))
            .is_some_and(|p| !topup.is_zero() && p.ledger.available() >= topup);
        let recommendation = if parent_can_cover {
            Recommendation::RequestTopup(topup)
        } else {
            Recommendation::ForceSynthesis
        };

        if let Some(account) = inner.accounts.get_mut(unit) {
            account.ledger.latch_critical();
        }
        inner.stats.escalations += 1;
        warn!(%unit, utilization, ?recommendation, "Cell crossed high-water mark without progress");
        Some(EscalationSignal {
            unit: unit.clone(),
            utilization,
            consumed,
            allocated,
            recommendation,
        })
    }

    pub fn note_progress(&self, unit: &CellId) {
        debug!(%unit, "ResourceGovernor::note_progress: called");
        if let Some(account) = self.inner.lock().accounts.get_mut(unit) {
            account.ledger.note_progress();
        }
    }

    /// Grow `unit`'s allocation by `amount` taken from its parent's available pool
    pub fn request_topup(&self, unit: &CellId, amount: Budget) -> Result<Budget, KernelError> {
        debug!(%unit, %amount, "ResourceGovernor::request_topup: called");
        let mut inner = self.inner.lock();
        let parent = inner
            .accounts
            .get(unit)
            .ok_or_else(|| KernelError::UnknownUnit(unit.clone()))?
            .parent
            .clone();

        let Some(parent) = parent else {
            return Err(KernelError::BudgetExhausted {
                unit: unit.clone(),
                resource: ResourceKind::Compute,
                requested: amount,
                available: Budget::ZERO,
            });
        };

        let parent_account = inner
            .accounts
            .get_mut(&parent)
            .ok_or_else(|| KernelError::UnknownUnit(parent.clone()))?;
        if let Err(available) = parent_account.ledger.book_child(amount) {
            return Err(KernelError::BudgetExhausted {
                unit: parent,
                resource: ResourceKind::Compute,
                requested: amount,
                available,
            });
        }

        let account = inner
            .accounts
            .get_mut(unit)
            .ok_or_else(|| KernelError::UnknownUnit(unit.clone()))?;
        account.ledger.grow(amount);
        let allocated = account.ledger.allocated();
        inner.stats.topups += 1;
        info!(%unit, %amount, %allocated, "Topped up cell");
        Ok(allocated)
    }

    /// Register the token a governor-triggered kill cancels
    pub fn bind_cancellation(&self, unit: &CellId, token: CancellationToken) {
        debug!(%unit, "ResourceGovernor::bind_cancellation: called");
        if let Some(account) = self.inner.lock().accounts.get_mut(unit) {
            account.cancel = Some(token);
        }
    }

    /// Cancel a cell's token; returns false if it has none bound
    pub fn kill(&self, unit: &CellId) -> bool {
        debug!(%unit, "ResourceGovernor::kill: called");
        let mut inner = self.inner.lock();
        let Some(token) = inner.accounts.get(unit).and_then(|a| a.cancel.clone()) else {
            return false;
        };
        if token.is_cancelled() {
            return false;
        }
        token.cancel();
        inner.stats.kills += 1;
        warn!(%unit, "Killed cell under resource pressure");
        true
    }

    /// Kill the deepest live leaf while load is above `kill_threshold`
    ///
    /// Roots are never chosen. Returns the cells killed by this call.
    pub fn relieve_pressure(&self) -> Vec<CellId> {
        let pressure = self.load.current_pressure();
        if pressure <= self.config.kill_threshold {
            return Vec::new();
        }
        debug!(pressure, "ResourceGovernor::relieve_pressure: called");

        let victim = {
            let inner = self.inner.lock();
            let mut leaves: Vec<(&CellId, &Account)> = inner
                .accounts
                .iter()
                .filter(|(id, a)| {
                    a.depth > 0
                        && a.cancel.as_ref().is_some_and(|t| !t.is_cancelled())
                        && !inner.accounts.values().any(|other| other.parent.as_ref() == Some(*id))
                })
                .collect();
            leaves.sort_by(|(a_id, a), (b_id, b)| b.depth.cmp(&a.depth).then_with(|| a_id.cmp(b_id)));
            leaves.first().map(|(id, _)| (*id).clone())
        };

        match victim {
            Some(unit) if self.kill(&unit) => vec![unit],
            _ => Vec::new(),
        }
    }

    pub fn snapshot(&self, unit: &CellId) -> Option<BudgetLedger> {
        self.inner.lock().accounts.get(unit).map(|a| a.ledger.clone())
    }

    pub fn depth(&self, unit: &CellId) -> Option<u32> {
        self.inner.lock().accounts.get(unit).map(|a| a.depth)
    }

    pub fn live_units(&self) -> usize {
        self.inner.lock().accounts.len()
    }

    pub fn check_all_invariants(&self) -> bool {
        self.inner.lock().accounts.values().all(|a| a.ledger.check_invariant())
    }

    pub fn stats(&self) -> GovernorStats {
        self.inner.lock().stats.clone()
    }
}

impl CommunicationMeter for ResourceGovernor {
    fn meter(&self, unit: &CellId, cost: Budget, direction: Direction) -> Result<(), KernelError> {
        self.meter_communication(unit, cost, direction)
    }
}

/// Depth-first settlement of `unit` and its live descendants
fn settle(accounts: &mut HashMap<CellId, Account>, unit: &CellId) -> Budget {
    let children: Vec<CellId> = accounts
        .iter()
        .filter(|(_, a)| a.parent.as_ref() == Some(unit))
        .map(|(id, _)| id.clone())
        .collect();
    for child in &children {
        settle(accounts, child);
    }

    let Some(mut account) = accounts.remove(unit) else {
        return Budget::ZERO;
    };
    let surplus = account.ledger.close();
    if let Some(parent) = account.parent.as_ref().and_then(|p| accounts.get_mut(p)) {
        parent.ledger.settle_child(account.ledger.allocated(), account.ledger.spent());
    }
    surplus
}
