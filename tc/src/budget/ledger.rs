//! Per-cell budget accounting
//!
//! A ledger is plain data. Every mutator is crate-private; the resource
//! governor is the only caller.

use serde::Serialize;

use crate::domain::Budget;

/// Budget accounting for one cell
///
/// Invariant: `consumed + children_allocated + reserved_for_communication <= allocated`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetLedger {
    allocated: Budget,
    consumed: Budget,
    reserved_for_communication: Budget,
    communication_spent: Budget,
    children_allocated: Budget,
    reclaimed: Budget,
    surplus: Option<Budget>,

    /// Consumption level at the most recent progress report
    progress_mark: Budget,
    critical_latched: bool,
    exhausted: bool,
}

impl BudgetLedger {
    /// Open a ledger, carving the communication reserve out of `allocated`
    pub fn new(allocated: Budget, reserve_fraction: f64) -> Self {
        Self {
            allocated,
            consumed: Budget::ZERO,
            reserved_for_communication: allocated.scale(reserve_fraction),
            communication_spent: Budget::ZERO,
            children_allocated: Budget::ZERO,
            reclaimed: Budget::ZERO,
            surplus: None,
            progress_mark: Budget::ZERO,
            critical_latched: false,
            exhausted: false,
        }
    }

    pub fn allocated(&self) -> Budget {
        self.allocated
    }

    /// Own execution spend plus settled child spend
    pub fn consumed(&self) -> Budget {
        self.consumed
    }

    pub fn reserved_for_communication(&self) -> Budget {
        self.reserved_for_communication
    }

    pub fn communication_spent(&self) -> Budget {
        self.communication_spent
    }

    pub fn communication_remaining(&self) -> Budget {
        self.reserved_for_communication.saturating_sub(self.communication_spent)
    }

    /// Sum of allocations held by live children
    pub fn children_allocated(&self) -> Budget {
        self.children_allocated
    }

    /// Running total of surplus returned by settled children
    pub fn reclaimed(&self) -> Budget {
        self.reclaimed
    }

    /// Unused budget recorded when the ledger was closed
    pub fn surplus(&self) -> Option<Budget> {
        self.surplus
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Pool still free for own work or new children
    pub fn available(&self) -> Budget {
        self.allocated
            .saturating_sub(self.reserved_for_communication)
            .saturating_sub(self.consumed)
            .saturating_sub(self.children_allocated)
    }

    /// Everything this cell has actually used
    pub fn spent(&self) -> Budget {
        self.consumed.saturating_add(self.communication_spent)
    }

    pub fn unused(&self) -> Budget {
        self.allocated.saturating_sub(self.spent())
    }

    pub fn check_invariant(&self) -> bool {
        let committed = self
            .consumed
            .saturating_add(self.children_allocated)
            .saturating_add(self.reserved_for_communication);
        committed <= self.allocated && self.communication_spent <= self.reserved_for_communication
    }

    /// Share of the working pool (allocation minus reserve) already consumed
    pub fn utilization(&self) -> f64 {
        let pool = self.allocated.saturating_sub(self.reserved_for_communication);
        self.consumed.ratio_of(pool)
    }

    pub(crate) fn is_critical_latched(&self) -> bool {
        self.critical_latched
    }

    /// Whether utilization crossed `high_water` with no progress reported since
    pub(crate) fn crossed_without_progress(&self, high_water: f64) -> bool {
        let pool = self.allocated.saturating_sub(self.reserved_for_communication);
        let threshold = pool.scale(high_water);
        self.consumed >= threshold && self.progress_mark < threshold && !pool.is_zero()
    }

    pub(crate) fn latch_critical(&mut self) {
        self.critical_latched = true;
    }

    pub(crate) fn note_progress(&mut self) {
        self.progress_mark = self.consumed;
        self.critical_latched = false;
    }

    /// Book a child allocation against the available pool
    pub(crate) fn book_child(&mut self, amount: Budget) -> Result<(), Budget> {
        let available = self.available();
        if amount > available {
            return Err(available);
        }
        self.children_allocated = self.children_allocated.saturating_add(amount);
        Ok(())
    }

    /// Release a child's allocation, keeping what it spent and reclaiming the rest
    pub(crate) fn settle_child(&mut self, child_allocated: Budget, child_spent: Budget) -> Budget {
        let spent = child_spent.min(child_allocated);
        let returned = child_allocated.saturating_sub(spent);
        self.children_allocated = self.children_allocated.saturating_sub(child_allocated);
        self.consumed = self.consumed.saturating_add(spent);
        self.reclaimed = self.reclaimed.saturating_add(returned);
        returned
    }

    /// Charge own execution cost; on overrun nothing is charged and the available pool is returned
    pub(crate) fn consume(&mut self, cost: Budget) -> Result<(), Budget> {
        let available = self.available();
        if cost > available {
            return Err(available);
        }
        self.consumed = self.consumed.saturating_add(cost);
        Ok(())
    }

    /// Mark the whole available pool as consumed
    pub(crate) fn exhaust(&mut self) {
        self.consumed = self.consumed.saturating_add(self.available());
        self.exhausted = true;
    }

    /// Draw from the communication reserve
    pub(crate) fn spend_communication(&mut self, cost: Budget) -> bool {
        if cost > self.communication_remaining() {
            return false;
        }
        self.communication_spent = self.communication_spent.saturating_add(cost);
        true
    }

    /// Extend the allocation; the reserve is left as originally carved
    pub(crate) fn grow(&mut self, extra: Budget) {
        self.allocated = self.allocated.saturating_add(extra);
        self.exhausted = false;
        self.critical_latched = false;
    }

    /// Record the final surplus; returns it
    pub(crate) fn close(&mut self) -> Budget {
        let surplus = self.unused();
        self.surplus = Some(surplus);
        surplus
    }
}
