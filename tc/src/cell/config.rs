//! Work cell configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::domain::Budget;

/// Work cell configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CellConfig {
    /// Cells at this depth always work solo
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Below this (after the communication reserve) a cell works solo
    #[serde(default = "default_min_delegation_budget")]
    pub min_delegation_budget: Budget,

    /// Wall-clock milliseconds one budget unit buys
    #[serde(default = "default_millis_per_unit")]
    pub millis_per_unit: u64,

    /// Clarification round trips a solo cell makes before giving up
    #[serde(default = "default_max_clarifications")]
    pub max_clarifications: u32,
}

fn default_max_depth() -> u32 {
    debug!("default_max_depth: called");
    4
}

fn default_min_delegation_budget() -> Budget {
    debug!("default_min_delegation_budget: called");
    Budget::from_units(5.0)
}

fn default_millis_per_unit() -> u64 {
    debug!("default_millis_per_unit: called");
    1000
}

fn default_max_clarifications() -> u32 {
    debug!("default_max_clarifications: called");
    8
}

impl Default for CellConfig {
    fn default() -> Self {
        debug!("CellConfig::default: called");
        Self {
            max_depth: default_max_depth(),
            min_delegation_budget: default_min_delegation_budget(),
            millis_per_unit: default_millis_per_unit(),
            max_clarifications: default_max_clarifications(),
        }
    }
}

impl CellConfig {
    /// Wall-clock allowance bought by `budget`
    pub fn time_allowance(&self, budget: Budget) -> Duration {
        Duration::from_millis(budget.millis().saturating_mul(self.millis_per_unit) / Budget::SCALE)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.millis_per_unit == 0 {
            return Err("cell.millis-per-unit must be positive".to_string());
        }
        Ok(())
    }
}
