//! Resource governor configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::domain::Budget;

/// Resource governor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GovernorConfig {
    /// Share of every allocation set aside for messaging
    #[serde(default = "default_reserve_fraction")]
    pub reserve_fraction: f64,

    /// Cells at or below this budget cannot do useful work
    #[serde(default = "default_min_viable_budget")]
    pub min_viable_budget: Budget,

    /// Multiplier applied per level of parent depth when sizing children
    #[serde(default = "default_depth_discount")]
    pub depth_discount: f64,

    /// Utilization at which a cell without fresh progress escalates
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: f64,

    /// Load above which new admissions are deferred
    #[serde(default = "default_pressure_threshold")]
    pub pressure_threshold: f64,

    /// Load above which running leaf cells are killed
    #[serde(default = "default_kill_threshold")]
    pub kill_threshold: f64,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Deferrals allowed before an admission is rejected outright
    #[serde(default = "default_max_admission_attempts")]
    pub max_admission_attempts: u32,

    /// Top-up requested on a critical escalation, as a share of the original allocation
    #[serde(default = "default_topup_fraction")]
    pub topup_fraction: f64,
}

fn default_reserve_fraction() -> f64 {
    debug!("default_reserve_fraction: called");
    0.15
}

fn default_min_viable_budget() -> Budget {
    debug!("default_min_viable_budget: called");
    Budget::from_units(1.0)
}

fn default_depth_discount() -> f64 {
    debug!("default_depth_discount: called");
    0.9
}

fn default_high_water_mark() -> f64 {
    debug!("default_high_water_mark: called");
    0.9
}

fn default_pressure_threshold() -> f64 {
    debug!("default_pressure_threshold: called");
    0.85
}

fn default_kill_threshold() -> f64 {
    debug!("default_kill_threshold: called");
    0.98
}

fn default_base_backoff_ms() -> u64 {
    debug!("default_base_backoff_ms: called");
    50
}

fn default_max_backoff_ms() -> u64 {
    debug!("default_max_backoff_ms: called");
    2000
}

fn default_max_admission_attempts() -> u32 {
    debug!("default_max_admission_attempts: called");
    6
}

fn default_topup_fraction() -> f64 {
    debug!("default_topup_fraction: called");
    0.25
}

impl Default for GovernorConfig {
    fn default() -> Self {
        debug!("GovernorConfig::default: called");
        Self {
            reserve_fraction: default_reserve_fraction(),
            min_viable_budget: default_min_viable_budget(),
            depth_discount: default_depth_discount(),
            high_water_mark: default_high_water_mark(),
            pressure_threshold: default_pressure_threshold(),
            kill_threshold: default_kill_threshold(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_admission_attempts: default_max_admission_attempts(),
            topup_fraction: default_topup_fraction(),
        }
    }
}

impl GovernorConfig {
    /// Backoff before retrying a deferred admission: `base * 2^attempt`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        debug!(attempt, millis, "GovernorConfig::backoff: called");
        Duration::from_millis(millis)
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("reserve-fraction", self.reserve_fraction),
            ("depth-discount", self.depth_discount),
            ("high-water-mark", self.high_water_mark),
            ("pressure-threshold", self.pressure_threshold),
            ("kill-threshold", self.kill_threshold),
            ("topup-fraction", self.topup_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(format!("governor.{} must be in (0, 1], got {}", name, value));
            }
        }
        if self.reserve_fraction >= 1.0 {
            return Err("governor.reserve-fraction must leave budget for work".to_string());
        }
        if self.kill_threshold < self.pressure_threshold {
            return Err("governor.kill-threshold must not be below pressure-threshold".to_string());
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err("governor.base-backoff-ms exceeds max-backoff-ms".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GovernorConfig::default();
        assert_eq!(config.reserve_fraction, 0.15);
        assert_eq!(config.high_water_mark, 0.9);
        assert_eq!(config.min_viable_budget, Budget::from_units(1.0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = GovernorConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(50));
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(10), Duration::from_millis(2000));
        assert_eq!(config.backoff(200), Duration::from_millis(2000));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = GovernorConfig {
            reserve_fraction: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GovernorConfig {
            depth_discount: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let yaml = "reserve-fraction: 0.2\nmin-viable-budget: 2.5\n";
        let config: GovernorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.reserve_fraction, 0.2);
        assert_eq!(config.min_viable_budget, Budget::from_units(2.5));
        assert_eq!(config.depth_discount, 0.9);
    }
}
