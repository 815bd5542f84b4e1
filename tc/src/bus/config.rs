//! Message bus configuration

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::Budget;

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BusConfig {
    /// Charged to the sender per recipient
    pub message_cost: Budget,

    /// Max sends per second per cell (rate limiting)
    pub rate_limit_per_sec: usize,

    /// Backlog above which sends report `Queued`
    pub mailbox_high_water: usize,

    /// Capacity of the observability event channel
    pub event_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        debug!("BusConfig::default: called");
        Self {
            message_cost: Budget::from_units(0.05),
            rate_limit_per_sec: 200,
            mailbox_high_water: 256,
            event_capacity: 1024,
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.rate_limit_per_sec == 0 {
            return Err("bus.rate-limit-per-sec must be positive".to_string());
        }
        if self.mailbox_high_water == 0 {
            return Err("bus.mailbox-high-water must be positive".to_string());
        }
        if self.event_capacity == 0 {
            return Err("bus.event-capacity must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();
        assert_eq!(config.message_cost, Budget::from_millis(50));
        assert_eq!(config.rate_limit_per_sec, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_kebab_keys() {
        let yaml = "message-cost: 0\nmailbox-high-water: 4\n";
        let config: BusConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.message_cost, Budget::ZERO);
        assert_eq!(config.mailbox_high_water, 4);
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_zero_rate_limit_invalid() {
        let config = BusConfig {
            rate_limit_per_sec: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
