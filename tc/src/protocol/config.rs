//! Delegation protocol configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::domain::Budget;

/// Delegation protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProtocolConfig {
    /// Spawn/collect/review rounds one episode may run
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Attempts per failure signature before the convergence veto
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Re-delegations allowed per subtask
    #[serde(default = "default_max_redelegations")]
    pub max_redelegations: u32,

    /// Minimum review score for a child result to be accepted
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f64,

    /// Similarity below which two accepted results conflict
    #[serde(default = "default_conflict_threshold")]
    pub conflict_threshold: f64,

    /// Confidence multiplier for degraded syntheses
    #[serde(default = "default_degraded_penalty")]
    pub degraded_penalty: f64,

    /// How long an aborted child gets to stop before its task is torn down
    #[serde(default = "default_abort_grace_ms")]
    pub abort_grace_ms: u64,

    /// Interval of deadline, pressure and budget checks while children run
    #[serde(default = "default_supervision_tick_ms")]
    pub supervision_tick_ms: u64,

    #[serde(default)]
    pub plan_cost: Budget,

    #[serde(default)]
    pub review_cost: Budget,

    #[serde(default)]
    pub synthesis_cost: Budget,
}

fn default_max_rounds() -> u32 {
    debug!("default_max_rounds: called");
    3
}

fn default_max_attempts() -> u32 {
    debug!("default_max_attempts: called");
    4
}

fn default_max_redelegations() -> u32 {
    debug!("default_max_redelegations: called");
    1
}

fn default_acceptance_threshold() -> f64 {
    debug!("default_acceptance_threshold: called");
    0.6
}

fn default_conflict_threshold() -> f64 {
    debug!("default_conflict_threshold: called");
    0.5
}

fn default_degraded_penalty() -> f64 {
    debug!("default_degraded_penalty: called");
    0.5
}

fn default_abort_grace_ms() -> u64 {
    debug!("default_abort_grace_ms: called");
    250
}

fn default_supervision_tick_ms() -> u64 {
    debug!("default_supervision_tick_ms: called");
    100
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        debug!("ProtocolConfig::default: called");
        Self {
            max_rounds: default_max_rounds(),
            max_attempts: default_max_attempts(),
            max_redelegations: default_max_redelegations(),
            acceptance_threshold: default_acceptance_threshold(),
            conflict_threshold: default_conflict_threshold(),
            degraded_penalty: default_degraded_penalty(),
            abort_grace_ms: default_abort_grace_ms(),
            supervision_tick_ms: default_supervision_tick_ms(),
            plan_cost: Budget::ZERO,
            review_cost: Budget::ZERO,
            synthesis_cost: Budget::ZERO,
        }
    }
}

impl ProtocolConfig {
    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    pub fn supervision_tick(&self) -> Duration {
        Duration::from_millis(self.supervision_tick_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_rounds == 0 {
            return Err("protocol.max-rounds must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            return Err("protocol.max-attempts must be at least 1".to_string());
        }
        for (name, value) in [
            ("acceptance-threshold", self.acceptance_threshold),
            ("conflict-threshold", self.conflict_threshold),
            ("degraded-penalty", self.degraded_penalty),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(format!("protocol.{} must be in (0, 1], got {}", name, value));
            }
        }
        if self.supervision_tick_ms == 0 {
            return Err("protocol.supervision-tick-ms must be positive".to_string());
        }
        Ok(())
    }
}
