//! Global load signal consulted by the governor

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Reports system-wide resource pressure in `[0, 1]`
pub trait LoadMonitor: Send + Sync {
    fn current_pressure(&self) -> f64;
}

/// A load level set by hand (tests, CLI scenarios)
#[derive(Debug, Default)]
pub struct StaticPressure {
    bits: AtomicU64,
}

impl StaticPressure {
    pub fn new(pressure: f64) -> Self {
        Self {
            bits: AtomicU64::new(clamp(pressure).to_bits()),
        }
    }

    pub fn set(&self, pressure: f64) {
        debug!(pressure, "StaticPressure::set: called");
        self.bits.store(clamp(pressure).to_bits(), Ordering::SeqCst);
    }
}

impl LoadMonitor for StaticPressure {
    fn current_pressure(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

fn clamp(pressure: f64) -> f64 {
    if pressure.is_finite() { pressure.clamp(0.0, 1.0) } else { 0.0 }
}
