//! Convergence detection for retry loops
//!
//! Every retry an episode considers is keyed by a [`Signature`] built from the
//! subtask id and the failure category. Once a signature has been refused it
//! stays refused for the lifetime of the detector.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable hash of `(subtask, failure category)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(u64);

impl Signature {
    pub fn new(subtask: &str, category: &str) -> Self {
        let mut hash = FNV_OFFSET;
        for byte in subtask.bytes().chain([0u8]).chain(category.bytes()) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        Self(hash)
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Attempt counter with a latching veto, scoped to one episode
#[derive(Debug, Default)]
pub struct ConvergenceDetector {
    attempts: HashMap<Signature, u32>,
    vetoed: HashSet<Signature>,
}

impl ConvergenceDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more attempt for `signature` and return the running total
    pub fn record_attempt(&mut self, signature: Signature) -> u32 {
        let count = self.attempts.entry(signature).or_insert(0);
        *count += 1;
        debug!(%signature, count = *count, "ConvergenceDetector::record_attempt: called");
        *count
    }

    pub fn attempts(&self, signature: Signature) -> u32 {
        self.attempts.get(&signature).copied().unwrap_or(0)
    }

    /// Whether another attempt is allowed; a refusal is permanent
    pub fn should_retry(&mut self, signature: Signature, max_attempts: u32) -> bool {
        if self.vetoed.contains(&signature) {
            return false;
        }
        if self.attempts(signature) < max_attempts {
            return true;
        }
        warn!(%signature, max_attempts, "Convergence veto latched");
        self.vetoed.insert(signature);
        false
    }

    pub fn is_vetoed(&self, signature: Signature) -> bool {
        self.vetoed.contains(&signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_stable_and_distinct() {
        assert_eq!(Signature::new("a", "failed"), Signature::new("a", "failed"));
        assert_ne!(Signature::new("a", "failed"), Signature::new("a", "blocked"));
        assert_ne!(Signature::new("ab", "c"), Signature::new("a", "bc"));
    }

    #[test]
    fn test_record_attempt_counts() {
        let mut detector = ConvergenceDetector::new();
        let sig = Signature::new("revenue", "clarification");
        assert_eq!(detector.record_attempt(sig), 1);
        assert_eq!(detector.record_attempt(sig), 2);
        assert_eq!(detector.attempts(sig), 2);
        assert_eq!(detector.attempts(Signature::new("costs", "clarification")), 0);
    }

    #[test]
    fn test_veto_after_max_attempts() {
        let mut detector = ConvergenceDetector::new();
        let sig = Signature::new("revenue", "clarification");
        for _ in 0..4 {
            assert!(detector.should_retry(sig, 4));
            detector.record_attempt(sig);
        }
        assert!(!detector.should_retry(sig, 4));
        assert!(detector.is_vetoed(sig));
    }

    #[test]
    fn test_veto_is_monotonic() {
        let mut detector = ConvergenceDetector::new();
        let sig = Signature::new("x", "failed");
        detector.record_attempt(sig);
        assert!(!detector.should_retry(sig, 1));
        // A larger cap later does not lift the veto
        assert!(!detector.should_retry(sig, 100));
    }

    #[test]
    fn test_should_retry_has_no_side_effect_on_counts() {
        let mut detector = ConvergenceDetector::new();
        let sig = Signature::new("x", "failed");
        assert!(detector.should_retry(sig, 3));
        assert!(detector.should_retry(sig, 3));
        assert_eq!(detector.attempts(sig), 0);
    }
}
