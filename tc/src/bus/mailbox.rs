//! Priority-partitioned inbound queue

use std::collections::VecDeque;
use std::sync::Arc;

use super::envelope::Envelope;
use crate::domain::{CellId, Priority};

/// Inbound queue owned by exactly one cell
#[derive(Debug)]
pub struct Mailbox {
    owner: CellId,
    tiers: [VecDeque<Arc<Envelope>>; 4],
    received: u64,
}

impl Mailbox {
    pub fn new(owner: CellId) -> Self {
        Self {
            owner,
            tiers: Default::default(),
            received: 0,
        }
    }

    pub fn owner(&self) -> &CellId {
        &self.owner
    }

    /// Validate and enqueue; returns the backlog after the push
    pub fn push(&mut self, envelope: Arc<Envelope>) -> Result<usize, String> {
        envelope.payload().validate(envelope.direction())?;
        self.tiers[envelope.priority().tier()].push_back(envelope);
        self.received += 1;
        Ok(self.len())
    }

    /// Take everything queued: highest priority first, arrival order within a tier
    pub fn drain(&mut self) -> Vec<Arc<Envelope>> {
        let mut out = Vec::with_capacity(self.len());
        for priority in Priority::DESCENDING {
            out.extend(self.tiers[priority.tier()].drain(..));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    /// Total envelopes ever accepted
    pub fn received(&self) -> u64 {
        self.received
    }
}
