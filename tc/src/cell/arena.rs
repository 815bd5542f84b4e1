//! Flat registry of live cells
//!
//! Parent, child and peer relations are stored as ids and resolved here; no
//! cell holds a pointer to another.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{Budget, CellId, CellStatus, PeerGroupId};
use crate::error::KernelError;

/// What the arena knows about one cell
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CellRecord {
    pub id: CellId,
    pub parent: Option<CellId>,
    pub depth: u32,
    pub budget: Budget,
    pub status: CellStatus,
    pub group: Option<PeerGroupId>,

    /// Arena-wide creation order; unique
    pub spawn_seq: u64,
    pub task_id: String,
}

#[derive(Default)]
struct ArenaInner {
    cells: HashMap<CellId, CellRecord>,
    next_seq: u64,
}

/// Arena of cell records indexed by id
#[derive(Default)]
pub struct CellArena {
    inner: Mutex<ArenaInner>,
}

impl CellArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_root(&self, id: &CellId, task_id: &str, budget: Budget) -> Result<CellRecord, KernelError> {
        debug!(%id, %task_id, %budget, "CellArena::insert_root: called");
        self.insert(id, None, 0, task_id, budget, None)
    }

    pub fn insert_child(
        &self,
        id: &CellId,
        parent: &CellId,
        task_id: &str,
        budget: Budget,
        group: PeerGroupId,
    ) -> Result<CellRecord, KernelError> {
        debug!(%id, %parent, %task_id, %budget, "CellArena::insert_child: called");
        let depth = self
            .inner
            .lock()
            .cells
            .get(parent)
            .map(|p| p.depth + 1)
            .ok_or_else(|| KernelError::UnknownUnit(parent.clone()))?;
        self.insert(id, Some(parent.clone()), depth, task_id, budget, Some(group))
    }

    fn insert(
        &self,
        id: &CellId,
        parent: Option<CellId>,
        depth: u32,
        task_id: &str,
        budget: Budget,
        group: Option<PeerGroupId>,
    ) -> Result<CellRecord, KernelError> {
        let mut inner = self.inner.lock();
        if inner.cells.contains_key(id) {
            return Err(KernelError::AdmissionRejected {
                unit: id.clone(),
                reason: "id already present in arena".to_string(),
            });
        }
        let record = CellRecord {
            id: id.clone(),
            parent,
            depth,
            budget,
            status: CellStatus::Pending,
            group,
            spawn_seq: inner.next_seq,
            task_id: task_id.to_string(),
        };
        inner.next_seq += 1;
        inner.cells.insert(id.clone(), record.clone());
        Ok(record)
    }

    /// Move `id` to `next`, enforcing the lifecycle state machine; returns the previous status
    pub fn transition(&self, id: &CellId, next: CellStatus) -> Result<CellStatus, KernelError> {
        let mut inner = self.inner.lock();
        let record = inner.cells.get_mut(id).ok_or_else(|| KernelError::UnknownUnit(id.clone()))?;
        let from = record.status;
        if !from.can_transition_to(next) {
            warn!(%id, %from, to = %next, "Rejected status transition");
            return Err(KernelError::InvalidTransition {
                unit: id.clone(),
                from,
                to: next,
            });
        }
        record.status = next;
        debug!(%id, %from, to = %next, "CellArena::transition: applied");
        Ok(from)
    }

    pub fn get(&self, id: &CellId) -> Option<CellRecord> {
        self.inner.lock().cells.get(id).cloned()
    }

    pub fn status(&self, id: &CellId) -> Option<CellStatus> {
        self.inner.lock().cells.get(id).map(|r| r.status)
    }

    /// Direct children of `id`, in spawn order
    pub fn children(&self, id: &CellId) -> Vec<CellRecord> {
        let inner = self.inner.lock();
        let mut children: Vec<CellRecord> = inner
            .cells
            .values()
            .filter(|r| r.parent.as_ref() == Some(id))
            .cloned()
            .collect();
        children.sort_by_key(|r| r.spawn_seq);
        children
    }

    /// Other members of `id`'s peer group, in spawn order
    pub fn peers(&self, id: &CellId) -> Vec<CellRecord> {
        let inner = self.inner.lock();
        let Some(group) = inner.cells.get(id).and_then(|r| r.group) else {
            return Vec::new();
        };
        let mut peers: Vec<CellRecord> = inner
            .cells
            .values()
            .filter(|r| r.group == Some(group) && &r.id != id)
            .cloned()
            .collect();
        peers.sort_by_key(|r| r.spawn_seq);
        peers
    }

    pub fn remove(&self, id: &CellId) -> Option<CellRecord> {
        debug!(%id, "CellArena::remove: called");
        self.inner.lock().cells.remove(id)
    }

    /// Remove `id` and every descendant; returns how many records went
    pub fn remove_subtree(&self, id: &CellId) -> usize {
        debug!(%id, "CellArena::remove_subtree: called");
        let mut inner = self.inner.lock();
        let mut stack = vec![id.clone()];
        let mut removed = 0;
        while let Some(current) = stack.pop() {
            stack.extend(
                inner
                    .cells
                    .values()
                    .filter(|r| r.parent.as_ref() == Some(&current))
                    .map(|r| r.id.clone()),
            );
            if inner.cells.remove(&current).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().cells.is_empty()
    }
}
