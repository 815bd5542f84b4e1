//! Kernel - the boundary surface that turns a task and a budget into an outcome
//!
//! The kernel owns the shared services every cell tree uses (governor, bus,
//! arena, event stream, audit sink) and opens one root cell per submission.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::{Admission, ResourceGovernor};
use crate::bus::MessageBus;
use crate::cell::{CellArena, CellContext, WorkCell};
use crate::collab::{AuditRecord, AuditSink, Collaborators, LoadMonitor, SubmissionRecord};
use crate::config::Config;
use crate::domain::{Budget, CellId, CellOutcome, TaskDescriptor};
use crate::error::KernelError;
use crate::events::{EventBus, KernelEvent};

/// Entry point for submitting tasks
pub struct Kernel {
    config: Config,
    ctx: Arc<CellContext>,
    shutdown: CancellationToken,
}

impl Kernel {
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        load: Arc<dyn LoadMonitor>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        debug!("Kernel::new: called");
        let events = Arc::new(EventBus::new(config.bus.event_capacity));
        let governor = Arc::new(ResourceGovernor::new(config.governor.clone(), load));
        let bus = Arc::new(MessageBus::new(config.bus.clone(), governor.clone(), events.clone()));
        let ctx = Arc::new(CellContext {
            governor,
            bus,
            arena: Arc::new(CellArena::new()),
            events,
            collaborators,
            audit,
            cell: config.cell.clone(),
            protocol: config.protocol.clone(),
        });
        Self {
            config,
            ctx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.ctx.governor
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.ctx.bus
    }

    pub fn arena(&self) -> &Arc<CellArena> {
        &self.ctx.arena
    }

    /// Subscribe to the event stream
    pub fn events(&self) -> broadcast::Receiver<KernelEvent> {
        self.ctx.events.subscribe()
    }

    /// Cancel every submission in flight
    pub fn cancel_all(&self) {
        info!("Cancelling all submissions");
        self.shutdown.cancel();
    }

    /// Work `task` with `total` budget to a result, an escalation or an error
    ///
    /// Whatever happens, the root ledger is settled and the cell tree is
    /// removed before this returns.
    pub async fn submit(&self, task: TaskDescriptor, total: Budget) -> Result<CellOutcome, KernelError> {
        debug!(task_id = %task.id, %total, "Kernel::submit: called");
        let root = CellId::generate(&task.title);
        self.submit_as(root, task, total).await
    }

    async fn submit_as(&self, root: CellId, task: TaskDescriptor, total: Budget) -> Result<CellOutcome, KernelError> {
        let governor = &self.ctx.governor;

        let mut attempt = 0;
        loop {
            match governor.open_root(&root, total, attempt) {
                Admission::Admitted => break,
                Admission::Deferred {
                    retry_after,
                    attempt: next,
                } => {
                    self.ctx.events.emit(KernelEvent::AdmissionDeferred {
                        cell_id: root.clone(),
                        retry_after_ms: retry_after.as_millis() as u64,
                        attempt: next,
                    });
                    attempt = next;
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(KernelError::aborted(&root, "kernel shut down")),
                        _ = tokio::time::sleep(retry_after) => {}
                    }
                }
                Admission::Rejected(reason) => {
                    warn!(%root, %reason, "Submission rejected");
                    return Err(KernelError::AdmissionRejected { unit: root, reason });
                }
            }
        }

        let record = match self.ctx.arena.insert_root(&root, &task.id, total) {
            Ok(record) => record,
            Err(e) => {
                match governor.reclaim_surplus(&root) {
                    Ok(surplus) => debug!(%root, %surplus, "Kernel::submit: root settled after arena error"),
                    Err(settle) => warn!(%root, error = %settle, "Could not settle root after arena error"),
                }
                return Err(e);
            }
        };
        info!(%root, task_id = %task.id, %total, "Submitted task");

        let task_id = task.id.clone();
        let cell = WorkCell::from_record(&record, self.shutdown.child_token(), self.ctx.clone());
        let outcome = cell.process(task, total).await;

        let spent = governor
            .snapshot(&root)
            .map(|ledger| ledger.spent())
            .unwrap_or(Budget::ZERO);
        let surplus = governor.reclaim_surplus(&root).unwrap_or(Budget::ZERO);
        self.ctx.arena.remove_subtree(&root);
        if !governor.check_all_invariants() {
            warn!(%root, "Ledger invariants violated after submission");
        }

        let (summary, degraded) = match &outcome {
            Ok(CellOutcome::Result(result)) => ("result".to_string(), result.degraded),
            Ok(CellOutcome::Escalation(escalation)) => (format!("escalation: {}", escalation.kind), true),
            Err(e) => (format!("error: {}", e), true),
        };
        info!(%root, %spent, %surplus, outcome = %summary, "Submission finished");
        self.ctx.audit.record(AuditRecord::Submission(SubmissionRecord {
            root,
            task_id,
            budget: total,
            spent,
            surplus,
            outcome: summary,
            degraded,
            finished_at: Utc::now(),
        }));
        outcome
    }
}
