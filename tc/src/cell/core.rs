//! WorkCell - one recursive node of the task hierarchy
//!
//! A cell either works its task alone through the executor or delegates it
//! to children through the delegation protocol. Every exit path leaves the
//! cell in a terminal status, deregistered from the bus, with whatever it
//! spent still recorded in its ledger for the parent to settle.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::arena::{CellArena, CellRecord};
use super::config::CellConfig;
use crate::budget::{Recommendation, ResourceGovernor};
use crate::bus::{Envelope, MessageBus, Payload, Registration, SendOutcome};
use crate::collab::{AuditSink, Collaborators, ExecutionGrant, RawOutcome};
use crate::domain::{
    Budget, CellId, CellOutcome, CellResult, CellStatus, EnvelopeId, Escalation, EscalationKind, Mode, PartialResult,
    PeerGroupId, TaskDescriptor,
};
use crate::error::{KernelError, ResourceKind};
use crate::events::{EventBus, KernelEvent};
use crate::protocol::{self, ProtocolConfig};

/// Everything a cell needs from the kernel, shared by every cell of a tree
pub struct CellContext {
    pub governor: Arc<ResourceGovernor>,
    pub bus: Arc<MessageBus>,
    pub arena: Arc<CellArena>,
    pub events: Arc<EventBus>,
    pub collaborators: Collaborators,
    pub audit: Arc<dyn AuditSink>,
    pub cell: CellConfig,
    pub protocol: ProtocolConfig,
}

/// A cell ready to process one task
pub struct WorkCell {
    id: CellId,
    parent: Option<CellId>,
    depth: u32,
    group: Option<PeerGroupId>,
    cancel: CancellationToken,
    ctx: Arc<CellContext>,
}

impl WorkCell {
    /// Build a cell for an admitted arena record
    pub fn from_record(record: &CellRecord, cancel: CancellationToken, ctx: Arc<CellContext>) -> Self {
        Self {
            id: record.id.clone(),
            parent: record.parent.clone(),
            depth: record.depth,
            group: record.group,
            cancel,
            ctx,
        }
    }

    pub fn id(&self) -> &CellId {
        &self.id
    }

    pub fn parent(&self) -> Option<&CellId> {
        self.parent.as_ref()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn context(&self) -> &Arc<CellContext> {
        &self.ctx
    }

    /// Work `task` to a terminal outcome
    ///
    /// The cell must already hold a ledger and an arena record. Boxed so that
    /// delegation can spawn child cells recursively.
    pub fn process(self, task: TaskDescriptor, budget: Budget) -> BoxFuture<'static, Result<CellOutcome, KernelError>> {
        async move { self.run(task, budget).await }.boxed()
    }

    async fn run(self, mut task: TaskDescriptor, budget: Budget) -> Result<CellOutcome, KernelError> {
        debug!(cell = %self.id, task_id = %task.id, %budget, "WorkCell::run: called");
        let registration = self.ctx.bus.register(&self.id, self.group, self.cancel.clone())?;
        self.ctx.governor.bind_cancellation(&self.id, self.cancel.clone());
        self.ctx.arena.transition(&self.id, CellStatus::Running)?;
        self.emit(KernelEvent::CellStarted {
            cell_id: self.id.clone(),
            parent: self.parent.clone(),
            depth: self.depth,
            budget,
            title: task.title.clone(),
        });

        let outcome = self.work(&mut task, budget, &registration).await;
        let outcome = match outcome {
            Err(e) if e.is_aborted() || e.is_fatal() => Err(e),
            _ if self.cancel.is_cancelled() => Err(KernelError::aborted(&self.id, "cancelled")),
            other => other,
        };

        let status = match &outcome {
            Ok(CellOutcome::Result(_)) => CellStatus::Done,
            Ok(CellOutcome::Escalation(_)) => CellStatus::Failed,
            Err(e) if e.is_aborted() => CellStatus::Aborted,
            Err(_) => CellStatus::Failed,
        };
        if let Err(e) = self.ctx.arena.transition(&self.id, status) {
            warn!(cell = %self.id, error = %e, "Could not record final status");
        }
        if let Err(e) = &outcome
            && !e.is_aborted()
        {
            self.send_up(
                Payload::Escalate {
                    reason: e.to_string(),
                },
                &task,
            );
        }

        let spent = self.spent();
        info!(cell = %self.id, task_id = %task.id, %status, %spent, "Cell finished");
        self.emit(KernelEvent::CellFinished {
            cell_id: self.id.clone(),
            status,
            spent,
        });
        drop(registration);
        outcome
    }

    async fn work(
        &self,
        task: &mut TaskDescriptor,
        budget: Budget,
        registration: &Registration,
    ) -> Result<CellOutcome, KernelError> {
        let min_viable = self.ctx.governor.config().min_viable_budget;
        if budget <= min_viable {
            warn!(cell = %self.id, %budget, %min_viable, "Budget below viable minimum");
            return Err(KernelError::BudgetExhausted {
                unit: self.id.clone(),
                resource: ResourceKind::Compute,
                requested: min_viable,
                available: budget,
            });
        }

        let available = self.available();
        let forced_solo = self.depth >= self.ctx.cell.max_depth || available < self.ctx.cell.min_delegation_budget;
        let mode = if forced_solo {
            debug!(cell = %self.id, depth = self.depth, %available, "WorkCell::work: solo forced");
            Mode::Solo
        } else {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(KernelError::aborted(&self.id, "cancelled while classifying")),
                mode = self.ctx.collaborators.classifier.classify(task) => {
                    mode.map_err(|e| KernelError::collaborator("classifier", e))?
                }
            }
        };
        self.emit(KernelEvent::ModeChosen {
            cell_id: self.id.clone(),
            mode,
        });

        match mode {
            Mode::Solo => self.solo(task, registration).await,
            Mode::Delegate => {
                self.ctx.arena.transition(&self.id, CellStatus::AwaitingChildren)?;
                protocol::run_episode(self, task, registration).await
            }
        }
    }

    async fn solo(&self, task: &mut TaskDescriptor, registration: &Registration) -> Result<CellOutcome, KernelError> {
        let governor = &self.ctx.governor;
        let mut clarifications = 0u32;
        let mut attempt = 0u32;
        let mut best_partial: Option<PartialResult> = None;

        loop {
            self.absorb_mail(task)?;
            if self.cancel.is_cancelled() {
                return Err(KernelError::aborted(&self.id, "cancelled before execution"));
            }

            let spendable = self.available();
            let grant = ExecutionGrant {
                spendable,
                time_allowance: self.ctx.cell.time_allowance(spendable),
                attempt,
            };
            debug!(cell = %self.id, %spendable, attempt, "WorkCell::solo: executing");
            let executed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(KernelError::aborted(&self.id, "cancelled during execution")),
                executed = tokio::time::timeout(
                    grant.time_allowance,
                    self.ctx.collaborators.executor.execute(task, &grant),
                ) => executed,
            };
            let raw = match executed {
                Ok(raw) => raw.map_err(|e| KernelError::collaborator("executor", e))?,
                Err(_) => {
                    governor.exhaust(&self.id);
                    warn!(cell = %self.id, allowance = ?grant.time_allowance, "Execution ran out of time");
                    return Err(KernelError::BudgetExhausted {
                        unit: self.id.clone(),
                        resource: ResourceKind::Time,
                        requested: spendable,
                        available: Budget::ZERO,
                    });
                }
            };
            attempt += 1;
            governor.charge(&self.id, raw.cost)?;
            for insight in raw.insights.iter().filter(|i| !i.trim().is_empty()) {
                self.send_up(Payload::Insight { text: insight.clone() }, task);
            }
            let confidence = raw.confidence.clamp(0.0, 1.0);

            match raw.outcome {
                RawOutcome::Completed { output } => {
                    governor.note_progress(&self.id);
                    self.send_up(
                        Payload::Progress {
                            fraction: 1.0,
                            note: "completed".to_string(),
                        },
                        task,
                    );
                    return Ok(CellOutcome::Result(self.result(task, output, confidence, false)));
                }
                RawOutcome::NeedsClarification { question, partial } => {
                    if let Some(output) = partial.filter(|p| !p.trim().is_empty()) {
                        self.send_up(
                            Payload::Partial {
                                output: output.clone(),
                                confidence,
                            },
                            task,
                        );
                        best_partial = Some(PartialResult {
                            source: self.id.clone(),
                            output,
                            confidence,
                        });
                    }
                    clarifications += 1;
                    if clarifications > self.ctx.cell.max_clarifications {
                        return Ok(self.escalate(
                            task,
                            EscalationKind::ClarificationUnanswered,
                            format!("still unclear after {} clarifications: {}", clarifications - 1, question),
                            best_partial,
                        ));
                    }
                    match self.ask(task, &question, registration).await? {
                        Some(answer) => task.add_context(format!("answer to '{}': {}", question, answer)),
                        None => task.add_context(format!("no answer to '{}'; proceed with best judgement", question)),
                    }
                }
                RawOutcome::Failed { reason, partial } => {
                    let partial = partial.map(|output| PartialResult {
                        source: self.id.clone(),
                        output,
                        confidence,
                    });
                    return Ok(self.escalate(task, EscalationKind::ExecutionFailed, reason, partial.or(best_partial)));
                }
                RawOutcome::Blocked { reason } => {
                    self.send_up(Payload::Blocked { reason: reason.clone() }, task);
                    return Ok(self.escalate(task, EscalationKind::Blocked, reason, best_partial));
                }
            }

            if let Some(signal) = governor.escalate_if_critical(&self.id) {
                self.emit(KernelEvent::BudgetCritical {
                    cell_id: self.id.clone(),
                    utilization: signal.utilization,
                });
                match signal.recommendation {
                    Recommendation::RequestTopup(amount) => {
                        if let Err(e) = governor.request_topup(&self.id, amount) {
                            warn!(cell = %self.id, error = %e, "Top-up refused");
                        }
                    }
                    Recommendation::ForceSynthesis => {
                        if let Some(partial) = best_partial.take() {
                            let confidence = partial.confidence * self.ctx.protocol.degraded_penalty;
                            return Ok(CellOutcome::Result(self.result(task, partial.output, confidence, true)));
                        }
                    }
                }
            }
        }
    }

    /// Ask the parent a question and wait for its reply; `None` when nobody can answer
    async fn ask(
        &self,
        task: &mut TaskDescriptor,
        question: &str,
        registration: &Registration,
    ) -> Result<Option<String>, KernelError> {
        let Some(parent) = self.parent.clone() else {
            debug!(cell = %self.id, "WorkCell::ask: root has nobody to ask");
            return Ok(None);
        };
        let envelope = Envelope::upward(
            self.id.clone(),
            parent,
            Payload::Clarify {
                subtask: task.id.clone(),
                question: question.to_string(),
            },
            task.correlation,
        );
        let question_id = envelope.id();
        let sent = self.ctx.bus.send(envelope);
        if sent.delivered_to().is_empty() {
            warn!(cell = %self.id, ?sent, "Clarification could not reach parent");
            return Ok(None);
        }

        let available = self.available();
        let deadline = tokio::time::Instant::now() + self.ctx.cell.time_allowance(available);
        loop {
            if let Some((_, answer)) = self.absorb_mail(task)?.into_iter().find(|(id, _)| *id == question_id) {
                return Ok(answer);
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(KernelError::aborted(&self.id, "cancelled awaiting clarification"));
                }
                _ = registration.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    self.ctx.governor.exhaust(&self.id);
                    return Err(KernelError::BudgetExhausted {
                        unit: self.id.clone(),
                        resource: ResourceKind::Time,
                        requested: available,
                        available: Budget::ZERO,
                    });
                }
            }
        }
    }

    /// Fold pending mail into the task; returns replies and bounced envelope ids
    fn absorb_mail(&self, task: &mut TaskDescriptor) -> Result<Vec<(EnvelopeId, Option<String>)>, KernelError> {
        let mut replies = Vec::new();
        for envelope in self.ctx.bus.drain(&self.id) {
            match envelope.payload() {
                Payload::Insight { text } => task.add_context(format!("insight: {}", text)),
                Payload::Instruction { text } => task.add_context(format!("instruction: {}", text)),
                Payload::ClarifyReply { question_id, answer } => replies.push((*question_id, answer.clone())),
                Payload::DeliveryFailure { envelope: bounced, .. } => replies.push((*bounced, None)),
                Payload::Abort { reason } => return Err(KernelError::aborted(&self.id, reason.clone())),
                other => debug!(cell = %self.id, kind = other.kind(), "WorkCell::absorb_mail: ignored"),
            }
        }
        Ok(replies)
    }

    /// Send `payload` to the parent; roots have nobody to tell
    pub(crate) fn send_up(&self, payload: Payload, task: &TaskDescriptor) -> Option<SendOutcome> {
        let parent = self.parent.clone()?;
        let outcome = self
            .ctx
            .bus
            .send(Envelope::upward(self.id.clone(), parent, payload, task.correlation));
        if !outcome.is_accepted() {
            warn!(cell = %self.id, ?outcome, "Upward send not accepted");
        }
        Some(outcome)
    }

    /// Tell the parent this cell cannot finish and build the escalation outcome
    pub(crate) fn escalate(
        &self,
        task: &TaskDescriptor,
        kind: EscalationKind,
        reason: impl Into<String>,
        partial: Option<PartialResult>,
    ) -> CellOutcome {
        let reason = reason.into();
        warn!(cell = %self.id, task_id = %task.id, %kind, %reason, "Escalating");
        self.send_up(
            Payload::Escalate {
                reason: format!("{}: {}", kind, reason),
            },
            task,
        );
        CellOutcome::Escalation(Escalation::new(self.id.clone(), task.id.clone(), kind, reason).with_partial(partial))
    }

    fn result(&self, task: &TaskDescriptor, output: String, confidence: f64, degraded: bool) -> CellResult {
        CellResult {
            cell_id: self.id.clone(),
            task_id: task.id.clone(),
            mode: Mode::Solo,
            output,
            confidence,
            degraded,
            consumed: self.spent(),
            conflicts: Vec::new(),
            trail: Vec::new(),
            rounds: 0,
        }
    }

    pub(crate) fn available(&self) -> Budget {
        self.ctx
            .governor
            .snapshot(&self.id)
            .map(|ledger| ledger.available())
            .unwrap_or(Budget::ZERO)
    }

    pub(crate) fn spent(&self) -> Budget {
        self.ctx
            .governor
            .snapshot(&self.id)
            .map(|ledger| ledger.spent())
            .unwrap_or(Budget::ZERO)
    }

    pub(crate) fn emit(&self, event: KernelEvent) {
        self.ctx.events.emit(event);
    }
}
