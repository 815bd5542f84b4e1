//! EpisodeRunner - drives one delegation episode for a delegating cell
//!
//! Plan, spawn children, collect their outcomes while answering their mail,
//! retry what is worth retrying, resolve conflicts between accepted results
//! and synthesize. Children run as tasks in a `JoinSet`; the runner owns
//! their settlement, so every child ledger is closed before the episode is.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conflict::{self, Contender};
use super::episode::{Contribution, Episode, FailureKind, RunningChild, SlotState};
use super::plan::ValidatedPlan;
use crate::budget::{Admission, Recommendation};
use crate::bus::{Envelope, Payload, Registration, SendOutcome};
use crate::cell::{CellContext, CellRecord, WorkCell};
use crate::collab::{AuditRecord, Candidate, EpisodeRecord, SlotFailure};
use crate::convergence::Signature;
use crate::domain::{
    Budget, CellId, CellOutcome, CellResult, EnvelopeId, Escalation, EscalationKind, Mode, PartialResult, PeerGroupId,
    TaskDescriptor,
};
use crate::error::KernelError;
use crate::events::KernelEvent;

/// Slot index, child id and what the child returned
type ChildJoin = (usize, CellId, Result<CellOutcome, KernelError>);

struct ChildHandle {
    abort: AbortHandle,
    cancel: CancellationToken,
}

/// Run a delegation episode for `cell` and return its synthesized outcome
pub(crate) async fn run_episode(
    cell: &WorkCell,
    task: &TaskDescriptor,
    registration: &Registration,
) -> Result<CellOutcome, KernelError> {
    debug!(cell = %cell.id(), task_id = %task.id, "run_episode: called");
    let ctx = cell.context().clone();

    let subtasks = tokio::select! {
        biased;
        _ = cell.cancel_token().cancelled() => return Err(KernelError::aborted(cell.id(), "cancelled while planning")),
        planned = ctx.collaborators.planner.decompose(task) => {
            planned.map_err(|e| KernelError::collaborator("planner", e))?
        }
    };
    let plan = ValidatedPlan::new(subtasks)?;
    if !ctx.protocol.plan_cost.is_zero() {
        ctx.governor.charge(cell.id(), ctx.protocol.plan_cost)?;
    }
    let group = PeerGroupId::new();
    info!(cell = %cell.id(), subtasks = plan.len(), %group, "Plan accepted");

    let mut runner = EpisodeRunner {
        cell,
        task,
        registration,
        episode: Episode::new(cell.id().clone(), plan, group),
        children: JoinSet::new(),
        handles: HashMap::new(),
        ctx,
    };
    let outcome = runner.drive().await;
    runner.close(&outcome).await;
    outcome
}

struct EpisodeRunner<'a> {
    cell: &'a WorkCell,
    task: &'a TaskDescriptor,
    registration: &'a Registration,
    ctx: Arc<CellContext>,
    episode: Episode,
    children: JoinSet<ChildJoin>,
    handles: HashMap<CellId, ChildHandle>,
}

impl EpisodeRunner<'_> {
    fn id(&self) -> &CellId {
        self.cell.id()
    }

    fn aborted(&self, reason: &str) -> KernelError {
        KernelError::aborted(self.cell.id(), reason)
    }

    async fn drive(&mut self) -> Result<CellOutcome, KernelError> {
        loop {
            self.collect_round().await?;
            if !self.schedule_retries() {
                break;
            }
        }

        let orphaned = self.episode.fail_orphans();
        if orphaned > 0 {
            let owner = self.id().clone();
            let orphans: Vec<(String, String, Option<PartialResult>)> = self
                .episode
                .slots
                .iter()
                .filter_map(|s| match s.failure() {
                    Some((FailureKind::DependencyFailed, reason)) => {
                        Some((s.subtask.id.clone(), reason.to_string(), s.best_partial.clone()))
                    }
                    _ => None,
                })
                .collect();
            for (subtask, reason, partial) in orphans {
                self.episode.record_trail(
                    Escalation::new(owner.clone(), subtask, EscalationKind::ChildFailed, reason).with_partial(partial),
                );
            }
        }

        self.resolve_conflicts().await?;
        self.synthesize()
    }

    /// Spawn, supervise and collect until nothing is running or schedulable
    async fn collect_round(&mut self) -> Result<(), KernelError> {
        info!(cell = %self.id(), round = self.episode.round, "Delegation round started");
        loop {
            self.spawn_ready()?;
            if self.episode.running() == 0 && self.episode.next_admission().is_none() {
                debug!(cell = %self.id(), round = self.episode.round, "EpisodeRunner::collect_round: settled");
                return Ok(());
            }

            let wake_at = self.next_wake();
            tokio::select! {
                biased;
                _ = self.cell.cancel_token().cancelled() => {
                    return Err(self.aborted("cancelled while awaiting children"));
                }
                joined = self.children.join_next(), if !self.children.is_empty() => {
                    // Mail sent before the child returned must be seen before its outcome
                    self.process_mail().await?;
                    if let Some(joined) = joined {
                        self.on_joined(joined).await?;
                    }
                }
                _ = self.registration.notified() => {
                    self.process_mail().await?;
                }
                _ = tokio::time::sleep_until(wake_at) => {
                    self.supervise();
                }
            }
        }
    }

    fn next_wake(&self) -> Instant {
        let grace = self.ctx.protocol.abort_grace();
        let mut wake = Instant::now() + self.ctx.protocol.supervision_tick();
        for child in self.episode.slots.iter().filter_map(|s| s.running()) {
            let due = match child.abort_sent {
                None => child.deadline,
                Some(at) => at + grace,
            };
            wake = wake.min(due);
        }
        if let Some(at) = self.episode.next_admission() {
            wake = wake.min(at);
        }
        wake
    }

    fn spawn_ready(&mut self) -> Result<(), KernelError> {
        for idx in self.episode.ready(Instant::now()) {
            self.spawn_slot(idx)?;
        }
        Ok(())
    }

    fn spawn_slot(&mut self, idx: usize) -> Result<(), KernelError> {
        let owner = self.id().clone();
        let remaining = self.episode.remaining_weight();
        let subtask = self.episode.slots[idx].subtask.clone();
        let attempt = self.episode.slots[idx].admission_attempt;
        let fraction = if remaining > 0.0 { subtask.weight / remaining } else { 1.0 };

        let sizing = self.ctx.governor.allocate_child_budget(&owner, fraction)?;
        let child_id = CellId::generate(&subtask.title);
        debug!(cell = %owner, subtask = %subtask.id, child = %child_id, amount = %sizing.amount, fraction, "EpisodeRunner::spawn_slot: called");

        match self.ctx.governor.admit(&child_id, Some(&owner), sizing.amount, attempt) {
            Admission::Admitted => {}
            Admission::Deferred { retry_after, attempt } => {
                let slot = &mut self.episode.slots[idx];
                slot.admission_attempt = attempt;
                slot.not_before = Some(Instant::now() + retry_after);
                self.cell.emit(KernelEvent::AdmissionDeferred {
                    cell_id: child_id,
                    retry_after_ms: retry_after.as_millis() as u64,
                    attempt,
                });
                return Ok(());
            }
            Admission::Rejected(reason) => {
                self.fail_slot(idx, FailureKind::Admission, reason, owner);
                return Ok(());
            }
        }

        let record = match self
            .ctx
            .arena
            .insert_child(&child_id, &owner, &subtask.id, sizing.amount, self.episode.group)
        {
            Ok(record) => record,
            Err(e) => {
                self.settle(&child_id);
                self.fail_slot(idx, FailureKind::Admission, e.to_string(), owner);
                return Ok(());
            }
        };

        let mut child_task = self.task.for_subtask(&subtask);
        child_task.context.extend(self.episode.notes.iter().cloned());
        let cancel = self.cell.cancel_token().child_token();
        let child = WorkCell::from_record(&record, cancel.clone(), self.ctx.clone());
        let process = child.process(child_task, sizing.amount);
        let joined_id = child_id.clone();
        let abort = self.children.spawn(async move {
            let outcome = match AssertUnwindSafe(process).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Err(KernelError::collaborator("child task", "panicked")),
            };
            (idx, joined_id, outcome)
        });
        self.handles.insert(child_id.clone(), ChildHandle { abort, cancel });

        let now = Instant::now();
        let allowance = self.ctx.cell.time_allowance(sizing.amount);
        let slot = &mut self.episode.slots[idx];
        slot.spawns += 1;
        slot.progress = 0.0;
        slot.not_before = None;
        slot.state = SlotState::Running(RunningChild {
            cell: child_id.clone(),
            started: now,
            deadline: now + allowance,
            abort_sent: None,
            vetoed: false,
        });
        info!(cell = %owner, child = %child_id, subtask = %subtask.id, budget = %sizing.amount, spawn = slot.spawns, "Spawned child");
        Ok(())
    }

    async fn on_joined(&mut self, joined: Result<ChildJoin, JoinError>) -> Result<(), KernelError> {
        match joined {
            Ok((idx, child, outcome)) => {
                self.handles.remove(&child);
                self.on_child_finished(idx, child, outcome).await
            }
            Err(e) => {
                // Only torn-down children end this way and they were settled when torn down
                debug!(cell = %self.id(), error = %e, "EpisodeRunner::on_joined: task cancelled");
                Ok(())
            }
        }
    }

    async fn on_child_finished(
        &mut self,
        idx: usize,
        child: CellId,
        outcome: Result<CellOutcome, KernelError>,
    ) -> Result<(), KernelError> {
        let Some(running) = self.episode.slots[idx]
            .running()
            .filter(|r| r.cell == child)
            .cloned()
        else {
            debug!(cell = %self.id(), %child, "EpisodeRunner::on_child_finished: stale child");
            self.settle(&child);
            return Ok(());
        };

        let record = self.ctx.arena.get(&child);
        let consumed = self.settle(&child);
        self.ctx.governor.note_progress(self.cell.id());

        match outcome {
            Ok(CellOutcome::Result(result)) => self.review(idx, running, record, result, consumed).await?,
            Ok(CellOutcome::Escalation(escalation)) => {
                if let Some(partial) = escalation.partial.clone() {
                    self.episode.slots[idx].offer_partial(partial);
                }
                let kind = if running.vetoed {
                    FailureKind::ConvergenceVeto
                } else {
                    FailureKind::from_escalation(escalation.kind)
                };
                let reason = escalation.reason.clone();
                self.episode.record_trail(escalation);
                self.fail_slot(idx, kind, reason, child);
            }
            Err(e) if e.is_fatal() => {
                warn!(cell = %self.id(), %child, error = %e, "Fatal error from child");
                return Err(e);
            }
            Err(e) => {
                let kind = match &e {
                    _ if running.vetoed => FailureKind::ConvergenceVeto,
                    KernelError::Aborted { .. } if running.abort_sent.is_some() && !self.episode.winding_down => {
                        FailureKind::Unresponsive
                    }
                    KernelError::Aborted { .. } => FailureKind::Aborted,
                    KernelError::BudgetExhausted { .. } => FailureKind::Budget,
                    KernelError::ChildUnresponsive { .. } => FailureKind::Unresponsive,
                    _ => FailureKind::Execution,
                };
                self.fail_slot(idx, kind, e.to_string(), child);
            }
        }
        self.report_progress();
        Ok(())
    }

    /// Score a child's result and accept or reject it
    async fn review(
        &mut self,
        idx: usize,
        running: RunningChild,
        record: Option<CellRecord>,
        result: CellResult,
        consumed: Budget,
    ) -> Result<(), KernelError> {
        let subtask = self.episode.slots[idx].subtask.clone();
        self.episode.conflicts.extend(result.conflicts.iter().cloned());
        for escalation in &result.trail {
            self.episode.record_trail(escalation.clone());
        }
        if result.degraded {
            self.episode.degraded = true;
        }

        let review_cost = self.ctx.protocol.review_cost;
        if !review_cost.is_zero() {
            self.ctx.governor.charge(self.cell.id(), review_cost)?;
        }
        let child_task = self.task.for_subtask(&subtask);
        let scored = tokio::select! {
            biased;
            _ = self.cell.cancel_token().cancelled() => return Err(self.aborted("cancelled during review")),
            scored = self.ctx.collaborators.scorer.score(&child_task, &result.output) => scored,
        };
        let score = match scored {
            Ok(score) => score.clamp(0.0, 1.0),
            Err(e) => {
                self.fail_slot(idx, FailureKind::Review, format!("review failed: {}", e), running.cell);
                return Ok(());
            }
        };

        let threshold = self.ctx.protocol.acceptance_threshold;
        if score >= threshold {
            info!(cell = %self.id(), child = %running.cell, subtask = %subtask.id, score, "Accepted child result");
            let slot = &mut self.episode.slots[idx];
            slot.progress = 1.0;
            slot.state = SlotState::Accepted(Contribution {
                depth: record.as_ref().map_or(self.cell.depth() + 1, |r| r.depth),
                spawn_seq: record.as_ref().map_or(u64::MAX, |r| r.spawn_seq),
                cell: running.cell,
                output: result.output,
                score,
                consumed,
            });
        } else {
            self.episode.slots[idx].offer_partial(PartialResult {
                source: running.cell.clone(),
                output: result.output,
                confidence: score,
            });
            self.fail_slot(
                idx,
                FailureKind::Rejected,
                format!("score {:.2} below acceptance threshold {:.2}", score, threshold),
                running.cell,
            );
        }
        Ok(())
    }

    async fn process_mail(&mut self) -> Result<(), KernelError> {
        for envelope in self.ctx.bus.drain(self.cell.id()) {
            let from = envelope.sender().clone();
            match envelope.payload() {
                Payload::Progress { fraction, .. } => {
                    if let Some(idx) = self.episode.slot_of(&from) {
                        self.episode.slots[idx].progress = fraction.clamp(0.0, 1.0);
                        self.ctx.governor.note_progress(&from);
                    }
                    self.report_progress();
                }
                Payload::Clarify { subtask, question } => {
                    self.on_clarify(&from, envelope.id(), subtask, question).await?;
                }
                Payload::ClarifyReply { question_id, answer } => {
                    if let Some((child, child_question)) = self.episode.take_question(question_id) {
                        self.reply(&child, child_question, answer.clone());
                    } else {
                        debug!(cell = %self.id(), %question_id, "EpisodeRunner::process_mail: reply to unknown question");
                    }
                }
                Payload::Partial { output, confidence } => {
                    if let Some(idx) = self.episode.slot_of(&from) {
                        self.episode.slots[idx].offer_partial(PartialResult {
                            source: from.clone(),
                            output: output.clone(),
                            confidence: confidence.clamp(0.0, 1.0),
                        });
                    }
                }
                Payload::Insight { text } => self.relay_insight(&from, text),
                Payload::Escalate { reason } => {
                    info!(cell = %self.id(), child = %from, %reason, "Child escalated");
                    self.check_critical();
                }
                Payload::Blocked { reason } => {
                    if let Some(idx) = self.episode.slot_of(&from) {
                        let slot = &self.episode.slots[idx];
                        let escalation =
                            Escalation::new(from.clone(), slot.subtask.id.clone(), EscalationKind::Blocked, reason.clone())
                                .with_partial(slot.best_partial.clone());
                        self.episode.record_trail(escalation);
                    }
                    self.check_critical();
                }
                Payload::Instruction { text } => self.episode.notes.push(format!("instruction: {}", text)),
                Payload::DeliveryFailure { envelope: bounced, reason, .. } => {
                    if let Some((child, child_question)) = self.episode.take_question(bounced) {
                        debug!(cell = %self.id(), %reason, "EpisodeRunner::process_mail: forwarded question bounced");
                        self.reply(&child, child_question, None);
                    }
                }
                Payload::Abort { reason } => {
                    debug!(cell = %self.id(), %reason, "EpisodeRunner::process_mail: abort noted");
                }
                other => debug!(cell = %self.id(), kind = other.kind(), "EpisodeRunner::process_mail: ignored"),
            }
        }
        Ok(())
    }

    /// Answer, forward or veto a child's clarification question
    async fn on_clarify(
        &mut self,
        from: &CellId,
        question_id: EnvelopeId,
        subtask: &str,
        question: &str,
    ) -> Result<(), KernelError> {
        let Some(idx) = self.episode.slot_of(from) else {
            debug!(cell = %self.id(), child = %from, "EpisodeRunner::on_clarify: no running slot");
            return Ok(());
        };

        let signature = Signature::new(subtask, FailureKind::Clarification.category());
        if !self.episode.detector.should_retry(signature, self.ctx.protocol.max_attempts) {
            let veto = KernelError::ConvergenceExhausted {
                subtask: subtask.to_string(),
                category: FailureKind::Clarification.category().to_string(),
                attempts: self.episode.detector.attempts(signature),
            };
            warn!(cell = %self.id(), child = %from, %signature, error = %veto, "Clarification loop vetoed");
            self.episode.degraded = true;
            let slot = &mut self.episode.slots[idx];
            let partial = slot.best_partial.clone();
            let slot_subtask = slot.subtask.id.clone();
            if let Some(child) = slot.running_mut() {
                child.vetoed = true;
                child.abort_sent = Some(Instant::now());
            }
            self.episode.record_trail(
                Escalation::new(from.clone(), slot_subtask, EscalationKind::ConvergenceExhausted, veto.to_string())
                    .with_partial(partial),
            );
            self.abort_child(from, &veto.to_string());
            return Ok(());
        }
        self.episode.detector.record_attempt(signature);

        let answered = tokio::select! {
            biased;
            _ = self.cell.cancel_token().cancelled() => return Err(self.aborted("cancelled while answering")),
            answered = self.ctx.collaborators.planner.answer(self.task, question) => answered,
        };
        let answer = answered.unwrap_or_else(|e| {
            warn!(cell = %self.id(), error = %e, "Planner could not answer");
            None
        });
        if answer.is_some() {
            self.reply(from, question_id, answer);
            return Ok(());
        }

        match self.cell.parent() {
            Some(parent) => {
                let forward = Envelope::upward(
                    self.id().clone(),
                    parent.clone(),
                    Payload::Clarify {
                        subtask: subtask.to_string(),
                        question: question.to_string(),
                    },
                    self.task.correlation,
                );
                let forward_id = forward.id();
                if self.ctx.bus.send(forward).delivered_to().is_empty() {
                    self.reply(from, question_id, None);
                } else {
                    debug!(cell = %self.id(), child = %from, "EpisodeRunner::on_clarify: forwarded upward");
                    self.episode.track_question(forward_id, from.clone(), question_id);
                }
            }
            None => {
                info!(cell = %self.id(), child = %from, %question, "Clarification unanswered at root");
                self.cell.emit(KernelEvent::ClarificationUnanswered {
                    cell_id: self.id().clone(),
                    subtask: subtask.to_string(),
                    question: question.to_string(),
                });
                self.reply(from, question_id, None);
            }
        }
        Ok(())
    }

    fn reply(&self, child: &CellId, question_id: EnvelopeId, answer: Option<String>) {
        self.send_down(child, Payload::ClarifyReply { question_id, answer });
    }

    /// Keep a child's insight for later spawns and pass it to its live siblings
    ///
    /// The relay is charged to this cell, not to the child that reported it.
    fn relay_insight(&mut self, from: &CellId, text: &str) {
        self.episode.notes.push(format!("insight: {}", text));
        let peers = self.ctx.bus.live_peers(from);
        if peers.is_empty() {
            return;
        }
        let relay = Envelope::lateral(
            from.clone(),
            peers,
            Payload::Insight { text: text.to_string() },
            self.task.correlation,
        )
        .relayed_by(self.id().clone());
        let outcome = self.ctx.bus.send(relay);
        debug!(cell = %self.id(), child = %from, ?outcome, "EpisodeRunner::relay_insight: relayed");
    }

    fn send_down(&self, child: &CellId, payload: Payload) -> SendOutcome {
        let outcome = self.ctx.bus.send(Envelope::downward(
            self.id().clone(),
            child.clone(),
            payload,
            self.task.correlation,
        ));
        if !outcome.is_accepted() {
            warn!(cell = %self.id(), %child, ?outcome, "Downward send not accepted");
        }
        outcome
    }

    /// Ask a child to stop; cancel it directly if the message cannot be delivered
    fn abort_child(&self, child: &CellId, reason: &str) {
        let outcome = self.send_down(
            child,
            Payload::Abort {
                reason: reason.to_string(),
            },
        );
        if outcome.delivered_to().is_empty()
            && let Some(handle) = self.handles.get(child)
        {
            handle.cancel.cancel();
        }
    }

    fn supervise(&mut self) {
        let now = Instant::now();
        let grace = self.ctx.protocol.abort_grace();
        let mut overdue = Vec::new();
        let mut unresponsive = Vec::new();
        for (idx, slot) in self.episode.slots.iter().enumerate() {
            let Some(child) = slot.running() else { continue };
            match child.abort_sent {
                None if now >= child.deadline => overdue.push((idx, child.cell.clone())),
                Some(at) if now >= at + grace => unresponsive.push((idx, child.cell.clone(), now - child.started)),
                _ => {}
            }
        }

        for (idx, child) in overdue {
            warn!(cell = %self.id(), %child, "Child overran its time allowance");
            if let Some(running) = self.episode.slots[idx].running_mut() {
                running.abort_sent = Some(now);
            }
            self.abort_child(&child, "time allowance exceeded");
        }
        for (idx, child, waited) in unresponsive {
            self.tear_down(idx, child, waited.as_millis() as u64);
        }

        self.check_critical();
        for killed in self.ctx.governor.relieve_pressure() {
            self.cell.emit(KernelEvent::CellKilled { cell_id: killed });
        }
    }

    /// Forcibly stop a child that ignored its abort
    fn tear_down(&mut self, idx: usize, child: CellId, waited_ms: u64) {
        if let Some(handle) = self.handles.remove(&child) {
            handle.cancel.cancel();
            handle.abort.abort();
        }
        self.settle(&child);
        self.ctx.arena.remove_subtree(&child);
        let vetoed = self.episode.slots[idx].running().is_some_and(|r| r.vetoed);
        let error = KernelError::ChildUnresponsive {
            unit: child.clone(),
            waited_ms,
        };
        warn!(cell = %self.id(), %child, waited_ms, "Tearing down unresponsive child");
        let kind = if vetoed {
            FailureKind::ConvergenceVeto
        } else {
            FailureKind::Unresponsive
        };
        self.fail_slot(idx, kind, error.to_string(), child);
    }

    fn check_critical(&mut self) {
        let Some(signal) = self.ctx.governor.escalate_if_critical(self.cell.id()) else {
            return;
        };
        self.cell.emit(KernelEvent::BudgetCritical {
            cell_id: self.id().clone(),
            utilization: signal.utilization,
        });
        if let Recommendation::RequestTopup(amount) = signal.recommendation {
            match self.ctx.governor.request_topup(self.cell.id(), amount) {
                Ok(granted) => {
                    info!(cell = %self.id(), %granted, "Top-up granted");
                    return;
                }
                Err(e) => warn!(cell = %self.id(), error = %e, "Top-up refused"),
            }
        }
        self.wind_down("budget critical");
    }

    /// Stop scheduling, abort running children and synthesize from what exists
    fn wind_down(&mut self, reason: &str) {
        if self.episode.winding_down {
            return;
        }
        warn!(cell = %self.id(), %reason, "Winding down episode");
        self.episode.winding_down = true;
        self.episode.degraded = true;
        let now = Instant::now();
        let mut running = Vec::new();
        for slot in &mut self.episode.slots {
            if let Some(child) = slot.running_mut()
                && child.abort_sent.is_none()
            {
                child.abort_sent = Some(now);
                running.push(child.cell.clone());
            }
        }
        for child in running {
            self.abort_child(&child, reason);
        }
    }

    /// Requeue retryable failures; returns whether another round should run
    fn schedule_retries(&mut self) -> bool {
        let protocol = &self.ctx.protocol;
        if self.episode.winding_down || self.episode.round >= protocol.max_rounds {
            return false;
        }
        let (max_attempts, max_redelegations) = (protocol.max_attempts, protocol.max_redelegations);

        let owner = self.id().clone();
        let mut requeued = 0;
        for idx in 0..self.episode.slots.len() {
            let slot = &self.episode.slots[idx];
            let Some((kind, _)) = slot.failure() else { continue };
            if !kind.is_retryable() || slot.redelegations >= max_redelegations {
                continue;
            }
            let subtask = slot.subtask.id.clone();
            let signature = Signature::new(&subtask, kind.category());
            if !self.episode.detector.should_retry(signature, max_attempts) {
                let veto = KernelError::ConvergenceExhausted {
                    subtask: subtask.clone(),
                    category: kind.category().to_string(),
                    attempts: self.episode.detector.attempts(signature),
                };
                warn!(cell = %owner, %subtask, error = %veto, "Re-delegation vetoed");
                self.episode.degraded = true;
                let partial = self.episode.slots[idx].best_partial.clone();
                self.episode.slots[idx].fail(FailureKind::ConvergenceVeto, veto.to_string());
                self.episode.record_trail(
                    Escalation::new(owner.clone(), subtask, EscalationKind::ConvergenceExhausted, veto.to_string())
                        .with_partial(partial),
                );
                continue;
            }
            let slot = &mut self.episode.slots[idx];
            slot.requeue();
            info!(cell = %owner, %subtask, redelegation = slot.redelegations, "Re-delegating subtask");
            requeued += 1;
        }

        if requeued > 0 {
            self.episode.round += 1;
        }
        requeued > 0
    }

    fn contender(&self, idx: usize) -> Option<Contender> {
        let slot = &self.episode.slots[idx];
        let c = slot.contribution()?;
        Some(Contender {
            cell: c.cell.clone(),
            subtask: slot.subtask.id.clone(),
            output: c.output.clone(),
            score: c.score,
            depth: c.depth,
            spawn_seq: c.spawn_seq,
        })
    }

    /// Compare accepted results pairwise in plan order and overrule the losers
    async fn resolve_conflicts(&mut self) -> Result<(), KernelError> {
        let threshold = self.ctx.protocol.conflict_threshold;
        let accepted: Vec<usize> = (0..self.episode.slots.len())
            .filter(|&i| self.episode.slots[i].contribution().is_some())
            .collect();
        let mut overruled = HashSet::new();

        for (pos, &a) in accepted.iter().enumerate() {
            for &b in &accepted[pos + 1..] {
                if overruled.contains(&a) {
                    break;
                }
                if overruled.contains(&b) {
                    continue;
                }
                let (Some(left), Some(right)) = (self.contender(a), self.contender(b)) else {
                    continue;
                };
                let measured = tokio::select! {
                    biased;
                    _ = self.cell.cancel_token().cancelled() => {
                        return Err(self.aborted("cancelled during conflict resolution"));
                    }
                    measured = self.ctx.collaborators.scorer.similarity(
                        Candidate { task_id: &left.subtask, output: &left.output },
                        Candidate { task_id: &right.subtask, output: &right.output },
                    ) => measured,
                };

                let report = match measured {
                    Ok(similarity) if similarity >= threshold => continue,
                    Ok(similarity) => {
                        let report = conflict::resolved_report(self.cell.id(), &left, &right, similarity, threshold);
                        overruled.insert(if report.winner() == Some(&left.cell) { b } else { a });
                        info!(cell = %self.id(), left = %left.subtask, right = %right.subtask, similarity, "Conflict resolved");
                        report
                    }
                    Err(e) => {
                        let error = KernelError::ConflictUnresolved {
                            left: left.cell.clone(),
                            right: right.cell.clone(),
                            reason: e.to_string(),
                        };
                        warn!(cell = %self.id(), error = %error, "Conflict left unresolved");
                        self.episode.record_trail(Escalation::new(
                            self.id().clone(),
                            format!("{}/{}", left.subtask, right.subtask),
                            EscalationKind::ConflictUnresolved,
                            error.to_string(),
                        ));
                        conflict::unresolved_report(self.cell.id(), &left, &right, threshold, e.to_string())
                    }
                };
                self.ctx.audit.record(AuditRecord::Conflict(report.clone()));
                self.cell.send_up(
                    Payload::ConflictReport {
                        report: Box::new(report.clone()),
                    },
                    self.task,
                );
                self.episode.conflicts.push(report);
            }
        }

        for idx in overruled {
            let slot = &mut self.episode.slots[idx];
            if let SlotState::Accepted(contribution) = std::mem::replace(&mut slot.state, SlotState::Waiting) {
                slot.state = SlotState::Overruled(contribution);
            }
        }
        Ok(())
    }

    /// Merge accepted results, and partials forced out of failed slots, in plan order
    ///
    /// With nothing accepted and no forced partial the episode escalates
    /// `AllChildrenFailed`, carrying the best partial any slot produced.
    fn synthesize(&mut self) -> Result<CellOutcome, KernelError> {
        let synthesis_cost = self.ctx.protocol.synthesis_cost;
        if !synthesis_cost.is_zero() {
            self.ctx.governor.charge(self.cell.id(), synthesis_cost)?;
        }

        let mut degraded = self.episode.degraded;
        let mut sections = Vec::new();
        let mut scores = Vec::new();
        let mut partial_scores = Vec::new();
        for slot in &self.episode.slots {
            match &slot.state {
                SlotState::Accepted(c) => {
                    sections.push(format!("## {}\n{}", slot.subtask.title, c.output));
                    scores.push(c.score);
                }
                SlotState::Overruled(_) => {}
                _ => {
                    degraded = true;
                    if slot.partial_usable()
                        && let Some(partial) = &slot.best_partial
                    {
                        sections.push(format!("## {} (partial)\n{}", slot.subtask.title, partial.output));
                        partial_scores.push(partial.confidence);
                    }
                }
            }
        }

        if sections.is_empty() {
            let error = KernelError::AllChildrenFailed {
                count: self.episode.slots.len(),
            };
            let best = self
                .episode
                .slots
                .iter()
                .filter_map(|s| s.best_partial.as_ref())
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
                .cloned();
            return Ok(self
                .cell
                .escalate(self.task, EscalationKind::AllChildrenFailed, error.to_string(), best));
        }

        let basis = if scores.is_empty() { &partial_scores } else { &scores };
        let mean = basis.iter().sum::<f64>() / basis.len() as f64;
        let confidence = if degraded {
            mean * self.ctx.protocol.degraded_penalty
        } else {
            mean
        };
        info!(cell = %self.id(), sections = sections.len(), confidence, degraded, "Synthesized");
        Ok(CellOutcome::Result(CellResult {
            cell_id: self.id().clone(),
            task_id: self.task.id.clone(),
            mode: Mode::Delegate,
            output: sections.join("\n\n"),
            confidence,
            degraded,
            consumed: self.cell.spent(),
            conflicts: self.episode.conflicts.clone(),
            trail: self.episode.trail.clone(),
            rounds: self.episode.round,
        }))
    }

    fn report_progress(&mut self) {
        if let Some(step) = self.episode.progress_step() {
            self.ctx.governor.note_progress(self.cell.id());
            self.cell.send_up(
                Payload::Progress {
                    fraction: step,
                    note: format!("{:.0}% of subtasks settled", step * 100.0),
                },
                self.task,
            );
        }
    }

    fn fail_slot(&mut self, idx: usize, kind: FailureKind, reason: String, origin: CellId) {
        let winding_down = self.episode.winding_down;
        let slot = &mut self.episode.slots[idx];
        let subtask = slot.subtask.id.clone();
        let partial = slot.best_partial.clone();
        slot.fail(kind, reason.clone());
        slot.failed_winding_down = winding_down;
        self.episode
            .detector
            .record_attempt(Signature::new(&subtask, kind.category()));
        self.episode
            .record_trail(Escalation::new(origin, subtask, kind.escalation_kind(), reason).with_partial(partial));
    }

    /// Close a child's ledger into ours; returns what the child spent
    fn settle(&self, child: &CellId) -> Budget {
        let spent = self
            .ctx
            .governor
            .snapshot(child)
            .map(|ledger| ledger.spent())
            .unwrap_or(Budget::ZERO);
        match self.ctx.governor.reclaim_surplus(child) {
            Ok(surplus) => debug!(cell = %self.id(), %child, %spent, %surplus, "EpisodeRunner::settle: settled"),
            Err(e) => debug!(cell = %self.id(), %child, error = %e, "EpisodeRunner::settle: nothing to settle"),
        }
        spent
    }

    /// Abort every running child, wait out the grace period, then force the rest
    async fn shutdown_children(&mut self) {
        let running: Vec<CellId> = self.episode.slots.iter().filter_map(|s| s.running()).map(|r| r.cell.clone()).collect();
        debug!(cell = %self.id(), running = running.len(), "EpisodeRunner::shutdown_children: called");
        for child in &running {
            self.abort_child(child, "episode closing");
        }

        let deadline = Instant::now() + self.ctx.protocol.abort_grace();
        while !self.children.is_empty() {
            match tokio::time::timeout_at(deadline, self.children.join_next()).await {
                Ok(Some(Ok((idx, child, _)))) => {
                    self.handles.remove(&child);
                    self.settle(&child);
                    if self.episode.slots[idx].running().is_some_and(|r| r.cell == child) {
                        self.fail_slot(idx, FailureKind::Aborted, "episode closed".to_string(), child);
                    }
                }
                Ok(Some(Err(e))) => debug!(cell = %self.id(), error = %e, "EpisodeRunner::shutdown_children: task ended"),
                Ok(None) => break,
                Err(_) => {
                    warn!(cell = %self.id(), remaining = self.children.len(), "Children ignored abort; forcing");
                    self.children.abort_all();
                    while self.children.join_next().await.is_some() {}
                    break;
                }
            }
        }

        let leftover: Vec<(usize, CellId)> = self
            .episode
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.running().map(|r| (i, r.cell.clone())))
            .collect();
        for (idx, child) in leftover {
            self.handles.remove(&child);
            self.settle(&child);
            self.ctx.arena.remove_subtree(&child);
            self.fail_slot(idx, FailureKind::Aborted, "episode closed".to_string(), child);
        }
    }

    /// Release every resource the episode holds and record what happened
    async fn close(&mut self, outcome: &Result<CellOutcome, KernelError>) {
        if !self.children.is_empty() || self.episode.running() > 0 {
            self.shutdown_children().await;
        }
        self.ctx.bus.dissolve_group(self.episode.group);
        for child in self.ctx.arena.children(self.cell.id()) {
            self.ctx.arena.remove_subtree(&child.id);
        }

        let summary = self.episode.summary();
        let confidence = match outcome {
            Ok(CellOutcome::Result(result)) => Some(result.confidence),
            _ => None,
        };
        let degraded = match outcome {
            Ok(CellOutcome::Result(result)) => result.degraded,
            _ => true,
        };
        let record = EpisodeRecord {
            cell_id: self.id().clone(),
            task_id: self.task.id.clone(),
            rounds: self.episode.round,
            accepted: self
                .episode
                .slots
                .iter()
                .filter(|s| s.contribution().is_some())
                .map(|s| s.subtask.id.clone())
                .collect(),
            failed: self
                .episode
                .slots
                .iter()
                .filter_map(|s| {
                    s.failure().map(|(kind, reason)| SlotFailure {
                        subtask: s.subtask.id.clone(),
                        category: kind.category().to_string(),
                        reason: reason.to_string(),
                    })
                })
                .collect(),
            conflicts: self.episode.conflicts.len(),
            degraded,
            confidence,
            finished_at: Utc::now(),
        };
        self.ctx.audit.record(AuditRecord::Episode(record));

        info!(
            cell = %self.id(),
            rounds = self.episode.round,
            accepted = summary.accepted,
            overruled = summary.overruled,
            failed = summary.failed,
            "Episode closed"
        );
        self.cell.emit(KernelEvent::EpisodeFinished {
            cell_id: self.id().clone(),
            rounds: self.episode.round,
            accepted: summary.accepted,
            failed: summary.failed,
            conflicts: self.episode.conflicts.len(),
            degraded,
            timestamp: Utc::now(),
        });
    }
}
