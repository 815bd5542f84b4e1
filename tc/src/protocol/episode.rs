//! Delegation episode state
//!
//! One episode per delegating `process` call. Slots follow the validated plan
//! order; every spawn, retry and verdict for a subtask is recorded on its slot.

use std::collections::HashMap;

use tokio::time::Instant;
use tracing::debug;

use super::plan::ValidatedPlan;
use crate::convergence::ConvergenceDetector;
use crate::domain::{Budget, CellId, ConflictReport, EnvelopeId, Escalation, EscalationKind, PartialResult, PeerGroupId, Subtask};

/// Why a slot ended without an accepted result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Admission,
    Execution,
    Rejected,
    Review,
    Blocked,
    Clarification,
    Unresponsive,
    Budget,
    Aborted,
    ConvergenceVeto,
    DependencyFailed,
}

impl FailureKind {
    /// Failure category used in convergence signatures and audit records
    pub fn category(self) -> &'static str {
        match self {
            Self::Admission => "admission",
            Self::Execution => "execution",
            Self::Rejected => "rejected",
            Self::Review => "review",
            Self::Blocked => "blocked",
            Self::Clarification => "clarification",
            Self::Unresponsive => "unresponsive",
            Self::Budget => "budget",
            Self::Aborted => "aborted",
            Self::ConvergenceVeto => "convergence-veto",
            Self::DependencyFailed => "dependency-failed",
        }
    }

    /// Whether a fresh child could plausibly succeed where this one failed
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Execution | Self::Rejected | Self::Review | Self::Unresponsive | Self::Budget
        )
    }

    pub fn escalation_kind(self) -> EscalationKind {
        match self {
            Self::Blocked => EscalationKind::Blocked,
            Self::Clarification => EscalationKind::ClarificationUnanswered,
            Self::Unresponsive => EscalationKind::ChildUnresponsive,
            Self::Budget => EscalationKind::BudgetCritical,
            Self::ConvergenceVeto => EscalationKind::ConvergenceExhausted,
            Self::Admission
            | Self::Execution
            | Self::Rejected
            | Self::Review
            | Self::Aborted
            | Self::DependencyFailed => EscalationKind::ChildFailed,
        }
    }

    pub fn from_escalation(kind: EscalationKind) -> Self {
        match kind {
            EscalationKind::Blocked => Self::Blocked,
            EscalationKind::ClarificationUnanswered => Self::Clarification,
            EscalationKind::ChildUnresponsive => Self::Unresponsive,
            EscalationKind::BudgetCritical => Self::Budget,
            EscalationKind::ConvergenceExhausted => Self::ConvergenceVeto,
            EscalationKind::ExecutionFailed
            | EscalationKind::ChildFailed
            | EscalationKind::AllChildrenFailed
            | EscalationKind::ConflictUnresolved => Self::Execution,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.category())
    }
}

/// An accepted child result and what conflict resolution needs to rank it
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub cell: CellId,
    pub output: String,
    pub score: f64,
    pub depth: u32,
    pub spawn_seq: u64,
    pub consumed: Budget,
}

/// A child currently working a slot
#[derive(Debug, Clone, PartialEq)]
pub struct RunningChild {
    pub cell: CellId,
    pub started: Instant,
    pub deadline: Instant,
    pub abort_sent: Option<Instant>,

    /// Set when the abort came from a convergence veto
    pub vetoed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlotState {
    Waiting,
    Running(RunningChild),
    Accepted(Contribution),
    Overruled(Contribution),
    Failed { kind: FailureKind, reason: String },
}

/// Per-subtask bookkeeping
#[derive(Debug, Clone)]
pub struct Slot {
    pub subtask: Subtask,
    pub state: SlotState,
    pub spawns: u32,
    pub redelegations: u32,
    pub best_partial: Option<PartialResult>,
    pub progress: f64,
    pub admission_attempt: u32,
    pub not_before: Option<Instant>,

    /// Set when the slot failed after the episode began winding down
    pub failed_winding_down: bool,
}

impl Slot {
    fn new(subtask: Subtask) -> Self {
        Self {
            subtask,
            state: SlotState::Waiting,
            spawns: 0,
            redelegations: 0,
            best_partial: None,
            progress: 0.0,
            admission_attempt: 0,
            not_before: None,
            failed_winding_down: false,
        }
    }

    pub fn running(&self) -> Option<&RunningChild> {
        match &self.state {
            SlotState::Running(child) => Some(child),
            _ => None,
        }
    }

    pub fn running_mut(&mut self) -> Option<&mut RunningChild> {
        match &mut self.state {
            SlotState::Running(child) => Some(child),
            _ => None,
        }
    }

    pub fn contribution(&self) -> Option<&Contribution> {
        match &self.state {
            SlotState::Accepted(c) => Some(c),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<(FailureKind, &str)> {
        match &self.state {
            SlotState::Failed { kind, reason } => Some((*kind, reason.as_str())),
            _ => None,
        }
    }

    /// Whether this slot's best partial may stand in for a result during synthesis
    ///
    /// Only partials forced out of a child qualify: a convergence veto or a
    /// wind-down. Ordinary failures escalate instead.
    pub fn partial_usable(&self) -> bool {
        self.best_partial.is_some()
            && match self.failure() {
                Some((FailureKind::ConvergenceVeto, _)) => true,
                Some(_) => self.failed_winding_down,
                None => false,
            }
    }

    pub fn is_waiting(&self) -> bool {
        self.state == SlotState::Waiting
    }

    pub fn fail(&mut self, kind: FailureKind, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(subtask = %self.subtask.id, %kind, %reason, "Slot::fail: called");
        self.state = SlotState::Failed { kind, reason };
    }

    /// Keep `partial` if it beats the current best
    pub fn offer_partial(&mut self, partial: PartialResult) {
        let better = self
            .best_partial
            .as_ref()
            .is_none_or(|best| partial.confidence >= best.confidence);
        if better {
            self.best_partial = Some(partial);
        }
    }

    /// Put a failed slot back in the queue for re-delegation
    pub fn requeue(&mut self) {
        self.state = SlotState::Waiting;
        self.redelegations += 1;
        self.failed_winding_down = false;
        self.admission_attempt = 0;
        self.not_before = None;
        self.progress = 0.0;
    }
}

/// Counts reported when an episode closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpisodeSummary {
    pub accepted: usize,
    pub overruled: usize,
    pub failed: usize,
}

/// Transient state of one decompose, spawn, review, synthesize cycle
#[derive(Debug)]
pub struct Episode {
    pub owner: CellId,
    pub group: PeerGroupId,
    pub slots: Vec<Slot>,
    pub round: u32,
    pub detector: ConvergenceDetector,
    pub trail: Vec<Escalation>,
    pub conflicts: Vec<ConflictReport>,

    /// Sibling insights and parent instructions handed to later spawns
    pub notes: Vec<String>,
    pub degraded: bool,
    pub winding_down: bool,
    reported_progress: f64,
    questions: HashMap<EnvelopeId, (CellId, EnvelopeId)>,
}

impl Episode {
    pub fn new(owner: CellId, plan: ValidatedPlan, group: PeerGroupId) -> Self {
        debug!(%owner, subtasks = plan.len(), %group, "Episode::new: called");
        Self {
            owner,
            group,
            slots: plan.subtasks().iter().cloned().map(Slot::new).collect(),
            round: 1,
            detector: ConvergenceDetector::new(),
            trail: Vec::new(),
            conflicts: Vec::new(),
            notes: Vec::new(),
            degraded: false,
            winding_down: false,
            reported_progress: 0.0,
            questions: HashMap::new(),
        }
    }

    /// Slot currently run by `cell`
    pub fn slot_of(&self, cell: &CellId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.running().is_some_and(|child| &child.cell == cell))
    }

    fn deps_accepted(&self, slot: &Slot) -> bool {
        slot.subtask.depends_on.iter().all(|dep| {
            self.slots
                .iter()
                .find(|s| &s.subtask.id == dep)
                .is_some_and(|s| s.contribution().is_some())
        })
    }

    /// Waiting slots whose dependencies are accepted and whose deferral has passed, in plan order
    pub fn ready(&self, now: Instant) -> Vec<usize> {
        if self.winding_down {
            return Vec::new();
        }
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_waiting() && s.not_before.is_none_or(|t| t <= now) && self.deps_accepted(s))
            .map(|(i, _)| i)
            .collect()
    }

    /// Earliest deferred admission still pending
    pub fn next_admission(&self) -> Option<Instant> {
        if self.winding_down {
            return None;
        }
        self.slots
            .iter()
            .filter(|s| s.is_waiting() && self.deps_accepted(s))
            .filter_map(|s| s.not_before)
            .min()
    }

    /// Sum of weights still waiting to be spawned; denominator of the allocation fraction
    pub fn remaining_weight(&self) -> f64 {
        self.slots.iter().filter(|s| s.is_waiting()).map(|s| s.subtask.weight).sum()
    }

    pub fn running(&self) -> usize {
        self.slots.iter().filter(|s| s.running().is_some()).count()
    }

    /// Mean completion across slots; finished slots count as complete
    pub fn overall_progress(&self) -> f64 {
        if self.slots.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .slots
            .iter()
            .map(|s| match &s.state {
                SlotState::Waiting => 0.0,
                SlotState::Running(_) => s.progress.clamp(0.0, 1.0),
                _ => 1.0,
            })
            .sum();
        total / self.slots.len() as f64
    }

    /// Next quarter step of overall progress not yet reported upward
    pub fn progress_step(&mut self) -> Option<f64> {
        let step = (self.overall_progress() * 4.0).floor() / 4.0;
        if step > self.reported_progress {
            self.reported_progress = step;
            Some(step)
        } else {
            None
        }
    }

    /// Record an escalation; a later report from the same origin about the same task replaces the earlier one
    pub fn record_trail(&mut self, escalation: Escalation) {
        match self
            .trail
            .iter_mut()
            .find(|e| e.origin == escalation.origin && e.task_id == escalation.task_id)
        {
            Some(existing) => *existing = escalation,
            None => self.trail.push(escalation),
        }
    }

    /// Fail every slot still waiting; their dependencies never completed
    pub fn fail_orphans(&mut self) -> usize {
        let mut orphaned = 0;
        let finished: HashMap<String, bool> = self
            .slots
            .iter()
            .map(|s| (s.subtask.id.clone(), s.contribution().is_some()))
            .collect();
        for slot in self.slots.iter_mut().filter(|s| s.is_waiting()) {
            let missing: Vec<&str> = slot
                .subtask
                .depends_on
                .iter()
                .filter(|d| !finished.get(*d).copied().unwrap_or(false))
                .map(String::as_str)
                .collect();
            let reason = if missing.is_empty() {
                "episode ended before it was scheduled".to_string()
            } else {
                format!("dependency {} did not complete", missing.join(", "))
            };
            slot.fail(FailureKind::DependencyFailed, reason);
            orphaned += 1;
        }
        orphaned
    }

    /// Remember that `upward` carries `child`'s question `child_question` to our parent
    pub fn track_question(&mut self, upward: EnvelopeId, child: CellId, child_question: EnvelopeId) {
        self.questions.insert(upward, (child, child_question));
    }

    pub fn take_question(&mut self, upward: &EnvelopeId) -> Option<(CellId, EnvelopeId)> {
        self.questions.remove(upward)
    }

    pub fn summary(&self) -> EpisodeSummary {
        let mut summary = EpisodeSummary::default();
        for slot in &self.slots {
            match slot.state {
                SlotState::Accepted(_) => summary.accepted += 1,
                SlotState::Overruled(_) => summary.overruled += 1,
                SlotState::Failed { .. } => summary.failed += 1,
                _ => {}
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn episode(subtasks: Vec<Subtask>) -> Episode {
        Episode::new(
            CellId::from_string("root"),
            ValidatedPlan::new(subtasks).unwrap(),
            PeerGroupId::new(),
        )
    }

    fn accept(slot: &mut Slot, cell: &str) {
        slot.state = SlotState::Accepted(Contribution {
            cell: CellId::from_string(cell),
            output: "ok".into(),
            score: 0.9,
            depth: 1,
            spawn_seq: 1,
            consumed: Budget::from_units(1.0),
        });
    }

    fn run(slot: &mut Slot, cell: &str) {
        let now = Instant::now();
        slot.state = SlotState::Running(RunningChild {
            cell: CellId::from_string(cell),
            started: now,
            deadline: now + Duration::from_secs(1),
            abort_sent: None,
            vetoed: false,
        });
    }

    #[test]
    fn test_ready_respects_dependencies() {
        let mut ep = episode(vec![Subtask::new("a", "A"), Subtask::new("b", "B").depends_on(&["a"])]);
        let now = Instant::now();
        assert_eq!(ep.ready(now), vec![0]);
        accept(&mut ep.slots[0], "cell-a");
        assert_eq!(ep.ready(now), vec![1]);
    }

    #[test]
    fn test_ready_respects_deferral() {
        let mut ep = episode(vec![Subtask::new("a", "A")]);
        let now = Instant::now();
        ep.slots[0].not_before = Some(now + Duration::from_millis(50));
        assert!(ep.ready(now).is_empty());
        assert_eq!(ep.next_admission(), ep.slots[0].not_before);
        assert_eq!(ep.ready(now + Duration::from_millis(60)), vec![0]);
    }

    #[test]
    fn test_remaining_weight_counts_waiting_only() {
        let mut ep = episode(vec![
            Subtask::new("a", "A").with_weight(2.0),
            Subtask::new("b", "B"),
            Subtask::new("c", "C"),
        ]);
        assert_eq!(ep.remaining_weight(), 4.0);
        run(&mut ep.slots[0], "cell-a");
        assert_eq!(ep.remaining_weight(), 2.0);
        assert_eq!(ep.running(), 1);
        assert_eq!(ep.slot_of(&CellId::from_string("cell-a")), Some(0));
    }

    #[test]
    fn test_progress_steps_by_quarter() {
        let mut ep = episode(vec![Subtask::new("a", "A"), Subtask::new("b", "B")]);
        run(&mut ep.slots[0], "cell-a");
        ep.slots[0].progress = 0.3;
        assert_eq!(ep.progress_step(), None);
        ep.slots[0].progress = 0.6;
        assert_eq!(ep.progress_step(), Some(0.25));
        assert_eq!(ep.progress_step(), None);
        accept(&mut ep.slots[0], "cell-a");
        accept(&mut ep.slots[1], "cell-b");
        assert_eq!(ep.progress_step(), Some(1.0));
    }

    #[test]
    fn test_fail_orphans() {
        let mut ep = episode(vec![Subtask::new("a", "A"), Subtask::new("b", "B").depends_on(&["a"])]);
        ep.slots[0].fail(FailureKind::Execution, "boom");
        assert_eq!(ep.fail_orphans(), 1);
        let (kind, reason) = ep.slots[1].failure().unwrap();
        assert_eq!(kind, FailureKind::DependencyFailed);
        assert_eq!(reason, "dependency a did not complete");
        assert_eq!(ep.summary().failed, 2);
    }

    #[test]
    fn test_offer_partial_keeps_best() {
        let mut ep = episode(vec![Subtask::new("a", "A")]);
        let source = CellId::from_string("cell-a");
        let slot = &mut ep.slots[0];
        slot.offer_partial(PartialResult {
            source: source.clone(),
            output: "rough".into(),
            confidence: 0.6,
        });
        slot.offer_partial(PartialResult {
            source: source.clone(),
            output: "worse".into(),
            confidence: 0.2,
        });
        assert_eq!(slot.best_partial.as_ref().unwrap().output, "rough");
    }

    #[test]
    fn test_trail_keeps_latest_report_per_origin() {
        let mut ep = episode(vec![Subtask::new("a", "A"), Subtask::new("b", "B")]);
        let origin = CellId::from_string("cell-a");
        ep.record_trail(Escalation::new(origin.clone(), "a", EscalationKind::ChildFailed, "escalated"));
        ep.record_trail(Escalation::new(origin.clone(), "a", EscalationKind::ExecutionFailed, "tool crashed"));
        ep.record_trail(Escalation::new(CellId::from_string("cell-b"), "b", EscalationKind::Blocked, "no access"));
        assert_eq!(ep.trail.len(), 2);
        assert_eq!(ep.trail[0].kind, EscalationKind::ExecutionFailed);
        assert_eq!(ep.trail[0].reason, "tool crashed");
    }

    #[test]
    fn test_partial_usable_only_when_forced() {
        let mut ep = episode(vec![Subtask::new("a", "A"), Subtask::new("b", "B"), Subtask::new("c", "C")]);
        for slot in &mut ep.slots {
            slot.offer_partial(PartialResult {
                source: CellId::from_string("cell"),
                output: "half".into(),
                confidence: 0.5,
            });
        }
        ep.slots[0].fail(FailureKind::Execution, "boom");
        ep.slots[1].fail(FailureKind::ConvergenceVeto, "looping");
        ep.slots[2].fail(FailureKind::Aborted, "winding down");
        ep.slots[2].failed_winding_down = true;

        assert!(!ep.slots[0].partial_usable());
        assert!(ep.slots[1].partial_usable());
        assert!(ep.slots[2].partial_usable());

        ep.slots[2].requeue();
        assert!(!ep.slots[2].partial_usable());
    }

    #[test]
    fn test_requeue_counts_redelegation() {
        let mut ep = episode(vec![Subtask::new("a", "A")]);
        ep.slots[0].fail(FailureKind::Execution, "boom");
        ep.slots[0].requeue();
        assert!(ep.slots[0].is_waiting());
        assert_eq!(ep.slots[0].redelegations, 1);
    }

    #[test]
    fn test_failure_kinds() {
        assert!(FailureKind::Execution.is_retryable());
        assert!(!FailureKind::Blocked.is_retryable());
        assert!(!FailureKind::ConvergenceVeto.is_retryable());
        assert_eq!(
            FailureKind::from_escalation(EscalationKind::Blocked).escalation_kind(),
            EscalationKind::Blocked
        );
    }

    #[test]
    fn test_question_tracking() {
        let mut ep = episode(vec![Subtask::new("a", "A")]);
        let up = EnvelopeId::new();
        let child_q = EnvelopeId::new();
        ep.track_question(up, CellId::from_string("cell-a"), child_q);
        assert_eq!(ep.take_question(&up), Some((CellId::from_string("cell-a"), child_q)));
        assert_eq!(ep.take_question(&up), None);
    }
}
