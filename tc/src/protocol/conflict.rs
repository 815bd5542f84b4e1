//! Conflict resolution between accepted sibling results
//!
//! Ranking is a total order: higher review score, then shallower depth, then
//! earlier spawn, then lower cell id. `resolve(a, b)` and `resolve(b, a)`
//! always name the same winner.

use std::cmp::Ordering;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{CellId, ConflictReport, Resolution, TieBreak};

/// One side of a conflict
#[derive(Debug, Clone, PartialEq)]
pub struct Contender {
    pub cell: CellId,
    pub subtask: String,
    pub output: String,
    pub score: f64,
    pub depth: u32,
    pub spawn_seq: u64,
}

/// Outcome of ranking two contenders
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict<'a> {
    pub winner: &'a Contender,
    pub loser: &'a Contender,
    pub rule: TieBreak,
}

/// Pick the winner of two conflicting results
pub fn resolve<'a>(a: &'a Contender, b: &'a Contender) -> Verdict<'a> {
    let (ordering, rule) = rank(a, b);
    let (winner, loser) = if ordering == Ordering::Greater { (b, a) } else { (a, b) };
    debug!(winner = %winner.cell, loser = %loser.cell, %rule, "resolve: decided");
    Verdict { winner, loser, rule }
}

/// `Less` means `a` ranks first
fn rank(a: &Contender, b: &Contender) -> (Ordering, TieBreak) {
    let by_score = b.score.total_cmp(&a.score);
    if by_score != Ordering::Equal {
        return (by_score, TieBreak::HigherScore);
    }
    let by_depth = a.depth.cmp(&b.depth);
    if by_depth != Ordering::Equal {
        return (by_depth, TieBreak::ShallowerDepth);
    }
    let by_spawn = a.spawn_seq.cmp(&b.spawn_seq);
    if by_spawn != Ordering::Equal {
        return (by_spawn, TieBreak::EarlierSpawn);
    }
    (a.cell.cmp(&b.cell), TieBreak::LowerId)
}

fn rationale(verdict: &Verdict<'_>) -> String {
    let (w, l) = (verdict.winner, verdict.loser);
    match verdict.rule {
        TieBreak::HigherScore => format!("{} scored {:.2} against {:.2} for {}", w.subtask, w.score, l.score, l.subtask),
        TieBreak::ShallowerDepth => format!(
            "equal scores {:.2}; {} sits at depth {} against {}",
            w.score, w.subtask, w.depth, l.depth
        ),
        TieBreak::EarlierSpawn => format!(
            "equal scores and depth; {} was spawned first (#{} before #{})",
            w.subtask, w.spawn_seq, l.spawn_seq
        ),
        TieBreak::LowerId => format!("indistinguishable on score, depth and spawn order; {} has the lower id", w.cell),
    }
}

/// Report for a conflict that ranking settled
pub fn resolved_report(detected_by: &CellId, a: &Contender, b: &Contender, similarity: f64, threshold: f64) -> ConflictReport {
    let verdict = resolve(a, b);
    ConflictReport {
        id: Uuid::now_v7(),
        detected_by: detected_by.clone(),
        disputants: [a.cell.clone(), b.cell.clone()],
        subtasks: [a.subtask.clone(), b.subtask.clone()],
        similarity: Some(similarity),
        threshold,
        resolution: Resolution::Resolved {
            winner: verdict.winner.cell.clone(),
            loser: verdict.loser.cell.clone(),
            winner_score: verdict.winner.score,
            loser_score: verdict.loser.score,
            rule: verdict.rule,
            rationale: rationale(&verdict),
        },
        losing_output: Some(verdict.loser.output.clone()),
        recorded_at: Utc::now(),
    }
}

/// Report for a pair whose disagreement could not be measured
pub fn unresolved_report(
    detected_by: &CellId,
    a: &Contender,
    b: &Contender,
    threshold: f64,
    reason: impl Into<String>,
) -> ConflictReport {
    ConflictReport {
        id: Uuid::now_v7(),
        detected_by: detected_by.clone(),
        disputants: [a.cell.clone(), b.cell.clone()],
        subtasks: [a.subtask.clone(), b.subtask.clone()],
        similarity: None,
        threshold,
        resolution: Resolution::Unresolved { reason: reason.into() },
        losing_output: None,
        recorded_at: Utc::now(),
    }
}
