//! Plan validation and ordering
//!
//! A plan is accepted only if it is non-empty, every id is unique and
//! non-blank, every dependency names a sibling, weights are positive and the
//! dependency graph has no cycle. Subtasks are then kept in topological order.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::domain::Subtask;
use crate::error::KernelError;

/// A decomposition that passed validation, in dependency order
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPlan {
    subtasks: Vec<Subtask>,
}

impl ValidatedPlan {
    pub fn new(subtasks: Vec<Subtask>) -> Result<Self, KernelError> {
        debug!(count = subtasks.len(), "ValidatedPlan::new: called");
        if subtasks.is_empty() {
            return Err(KernelError::PlanInvalid("plan has no subtasks".to_string()));
        }

        let mut seen = HashSet::new();
        for subtask in &subtasks {
            if subtask.id.trim().is_empty() {
                return Err(KernelError::PlanInvalid(format!("subtask '{}' has a blank id", subtask.title)));
            }
            if !seen.insert(subtask.id.as_str()) {
                return Err(KernelError::PlanInvalid(format!("duplicate subtask id {}", subtask.id)));
            }
            if !(subtask.weight.is_finite() && subtask.weight > 0.0) {
                return Err(KernelError::PlanInvalid(format!(
                    "subtask {} has non-positive weight {}",
                    subtask.id, subtask.weight
                )));
            }
        }
        for subtask in &subtasks {
            if let Some(missing) = subtask.depends_on.iter().find(|d| !seen.contains(d.as_str())) {
                return Err(KernelError::PlanInvalid(format!(
                    "subtask {} depends on unknown {}",
                    subtask.id, missing
                )));
            }
        }

        let order = topological_sort(&subtasks)
            .map_err(|cycle| KernelError::PlanInvalid(format!("dependency cycle: {}", cycle.join(" -> "))))?;
        let mut slots: Vec<Option<Subtask>> = subtasks.into_iter().map(Some).collect();
        let subtasks = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(Self { subtasks })
    }

    /// Subtasks with every dependency ahead of its dependents
    pub fn subtasks(&self) -> &[Subtask] {
        &self.subtasks
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }
}

/// Detect a dependency cycle; returns the path that closes it
fn find_cycle(subtasks: &[Subtask]) -> Option<Vec<String>> {
    let graph: HashMap<&str, &Subtask> = subtasks.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut cycle_path = Vec::new();

    for subtask in subtasks {
        let id = subtask.id.as_str();
        if !visited.contains(id) && has_cycle_dfs(id, &graph, &mut visited, &mut rec_stack, &mut cycle_path) {
            return Some(cycle_path);
        }
    }
    None
}

fn has_cycle_dfs<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a Subtask>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    cycle_path: &mut Vec<String>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    cycle_path.push(node.to_string());

    if let Some(subtask) = graph.get(node) {
        for dep in &subtask.depends_on {
            if !visited.contains(dep.as_str()) {
                if graph.contains_key(dep.as_str()) && has_cycle_dfs(dep.as_str(), graph, visited, rec_stack, cycle_path)
                {
                    return true;
                }
            } else if rec_stack.contains(dep.as_str()) {
                cycle_path.push(dep.clone());
                return true;
            }
        }
    }

    rec_stack.remove(node);
    cycle_path.pop();
    false
}

/// Indices of `subtasks` in execution order (dependencies first, otherwise input order)
fn topological_sort(subtasks: &[Subtask]) -> Result<Vec<usize>, Vec<String>> {
    if let Some(cycle) = find_cycle(subtasks) {
        return Err(cycle);
    }

    let index: HashMap<&str, usize> = subtasks.iter().enumerate().map(|(i, s)| (s.id.as_str(), i)).collect();
    let mut visited = HashSet::new();
    let mut order = Vec::with_capacity(subtasks.len());
    for idx in 0..subtasks.len() {
        topo_dfs(idx, subtasks, &index, &mut visited, &mut order);
    }
    Ok(order)
}

fn topo_dfs(
    idx: usize,
    subtasks: &[Subtask],
    index: &HashMap<&str, usize>,
    visited: &mut HashSet<usize>,
    order: &mut Vec<usize>,
) {
    if !visited.insert(idx) {
        return;
    }
    for dep in &subtasks[idx].depends_on {
        if let Some(&dep_idx) = index.get(dep.as_str()) {
            topo_dfs(dep_idx, subtasks, index, visited, order);
        }
    }
    order.push(idx);
}
