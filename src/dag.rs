//! Dependency resolution over step sets
//!
//! Two operations live here: the readiness check, which asks a by-ID lookup
//! whether every dependency of a step has completed, and the topological
//! ordering of an in-memory step set with cycle detection.

use crate::error::{MapflowError, Result};
use crate::models::{Step, StepId, StepState};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

/// By-ID step accessor used by [`is_ready`]
#[async_trait]
pub trait StepLookup: Send + Sync {
    async fn step_by_id(&self, id: StepId) -> Result<Step>;
}

#[async_trait]
impl StepLookup for HashMap<StepId, Step> {
    async fn step_by_id(&self, id: StepId) -> Result<Step> {
        self.get(&id).cloned().ok_or(MapflowError::StepNotFound(id))
    }
}

/// True iff every dependency of `step` resolves to a completed step.
///
/// Fails closed: a lookup error or a missing dependency makes the step not
/// ready. A step without dependencies is always ready.
pub async fn is_ready<L: StepLookup + ?Sized>(step: &Step, lookup: &L) -> bool {
    for &dep_id in &step.dependencies {
        match lookup.step_by_id(dep_id).await {
            Ok(dep) if dep.state == StepState::Completed => {}
            Ok(dep) => {
                debug!(
                    "Step {} waiting on dependency {} (state: {})",
                    step.id, dep_id, dep.state
                );
                return false;
            }
            Err(e) => {
                warn!(
                    "Step {} dependency {} could not be resolved: {}",
                    step.id, dep_id, e
                );
                return false;
            }
        }
    }
    true
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Order steps so that every step comes after all steps it depends on.
///
/// Post-order depth-first traversal in input order, so independent subgraphs
/// keep the caller's order. Dependencies outside `steps` are ignored. A cycle
/// (including a self-dependency) aborts with [`MapflowError::CycleDetected`]
/// and no partial ordering. Duplicate IDs keep their first occurrence.
pub fn topological_order(steps: &[Step]) -> Result<Vec<Step>> {
    let mut index: HashMap<StepId, usize> = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        index.entry(step.id).or_insert(i);
    }

    let mut marks: HashMap<StepId, Mark> = HashMap::with_capacity(steps.len());
    let mut order: Vec<Step> = Vec::with_capacity(steps.len());
    // (index into `steps`, next dependency to visit); doubles as the DFS path
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for (root, step) in steps.iter().enumerate() {
        if marks.contains_key(&step.id) {
            continue;
        }
        marks.insert(step.id, Mark::InProgress);
        stack.push((root, 0));

        while let Some(frame) = stack.last_mut() {
            let (i, next) = *frame;
            let current = &steps[i];

            let Some(dep_id) = current.dependencies.get(next) else {
                marks.insert(current.id, Mark::Done);
                order.push(current.clone());
                stack.pop();
                continue;
            };
            frame.1 += 1;

            let Some(&dep) = index.get(dep_id) else {
                continue;
            };
            match marks.get(dep_id) {
                Some(Mark::Done) => {}
                Some(Mark::InProgress) => {
                    let path: Vec<StepId> = stack.iter().map(|&(i, _)| steps[i].id).collect();
                    return Err(MapflowError::CycleDetected(describe_cycle(&path, *dep_id)));
                }
                None => {
                    marks.insert(*dep_id, Mark::InProgress);
                    stack.push((dep, 0));
                }
            }
        }
    }

    Ok(order)
}

fn describe_cycle(path: &[StepId], repeated: StepId) -> String {
    let start = path.iter().position(|&id| id == repeated).unwrap_or(0);
    path[start..]
        .iter()
        .chain(std::iter::once(&repeated))
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
