//! Serial lanes and named group limits
//!
//! `NotInParallel` members of one key form a lane: a totally ordered queue
//! dispatched strictly front-first, one runner at a time. `ParallelGroup`
//! members share a named semaphore capped below the global pool.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::models::ParallelConstraint;

struct Lane {
    queue: VecDeque<usize>,
    busy: bool,
}

/// Mutual-exclusion lanes for `NotInParallel` tests.
///
/// Units are queued by ascending declared order, ties broken by discovery
/// index, and only the front of an idle lane is dispatchable. Units that
/// resolve without running (skipped, cancelled) must be removed so the lane
/// keeps draining.
pub(crate) struct SerialLanes {
    lanes: HashMap<String, Lane>,
    membership: HashMap<usize, String>,
}

impl SerialLanes {
    pub(crate) fn build<'a>(
        constraints: impl Iterator<Item = (usize, &'a ParallelConstraint)>,
    ) -> Self {
        let mut members: HashMap<String, Vec<(i32, usize)>> = HashMap::new();
        let mut membership = HashMap::new();

        for (index, constraint) in constraints {
            if let Some(key) = constraint.lane_key() {
                members
                    .entry(key.to_string())
                    .or_default()
                    .push((constraint.lane_order(), index));
                membership.insert(index, key.to_string());
            }
        }

        let lanes = members
            .into_iter()
            .map(|(key, mut entries)| {
                entries.sort();
                let queue = entries.into_iter().map(|(_, index)| index).collect();
                (key, Lane { queue, busy: false })
            })
            .collect();

        Self { lanes, membership }
    }

    /// Whether `index` may start now. Claims the lane on success; units
    /// outside every lane always succeed.
    pub(crate) fn try_claim(&mut self, index: usize) -> bool {
        let Some(key) = self.membership.get(&index) else {
            return true;
        };
        let Some(lane) = self.lanes.get_mut(key) else {
            return true;
        };
        if lane.busy || lane.queue.front() != Some(&index) {
            return false;
        }
        lane.queue.pop_front();
        lane.busy = true;
        true
    }

    /// A claimed unit finished; the lane may dispatch its next member.
    pub(crate) fn release(&mut self, index: usize) {
        if let Some(key) = self.membership.get(&index) {
            if let Some(lane) = self.lanes.get_mut(key) {
                lane.busy = false;
            }
        }
    }

    /// Drop a unit that will never run so it cannot block the lane.
    pub(crate) fn remove(&mut self, index: usize) {
        if let Some(key) = self.membership.remove(&index) {
            if let Some(lane) = self.lanes.get_mut(&key) {
                lane.queue.retain(|&queued| queued != index);
            }
        }
    }
}

/// Capped concurrency for named parallel groups.
///
/// The first descriptor declaring a limit for a name wins; conflicting
/// later declarations are logged and ignored. Groups without a limit only
/// share the global pool and carry no semaphore.
pub(crate) struct GroupLimits {
    groups: HashMap<String, Arc<Semaphore>>,
}

impl GroupLimits {
    pub(crate) fn build<'a>(constraints: impl Iterator<Item = &'a ParallelConstraint>) -> Self {
        let mut declared: HashMap<String, Option<NonZeroUsize>> = HashMap::new();

        for constraint in constraints {
            if let ParallelConstraint::ParallelGroup { name, limit } = constraint {
                match declared.get(name).copied() {
                    None => {
                        declared.insert(name.clone(), *limit);
                    }
                    Some(existing) if existing != *limit => {
                        warn!(
                            group = %name,
                            kept = ?existing,
                            ignored = ?limit,
                            "conflicting parallel group limits, keeping the first"
                        );
                    }
                    Some(_) => {}
                }
            }
        }

        let groups = declared
            .into_iter()
            .filter_map(|(name, limit)| {
                limit.map(|limit| (name, Arc::new(Semaphore::new(limit.get()))))
            })
            .collect();

        Self { groups }
    }

    pub(crate) fn semaphore(&self, constraint: &ParallelConstraint) -> Option<Arc<Semaphore>> {
        match constraint {
            ParallelConstraint::ParallelGroup { name, .. } => self.groups.get(name).cloned(),
            _ => None,
        }
    }
}
