//! History analysis over the dependency graph.
//!
//! Given a set of activities to remove, find every activity that would be
//! affected. Affected activities are split by the weakest link on their
//! cheapest path back to the set:
//!
//! ```text
//!   cost(path) = number of PossibleDependency edges on it
//!
//!   min cost == 0  ─► hard dependency    (must go with the set)
//!   min cost >= 1  ─► possible dependency (user should review)
//! ```
//!
//! The search is a 0-1 BFS over dependents, so each node is settled once
//! with its minimum cost: O(V + E).

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::activity::ActivityId;
use crate::graph::ActivityDependencyGraph;

/// Result of [`analyse_activity_dependencies`]. The two sets are disjoint and
/// never contain the analysed activities themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityDependencies {
    pub hard_dependencies: BTreeSet<ActivityId>,
    pub possible_dependencies: BTreeSet<ActivityId>,
}

impl ActivityDependencies {
    pub fn is_empty(&self) -> bool {
        self.hard_dependencies.is_empty() && self.possible_dependencies.is_empty()
    }

    /// Every activity that has to be deleted together with the requested
    /// ones, optionally widened to the possible dependencies.
    pub fn deletion_set(&self, requested: &BTreeSet<ActivityId>, include_possible: bool) -> BTreeSet<ActivityId> {
        let mut all = requested.clone();
        all.extend(self.hard_dependencies.iter().copied());
        if include_possible {
            all.extend(self.possible_dependencies.iter().copied());
        }
        all
    }
}

/// Compute the transitive dependents of `activities`.
///
/// Ids that are not in the graph are ignored.
pub fn analyse_activity_dependencies(
    graph: &ActivityDependencyGraph,
    activities: &BTreeSet<ActivityId>,
) -> ActivityDependencies {
    let mut best: BTreeMap<ActivityId, u32> = BTreeMap::new();
    let mut queue: VecDeque<ActivityId> = VecDeque::new();

    for &id in activities {
        if graph.contains(id) {
            best.insert(id, 0);
            queue.push_back(id);
        }
    }

    while let Some(id) = queue.pop_front() {
        let cost = best.get(&id).copied().unwrap_or(0);
        let Some(node) = graph.node(id) else {
            continue;
        };
        for &(dependent, strength) in &node.dependents {
            let next = cost + strength.cost();
            let improved = best.get(&dependent).map_or(true, |&known| next < known);
            if improved {
                best.insert(dependent, next);
                if strength.is_hard() {
                    queue.push_front(dependent);
                } else {
                    queue.push_back(dependent);
                }
            }
        }
    }

    let mut result = ActivityDependencies::default();
    for (id, cost) in best {
        if activities.contains(&id) {
            continue;
        }
        if cost == 0 {
            result.hard_dependencies.insert(id);
        } else {
            result.possible_dependencies.insert(id);
        }
    }
    log::debug!(
        "Dependency analysis of {} activities: {} hard, {} possible",
        activities.len(),
        result.hard_dependencies.len(),
        result.possible_dependencies.len()
    );
    result
}
