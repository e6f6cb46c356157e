//! Activity dependency graph.
//!
//! Built offline from a ledger in one forward pass. Every edge points from an
//! activity to a strictly older one, so the graph is a DAG ordered by
//! activity id.
//!
//! ```text
//!   1 NewPackage Foo ◄──H── 2 SavePackage Foo
//!        ▲
//!        H (PackageCreation)
//!        │
//!   3 AddActor ◄──H── 4 EditActor ◄──P── 5 EditActor
//! ```

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::activity::{ActivityEvent, ActivityId};
use crate::ledger::ActivityLedger;
use crate::package::{PackageEvent, PackageUpdateType};
use crate::transaction::TransactionEvent;

/// Why an activity depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyReason {
    /// Requires the package to have been created
    PackageCreation,
    /// Requires the rename that gave the package its current name
    PackageRename,
    /// Re-creates a package that an earlier activity deleted
    PackageRemoval,
    /// Requires the object (or its outer) to have been created
    SubobjectCreation,
    /// Re-creates an object that an earlier activity destroyed
    SubobjectRemoval,
    /// Edits something a previous activity also edited
    EditAfterPreviousPackageEdit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyStrength {
    /// The dependent cannot exist without the target
    HardDependency,
    /// Plausible but not certain causal link
    PossibleDependency,
}

impl DependencyStrength {
    /// Traversal cost: hard edges are free, possible edges cost one.
    pub fn cost(self) -> u32 {
        match self {
            DependencyStrength::HardDependency => 0,
            DependencyStrength::PossibleDependency => 1,
        }
    }

    pub fn is_hard(self) -> bool {
        self == DependencyStrength::HardDependency
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyEdge {
    pub target: ActivityId,
    pub reason: DependencyReason,
    pub strength: DependencyStrength,
}

/// One activity and its outgoing (older) and incoming (newer) edges.
#[derive(Debug, Clone, Default)]
pub struct ActivityNode {
    pub activity_id: ActivityId,
    pub dependencies: Vec<DependencyEdge>,
    /// Newer activities depending on this one, with the edge strength
    pub dependents: Vec<(ActivityId, DependencyStrength)>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Activity {0} is not in the graph")]
    UnknownActivity(ActivityId),
    #[error("Activity {from} cannot depend on {target}: dependencies must point to older activities")]
    ForwardDependency { from: ActivityId, target: ActivityId },
}

#[derive(Debug, Clone, Default)]
pub struct ActivityDependencyGraph {
    nodes: BTreeMap<ActivityId, ActivityNode>,
}

impl ActivityDependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, activity_id: ActivityId) {
        self.nodes.entry(activity_id).or_insert_with(|| ActivityNode {
            activity_id,
            ..ActivityNode::default()
        });
    }

    /// Add an edge `from -> target`.
    ///
    /// An existing edge to the same target is kept once, with the stronger
    /// strength (and that edge's reason).
    pub fn add_dependency(
        &mut self,
        from: ActivityId,
        target: ActivityId,
        reason: DependencyReason,
        strength: DependencyStrength,
    ) -> Result<(), GraphError> {
        if target >= from {
            return Err(GraphError::ForwardDependency { from, target });
        }
        if !self.nodes.contains_key(&target) {
            return Err(GraphError::UnknownActivity(target));
        }
        let node = self
            .nodes
            .get_mut(&from)
            .ok_or(GraphError::UnknownActivity(from))?;

        if let Some(existing) = node.dependencies.iter_mut().find(|e| e.target == target) {
            if strength.is_hard() && !existing.strength.is_hard() {
                existing.strength = strength;
                existing.reason = reason;
            } else {
                return Ok(());
            }
        } else {
            node.dependencies.push(DependencyEdge {
                target,
                reason,
                strength,
            });
        }

        if let Some(target_node) = self.nodes.get_mut(&target) {
            match target_node.dependents.iter_mut().find(|(id, _)| *id == from) {
                Some(entry) => entry.1 = strength,
                None => target_node.dependents.push((from, strength)),
            }
        }
        Ok(())
    }

    pub fn node(&self, activity_id: ActivityId) -> Option<&ActivityNode> {
        self.nodes.get(&activity_id)
    }

    pub fn contains(&self, activity_id: ActivityId) -> bool {
        self.nodes.contains_key(&activity_id)
    }

    /// The edge from `from` to `target`, if any.
    pub fn edge(&self, from: ActivityId, target: ActivityId) -> Option<&DependencyEdge> {
        self.nodes
            .get(&from)?
            .dependencies
            .iter()
            .find(|e| e.target == target)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ActivityNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.dependencies.len()).sum()
    }
}

// ─── Builder ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageOrigin {
    /// `Added` event
    Created,
    /// First seen through a `Saved`/`Dummy` event
    ImplicitlyCreated,
    /// Got its current name from a rename
    Renamed,
}

#[derive(Debug, Clone, Copy)]
struct PackageRecord {
    activity_id: ActivityId,
    origin: PackageOrigin,
}

impl PackageRecord {
    fn reason(&self) -> DependencyReason {
        match self.origin {
            PackageOrigin::Renamed => DependencyReason::PackageRename,
            _ => DependencyReason::PackageCreation,
        }
    }
}

/// Forward-pass state of the graph builder.
#[derive(Default)]
struct DependencyTracker {
    /// Package name -> activity that created or renamed it
    packages: HashMap<String, PackageRecord>,
    /// Package name -> activity that deleted it
    removed_packages: HashMap<String, ActivityId>,
    /// Object path -> activity that created it
    objects: HashMap<String, ActivityId>,
    /// Object path -> activity that destroyed it
    removed_objects: HashMap<String, ActivityId>,
    /// Object path -> last activity that touched it
    last_touch: HashMap<String, ActivityId>,
}

impl DependencyTracker {
    /// Move every object record of `from` under `to`.
    fn rebase_objects(&mut self, from: &str, to: &str) {
        let prefix = format!("{from}:");
        for map in [&mut self.objects, &mut self.removed_objects, &mut self.last_touch] {
            let moved: Vec<(String, ActivityId)> = map
                .iter()
                .filter(|(path, _)| path.starts_with(&prefix))
                .map(|(path, id)| (path.clone(), *id))
                .collect();
            for (path, id) in moved {
                map.remove(&path);
                map.insert(format!("{to}:{}", &path[prefix.len()..]), id);
            }
        }
    }

    fn forget_objects(&mut self, package: &str) {
        let prefix = format!("{package}:");
        self.objects.retain(|path, _| !path.starts_with(&prefix));
        self.removed_objects.retain(|path, _| !path.starts_with(&prefix));
        self.last_touch.retain(|path, _| !path.starts_with(&prefix));
    }
}

/// Build the dependency graph of every activity in `ledger`.
pub fn build_dependency_graph(ledger: &ActivityLedger) -> ActivityDependencyGraph {
    let mut graph = ActivityDependencyGraph::new();
    let mut tracker = DependencyTracker::default();

    for activity in ledger.iter() {
        let id = activity.activity_id;
        graph.add_node(id);
        match ledger.event(activity) {
            Some(ActivityEvent::Package(event)) => {
                track_package(&mut graph, &mut tracker, id, &event);
            }
            Some(ActivityEvent::Transaction(event)) => {
                track_transaction(&mut graph, &mut tracker, id, &event);
            }
            Some(_) => {}
            None => log::warn!("Activity {id} has no event row; treated as independent"),
        }
    }

    log::debug!(
        "Built dependency graph: {} nodes, {} edges",
        graph.len(),
        graph.edge_count()
    );
    graph
}

fn link(
    graph: &mut ActivityDependencyGraph,
    from: ActivityId,
    target: ActivityId,
    reason: DependencyReason,
    strength: DependencyStrength,
) {
    if target == from {
        return;
    }
    if let Err(e) = graph.add_dependency(from, target, reason, strength) {
        log::warn!("Skipping dependency edge: {e}");
    }
}

fn track_package(
    graph: &mut ActivityDependencyGraph,
    tracker: &mut DependencyTracker,
    id: ActivityId,
    event: &PackageEvent,
) {
    use DependencyStrength::{HardDependency, PossibleDependency};

    let name = event.info.package_name.clone();
    match event.info.update_type {
        PackageUpdateType::Added => {
            if let Some(removal) = tracker.removed_packages.remove(&name) {
                link(graph, id, removal, DependencyReason::PackageRemoval, HardDependency);
            }
            tracker.packages.insert(
                name,
                PackageRecord {
                    activity_id: id,
                    origin: PackageOrigin::Created,
                },
            );
        }
        PackageUpdateType::Saved | PackageUpdateType::Dummy => match tracker.packages.get(&name) {
            Some(record) => {
                link(graph, id, record.activity_id, record.reason(), HardDependency);
            }
            None => {
                // Saving an unknown package creates it
                if let Some(removal) = tracker.removed_packages.remove(&name) {
                    link(graph, id, removal, DependencyReason::PackageRemoval, HardDependency);
                }
                tracker.packages.insert(
                    name,
                    PackageRecord {
                        activity_id: id,
                        origin: PackageOrigin::ImplicitlyCreated,
                    },
                );
            }
        },
        PackageUpdateType::Renamed => {
            let destination = event.info.resulting_package_name().to_string();
            let source = tracker.packages.remove(&name);
            if let Some(source) = source {
                link(graph, id, source.activity_id, source.reason(), HardDependency);
            }
            if let Some(dest) = tracker.packages.get(&destination).copied() {
                link(graph, id, dest.activity_id, DependencyReason::PackageRename, PossibleDependency);
                // Save-then-rename: the saved destination content came from the source
                if let (PackageOrigin::ImplicitlyCreated, Some(source)) = (dest.origin, source) {
                    link(
                        graph,
                        dest.activity_id,
                        source.activity_id,
                        DependencyReason::PackageRename,
                        PossibleDependency,
                    );
                }
            }
            tracker.removed_packages.remove(&destination);
            tracker.forget_objects(&destination);
            tracker.rebase_objects(&name, &destination);
            tracker.packages.insert(
                destination,
                PackageRecord {
                    activity_id: id,
                    origin: PackageOrigin::Renamed,
                },
            );
        }
        PackageUpdateType::Deleted => {
            if let Some(record) = tracker.packages.remove(&name) {
                link(graph, id, record.activity_id, record.reason(), HardDependency);
            }
            tracker.forget_objects(&name);
            tracker.removed_packages.insert(name, id);
        }
    }
}

fn track_transaction(
    graph: &mut ActivityDependencyGraph,
    tracker: &mut DependencyTracker,
    id: ActivityId,
    event: &TransactionEvent,
) {
    use DependencyStrength::{HardDependency, PossibleDependency};

    for package in &event.modified_packages {
        if let Some(record) = tracker.packages.get(package) {
            link(graph, id, record.activity_id, record.reason(), HardDependency);
        }
    }

    let mut objects: Vec<_> = event.exported_objects.iter().collect();
    objects.sort_by_key(|o| o.object_path_depth);

    for object in objects {
        let path = object.object_id.object_path();

        if object.is_new {
            if let Some(removal) = tracker.removed_objects.remove(&path) {
                link(graph, id, removal, DependencyReason::SubobjectRemoval, HardDependency);
            } else if let Some(creation) = tracker.objects.get(&path) {
                link(graph, id, *creation, DependencyReason::SubobjectCreation, HardDependency);
            }
            let outer = object
                .object_id
                .outer_object_path()
                .and_then(|outer| tracker.objects.get(&outer).copied());
            match outer {
                Some(outer) => {
                    link(graph, id, outer, DependencyReason::SubobjectCreation, HardDependency);
                }
                None => {
                    if let Some(record) = tracker.packages.get(&object.object_id.package_name) {
                        link(graph, id, record.activity_id, record.reason(), HardDependency);
                    }
                }
            }
            tracker.objects.insert(path.clone(), id);
        } else if object.is_pending_kill {
            if let Some(creation) = tracker.objects.remove(&path) {
                link(graph, id, creation, DependencyReason::SubobjectCreation, HardDependency);
            }
            tracker.removed_objects.insert(path.clone(), id);
        } else {
            if let Some(creation) = tracker.objects.get(&path) {
                link(graph, id, *creation, DependencyReason::SubobjectCreation, HardDependency);
            }
            // Label-only renames stay possible, like any other plain edit
            if let Some(previous) = tracker.last_touch.get(&path) {
                link(
                    graph,
                    id,
                    *previous,
                    DependencyReason::EditAfterPreviousPackageEdit,
                    PossibleDependency,
                );
            }
        }

        tracker.last_touch.insert(path, id);
    }
}
