//! Client transaction manager.
//!
//! Outgoing: local edits are buffered per transaction and turned into wire
//! events on the end-of-frame tick.
//!
//! ```text
//! Started ──► (changes, snapshot)* ──► Finalized ─► TransactionFinalizedEvent (reliable)
//!                                  └─► Canceled ──► dropped, or finalized with
//!                                                   `canceled` if a snapshot went out
//! ```
//!
//! Incoming: remote transactions are applied in two phases. Objects are
//! resolved or created parents first, then their data is written.
//!
//! Rejection: property values captured by pre-change notifications are
//! written back, objects created by the transaction are destroyed and
//! objects it destroyed are revived. Values overwritten since by an
//! admitted remote transaction are left alone.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

use ensemble_core::{
    EndpointId, EventId, ExportedObject, ObjectId, ObjectPayload, ObjectWorld, PackageInfo,
    PackageUpdateType, TransactionEvent,
};

use crate::config::TransactionManagerConfig;
use crate::protocol::{Payload, SyncMessage, TransactionFinalizedEvent, TransactionSnapshotEvent};

/// One object-changed notification from the local editor.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectChange {
    pub object_id: ObjectId,
    /// Changed root properties
    pub changed_properties: Vec<String>,
    pub is_new: bool,
    pub is_pending_kill: bool,
    pub annotation: Option<Vec<u8>>,
}

impl ObjectChange {
    pub fn edited(object_id: ObjectId, properties: &[&str]) -> Self {
        Self {
            object_id,
            changed_properties: properties.iter().map(|p| p.to_string()).collect(),
            is_new: false,
            is_pending_kill: false,
            annotation: None,
        }
    }

    pub fn created(object_id: ObjectId) -> Self {
        Self {
            is_new: true,
            ..Self::edited(object_id, &[])
        }
    }

    pub fn destroyed(object_id: ObjectId) -> Self {
        Self {
            is_pending_kill: true,
            ..Self::edited(object_id, &[])
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Ongoing,
    Finalized,
    Canceled,
}

#[derive(Debug, Clone)]
struct TrackedObject {
    object_id: ObjectId,
    changed: BTreeSet<String>,
    is_new: bool,
    is_pending_kill: bool,
    annotation: Option<Vec<u8>>,
}

/// State of one object before a transaction first touched it.
#[derive(Debug, Clone)]
struct Baseline {
    existed: bool,
    properties: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
enum Rollback {
    Destroy,
    Restore {
        revive: bool,
        properties: BTreeMap<String, Vec<u8>>,
    },
}

/// A finalized transaction the server has not admitted yet.
#[derive(Debug)]
struct PendingAdmission {
    packages: BTreeSet<String>,
    rollback: BTreeMap<String, (ObjectId, Rollback)>,
}

#[derive(Debug)]
struct OngoingTransaction {
    transaction_id: Uuid,
    operation_id: Uuid,
    title: String,
    state: TransactionState,
    objects: BTreeMap<String, TrackedObject>,
    baselines: BTreeMap<String, Baseline>,
    /// Paths changed since the last snapshot
    snapshot_pending: BTreeSet<String>,
    has_notified_snapshot: bool,
    last_snapshot: Option<Instant>,
}

impl OngoingTransaction {
    fn new(transaction_id: Uuid, title: String) -> Self {
        Self {
            transaction_id,
            operation_id: Uuid::new_v4(),
            title,
            state: TransactionState::Ongoing,
            objects: BTreeMap::new(),
            baselines: BTreeMap::new(),
            snapshot_pending: BTreeSet::new(),
            has_notified_snapshot: false,
            last_snapshot: None,
        }
    }

    fn record(&mut self, change: ObjectChange) {
        let path = change.object_id.object_path();
        let tracked = self
            .objects
            .entry(path.clone())
            .or_insert_with(|| TrackedObject {
                object_id: change.object_id.clone(),
                changed: BTreeSet::new(),
                is_new: false,
                is_pending_kill: false,
                annotation: None,
            });
        tracked.changed.extend(change.changed_properties);
        tracked.is_new |= change.is_new;
        // Latest notification wins: a revived object is no longer pending kill
        tracked.is_pending_kill = change.is_pending_kill;
        if change.annotation.is_some() {
            tracked.annotation = change.annotation;
        }
        self.snapshot_pending.insert(path);
    }

    /// What undoes this transaction locally, per object path.
    fn rollback(&self) -> BTreeMap<String, (ObjectId, Rollback)> {
        let mut rollback = BTreeMap::new();
        for (path, tracked) in &self.objects {
            let baseline = self.baselines.get(path);
            let existed = baseline.map_or(!tracked.is_new, |b| b.existed);
            let properties = baseline.map(|b| b.properties.clone()).unwrap_or_default();
            let action = match (existed, tracked.is_pending_kill) {
                (false, true) => continue,
                (false, false) => Rollback::Destroy,
                (true, revive) if revive || !properties.is_empty() => Rollback::Restore { revive, properties },
                (true, _) => continue,
            };
            rollback.insert(path.clone(), (tracked.object_id.clone(), action));
        }
        rollback
    }

    fn snapshot_due(&self, now: Instant, min_interval: Duration) -> bool {
        !self.snapshot_pending.is_empty()
            && self
                .last_snapshot
                .is_none_or(|last| now.duration_since(last) >= min_interval)
    }
}

/// Result of applying one remote transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub destroyed: usize,
    pub skipped: usize,
}

pub struct TransactionManager {
    endpoint_id: EndpointId,
    config: TransactionManagerConfig,
    ongoing: Vec<OngoingTransaction>,
    /// Finalized and sent, awaiting admission
    awaiting_admission: HashMap<Uuid, PendingAdmission>,
    /// Applied, unsaved transaction event ids per package
    live_transactions: BTreeMap<String, BTreeSet<EventId>>,
    /// Objects whose last shared state is pending kill
    killed: BTreeSet<String>,
}

impl TransactionManager {
    pub fn new(endpoint_id: EndpointId, config: TransactionManagerConfig) -> Self {
        Self {
            endpoint_id,
            config,
            ongoing: Vec::new(),
            awaiting_admission: HashMap::new(),
            live_transactions: BTreeMap::new(),
            killed: BTreeSet::new(),
        }
    }

    // ─── Local capture ────────────────────────────────────────────────

    pub fn on_transaction_started(&mut self, transaction_id: Uuid, title: impl Into<String>) {
        if self.find(transaction_id).is_some() {
            log::warn!("Transaction {transaction_id} started twice");
            return;
        }
        self.ongoing.push(OngoingTransaction::new(transaction_id, title.into()));
    }

    /// Capture the current value of `properties` before the editor changes
    /// them, so a rejection can put them back. Only the first capture of
    /// each property per transaction is kept.
    pub fn on_object_pre_change(
        &mut self,
        world: &ObjectWorld,
        transaction_id: Uuid,
        object_id: &ObjectId,
        properties: &[&str],
    ) {
        let Some(tx) = self.find(transaction_id) else {
            log::warn!("Pre-change in unknown transaction {transaction_id} ignored");
            return;
        };
        if tx.state != TransactionState::Ongoing {
            return;
        }

        let path = object_id.object_path();
        let object = world
            .find(&path)
            .filter(|_| world.is_alive(&path))
            .and_then(|h| world.get(h));
        let baseline = tx.baselines.entry(path).or_insert_with(|| Baseline {
            existed: object.is_some(),
            properties: BTreeMap::new(),
        });
        let Some(object) = object else {
            return;
        };
        for name in properties {
            if baseline.properties.contains_key(*name) {
                continue;
            }
            match object.serialize_property(name) {
                Ok(data) => {
                    baseline.properties.insert(name.to_string(), data);
                }
                Err(e) => log::debug!("Cannot capture {}.{name}: {e}", object_id.object_path()),
            }
        }
    }

    pub fn on_object_changed(&mut self, transaction_id: Uuid, change: ObjectChange) {
        match self.find(transaction_id) {
            Some(tx) if tx.state == TransactionState::Ongoing => tx.record(change),
            Some(_) => log::warn!("Change to closed transaction {transaction_id} ignored"),
            None => log::warn!("Change to unknown transaction {transaction_id} ignored"),
        }
    }

    pub fn on_transaction_finalized(&mut self, transaction_id: Uuid) {
        self.close(transaction_id, TransactionState::Finalized);
    }

    pub fn on_transaction_canceled(&mut self, transaction_id: Uuid) {
        self.close(transaction_id, TransactionState::Canceled);
    }

    fn close(&mut self, transaction_id: Uuid, state: TransactionState) {
        match self.find(transaction_id) {
            Some(tx) => tx.state = state,
            None => log::warn!("Unknown transaction {transaction_id} closed as {state:?}"),
        }
    }

    fn find(&mut self, transaction_id: Uuid) -> Option<&mut OngoingTransaction> {
        self.ongoing
            .iter_mut()
            .find(|tx| tx.transaction_id == transaction_id)
    }

    /// End-of-frame processing: emit finalized, canceled and snapshot events.
    pub fn tick(&mut self, world: &ObjectWorld, now: Instant) -> Vec<SyncMessage> {
        let min_interval = Duration::from_millis(self.config.snapshot_min_interval_ms);
        let mut messages = Vec::new();
        let mut still_ongoing = Vec::with_capacity(self.ongoing.len());

        for mut tx in std::mem::take(&mut self.ongoing) {
            match tx.state {
                TransactionState::Finalized => {
                    let event = build_event(world, &tx, tx.objects.keys(), &self.killed);
                    if event.exported_objects.is_empty() {
                        log::trace!("Transaction {} finalized without changes", tx.transaction_id);
                        continue;
                    }
                    for object in &event.exported_objects {
                        let path = object.object_id.object_path();
                        if object.is_pending_kill {
                            self.killed.insert(path);
                        } else {
                            self.killed.remove(&path);
                        }
                    }
                    self.awaiting_admission.insert(
                        tx.transaction_id,
                        PendingAdmission {
                            packages: event.modified_packages.clone(),
                            rollback: tx.rollback(),
                        },
                    );
                    self.push_message(&mut messages, &TransactionFinalizedEvent { transaction: event });
                }
                TransactionState::Canceled if tx.has_notified_snapshot => {
                    let mut event = build_event(world, &tx, tx.objects.keys(), &self.killed);
                    event.canceled = true;
                    log::debug!("Sending cancellation of snapshotted transaction {}", tx.transaction_id);
                    self.push_message(&mut messages, &TransactionFinalizedEvent { transaction: event });
                }
                TransactionState::Canceled => {
                    log::trace!("Dropping canceled transaction {}", tx.transaction_id);
                }
                TransactionState::Ongoing => {
                    if tx.snapshot_due(now, min_interval) {
                        let event = build_event(world, &tx, tx.snapshot_pending.iter(), &self.killed);
                        tx.snapshot_pending.clear();
                        tx.last_snapshot = Some(now);
                        if !event.exported_objects.is_empty() {
                            tx.has_notified_snapshot = true;
                            self.push_message(&mut messages, &TransactionSnapshotEvent { transaction: event });
                        }
                    }
                    still_ongoing.push(tx);
                }
            }
        }

        self.ongoing = still_ongoing;
        messages
    }

    fn push_message<P: Payload>(&self, messages: &mut Vec<SyncMessage>, payload: &P) {
        match SyncMessage::new(self.endpoint_id, payload) {
            Ok(message) => messages.push(message),
            Err(e) => log::error!("Failed to encode transaction message: {e}"),
        }
    }

    pub fn ongoing_count(&self) -> usize {
        self.ongoing.len()
    }

    // ─── Admission outcome ────────────────────────────────────────────

    /// Our transaction came back as an accepted activity.
    pub fn acknowledge(&mut self, transaction_id: Uuid) -> bool {
        self.awaiting_admission.remove(&transaction_id).is_some()
    }

    /// Our transaction was rejected: revert its objects in `world` and
    /// return the packages to restore to their head revision.
    pub fn handle_rejected(&mut self, world: &mut ObjectWorld, transaction_id: Uuid) -> BTreeSet<String> {
        let Some(pending) = self.awaiting_admission.remove(&transaction_id) else {
            log::warn!("Rejection for unknown transaction {transaction_id}");
            return BTreeSet::new();
        };

        let mut reverted = 0;
        for (path, (object_id, rollback)) in &pending.rollback {
            if !revert_object(world, object_id, rollback) {
                continue;
            }
            reverted += 1;
            match rollback {
                Rollback::Destroy => {
                    self.killed.insert(path.clone());
                }
                Rollback::Restore { revive: true, .. } => {
                    self.killed.remove(path);
                }
                Rollback::Restore { .. } => {}
            }
        }
        log::info!(
            "Transaction {transaction_id} rejected, reverted {reverted} objects, restoring {} packages",
            pending.packages.len()
        );
        pending.packages
    }

    /// An admitted remote change supersedes what our pending rollbacks
    /// would write back.
    fn supersede_rollbacks(&mut self, object: &ExportedObject) {
        let path = object.object_id.object_path();
        for pending in self.awaiting_admission.values_mut() {
            let superseded = match (pending.rollback.get_mut(&path), &object.payload) {
                (None, _) => false,
                (Some(_), _) if object.is_pending_kill || object.is_new => true,
                (Some(_), ObjectPayload::Full(_)) => true,
                (Some((_, Rollback::Restore { revive, properties })), ObjectPayload::Delta(deltas)) => {
                    for delta in deltas {
                        properties.remove(&delta.name);
                    }
                    !*revive && properties.is_empty()
                }
                (Some((_, Rollback::Destroy)), ObjectPayload::Delta(_)) => false,
            };
            if superseded {
                pending.rollback.remove(&path);
            }
        }
    }

    pub fn is_awaiting_admission(&self, transaction_id: Uuid) -> bool {
        self.awaiting_admission.contains_key(&transaction_id)
    }

    // ─── Live transactions ────────────────────────────────────────────

    pub fn record_live_transaction(&mut self, event_id: EventId, packages: &BTreeSet<String>) {
        for package in packages {
            self.live_transactions
                .entry(package.clone())
                .or_default()
                .insert(event_id);
        }
    }

    /// Saves obsolete the live transactions they include; renames and
    /// deletions move or drop them.
    pub fn on_package_event(&mut self, info: &PackageInfo) {
        match info.update_type {
            PackageUpdateType::Saved => {
                if let Some(ids) = self.live_transactions.get_mut(&info.package_name) {
                    ids.retain(|id| *id > info.transaction_event_id_at_save);
                    if ids.is_empty() {
                        self.live_transactions.remove(&info.package_name);
                    }
                }
            }
            PackageUpdateType::Renamed => {
                if let Some(ids) = self.live_transactions.remove(&info.package_name) {
                    self.live_transactions
                        .entry(info.resulting_package_name().to_string())
                        .or_default()
                        .extend(ids);
                }
            }
            PackageUpdateType::Deleted => {
                self.live_transactions.remove(&info.package_name);
            }
            PackageUpdateType::Added | PackageUpdateType::Dummy => {}
        }
    }

    pub fn live_transactions(&self, package_name: &str) -> Vec<EventId> {
        self.live_transactions
            .get(package_name)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    // ─── Remote application ───────────────────────────────────────────

    /// Apply a remote transaction to `world`.
    ///
    /// Objects that cannot be resolved and properties that fail to
    /// deserialize are logged and skipped; the rest still apply.
    pub fn apply_remote_transaction(
        &mut self,
        world: &mut ObjectWorld,
        event: &TransactionEvent,
        is_snapshot: bool,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();

        let mut ordered: Vec<&ExportedObject> = event.exported_objects.iter().collect();
        ordered.sort_by_key(|o| o.object_path_depth);

        if !is_snapshot {
            for object in &ordered {
                self.supersede_rollbacks(object);
                let path = object.object_id.object_path();
                if object.is_pending_kill {
                    self.killed.insert(path);
                } else if object.is_new {
                    self.killed.remove(&path);
                }
            }
        }

        // Phase 1: destroy, then resolve or create parents before children
        let mut resolved = Vec::with_capacity(ordered.len());
        for object in ordered {
            let path = object.object_id.object_path();
            if object.is_pending_kill {
                if world.destroy(&path) {
                    report.destroyed += 1;
                } else {
                    log::debug!("Destroy of unknown object {path} ignored");
                }
                continue;
            }

            let initial_state = match &object.payload {
                ObjectPayload::Full(data) if world.find(&path).is_none() => Some(data.as_slice()),
                _ => None,
            };
            match world.find_or_create(&object.object_id, object.is_new, initial_state) {
                Ok(handle) => resolved.push((handle, object, initial_state.is_some())),
                Err(e) => {
                    log::warn!("Skipping {path} in transaction {}: {e}", event.transaction_id);
                    report.skipped += 1;
                }
            }
        }

        // Phase 2: data
        for (handle, object, initialised) in resolved {
            let Some(target) = world.get_mut(handle) else {
                report.skipped += 1;
                continue;
            };
            if !is_snapshot || object.annotation.is_some() {
                target.notify_pre_change();
            }
            if !initialised {
                match &object.payload {
                    ObjectPayload::Full(data) => {
                        if let Err(e) = target.deserialize_full(data) {
                            log::warn!("Failed to deserialize {}: {e}", object.object_id.object_path());
                        }
                    }
                    ObjectPayload::Delta(properties) => {
                        for property in properties {
                            if let Err(e) = target.deserialize_property(&property.name, &property.data) {
                                log::warn!(
                                    "Failed to deserialize {}.{}: {e}",
                                    object.object_id.object_path(),
                                    property.name
                                );
                            }
                        }
                    }
                }
            }
            target.notify_post_change();
            report.applied += 1;
        }

        log::debug!(
            "Applied {} transaction {}: {} objects, {} destroyed, {} skipped",
            if is_snapshot { "snapshot of" } else { "finalized" },
            event.transaction_id,
            report.applied,
            report.destroyed,
            report.skipped
        );
        report
    }
}

/// Write a rollback back into `world`. Returns whether anything changed.
fn revert_object(world: &mut ObjectWorld, object_id: &ObjectId, rollback: &Rollback) -> bool {
    let path = object_id.object_path();
    let (revive, properties) = match rollback {
        Rollback::Destroy => return world.destroy(&path),
        Rollback::Restore { revive, properties } => (*revive, properties),
    };

    let handle = match world.find_or_create(object_id, revive, None) {
        Ok(handle) => handle,
        Err(e) => {
            log::warn!("Cannot revert {path}: {e}");
            return false;
        }
    };
    let Some(target) = world.get_mut(handle) else {
        return false;
    };
    target.notify_pre_change();
    for (name, data) in properties {
        if let Err(e) = target.deserialize_property(name, data) {
            log::warn!("Failed to revert {path}.{name}: {e}");
        }
    }
    target.notify_post_change();
    true
}

/// Serialize the given tracked objects of `tx` into a transaction event.
///
/// New objects carry their full state, others only their changed
/// properties. An object revived after a shared kill is exported as new,
/// since peers only revive on creation. Objects that fail to serialize are
/// left out.
fn build_event<'a>(
    world: &ObjectWorld,
    tx: &OngoingTransaction,
    paths: impl Iterator<Item = &'a String>,
    killed: &BTreeSet<String>,
) -> TransactionEvent {
    let mut event = TransactionEvent::new(tx.transaction_id, tx.title.clone());
    event.operation_id = tx.operation_id;

    for path in paths {
        let Some(tracked) = tx.objects.get(path) else {
            continue;
        };

        let is_new = tracked.is_new
            || (!tracked.is_pending_kill && killed.contains(path) && world.is_alive(path));
        let payload = if tracked.is_pending_kill {
            ObjectPayload::Delta(Vec::new())
        } else {
            let Some(object) = world.find(path).and_then(|h| world.get(h)) else {
                log::warn!("Changed object {path} is not in the world");
                continue;
            };
            let serialized = if is_new {
                object.serialize_full().map(ObjectPayload::Full)
            } else {
                let changed: Vec<String> = tracked.changed.iter().cloned().collect();
                object.serialize_delta(&changed).map(ObjectPayload::Delta)
            };
            match serialized {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("Failed to serialize {path}: {e}");
                    continue;
                }
            }
        };

        let mut exported = ExportedObject::new(tracked.object_id.clone(), payload);
        exported.is_new = is_new;
        exported.is_pending_kill = tracked.is_pending_kill;
        exported.annotation = tracked.annotation.clone();
        event.push_object(exported);
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use ensemble_core::{PropertyBag, PropertyBagFactory, SyncObject};
    use serde_json::json;

    const ACTOR: &str = "/Script/Engine.Actor";

    fn world() -> ObjectWorld {
        ObjectWorld::new(Box::new(PropertyBagFactory))
    }

    fn manager() -> TransactionManager {
        TransactionManager::new(Uuid::new_v4(), TransactionManagerConfig::for_testing())
    }

    fn actor(outer: &str, name: &str) -> ObjectId {
        ObjectId::new(ACTOR, "/Game/Map", outer, name)
    }

    fn spawn(world: &mut ObjectWorld, id: &ObjectId, props: &[(&str, serde_json::Value)]) {
        let mut bag = PropertyBag::new(ACTOR);
        for (name, value) in props {
            bag.set(*name, value.clone());
        }
        let state = bag.serialize_full().unwrap();
        world.find_or_create(id, true, Some(&state)).unwrap();
    }

    fn property(world: &ObjectWorld, path: &str, name: &str) -> Option<serde_json::Value> {
        let object = world.get(world.find(path)?)?;
        let bytes = object.serialize_property(name).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    #[test]
    fn test_finalized_sends_delta() {
        let mut world = world();
        let id = actor("", "Cube");
        spawn(&mut world, &id, &[("x", json!(1)), ("y", json!(2))]);

        let mut manager = manager();
        let tx = Uuid::new_v4();
        manager.on_transaction_started(tx, "Move");
        manager.on_object_changed(tx, ObjectChange::edited(id.clone(), &["x"]));
        manager.on_transaction_finalized(tx);

        let messages = manager.tick(&world, Instant::now());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].msg_type, MessageType::TransactionFinalized);
        assert!(messages[0].reliable);

        let event = messages[0]
            .decode_payload::<TransactionFinalizedEvent>()
            .unwrap()
            .transaction;
        assert_eq!(event.transaction_id, tx);
        assert_eq!(event.exported_objects.len(), 1);
        match &event.exported_objects[0].payload {
            ObjectPayload::Delta(props) => {
                assert_eq!(props.len(), 1);
                assert_eq!(props[0].name, "x");
            }
            other => panic!("expected delta, got {other:?}"),
        }
        assert!(manager.is_awaiting_admission(tx));
        assert_eq!(manager.ongoing_count(), 0);
    }

    #[test]
    fn test_new_object_sends_full_state() {
        let mut world = world();
        let id = actor("", "Lamp");
        spawn(&mut world, &id, &[("intensity", json!(5))]);

        let mut manager = manager();
        let tx = Uuid::new_v4();
        manager.on_transaction_started(tx, "Spawn");
        manager.on_object_changed(tx, ObjectChange::created(id));
        manager.on_transaction_finalized(tx);

        let messages = manager.tick(&world, Instant::now());
        let event = messages[0]
            .decode_payload::<TransactionFinalizedEvent>()
            .unwrap()
            .transaction;
        assert!(event.exported_objects[0].is_new);
        assert!(matches!(event.exported_objects[0].payload, ObjectPayload::Full(_)));
        assert!(event.modified_packages.contains("/Game/Map"));
    }

    #[test]
    fn test_snapshot_then_cancel_sends_cancellation() {
        let mut world = world();
        let id = actor("", "Cube");
        spawn(&mut world, &id, &[("x", json!(1))]);

        let mut manager = manager();
        let tx = Uuid::new_v4();
        manager.on_transaction_started(tx, "Drag");
        manager.on_object_changed(tx, ObjectChange::edited(id, &["x"]));

        let snapshot = manager.tick(&world, Instant::now());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].msg_type, MessageType::TransactionSnapshot);
        assert!(!snapshot[0].reliable);

        // Nothing new since the snapshot
        assert!(manager.tick(&world, Instant::now()).is_empty());

        manager.on_transaction_canceled(tx);
        let messages = manager.tick(&world, Instant::now());
        assert_eq!(messages.len(), 1);
        let event = messages[0]
            .decode_payload::<TransactionFinalizedEvent>()
            .unwrap()
            .transaction;
        assert!(event.canceled);
        assert!(!manager.is_awaiting_admission(tx));
    }

    #[test]
    fn test_cancel_without_snapshot_is_silent() {
        let mut world = world();
        let id = actor("", "Cube");
        spawn(&mut world, &id, &[("x", json!(1))]);

        let mut manager = manager();
        let tx = Uuid::new_v4();
        manager.on_transaction_started(tx, "Drag");
        manager.on_object_changed(tx, ObjectChange::edited(id, &["x"]));
        manager.on_transaction_canceled(tx);

        assert!(manager.tick(&world, Instant::now()).is_empty());
        assert_eq!(manager.ongoing_count(), 0);
    }

    #[test]
    fn test_snapshot_throttled() {
        let mut world = world();
        let id = actor("", "Cube");
        spawn(&mut world, &id, &[("x", json!(1))]);

        let mut manager = TransactionManager::new(
            Uuid::new_v4(),
            TransactionManagerConfig {
                snapshot_min_interval_ms: 1000,
            },
        );
        let tx = Uuid::new_v4();
        let start = Instant::now();
        manager.on_transaction_started(tx, "Drag");
        manager.on_object_changed(tx, ObjectChange::edited(id.clone(), &["x"]));
        assert_eq!(manager.tick(&world, start).len(), 1);

        manager.on_object_changed(tx, ObjectChange::edited(id, &["x"]));
        assert!(manager.tick(&world, start + Duration::from_millis(10)).is_empty());
        assert_eq!(manager.tick(&world, start + Duration::from_millis(1500)).len(), 1);
    }

    #[test]
    fn test_apply_creates_parents_first() {
        let mut source = world();
        let parent = actor("", "Parent");
        let child = actor("Parent", "Child");
        spawn(&mut source, &parent, &[("name", json!("p"))]);
        spawn(&mut source, &child, &[("name", json!("c"))]);

        // Child listed first on the wire
        let mut event = TransactionEvent::new(Uuid::new_v4(), "Spawn");
        for id in [&child, &parent] {
            let object = source.get(source.find(&id.object_path()).unwrap()).unwrap();
            let mut exported = ExportedObject::new(id.clone(), ObjectPayload::Full(object.serialize_full().unwrap()));
            exported.is_new = true;
            event.push_object(exported);
        }

        let mut target = world();
        let report = manager().apply_remote_transaction(&mut target, &event, false);
        assert_eq!(report.applied, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(property(&target, &child.object_path(), "name"), Some(json!("c")));
    }

    #[test]
    fn test_missing_ancestor_skips_only_that_object() {
        let mut target = world();
        let sibling = actor("", "Sibling");
        spawn(&mut target, &sibling, &[("x", json!(0))]);

        let mut event = TransactionEvent::new(Uuid::new_v4(), "Edit");
        let mut orphan = ExportedObject::new(actor("Missing", "Orphan"), ObjectPayload::Full(b"{}".to_vec()));
        orphan.is_new = true;
        event.push_object(orphan);
        event.push_object(ExportedObject::new(
            sibling.clone(),
            ObjectPayload::Delta(vec![ensemble_core::PropertyDelta {
                name: "x".into(),
                data: b"7".to_vec(),
            }]),
        ));

        let report = manager().apply_remote_transaction(&mut target, &event, false);
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(property(&target, &sibling.object_path(), "x"), Some(json!(7)));
    }

    #[test]
    fn test_bad_property_does_not_abort() {
        let mut target = world();
        let id = actor("", "Cube");
        spawn(&mut target, &id, &[("x", json!(0)), ("y", json!(0))]);

        let mut event = TransactionEvent::new(Uuid::new_v4(), "Edit");
        event.push_object(ExportedObject::new(
            id.clone(),
            ObjectPayload::Delta(vec![
                ensemble_core::PropertyDelta {
                    name: "x".into(),
                    data: b"not json".to_vec(),
                },
                ensemble_core::PropertyDelta {
                    name: "y".into(),
                    data: b"3".to_vec(),
                },
            ]),
        ));

        let report = manager().apply_remote_transaction(&mut target, &event, false);
        assert_eq!(report.applied, 1);
        assert_eq!(property(&target, &id.object_path(), "x"), Some(json!(0)));
        assert_eq!(property(&target, &id.object_path(), "y"), Some(json!(3)));
    }

    #[test]
    fn test_destroy_applied() {
        let mut target = world();
        let id = actor("", "Cube");
        spawn(&mut target, &id, &[]);

        let mut event = TransactionEvent::new(Uuid::new_v4(), "Delete");
        let mut exported = ExportedObject::new(id.clone(), ObjectPayload::Delta(Vec::new()));
        exported.is_pending_kill = true;
        event.push_object(exported);

        let report = manager().apply_remote_transaction(&mut target, &event, false);
        assert_eq!(report.destroyed, 1);
        assert!(!target.is_alive(&id.object_path()));
        assert_eq!(target.collect_garbage(), 1);
    }

    #[test]
    fn test_live_transactions_obsoleted_by_save() {
        let mut manager = manager();
        let packages: BTreeSet<String> = ["/Game/Map".to_string()].into();
        manager.record_live_transaction(1, &packages);
        manager.record_live_transaction(2, &packages);
        manager.record_live_transaction(3, &packages);

        let mut save = PackageInfo::new("/Game/Map", PackageUpdateType::Saved);
        save.transaction_event_id_at_save = 2;
        manager.on_package_event(&save);
        assert_eq!(manager.live_transactions("/Game/Map"), vec![3]);

        manager.on_package_event(&PackageInfo::renamed("/Game/Map", "/Game/Level"));
        assert!(manager.live_transactions("/Game/Map").is_empty());
        assert_eq!(manager.live_transactions("/Game/Level"), vec![3]);

        manager.on_package_event(&PackageInfo::new("/Game/Level", PackageUpdateType::Deleted));
        assert!(manager.live_transactions("/Game/Level").is_empty());
    }

    #[test]
    fn test_rejection_returns_packages() {
        let mut world = world();
        let id = actor("", "Cube");
        spawn(&mut world, &id, &[("x", json!(1))]);

        let mut manager = manager();
        let tx = Uuid::new_v4();
        manager.on_transaction_started(tx, "Move");
        manager.on_object_changed(tx, ObjectChange::edited(id, &["x"]));
        manager.on_transaction_finalized(tx);
        manager.tick(&world, Instant::now());

        let packages = manager.handle_rejected(&mut world, tx);
        assert_eq!(packages.into_iter().collect::<Vec<_>>(), vec!["/Game/Map".to_string()]);
        assert!(manager.handle_rejected(&mut world, tx).is_empty());
    }

    fn set(world: &mut ObjectWorld, path: &str, name: &str, value: serde_json::Value) {
        let handle = world.find(path).unwrap();
        let data = serde_json::to_vec(&value).unwrap();
        world.get_mut(handle).unwrap().deserialize_property(name, &data).unwrap();
    }

    fn finalize(manager: &mut TransactionManager, world: &ObjectWorld, title: &str, change: ObjectChange) -> TransactionEvent {
        let tx = Uuid::new_v4();
        manager.on_transaction_started(tx, title);
        manager.on_object_changed(tx, change);
        manager.on_transaction_finalized(tx);
        let messages = manager.tick(world, Instant::now());
        messages[0]
            .decode_payload::<TransactionFinalizedEvent>()
            .unwrap()
            .transaction
    }

    #[test]
    fn test_revived_object_sends_full_state() {
        let mut local = world();
        let mut remote = world();
        let id = actor("", "Cube");
        spawn(&mut local, &id, &[("x", json!(3))]);
        spawn(&mut remote, &id, &[("x", json!(3))]);
        let path = id.object_path();

        let mut manager = manager();
        local.destroy(&path);
        let delete = finalize(&mut manager, &local, "Delete", ObjectChange::destroyed(id.clone()));
        assert!(delete.exported_objects[0].is_pending_kill);
        let report = TransactionManager::new(Uuid::new_v4(), TransactionManagerConfig::for_testing())
            .apply_remote_transaction(&mut remote, &delete, false);
        assert_eq!(report.destroyed, 1);
        assert!(!remote.is_alive(&path));

        local.find_or_create(&id, true, None).unwrap();
        let undo = finalize(&mut manager, &local, "Undo Delete", ObjectChange::edited(id.clone(), &["x"]));
        let exported = &undo.exported_objects[0];
        assert!(exported.is_new);
        assert!(!exported.is_pending_kill);
        assert!(matches!(exported.payload, ObjectPayload::Full(_)));

        let report = TransactionManager::new(Uuid::new_v4(), TransactionManagerConfig::for_testing())
            .apply_remote_transaction(&mut remote, &undo, false);
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 0);
        assert!(remote.is_alive(&path));
        assert_eq!(property(&remote, &path, "x"), Some(json!(3)));

        // Once shared as alive, later edits go back to deltas
        let edit = finalize(&mut manager, &local, "Move", ObjectChange::edited(id, &["x"]));
        assert!(!edit.exported_objects[0].is_new);
        assert!(matches!(edit.exported_objects[0].payload, ObjectPayload::Delta(_)));
    }

    #[test]
    fn test_rejection_reverts_properties() {
        let mut world = world();
        let id = actor("", "Cube");
        let path = id.object_path();
        spawn(&mut world, &id, &[("x", json!(1)), ("y", json!(2))]);

        let mut manager = manager();
        let tx = Uuid::new_v4();
        manager.on_transaction_started(tx, "Move");
        manager.on_object_pre_change(&world, tx, &id, &["x", "y"]);
        set(&mut world, &path, "x", json!(9));
        manager.on_object_pre_change(&world, tx, &id, &["x"]);
        set(&mut world, &path, "x", json!(10));
        set(&mut world, &path, "y", json!(9));
        manager.on_object_changed(tx, ObjectChange::edited(id.clone(), &["x", "y"]));
        manager.on_transaction_finalized(tx);
        manager.tick(&world, Instant::now());

        manager.handle_rejected(&mut world, tx);
        assert_eq!(property(&world, &path, "x"), Some(json!(1)));
        assert_eq!(property(&world, &path, "y"), Some(json!(2)));
    }

    #[test]
    fn test_rejection_keeps_admitted_remote_values() {
        let mut world = world();
        let id = actor("", "Cube");
        let path = id.object_path();
        spawn(&mut world, &id, &[("x", json!(1)), ("y", json!(2))]);

        let mut manager = manager();
        let tx = Uuid::new_v4();
        manager.on_transaction_started(tx, "Move");
        manager.on_object_pre_change(&world, tx, &id, &["x", "y"]);
        set(&mut world, &path, "x", json!(9));
        set(&mut world, &path, "y", json!(9));
        manager.on_object_changed(tx, ObjectChange::edited(id.clone(), &["x", "y"]));
        manager.on_transaction_finalized(tx);
        manager.tick(&world, Instant::now());

        // Admitted before ours, delivered before the rejection
        let mut remote = TransactionEvent::new(Uuid::new_v4(), "Nudge");
        remote.push_object(ExportedObject::new(
            id,
            ObjectPayload::Delta(vec![ensemble_core::PropertyDelta {
                name: "x".into(),
                data: b"5".to_vec(),
            }]),
        ));
        manager.apply_remote_transaction(&mut world, &remote, false);

        manager.handle_rejected(&mut world, tx);
        assert_eq!(property(&world, &path, "x"), Some(json!(5)));
        assert_eq!(property(&world, &path, "y"), Some(json!(2)));
    }

    #[test]
    fn test_rejection_undoes_creation_and_deletion() {
        let mut world = world();
        let kept = actor("", "Cube");
        let spawned = actor("", "Lamp");
        spawn(&mut world, &kept, &[("x", json!(1))]);

        let mut manager = manager();
        let tx = Uuid::new_v4();
        manager.on_transaction_started(tx, "Replace");
        manager.on_object_pre_change(&world, tx, &spawned, &[]);
        spawn(&mut world, &spawned, &[]);
        manager.on_object_changed(tx, ObjectChange::created(spawned.clone()));
        world.destroy(&kept.object_path());
        manager.on_object_changed(tx, ObjectChange::destroyed(kept.clone()));
        manager.on_transaction_finalized(tx);
        manager.tick(&world, Instant::now());

        manager.handle_rejected(&mut world, tx);
        assert!(!world.is_alive(&spawned.object_path()));
        assert!(world.is_alive(&kept.object_path()));
        assert_eq!(property(&world, &kept.object_path(), "x"), Some(json!(1)));
    }
}
