//! Append-only activity ledger.
//!
//! The server owns the authoritative ledger; clients keep a cached copy built
//! from replicated activities. Both share this type.
//!
//! ```text
//! append(event) ─► assign activity id + event id ─► sink.persist() ─► commit
//!                                                        │
//!                                                        └─ Err: nothing committed
//! ```
//!
//! Activity ids are strictly increasing and never reused, even after a
//! history rewrite deletes rows.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

use crate::activity::{
    now_millis, Activity, ActivityEvent, ActivityId, ActivityType, ConnectionEvent, EndpointId,
    EventId, LockEvent, SyncActivity,
};
use crate::package::{PackageEvent, PackageUpdateType};
use crate::transaction::TransactionEvent;

/// Error returned by a persistence sink.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Durable backing store for a ledger.
pub trait LedgerSink: Send {
    /// Persist a new activity. The ledger only commits it on `Ok`.
    fn persist(&mut self, activity: &SyncActivity) -> Result<(), SinkError>;

    /// Remove activities deleted by a history rewrite.
    fn remove(&mut self, activity_ids: &[ActivityId]) -> Result<(), SinkError>;
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger write failed: {0}")]
    WriteFailed(String),
    #[error("Activity {got} is out of order (last activity is {last})")]
    OutOfOrder { last: ActivityId, got: ActivityId },
    #[error("Activity not found: {0}")]
    NotFound(ActivityId),
}

/// Latest accepted revision of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageHead {
    pub activity_id: ActivityId,
    pub event_id: EventId,
    pub revision: i64,
}

#[derive(Debug, Clone, Copy)]
struct EventCounters {
    connection: EventId,
    lock: EventId,
    transaction: EventId,
    package: EventId,
}

impl EventCounters {
    fn new() -> Self {
        Self {
            connection: 1,
            lock: 1,
            transaction: 1,
            package: 1,
        }
    }

    fn next(&self, event_type: ActivityType) -> EventId {
        match event_type {
            ActivityType::Connection => self.connection,
            ActivityType::Lock => self.lock,
            ActivityType::Transaction => self.transaction,
            ActivityType::Package => self.package,
        }
    }

    fn observe(&mut self, event_type: ActivityType, event_id: EventId) {
        let slot = match event_type {
            ActivityType::Connection => &mut self.connection,
            ActivityType::Lock => &mut self.lock,
            ActivityType::Transaction => &mut self.transaction,
            ActivityType::Package => &mut self.package,
        };
        *slot = (*slot).max(event_id + 1);
    }
}

/// Session ledger: activity rows plus one event table per activity type.
pub struct ActivityLedger {
    activities: BTreeMap<ActivityId, Activity>,
    connection_events: BTreeMap<EventId, ConnectionEvent>,
    lock_events: BTreeMap<EventId, LockEvent>,
    transaction_events: BTreeMap<EventId, TransactionEvent>,
    package_events: BTreeMap<EventId, PackageEvent>,
    package_heads: HashMap<String, PackageHead>,
    /// Highest revision ever assigned per package name, kept across deletes
    package_revisions: HashMap<String, i64>,
    next_activity_id: ActivityId,
    counters: EventCounters,
    sink: Option<Box<dyn LedgerSink>>,
}

impl Default for ActivityLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLedger {
    /// Create an empty, memory-only ledger.
    pub fn new() -> Self {
        Self {
            activities: BTreeMap::new(),
            connection_events: BTreeMap::new(),
            lock_events: BTreeMap::new(),
            transaction_events: BTreeMap::new(),
            package_events: BTreeMap::new(),
            package_heads: HashMap::new(),
            package_revisions: HashMap::new(),
            next_activity_id: 1,
            counters: EventCounters::new(),
            sink: None,
        }
    }

    /// Create a ledger that persists every append through `sink`.
    pub fn with_sink(sink: Box<dyn LedgerSink>) -> Self {
        let mut ledger = Self::new();
        ledger.sink = Some(sink);
        ledger
    }

    /// Attach a sink after restoring history into the ledger.
    pub fn set_sink(&mut self, sink: Box<dyn LedgerSink>) {
        self.sink = Some(sink);
    }

    /// Append a new activity for `endpoint_id`.
    ///
    /// Package events get their revision assigned here. On sink failure the
    /// activity is not accepted and no id is consumed.
    pub fn append(
        &mut self,
        endpoint_id: EndpointId,
        mut event: ActivityEvent,
    ) -> Result<SyncActivity, LedgerError> {
        let event_type = event.activity_type();
        let event_id = self.counters.next(event_type);

        if let ActivityEvent::Package(package) = &mut event {
            let name = package.info.resulting_package_name().to_string();
            package.revision = self.package_revisions.get(&name).copied().unwrap_or(0) + 1;
        }

        let sync = SyncActivity {
            activity: Activity {
                activity_id: self.next_activity_id,
                endpoint_id,
                event_time: now_millis(),
                event_type,
                event_id,
                ignored: false,
            },
            event,
        };

        if let Some(sink) = self.sink.as_mut() {
            sink.persist(&sync)
                .map_err(|e| LedgerError::WriteFailed(e.to_string()))?;
        }

        self.insert(sync.clone());
        Ok(sync)
    }

    /// Insert an activity produced elsewhere (replication or recovery).
    ///
    /// Returns `Ok(false)` for an already-known id. Ids may skip values
    /// (deleted history) but never go backwards past a known activity.
    pub fn append_synced(&mut self, sync: SyncActivity) -> Result<bool, LedgerError> {
        let id = sync.activity_id();
        if self.activities.contains_key(&id) {
            return Ok(false);
        }
        if id < self.next_activity_id {
            return Err(LedgerError::OutOfOrder {
                last: self.last_activity_id(),
                got: id,
            });
        }
        self.insert(sync);
        Ok(true)
    }

    /// Never hand out ids below `next` (recovery of a ledger whose tail was deleted).
    pub fn reserve_activity_ids(&mut self, next: ActivityId) {
        self.next_activity_id = self.next_activity_id.max(next);
    }

    fn insert(&mut self, sync: SyncActivity) {
        let activity = sync.activity;
        let event_id = activity.event_id;
        self.counters.observe(activity.event_type, event_id);
        self.next_activity_id = self.next_activity_id.max(activity.activity_id + 1);

        match sync.event {
            ActivityEvent::Connection(event) => {
                self.connection_events.insert(event_id, event);
            }
            ActivityEvent::Lock(event) => {
                self.lock_events.insert(event_id, event);
            }
            ActivityEvent::Transaction(event) => {
                self.transaction_events.insert(event_id, event);
            }
            ActivityEvent::Package(event) => {
                let revision = self
                    .package_revisions
                    .entry(event.info.resulting_package_name().to_string())
                    .or_insert(0);
                *revision = (*revision).max(event.revision);
                self.update_package_head(activity.activity_id, event_id, &event);
                self.package_events.insert(event_id, event);
            }
        }
        self.activities.insert(activity.activity_id, activity);
    }

    fn update_package_head(&mut self, activity_id: ActivityId, event_id: EventId, event: &PackageEvent) {
        let head = PackageHead {
            activity_id,
            event_id,
            revision: event.revision,
        };
        match event.info.update_type {
            PackageUpdateType::Deleted => {
                self.package_heads.remove(&event.info.package_name);
            }
            PackageUpdateType::Renamed => {
                self.package_heads.remove(&event.info.package_name);
                self.package_heads
                    .insert(event.info.resulting_package_name().to_string(), head);
            }
            _ => {
                self.package_heads.insert(event.info.package_name.clone(), head);
            }
        }
    }

    /// Delete a set of activities and their event rows.
    pub fn delete_activities(&mut self, activity_ids: &BTreeSet<ActivityId>) -> Result<usize, LedgerError> {
        let existing: Vec<ActivityId> = activity_ids
            .iter()
            .copied()
            .filter(|id| self.activities.contains_key(id))
            .collect();
        if existing.is_empty() {
            return Ok(0);
        }

        if let Some(sink) = self.sink.as_mut() {
            sink.remove(&existing)
                .map_err(|e| LedgerError::WriteFailed(e.to_string()))?;
        }

        for id in &existing {
            if let Some(activity) = self.activities.remove(id) {
                match activity.event_type {
                    ActivityType::Connection => {
                        self.connection_events.remove(&activity.event_id);
                    }
                    ActivityType::Lock => {
                        self.lock_events.remove(&activity.event_id);
                    }
                    ActivityType::Transaction => {
                        self.transaction_events.remove(&activity.event_id);
                    }
                    ActivityType::Package => {
                        self.package_events.remove(&activity.event_id);
                    }
                }
            }
        }

        self.rebuild_package_heads();
        Ok(existing.len())
    }

    /// Delete every activity up to and including `last`.
    pub fn delete_prefix(&mut self, last: ActivityId) -> Result<usize, LedgerError> {
        let ids: BTreeSet<ActivityId> = self.activities.range(..=last).map(|(id, _)| *id).collect();
        self.delete_activities(&ids)
    }

    fn rebuild_package_heads(&mut self) {
        self.package_heads.clear();
        let packages: Vec<(ActivityId, EventId)> = self
            .activities
            .values()
            .filter(|a| a.event_type == ActivityType::Package)
            .map(|a| (a.activity_id, a.event_id))
            .collect();
        for (activity_id, event_id) in packages {
            if let Some(event) = self.package_events.get(&event_id).cloned() {
                self.update_package_head(activity_id, event_id, &event);
            }
        }
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn activity(&self, activity_id: ActivityId) -> Option<&Activity> {
        self.activities.get(&activity_id)
    }

    /// Event row of an activity.
    pub fn event(&self, activity: &Activity) -> Option<ActivityEvent> {
        let id = activity.event_id;
        match activity.event_type {
            ActivityType::Connection => self.connection_events.get(&id).cloned().map(ActivityEvent::Connection),
            ActivityType::Lock => self.lock_events.get(&id).cloned().map(ActivityEvent::Lock),
            ActivityType::Transaction => self.transaction_events.get(&id).cloned().map(ActivityEvent::Transaction),
            ActivityType::Package => self.package_events.get(&id).cloned().map(ActivityEvent::Package),
        }
    }

    /// Activity joined with its event row.
    pub fn sync_activity(&self, activity_id: ActivityId) -> Option<SyncActivity> {
        let activity = self.activities.get(&activity_id)?;
        let event = self.event(activity)?;
        Some(SyncActivity {
            activity: activity.clone(),
            event,
        })
    }

    pub fn transaction_event(&self, event_id: EventId) -> Option<&TransactionEvent> {
        self.transaction_events.get(&event_id)
    }

    pub fn package_event(&self, event_id: EventId) -> Option<&PackageEvent> {
        self.package_events.get(&event_id)
    }

    /// Activities in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Activity> {
        self.activities.values()
    }

    /// Ids of all activities with `activity_id >= first`.
    pub fn activity_ids_from(&self, first: ActivityId) -> Vec<ActivityId> {
        self.activities.range(first..).map(|(id, _)| *id).collect()
    }

    /// Highest known activity id, 0 when empty.
    pub fn last_activity_id(&self) -> ActivityId {
        self.activities.keys().next_back().copied().unwrap_or(0)
    }

    /// Id the next appended activity will receive.
    pub fn next_activity_id(&self) -> ActivityId {
        self.next_activity_id
    }

    /// Highest transaction event id, 0 when none.
    pub fn last_transaction_event_id(&self) -> EventId {
        self.transaction_events.keys().next_back().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    pub fn package_head(&self, package_name: &str) -> Option<PackageHead> {
        self.package_heads.get(package_name).copied()
    }

    pub fn head_revision(&self, package_name: &str) -> Option<i64> {
        self.package_heads.get(package_name).map(|h| h.revision)
    }

    /// Event of the head revision of a package.
    pub fn head_package(&self, package_name: &str) -> Option<&PackageEvent> {
        let head = self.package_heads.get(package_name)?;
        self.package_events.get(&head.event_id)
    }

    /// Names of all packages with a head revision, sorted.
    pub fn package_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.package_heads.keys().cloned().collect();
        names.sort();
        names
    }
}
