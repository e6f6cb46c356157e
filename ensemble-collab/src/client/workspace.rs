//! Client workspace: one client's view of the session.
//!
//! ```text
//! SyncMessage ─► handle_message ─► ledger cache ─► pending remote work
//!                                                        │ tick(guard)
//!                                                        ▼
//!                               TransactionManager / PackageManager ─► ObjectWorld, disk
//! local edits ─► TransactionManager / PackageManager ─► outbox ─► server
//! ```
//!
//! Remote work is applied only from `tick`, and only when the suspend guard
//! allows it. Until then it stays queued in arrival order.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::time::Instant;
use uuid::Uuid;

use ensemble_core::{
    ActivityEvent, ActivityId, ActivityLedger, EndpointId, ObjectFactory, ObjectId, ObjectWorld,
    ObserverList, PackageInfo, PackageUpdateType, SuspendGuard, SyncActivity, TransactionEvent,
};

use super::package_manager::{PackageError, PackageManager, PackageReloader};
use super::transaction_manager::{ObjectChange, TransactionManager};
use crate::config::ClientConfig;
use crate::protocol::{
    ClientJoinedEvent, ClientLeftEvent, LockStateChangedEvent, LockType, MessageType,
    PackageRejectedEvent, PackageUpdateEvent, Payload, PlaySessionEvent, PlaySessionEventType,
    ResourceLockRequest, ResourceLockResponse, SyncMessage, TransactionFinalizedEvent,
    TransactionRejectedEvent, TransactionSnapshotEvent, WorkspaceSyncActivityEvent,
    WorkspaceSyncCompletedEvent, WorkspaceSyncEndpointEvent, WorkspaceSyncLockEvent,
    WorkspaceSyncRequestedEvent,
};
use crate::storage::DirectoryFileSharing;

/// Where the client is in the join / sync sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSyncState {
    NotJoined,
    Joining,
    Syncing,
    Synced,
}

/// Notifications for the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkspaceEvent {
    Joined { session_id: Uuid },
    EndpointJoined { endpoint_id: EndpointId, display_name: String },
    EndpointLeft { endpoint_id: EndpointId },
    SyncProgress { remaining: u64 },
    SyncCompleted { last_activity_id: ActivityId },
    ActivityApplied { activity_id: ActivityId },
    TransactionRejected { transaction_id: Uuid },
    PackageRejected { package_name: String },
    PackageRefused { package_name: String, size: u64, limit: u64 },
    LockResponse(ResourceLockResponse),
    LockStateChanged(LockStateChangedEvent),
    PlaySession(PlaySessionEvent),
}

#[derive(Debug)]
enum RemoteWork {
    Activity(ActivityId),
    Snapshot(TransactionEvent),
    /// Canceled after a snapshot: restore what the snapshot changed
    Canceled(TransactionEvent),
    /// Revert our own rejected transaction, in order with remote changes
    Rejected(Uuid),
}

pub struct ClientWorkspace {
    endpoint_id: EndpointId,
    config: ClientConfig,
    session_id: Option<Uuid>,
    sync_state: ClientSyncState,
    sync_remaining: u64,
    ledger: ActivityLedger,
    world: ObjectWorld,
    transactions: TransactionManager,
    packages: PackageManager,
    pending_remote: VecDeque<RemoteWork>,
    endpoints: BTreeMap<EndpointId, String>,
    locks: BTreeMap<String, EndpointId>,
    outbox: Vec<SyncMessage>,
    observers: ObserverList<WorkspaceEvent>,
}

impl ClientWorkspace {
    pub fn new(
        endpoint_id: EndpointId,
        config: ClientConfig,
        factory: Box<dyn ObjectFactory>,
    ) -> Result<Self, PackageError> {
        let mut packages = PackageManager::new(config.packages.clone());
        if let Some(dir) = &config.file_share_dir {
            packages.set_file_sharing(Box::new(DirectoryFileSharing::new(dir)?));
        }

        Ok(Self {
            endpoint_id,
            transactions: TransactionManager::new(endpoint_id, config.transactions.clone()),
            packages,
            config,
            session_id: None,
            sync_state: ClientSyncState::NotJoined,
            sync_remaining: 0,
            ledger: ActivityLedger::new(),
            world: ObjectWorld::new(factory),
            pending_remote: VecDeque::new(),
            endpoints: BTreeMap::new(),
            locks: BTreeMap::new(),
            outbox: Vec::new(),
            observers: ObserverList::new(),
        })
    }

    pub fn set_package_reloader(&mut self, reloader: Box<dyn PackageReloader>) {
        self.packages.set_reloader(reloader);
    }

    fn send<P: Payload>(&mut self, payload: &P) {
        match SyncMessage::new(self.endpoint_id, payload) {
            Ok(message) => self.outbox.push(message),
            Err(e) => log::error!("Failed to encode {:?}: {e}", P::MESSAGE_TYPE),
        }
    }

    fn notify(&mut self, event: WorkspaceEvent) {
        self.observers.notify(&event);
    }

    // ─── Session ──────────────────────────────────────────────────────

    pub fn join(&mut self) {
        self.sync_state = ClientSyncState::Joining;
        let event = ClientJoinedEvent {
            display_name: self.config.display_name.clone(),
            session_id: Uuid::nil(),
        };
        self.send(&event);
    }

    pub fn leave(&mut self) {
        let event = ClientLeftEvent {
            display_name: self.config.display_name.clone(),
        };
        self.send(&event);
        self.sync_state = ClientSyncState::NotJoined;
    }

    /// Ask for every activity after the last cached one.
    pub fn request_sync(&mut self) {
        let request = WorkspaceSyncRequestedEvent {
            first_activity_id_to_sync: self.ledger.last_activity_id() + 1,
            enable_live_sync: self.config.enable_live_sync,
        };
        self.sync_state = ClientSyncState::Syncing;
        self.send(&request);
    }

    // ─── Incoming ─────────────────────────────────────────────────────

    /// Handle one message from the server.
    pub fn handle_message(&mut self, msg: &SyncMessage) {
        let result = match msg.msg_type {
            MessageType::ClientJoined => msg
                .decode_payload::<ClientJoinedEvent>()
                .map(|e| self.handle_joined(msg.endpoint_id, e)),
            MessageType::ClientLeft => msg.decode_payload::<ClientLeftEvent>().map(|_| {
                self.endpoints.remove(&msg.endpoint_id);
                self.locks.retain(|_, owner| *owner != msg.endpoint_id);
                self.notify(WorkspaceEvent::EndpointLeft {
                    endpoint_id: msg.endpoint_id,
                });
            }),
            MessageType::WorkspaceSyncEndpoint => msg
                .decode_payload::<WorkspaceSyncEndpointEvent>()
                .map(|e| {
                    self.endpoints.insert(e.endpoint_id, e.display_name);
                    self.sync_progress(e.num_remaining_sync_events);
                }),
            MessageType::WorkspaceSyncActivity => msg
                .decode_payload::<WorkspaceSyncActivityEvent>()
                .map(|e| {
                    if self.sync_state == ClientSyncState::Syncing {
                        self.sync_progress(e.num_remaining_sync_events);
                    }
                    self.receive_activity(e.activity);
                }),
            MessageType::WorkspaceSyncLock => msg.decode_payload::<WorkspaceSyncLockEvent>().map(|e| {
                self.locks = e
                    .locks
                    .into_iter()
                    .map(|l| (l.resource_name, l.owner))
                    .collect();
                self.sync_progress(e.num_remaining_sync_events);
            }),
            MessageType::WorkspaceSyncCompleted => msg
                .decode_payload::<WorkspaceSyncCompletedEvent>()
                .map(|e| {
                    log::info!("Workspace synced up to activity {}", e.last_activity_id);
                    self.sync_state = ClientSyncState::Synced;
                    self.sync_remaining = 0;
                    self.notify(WorkspaceEvent::SyncCompleted {
                        last_activity_id: e.last_activity_id,
                    });
                }),
            MessageType::TransactionSnapshot => msg
                .decode_payload::<TransactionSnapshotEvent>()
                .map(|e| self.pending_remote.push_back(RemoteWork::Snapshot(e.transaction))),
            MessageType::TransactionFinalized => msg
                .decode_payload::<TransactionFinalizedEvent>()
                .map(|e| {
                    if e.transaction.canceled {
                        self.pending_remote.push_back(RemoteWork::Canceled(e.transaction));
                    } else {
                        log::debug!("Unexpected relayed finalized transaction from {}", msg.endpoint_id);
                    }
                }),
            MessageType::TransactionRejected => msg
                .decode_payload::<TransactionRejectedEvent>()
                .map(|e| self.pending_remote.push_back(RemoteWork::Rejected(e.transaction_id))),
            MessageType::PackageRejected => msg
                .decode_payload::<PackageRejectedEvent>()
                .map(|e| self.handle_package_rejected(e.package_name)),
            MessageType::ResourceLockResponse => msg
                .decode_payload::<ResourceLockResponse>()
                .map(|e| self.notify(WorkspaceEvent::LockResponse(e))),
            MessageType::LockStateChanged => msg
                .decode_payload::<LockStateChangedEvent>()
                .map(|e| self.handle_lock_state_changed(e)),
            MessageType::PlaySession => msg
                .decode_payload::<PlaySessionEvent>()
                .map(|e| self.notify(WorkspaceEvent::PlaySession(e))),
            MessageType::Ping => {
                self.outbox.push(SyncMessage::pong(self.endpoint_id));
                Ok(())
            }
            other => {
                log::trace!("Ignoring {other:?} from {}", msg.endpoint_id);
                Ok(())
            }
        };

        if let Err(e) = result {
            log::warn!("Dropping malformed {:?}: {e}", msg.msg_type);
        }
    }

    fn handle_joined(&mut self, endpoint_id: EndpointId, event: ClientJoinedEvent) {
        if endpoint_id != self.endpoint_id {
            self.endpoints.insert(endpoint_id, event.display_name.clone());
            self.notify(WorkspaceEvent::EndpointJoined {
                endpoint_id,
                display_name: event.display_name,
            });
            return;
        }

        log::info!("Joined session {}", event.session_id);
        if self.session_id.is_some_and(|id| id != event.session_id) {
            log::info!("Session changed, dropping cached history");
            self.ledger = ActivityLedger::new();
        }
        self.session_id = Some(event.session_id);
        self.endpoints.insert(endpoint_id, event.display_name);
        if let Err(e) = self
            .packages
            .load_persisted_state(self.config.persisted_state_path.clone(), event.session_id)
        {
            log::warn!("Ignoring unreadable persisted state: {e}");
        }
        self.notify(WorkspaceEvent::Joined {
            session_id: event.session_id,
        });
        self.request_sync();
    }

    fn sync_progress(&mut self, remaining: u64) {
        self.sync_remaining = remaining;
        self.notify(WorkspaceEvent::SyncProgress { remaining });
    }

    /// Cache the activity and queue it for application.
    fn receive_activity(&mut self, activity: SyncActivity) {
        let activity_id = activity.activity_id();
        match self.ledger.append_synced(activity) {
            Ok(true) => self.pending_remote.push_back(RemoteWork::Activity(activity_id)),
            Ok(false) => log::trace!("Activity {activity_id} already known"),
            Err(e) => log::warn!("Dropping activity {activity_id}: {e}"),
        }
    }

    fn handle_transaction_rejected(&mut self, transaction_id: Uuid) {
        for package_name in self.transactions.handle_rejected(&mut self.world, transaction_id) {
            self.restore_package(&package_name);
        }
        self.notify(WorkspaceEvent::TransactionRejected { transaction_id });
    }

    fn handle_package_rejected(&mut self, package_name: String) {
        log::info!("Package {package_name} rejected by the server");
        self.restore_package(&package_name);
        self.notify(WorkspaceEvent::PackageRejected { package_name });
    }

    fn restore_package(&mut self, package_name: &str) {
        match self.packages.restore_head(&self.ledger, package_name) {
            Ok(()) => {}
            Err(PackageError::NoHeadRevision(_)) => {
                log::debug!("No head revision of {package_name} to restore");
            }
            Err(e) => log::error!("Failed to restore {package_name}: {e}"),
        }
    }

    fn handle_lock_state_changed(&mut self, event: LockStateChangedEvent) {
        for name in &event.resource_names {
            match event.lock_type {
                LockType::Lock => {
                    self.locks.insert(name.clone(), event.owner);
                }
                LockType::Unlock => {
                    self.locks.remove(name);
                }
            }
        }
        self.notify(WorkspaceEvent::LockStateChanged(event));
    }

    // ─── Tick ─────────────────────────────────────────────────────────

    /// End-of-frame processing.
    pub fn tick(&mut self, guard: &dyn SuspendGuard, now: Instant) {
        let messages = self.transactions.tick(&self.world, now);
        self.outbox.extend(messages);

        if guard.can_perform_blocking_action() {
            while let Some(work) = self.pending_remote.pop_front() {
                self.apply_remote(work);
            }
        } else if !self.pending_remote.is_empty() {
            log::trace!("Deferring {} remote changes", self.pending_remote.len());
        }

        let processed = self.packages.process_pending(guard);
        for package_name in &processed.purged {
            self.world.purge_package(package_name);
        }
        if guard.can_hot_reload_or_purge() {
            let collected = self.world.collect_garbage();
            if collected > 0 {
                log::trace!("Collected {collected} destroyed objects");
            }
        }

        if let Err(e) = self.packages.save_persisted_state() {
            log::warn!("Failed to save persisted state: {e}");
        }
    }

    fn apply_remote(&mut self, work: RemoteWork) {
        match work {
            RemoteWork::Activity(activity_id) => self.apply_activity(activity_id),
            RemoteWork::Snapshot(transaction) => {
                self.transactions
                    .apply_remote_transaction(&mut self.world, &transaction, true);
            }
            RemoteWork::Canceled(transaction) => {
                self.transactions
                    .apply_remote_transaction(&mut self.world, &transaction, false);
            }
            RemoteWork::Rejected(transaction_id) => self.handle_transaction_rejected(transaction_id),
        }
    }

    fn apply_activity(&mut self, activity_id: ActivityId) {
        let Some(sync) = self.ledger.sync_activity(activity_id) else {
            return;
        };
        if sync.activity.ignored {
            return;
        }

        match &sync.event {
            ActivityEvent::Transaction(transaction) => {
                if sync.activity.endpoint_id == self.endpoint_id
                    && self.transactions.acknowledge(transaction.transaction_id)
                {
                    log::trace!("Own transaction {} admitted", transaction.transaction_id);
                } else {
                    self.transactions
                        .apply_remote_transaction(&mut self.world, transaction, false);
                }
                self.transactions
                    .record_live_transaction(sync.activity.event_id, &transaction.modified_packages);
            }
            ActivityEvent::Package(package) => {
                if let Err(e) = self.packages.apply_package_update(package) {
                    log::error!("Failed to apply package {}: {e}", package.info.package_name);
                }
                if package.info.update_type == PackageUpdateType::Renamed {
                    self.world
                        .rename_package(&package.info.package_name, package.info.resulting_package_name());
                }
                self.transactions.on_package_event(&package.info);
            }
            ActivityEvent::Connection(_) | ActivityEvent::Lock(_) => {}
        }

        self.notify(WorkspaceEvent::ActivityApplied { activity_id });
    }

    // ─── Local edits ──────────────────────────────────────────────────

    pub fn on_transaction_started(&mut self, transaction_id: Uuid, title: impl Into<String>) {
        self.transactions.on_transaction_started(transaction_id, title);
    }

    /// Called before the editor modifies `properties` of an object, or
    /// before it creates the object.
    pub fn on_object_pre_change(&mut self, transaction_id: Uuid, object_id: &ObjectId, properties: &[&str]) {
        self.transactions
            .on_object_pre_change(&self.world, transaction_id, object_id, properties);
    }

    pub fn on_object_changed(&mut self, transaction_id: Uuid, change: ObjectChange) {
        self.transactions.on_object_changed(transaction_id, change);
    }

    pub fn on_transaction_finalized(&mut self, transaction_id: Uuid) {
        self.transactions.on_transaction_finalized(transaction_id);
    }

    pub fn on_transaction_canceled(&mut self, transaction_id: Uuid) {
        self.transactions.on_transaction_canceled(transaction_id);
    }

    /// A package was saved, added, renamed or deleted locally.
    pub fn on_local_package_event(
        &mut self,
        mut info: PackageInfo,
        file: Option<&Path>,
    ) -> Result<(), PackageError> {
        if info.update_type == PackageUpdateType::Saved {
            info.transaction_event_id_at_save = self.ledger.last_transaction_event_id();
        }
        match self.packages.on_local_package_event(info, file) {
            Ok(update) => {
                self.send::<PackageUpdateEvent>(&update);
                Ok(())
            }
            Err(PackageError::PayloadTooLarge {
                package_name,
                size,
                limit,
            }) => {
                log::warn!("Package {package_name} refused: {size} bytes exceeds {limit}");
                self.notify(WorkspaceEvent::PackageRefused {
                    package_name: package_name.clone(),
                    size,
                    limit,
                });
                Err(PackageError::PayloadTooLarge {
                    package_name,
                    size,
                    limit,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn on_local_package_discarded(&mut self, package_name: &str) -> Result<(), PackageError> {
        self.packages
            .on_local_package_discarded(&self.ledger, package_name)
    }

    pub fn lock_resources(&mut self, resource_names: Vec<String>) {
        self.send_lock_request(resource_names, LockType::Lock, false);
    }

    pub fn unlock_resources(&mut self, resource_names: Vec<String>, force: bool) {
        self.send_lock_request(resource_names, LockType::Unlock, force);
    }

    fn send_lock_request(&mut self, resource_names: Vec<String>, lock_type: LockType, force: bool) {
        let request = ResourceLockRequest {
            client_id: self.endpoint_id,
            resource_names,
            lock_type,
            force,
        };
        self.send(&request);
    }

    pub fn send_play_session(&mut self, event_type: PlaySessionEventType, package_name: &str, is_simulating: bool) {
        let event = PlaySessionEvent {
            event_type,
            play_endpoint_id: self.endpoint_id,
            play_package_name: package_name.to_string(),
            is_simulating,
        };
        self.send(&event);
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn drain_outbox(&mut self) -> Vec<SyncMessage> {
        std::mem::take(&mut self.outbox)
    }

    pub fn observers_mut(&mut self) -> &mut ObserverList<WorkspaceEvent> {
        &mut self.observers
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn sync_state(&self) -> ClientSyncState {
        self.sync_state
    }

    /// `NumRemainingSyncEvents` of the last paging message.
    pub fn sync_remaining(&self) -> u64 {
        self.sync_remaining
    }

    pub fn ledger(&self) -> &ActivityLedger {
        &self.ledger
    }

    pub fn world(&self) -> &ObjectWorld {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut ObjectWorld {
        &mut self.world
    }

    pub fn packages(&self) -> &PackageManager {
        &self.packages
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn lock_owner(&self, resource_name: &str) -> Option<EndpointId> {
        self.locks.get(resource_name).copied()
    }

    pub fn endpoints(&self) -> &BTreeMap<EndpointId, String> {
        &self.endpoints
    }

    pub fn pending_remote_count(&self) -> usize {
        self.pending_remote.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LockOwnership, SERVER_ENDPOINT};
    use ensemble_core::{
        Activity, ActivityType, EditorState, ExportedObject, ObjectId, ObjectPayload, PackageData,
        PackageEvent, PropertyBag, PropertyBagFactory, PropertyDelta, SyncObject,
    };
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn client(dir: &Path) -> ClientWorkspace {
        ClientWorkspace::new(
            Uuid::new_v4(),
            ClientConfig::for_testing(dir.join("Content")),
            Box::new(PropertyBagFactory),
        )
        .unwrap()
    }

    fn welcome(client: &mut ClientWorkspace, session_id: Uuid) {
        let msg = SyncMessage::new(
            client.endpoint_id(),
            &ClientJoinedEvent {
                display_name: "Tester".into(),
                session_id,
            },
        )
        .unwrap();
        client.handle_message(&msg);
    }

    fn activity_message(activity_id: ActivityId, endpoint: EndpointId, event: ActivityEvent, remaining: u64) -> SyncMessage {
        let activity = SyncActivity {
            activity: Activity {
                activity_id,
                endpoint_id: endpoint,
                event_time: 0,
                event_type: event.activity_type(),
                event_id: activity_id,
                ignored: false,
            },
            event,
        };
        SyncMessage::new(
            SERVER_ENDPOINT,
            &WorkspaceSyncActivityEvent {
                activity,
                num_remaining_sync_events: remaining,
            },
        )
        .unwrap()
    }

    fn edit_x(value: i64) -> TransactionEvent {
        let mut event = TransactionEvent::new(Uuid::new_v4(), "Edit");
        event.push_object(ExportedObject::new(
            ObjectId::new("/Script/Engine.Actor", "/Game/Map", "", "Cube"),
            ObjectPayload::Delta(vec![PropertyDelta {
                name: "x".into(),
                data: serde_json::to_vec(&json!(value)).unwrap(),
            }]),
        ));
        event
    }

    fn spawn_cube(client: &mut ClientWorkspace) {
        let mut bag = PropertyBag::new("/Script/Engine.Actor");
        bag.set("x", json!(0));
        let state = bag.serialize_full().unwrap();
        client
            .world_mut()
            .find_or_create(
                &ObjectId::new("/Script/Engine.Actor", "/Game/Map", "", "Cube"),
                true,
                Some(&state),
            )
            .unwrap();
    }

    fn cube_x(client: &ClientWorkspace) -> serde_json::Value {
        let world = client.world();
        let object = world.get(world.find("/Game/Map:Cube").unwrap()).unwrap();
        serde_json::from_slice(&object.serialize_property("x").unwrap()).unwrap()
    }

    #[test]
    fn test_welcome_requests_sync() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        client
            .observers_mut()
            .add("test", move |e: &WorkspaceEvent| sink.lock().unwrap().push(e.clone()));

        client.join();
        assert_eq!(client.sync_state(), ClientSyncState::Joining);
        let session = Uuid::new_v4();
        welcome(&mut client, session);

        assert_eq!(client.session_id(), Some(session));
        assert_eq!(client.sync_state(), ClientSyncState::Syncing);
        let outbox = client.drain_outbox();
        let types: Vec<MessageType> = outbox.iter().map(|m| m.msg_type).collect();
        assert_eq!(types, vec![MessageType::ClientJoined, MessageType::WorkspaceSyncRequested]);
        let request = outbox[1].decode_payload::<WorkspaceSyncRequestedEvent>().unwrap();
        assert_eq!(request.first_activity_id_to_sync, 1);
        assert!(request.enable_live_sync);
        assert_eq!(events.lock().unwrap()[0], WorkspaceEvent::Joined { session_id: session });
    }

    #[test]
    fn test_remote_activity_waits_for_guard() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        spawn_cube(&mut client);
        welcome(&mut client, Uuid::new_v4());

        let other = Uuid::new_v4();
        client.handle_message(&activity_message(1, other, ActivityEvent::Transaction(edit_x(5)), 0));
        assert_eq!(client.ledger().len(), 1);
        assert_eq!(client.pending_remote_count(), 1);

        let busy = EditorState {
            is_interacting: true,
            ..EditorState::default()
        };
        client.tick(&busy, Instant::now());
        assert_eq!(cube_x(&client), json!(0));
        assert_eq!(client.pending_remote_count(), 1);

        client.tick(&EditorState::default(), Instant::now());
        assert_eq!(cube_x(&client), json!(5));
        assert_eq!(client.pending_remote_count(), 0);
        assert_eq!(client.transactions().live_transactions("/Game/Map"), vec![1]);
    }

    #[test]
    fn test_duplicate_activity_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let other = Uuid::new_v4();
        let msg = activity_message(1, other, ActivityEvent::Transaction(edit_x(1)), 0);
        client.handle_message(&msg);
        client.handle_message(&msg);
        assert_eq!(client.ledger().len(), 1);
        assert_eq!(client.pending_remote_count(), 1);
    }

    #[test]
    fn test_sync_progress_and_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        client.join();
        welcome(&mut client, Uuid::new_v4());

        let other = Uuid::new_v4();
        client.handle_message(
            &SyncMessage::new(
                other,
                &WorkspaceSyncEndpointEvent {
                    endpoint_id: other,
                    display_name: "Bob".into(),
                    num_remaining_sync_events: 2,
                },
            )
            .unwrap(),
        );
        assert_eq!(client.sync_remaining(), 2);
        assert_eq!(client.endpoints().get(&other).map(String::as_str), Some("Bob"));

        client.handle_message(
            &SyncMessage::new(
                SERVER_ENDPOINT,
                &WorkspaceSyncLockEvent {
                    locks: vec![LockOwnership {
                        resource_name: "/Game/Map:Cube".into(),
                        owner: other,
                    }],
                    num_remaining_sync_events: 0,
                },
            )
            .unwrap(),
        );
        assert_eq!(client.lock_owner("/Game/Map:Cube"), Some(other));

        client.handle_message(
            &SyncMessage::new(SERVER_ENDPOINT, &WorkspaceSyncCompletedEvent { last_activity_id: 0 }).unwrap(),
        );
        assert_eq!(client.sync_state(), ClientSyncState::Synced);
    }

    #[test]
    fn test_snapshot_applied_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        spawn_cube(&mut client);

        let snapshot = SyncMessage::new(
            Uuid::new_v4(),
            &TransactionSnapshotEvent {
                transaction: edit_x(9),
            },
        )
        .unwrap();
        client.handle_message(&snapshot);
        client.tick(&EditorState::default(), Instant::now());

        assert_eq!(cube_x(&client), json!(9));
        assert!(client.ledger().is_empty());
    }

    #[test]
    fn test_package_activity_written_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        welcome(&mut client, Uuid::new_v4());

        let mut package = PackageEvent::new(
            PackageInfo::new("/Game/Map", PackageUpdateType::Saved),
            PackageData::Inline(b"bytes".to_vec()),
        );
        package.revision = 1;
        client.handle_message(&activity_message(1, Uuid::new_v4(), ActivityEvent::Package(package), 0));
        client.tick(&EditorState::default(), Instant::now());

        let path = client.packages().package_path("/Game/Map", "uasset");
        assert_eq!(std::fs::read(path).unwrap(), b"bytes");
        assert!(client.packages().pending_hot_reload().is_empty());
        assert_eq!(client.ledger().activity(1).map(|a| a.event_type), Some(ActivityType::Package));
    }

    #[test]
    fn test_oversized_package_refused_locally() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let refused = Arc::new(Mutex::new(Vec::new()));
        let sink = refused.clone();
        client.observers_mut().add("refusals", move |e: &WorkspaceEvent| {
            if let WorkspaceEvent::PackageRefused { size, limit, .. } = e {
                sink.lock().unwrap().push((*size, *limit));
            }
        });

        let file = dir.path().join("huge.uasset");
        std::fs::write(&file, vec![0u8; 100 * 1024]).unwrap();
        let result = client.on_local_package_event(
            PackageInfo::new("/Game/Huge", PackageUpdateType::Saved),
            Some(&file),
        );

        assert!(matches!(result, Err(PackageError::PayloadTooLarge { .. })));
        assert!(client.drain_outbox().is_empty());
        assert_eq!(*refused.lock().unwrap(), vec![(100 * 1024, 64 * 1024)]);
    }

    #[test]
    fn test_rejected_transaction_restores_head() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        spawn_cube(&mut client);
        welcome(&mut client, Uuid::new_v4());

        let mut head = PackageEvent::new(
            PackageInfo::new("/Game/Map", PackageUpdateType::Saved),
            PackageData::Inline(b"head".to_vec()),
        );
        head.revision = 1;
        client.handle_message(&activity_message(1, Uuid::new_v4(), ActivityEvent::Package(head), 0));
        client.tick(&EditorState::default(), Instant::now());

        let tx = Uuid::new_v4();
        client.on_transaction_started(tx, "Move");
        client.on_object_changed(
            tx,
            ObjectChange::edited(ObjectId::new("/Script/Engine.Actor", "/Game/Map", "", "Cube"), &["x"]),
        );
        client.on_transaction_finalized(tx);
        client.tick(&EditorState::default(), Instant::now());
        client.drain_outbox();

        let path = client.packages().package_path("/Game/Map", "uasset");
        std::fs::write(&path, b"local").unwrap();
        client.handle_message(
            &SyncMessage::new(SERVER_ENDPOINT, &TransactionRejectedEvent { transaction_id: tx }).unwrap(),
        );
        client.tick(&EditorState::default(), Instant::now());
        assert_eq!(std::fs::read(&path).unwrap(), b"head");
    }

    #[test]
    fn test_rejected_transaction_reverts_world() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        spawn_cube(&mut client);
        welcome(&mut client, Uuid::new_v4());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        client
            .observers_mut()
            .add("test", move |e: &WorkspaceEvent| sink.lock().unwrap().push(e.clone()));

        let cube = ObjectId::new("/Script/Engine.Actor", "/Game/Map", "", "Cube");
        client.handle_message(&activity_message(1, Uuid::new_v4(), ActivityEvent::Transaction(edit_x(5)), 0));
        client.tick(&EditorState::default(), Instant::now());
        assert_eq!(cube_x(&client), json!(5));

        // No head revision of /Game/Map exists
        let tx = Uuid::new_v4();
        client.on_transaction_started(tx, "Move");
        client.on_object_pre_change(tx, &cube, &["x"]);
        let handle = client.world().find("/Game/Map:Cube").unwrap();
        client
            .world_mut()
            .get_mut(handle)
            .unwrap()
            .deserialize_property("x", b"9")
            .unwrap();
        client.on_object_changed(tx, ObjectChange::edited(cube, &["x"]));
        client.on_transaction_finalized(tx);
        client.tick(&EditorState::default(), Instant::now());
        client.drain_outbox();
        assert_eq!(cube_x(&client), json!(9));

        client.handle_message(
            &SyncMessage::new(SERVER_ENDPOINT, &TransactionRejectedEvent { transaction_id: tx }).unwrap(),
        );
        client.tick(&EditorState::default(), Instant::now());
        assert_eq!(cube_x(&client), json!(5));
        assert!(!client.transactions().is_awaiting_admission(tx));
        assert!(events
            .lock()
            .unwrap()
            .contains(&WorkspaceEvent::TransactionRejected { transaction_id: tx }));
    }

    #[test]
    fn test_lock_state_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let owner = Uuid::new_v4();
        let change = |lock_type| {
            SyncMessage::new(
                owner,
                &LockStateChangedEvent {
                    owner,
                    lock_type,
                    resource_names: vec!["/Game/Map".into()],
                },
            )
            .unwrap()
        };

        client.handle_message(&change(LockType::Lock));
        assert_eq!(client.lock_owner("/Game/Map"), Some(owner));
        client.handle_message(&change(LockType::Unlock));
        assert_eq!(client.lock_owner("/Game/Map"), None);

        client.lock_resources(vec!["/Game/Other".into()]);
        let outbox = client.drain_outbox();
        let request = outbox[0].decode_payload::<ResourceLockRequest>().unwrap();
        assert_eq!(request.lock_type, LockType::Lock);
        assert_eq!(request.client_id, client.endpoint_id());
    }
}
