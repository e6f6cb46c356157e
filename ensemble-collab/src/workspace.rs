//! Server workspace: the authoritative state of one session.
//!
//! ```text
//! handle_message ──► LockTable (temporary lock) ──► ActivityLedger.append
//!                         │ conflict                     │ Ok
//!                         ▼                              ▼
//!                   rejection to sender      SyncCommandQueue ─► live endpoints
//!                                                        │
//! tick(budget) ──► process_queue ──► outbox ─────────────┘
//! ```
//!
//! Everything here runs on the single session task. Lock acquisition and
//! ledger append happen in the same call, so two edits touching the same
//! resource are admitted strictly one after the other.
//!
//! Queued commands capture activity ids, not activity data: a command reads
//! the ledger when it runs, so activities deleted by a history rewrite in the
//! meantime are skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use ensemble_core::{
    analyse_activity_dependencies, build_dependency_graph, ActivityDependencies, ActivityEvent,
    ActivityId, ActivityLedger, ConnectionEvent, ConnectionEventType, EndpointId, LedgerError,
    LockEvent, LockEventType, PackageData, PackageEvent, PackageInfo, PackageUpdateType,
    SyncActivity, TransactionEvent,
};

use crate::lock_table::{LockFlags, LockTable};
use crate::play_session::PlaySessionTracker;
use crate::protocol::{
    ClientJoinedEvent, ClientLeftEvent, LockOwnership, LockStateChangedEvent, LockType,
    MessageType, PackageRejectedEvent, PackageUpdateEvent, Payload, PlaySessionEvent,
    ResourceLockRequest, ResourceLockResponse, SyncMessage, TransactionFinalizedEvent,
    TransactionRejectedEvent, TransactionSnapshotEvent, WorkspaceSyncActivityEvent,
    WorkspaceSyncCompletedEvent, WorkspaceSyncEndpointEvent, WorkspaceSyncLockEvent,
    WorkspaceSyncRequestedEvent, SERVER_ENDPOINT,
};
use crate::sync_queue::{ProcessingMethod, SyncCommand, SyncCommandQueue};

/// A message waiting to be routed to `endpoint`.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub endpoint: EndpointId,
    pub message: SyncMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointState {
    pub display_name: String,
    /// Receives new activities as they are admitted
    pub live_sync: bool,
    /// A sync replay is in progress
    pub syncing: bool,
}

/// State the queued sync commands run against.
pub struct WorkspaceState {
    session_id: Uuid,
    ledger: ActivityLedger,
    locks: LockTable,
    endpoints: BTreeMap<EndpointId, EndpointState>,
    play_sessions: PlaySessionTracker,
    outbox: Vec<OutboundMessage>,
}

impl WorkspaceState {
    fn send<P: Payload>(&mut self, to: EndpointId, subject: EndpointId, payload: &P) {
        match SyncMessage::new(subject, payload) {
            Ok(message) => self.outbox.push(OutboundMessage { endpoint: to, message }),
            Err(e) => log::error!("Failed to encode {:?} for {to}: {e}", P::MESSAGE_TYPE),
        }
    }

    /// Send to every connected endpoint except `except`.
    fn send_to_others<P: Payload>(&mut self, except: Option<EndpointId>, subject: EndpointId, payload: &P) {
        let message = match SyncMessage::new(subject, payload) {
            Ok(message) => message,
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", P::MESSAGE_TYPE);
                return;
            }
        };
        let targets: Vec<EndpointId> = self
            .endpoints
            .keys()
            .copied()
            .filter(|id| Some(*id) != except)
            .collect();
        for endpoint in targets {
            self.outbox.push(OutboundMessage {
                endpoint,
                message: message.clone(),
            });
        }
    }

    fn send_activity(&mut self, to: EndpointId, activity_id: ActivityId, remaining: u64) {
        if let Some(activity) = self.ledger.sync_activity(activity_id) {
            self.send(
                to,
                SERVER_ENDPOINT,
                &WorkspaceSyncActivityEvent {
                    activity,
                    num_remaining_sync_events: remaining,
                },
            );
        }
    }

    fn live_endpoints(&self) -> Vec<EndpointId> {
        self.endpoints
            .iter()
            .filter(|(_, e)| e.live_sync)
            .map(|(id, _)| *id)
            .collect()
    }
}

pub struct ServerWorkspace {
    state: WorkspaceState,
    sync_queue: SyncCommandQueue<WorkspaceState>,
}

impl ServerWorkspace {
    pub fn new(session_id: Uuid) -> Self {
        Self::with_ledger(session_id, ActivityLedger::new())
    }

    /// Resume a session from a recovered ledger.
    pub fn with_ledger(session_id: Uuid, ledger: ActivityLedger) -> Self {
        Self {
            state: WorkspaceState {
                session_id,
                ledger,
                locks: LockTable::new(),
                endpoints: BTreeMap::new(),
                play_sessions: PlaySessionTracker::new(),
                outbox: Vec::new(),
            },
            sync_queue: SyncCommandQueue::new(),
        }
    }

    /// Dispatch one message received from `sender`.
    pub fn handle_message(&mut self, sender: EndpointId, msg: &SyncMessage) {
        let result = match msg.msg_type {
            MessageType::ClientJoined => msg
                .decode_payload::<ClientJoinedEvent>()
                .map(|e| self.handle_client_joined(sender, e.display_name)),
            MessageType::ClientLeft => {
                self.handle_client_left(sender);
                Ok(())
            }
            MessageType::WorkspaceSyncRequested => msg
                .decode_payload::<WorkspaceSyncRequestedEvent>()
                .map(|e| self.handle_sync_requested(sender, &e)),
            MessageType::PackageUpdate => msg
                .decode_payload::<PackageUpdateEvent>()
                .map(|e| self.handle_package_update(sender, e)),
            MessageType::TransactionFinalized => msg
                .decode_payload::<TransactionFinalizedEvent>()
                .map(|e| self.handle_transaction_finalized(sender, e.transaction)),
            MessageType::TransactionSnapshot => msg
                .decode_payload::<TransactionSnapshotEvent>()
                .map(|e| self.handle_transaction_snapshot(sender, e.transaction)),
            MessageType::ResourceLockRequest => msg
                .decode_payload::<ResourceLockRequest>()
                .map(|e| self.handle_lock_request(sender, &e)),
            MessageType::PlaySession => msg
                .decode_payload::<PlaySessionEvent>()
                .map(|e| self.handle_play_session(sender, &e)),
            MessageType::Ping => {
                self.state.outbox.push(OutboundMessage {
                    endpoint: sender,
                    message: SyncMessage::pong(SERVER_ENDPOINT),
                });
                Ok(())
            }
            other => {
                log::debug!("Unhandled message type from {sender}: {other:?}");
                Ok(())
            }
        };

        if let Err(e) = result {
            log::warn!("Dropping malformed {:?} from {sender}: {e}", msg.msg_type);
        }
    }

    // ─── Membership ───────────────────────────────────────────────────

    pub fn handle_client_joined(&mut self, endpoint: EndpointId, display_name: String) {
        log::info!("Endpoint {endpoint} ({display_name}) joined");
        self.state.endpoints.insert(
            endpoint,
            EndpointState {
                display_name: display_name.clone(),
                live_sync: false,
                syncing: false,
            },
        );

        let welcome = ClientJoinedEvent {
            display_name: display_name.clone(),
            session_id: self.state.session_id,
        };
        self.state.send(endpoint, endpoint, &welcome);
        self.state.send_to_others(Some(endpoint), endpoint, &welcome);

        self.append(
            endpoint,
            ActivityEvent::Connection(ConnectionEvent {
                event_type: ConnectionEventType::Connected,
                display_name,
            }),
        );
    }

    /// Remove an endpoint, releasing its locks and play session.
    pub fn handle_client_left(&mut self, endpoint: EndpointId) {
        let Some(state) = self.state.endpoints.remove(&endpoint) else {
            return;
        };
        log::info!("Endpoint {endpoint} ({}) left", state.display_name);
        self.sync_queue.remove_endpoint(endpoint);

        let released = self.state.locks.release_all(endpoint);
        if !released.is_empty() {
            self.record_lock_change(endpoint, LockType::Unlock, released);
        }

        if let Some(session) = self.state.play_sessions.remove_endpoint(endpoint) {
            self.fence_package(endpoint, &session.play_package_name);
        }

        self.append(
            endpoint,
            ActivityEvent::Connection(ConnectionEvent {
                event_type: ConnectionEventType::Disconnected,
                display_name: state.display_name.clone(),
            }),
        );
        self.state.send_to_others(
            None,
            endpoint,
            &ClientLeftEvent {
                display_name: state.display_name,
            },
        );
    }

    // ─── Sync ─────────────────────────────────────────────────────────

    /// Queue a time-sliced replay of endpoints, activities and locks.
    pub fn handle_sync_requested(&mut self, endpoint: EndpointId, request: &WorkspaceSyncRequestedEvent) {
        let Some(state) = self.state.endpoints.get_mut(&endpoint) else {
            log::warn!("Sync requested by unknown endpoint {endpoint}");
            return;
        };
        state.live_sync = request.enable_live_sync;
        state.syncing = true;

        let endpoint_ids: Vec<EndpointId> = self.state.endpoints.keys().copied().collect();
        let activity_ids = self
            .state
            .ledger
            .activity_ids_from(request.first_activity_id_to_sync.max(1));
        let total = (endpoint_ids.len() + activity_ids.len() + 1) as u64;
        log::info!(
            "Syncing {} activities to {endpoint} from {}",
            activity_ids.len(),
            request.first_activity_id_to_sync
        );

        self.sync_queue
            .set_command_processing_method(endpoint, ProcessingMethod::ProcessTimeSliced);

        let mut remaining = total;
        for subject in endpoint_ids {
            remaining -= 1;
            let left = remaining;
            let command: SyncCommand<WorkspaceState> = Arc::new(move |state: &mut WorkspaceState, to: EndpointId| {
                let Some(info) = state.endpoints.get(&subject) else {
                    return;
                };
                let event = WorkspaceSyncEndpointEvent {
                    endpoint_id: subject,
                    display_name: info.display_name.clone(),
                    num_remaining_sync_events: left,
                };
                state.send(to, subject, &event);
            });
            self.sync_queue.queue_command(&mut self.state, &[endpoint], command);
        }

        for activity_id in activity_ids {
            remaining -= 1;
            let left = remaining;
            let command: SyncCommand<WorkspaceState> =
                Arc::new(move |state: &mut WorkspaceState, to: EndpointId| {
                    state.send_activity(to, activity_id, left)
                });
            self.sync_queue.queue_command(&mut self.state, &[endpoint], command);
        }

        let command: SyncCommand<WorkspaceState> = Arc::new(|state: &mut WorkspaceState, to: EndpointId| {
            let locks = state
                .locks
                .locked_resources()
                .into_iter()
                .map(|(resource_name, owner)| LockOwnership { resource_name, owner })
                .collect();
            state.send(
                to,
                SERVER_ENDPOINT,
                &WorkspaceSyncLockEvent {
                    locks,
                    num_remaining_sync_events: 0,
                },
            );
        });
        self.sync_queue.queue_command(&mut self.state, &[endpoint], command);
    }

    /// Run queued sync commands within `budget` and report finished replays.
    pub fn tick(&mut self, budget: Duration) {
        let completed = self.sync_queue.process_queue(&mut self.state, budget);
        for endpoint in completed {
            let Some(state) = self.state.endpoints.get_mut(&endpoint) else {
                continue;
            };
            if !state.syncing {
                continue;
            }
            state.syncing = false;
            let last_activity_id = self.state.ledger.last_activity_id();
            log::debug!("Sync of {endpoint} completed at activity {last_activity_id}");
            self.state.send(
                endpoint,
                SERVER_ENDPOINT,
                &WorkspaceSyncCompletedEvent { last_activity_id },
            );
        }
    }

    // ─── Edits ────────────────────────────────────────────────────────

    pub fn handle_transaction_finalized(&mut self, sender: EndpointId, transaction: TransactionEvent) {
        let names = transaction.resource_names();
        if let Err(conflict) = self.state.locks.lock(&names, sender, LockFlags::TEMPORARY) {
            log::info!(
                "Rejected transaction {} from {sender}: {conflict}",
                transaction.transaction_id
            );
            self.state.send(
                sender,
                SERVER_ENDPOINT,
                &TransactionRejectedEvent {
                    transaction_id: transaction.transaction_id,
                },
            );
            return;
        }

        let transaction_id = transaction.transaction_id;
        if transaction.canceled {
            // Corrects the snapshots others already applied; not history.
            log::debug!("Forwarding canceled transaction {transaction_id} from {sender}");
            self.state
                .send_to_others(Some(sender), sender, &TransactionFinalizedEvent { transaction });
        } else if self.append(sender, ActivityEvent::Transaction(transaction)).is_none() {
            self.state.send(
                sender,
                SERVER_ENDPOINT,
                &TransactionRejectedEvent { transaction_id },
            );
        }

        self.release_temporary(&names, sender);
    }

    /// Forward a best-effort snapshot to the other endpoints if the sender
    /// may touch every object in it.
    pub fn handle_transaction_snapshot(&mut self, sender: EndpointId, transaction: TransactionEvent) {
        let names = transaction.resource_names();
        if self.state.locks.lock(&names, sender, LockFlags::TEMPORARY).is_err() {
            log::trace!("Dropped snapshot {} from {sender}", transaction.transaction_id);
            return;
        }
        self.state
            .send_to_others(Some(sender), sender, &TransactionSnapshotEvent { transaction });
        self.release_temporary(&names, sender);
    }

    pub fn handle_package_update(&mut self, sender: EndpointId, update: PackageUpdateEvent) {
        let PackageUpdateEvent { info, mut data } = update;
        let mut names = vec![info.package_name.clone()];
        if let Some(new_name) = &info.new_package_name {
            names.push(new_name.clone());
        }

        if let Err(conflict) = self.state.locks.lock(&names, sender, LockFlags::TEMPORARY) {
            log::info!("Rejected package {} from {sender}: {conflict}", info.package_name);
            self.state.send(
                sender,
                SERVER_ENDPOINT,
                &PackageRejectedEvent {
                    package_name: info.package_name,
                },
            );
            return;
        }

        if info.update_type == PackageUpdateType::Dummy && data.is_empty() {
            if let Some(head) = self.state.ledger.head_package(&info.package_name) {
                data = head.data.clone();
            }
        }

        let package_name = info.package_name.clone();
        if self
            .append(sender, ActivityEvent::Package(PackageEvent::new(info, data)))
            .is_none()
        {
            self.state
                .send(sender, SERVER_ENDPOINT, &PackageRejectedEvent { package_name });
        }

        self.release_temporary(&names, sender);
    }

    // ─── Locks ────────────────────────────────────────────────────────

    pub fn handle_lock_request(&mut self, sender: EndpointId, request: &ResourceLockRequest) {
        if request.client_id != sender {
            log::debug!("Lock request from {sender} names client {}", request.client_id);
        }
        let mut flags = LockFlags::EXPLICIT;
        if request.force {
            flags |= LockFlags::FORCE;
        }

        let result = match request.lock_type {
            LockType::Lock => self.state.locks.lock(&request.resource_names, sender, flags),
            LockType::Unlock => self.state.locks.unlock(&request.resource_names, sender, flags),
        };

        let failed_resources = match result {
            Ok(changed) => {
                if !changed.is_empty() {
                    self.record_lock_change(sender, request.lock_type, changed);
                }
                BTreeMap::new()
            }
            Err(conflict) => {
                log::info!("Lock request from {sender} failed: {conflict}");
                conflict.failed
            }
        };

        self.state.send(
            sender,
            SERVER_ENDPOINT,
            &ResourceLockResponse {
                lock_type: request.lock_type,
                failed_resources,
            },
        );
    }

    /// Record a non-temporary lock change and tell every endpoint.
    fn record_lock_change(&mut self, owner: EndpointId, lock_type: LockType, resource_names: Vec<String>) {
        let event_type = match lock_type {
            LockType::Lock => LockEventType::Locked,
            LockType::Unlock => LockEventType::Unlocked,
        };
        self.append(
            owner,
            ActivityEvent::Lock(LockEvent {
                event_type,
                resource_names: resource_names.clone(),
            }),
        );
        self.state.send_to_others(
            None,
            owner,
            &LockStateChangedEvent {
                owner,
                lock_type,
                resource_names,
            },
        );
    }

    fn release_temporary(&mut self, names: &[String], owner: EndpointId) {
        if let Err(conflict) = self.state.locks.unlock(names, owner, LockFlags::TEMPORARY) {
            log::warn!("Failed to release admission lock for {owner}: {conflict}");
        }
    }

    // ─── Play sessions ────────────────────────────────────────────────

    pub fn handle_play_session(&mut self, sender: EndpointId, event: &PlaySessionEvent) {
        if let Some(ended) = self.state.play_sessions.handle(event) {
            self.fence_package(sender, &ended.play_package_name);
        }
        self.state.send_to_others(Some(sender), sender, event);
    }

    /// Append a `Dummy` update carrying the head revision's bytes.
    fn fence_package(&mut self, endpoint: EndpointId, package_name: &str) {
        let Some(head) = self.state.ledger.head_package(package_name) else {
            return;
        };
        let mut info = PackageInfo::new(package_name, PackageUpdateType::Dummy);
        info.extension = head.info.extension.clone();
        let data = head.data.clone();
        self.append(endpoint, ActivityEvent::Package(PackageEvent::new(info, data)));
    }

    // ─── Ledger ───────────────────────────────────────────────────────

    /// Append and push to live endpoints. `None` if the write failed.
    fn append(&mut self, endpoint: EndpointId, event: ActivityEvent) -> Option<SyncActivity> {
        match self.state.ledger.append(endpoint, event) {
            Ok(activity) => {
                log::debug!(
                    "Recorded {:?} activity {} from {endpoint}",
                    activity.activity.event_type,
                    activity.activity_id()
                );
                self.queue_live_activity(activity.activity_id());
                Some(activity)
            }
            Err(e) => {
                log::error!("Failed to record activity from {endpoint}: {e}");
                None
            }
        }
    }

    fn queue_live_activity(&mut self, activity_id: ActivityId) {
        let targets = self.state.live_endpoints();
        if targets.is_empty() {
            return;
        }
        let command: SyncCommand<WorkspaceState> =
            Arc::new(move |state: &mut WorkspaceState, to: EndpointId| {
            state.send_activity(to, activity_id, 0)
        });
        self.sync_queue.queue_command(&mut self.state, &targets, command);
    }

    /// Dependents of `activities` in the current ledger.
    pub fn analyse_history(&self, activities: &BTreeSet<ActivityId>) -> ActivityDependencies {
        let graph = build_dependency_graph(&self.state.ledger);
        analyse_activity_dependencies(&graph, activities)
    }

    /// Delete `activities` and everything that hard-depends on them
    /// (plus possible dependents when asked). Returns the analysis.
    pub fn delete_activities(
        &mut self,
        activities: &BTreeSet<ActivityId>,
        include_possible: bool,
    ) -> Result<ActivityDependencies, LedgerError> {
        let analysis = self.analyse_history(activities);
        let doomed = analysis.deletion_set(activities, include_possible);
        let deleted = self.state.ledger.delete_activities(&doomed)?;
        log::info!("History rewrite deleted {deleted} activities");
        Ok(analysis)
    }

    // ─── Accessors ────────────────────────────────────────────────────

    /// Take every message produced since the last drain.
    pub fn drain_outbox(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.state.outbox)
    }

    pub fn session_id(&self) -> Uuid {
        self.state.session_id
    }

    pub fn ledger(&self) -> &ActivityLedger {
        &self.state.ledger
    }

    pub fn locks(&self) -> &LockTable {
        &self.state.locks
    }

    pub fn play_sessions(&self) -> &PlaySessionTracker {
        &self.state.play_sessions
    }

    pub fn endpoint(&self, endpoint: EndpointId) -> Option<&EndpointState> {
        self.state.endpoints.get(&endpoint)
    }

    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.state.endpoints.keys().copied().collect()
    }

    pub fn queued_commands(&self, endpoint: EndpointId) -> usize {
        self.sync_queue.queued_commands(endpoint)
    }
}
