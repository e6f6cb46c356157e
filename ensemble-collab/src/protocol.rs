//! Binary session protocol.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬─────────────┬──────────┬──────────┐
//! │ msg_type │ endpoint_id │ reliable │ payload  │
//! │ 1 byte   │ 16 bytes    │ 1 byte   │ variable │
//! └──────────┴─────────────┴──────────┴──────────┘
//! ```
//!
//! `endpoint_id` is the sender for client → server messages and the subject
//! endpoint for server → client messages. Payloads are typed structs that
//! implement [`Payload`], each bound to exactly one [`MessageType`].
//!
//! Performance target: envelope encode < 500ns for a lock request.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use ensemble_core::{
    ActivityId, EndpointId, PackageData, PackageInfo, SyncActivity, TransactionEvent,
};

/// Message types for the session protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Endpoint joined the session (also the server's welcome to the joiner)
    ClientJoined = 1,
    /// Endpoint left the session
    ClientLeft = 2,
    /// Client asks for activities from a given id
    WorkspaceSyncRequested = 3,
    /// Paging: one known endpoint
    WorkspaceSyncEndpoint = 4,
    /// Paging or live push: one activity
    WorkspaceSyncActivity = 5,
    /// Paging: current lock table
    WorkspaceSyncLock = 6,
    /// Paging finished
    WorkspaceSyncCompleted = 7,
    /// Package saved, added, renamed or deleted
    PackageUpdate = 8,
    /// Package update refused
    PackageRejected = 9,
    /// Finalized (or canceled-after-snapshot) transaction
    TransactionFinalized = 10,
    /// Best-effort in-progress transaction preview
    TransactionSnapshot = 11,
    /// Finalized transaction refused
    TransactionRejected = 12,
    /// Explicit lock or unlock
    ResourceLockRequest = 13,
    /// Result of a lock request
    ResourceLockResponse = 14,
    /// Explicit lock ownership changed
    LockStateChanged = 15,
    /// Play session begin / switch / end
    PlaySession = 16,
    /// Heartbeat ping
    Ping = 17,
    /// Heartbeat pong
    Pong = 18,
}

/// Subject of server messages that are not about a particular endpoint.
pub const SERVER_ENDPOINT: EndpointId = Uuid::nil();

/// Typed message body.
pub trait Payload: Serialize + DeserializeOwned {
    const MESSAGE_TYPE: MessageType;
    /// Snapshots are the only best-effort payloads
    const RELIABLE: bool = true;
}

// ─── Session membership ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientJoinedEvent {
    pub display_name: String,
    /// Nil from clients; the server fills in its session id
    pub session_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientLeftEvent {
    pub display_name: String,
}

// ─── Workspace sync ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSyncRequestedEvent {
    pub first_activity_id_to_sync: ActivityId,
    pub enable_live_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSyncEndpointEvent {
    pub endpoint_id: EndpointId,
    pub display_name: String,
    pub num_remaining_sync_events: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSyncActivityEvent {
    pub activity: SyncActivity,
    pub num_remaining_sync_events: u64,
}

/// One resource and its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwnership {
    pub resource_name: String,
    pub owner: EndpointId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSyncLockEvent {
    pub locks: Vec<LockOwnership>,
    pub num_remaining_sync_events: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSyncCompletedEvent {
    pub last_activity_id: ActivityId,
}

// ─── Edits ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageUpdateEvent {
    pub info: PackageInfo,
    pub data: PackageData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRejectedEvent {
    pub package_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionFinalizedEvent {
    pub transaction: TransactionEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSnapshotEvent {
    pub transaction: TransactionEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRejectedEvent {
    pub transaction_id: Uuid,
}

// ─── Locks ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockType {
    Lock,
    Unlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLockRequest {
    pub client_id: EndpointId,
    pub resource_names: Vec<String>,
    pub lock_type: LockType,
    /// Take or release the resources regardless of their owner
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLockResponse {
    pub lock_type: LockType,
    /// Resource → current owner, for every resource that could not be changed
    pub failed_resources: BTreeMap<String, EndpointId>,
}

impl ResourceLockResponse {
    pub fn is_success(&self) -> bool {
        self.failed_resources.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockStateChangedEvent {
    pub owner: EndpointId,
    pub lock_type: LockType,
    pub resource_names: Vec<String>,
}

// ─── Play sessions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaySessionEventType {
    Begin,
    Switch,
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaySessionEvent {
    pub event_type: PlaySessionEventType,
    pub play_endpoint_id: EndpointId,
    pub play_package_name: String,
    pub is_simulating: bool,
}

macro_rules! impl_payload {
    ($($ty:ty => $msg:ident),* $(,)?) => {
        $(impl Payload for $ty {
            const MESSAGE_TYPE: MessageType = MessageType::$msg;
        })*
    };
}

impl_payload! {
    ClientJoinedEvent => ClientJoined,
    ClientLeftEvent => ClientLeft,
    WorkspaceSyncRequestedEvent => WorkspaceSyncRequested,
    WorkspaceSyncEndpointEvent => WorkspaceSyncEndpoint,
    WorkspaceSyncActivityEvent => WorkspaceSyncActivity,
    WorkspaceSyncLockEvent => WorkspaceSyncLock,
    WorkspaceSyncCompletedEvent => WorkspaceSyncCompleted,
    PackageUpdateEvent => PackageUpdate,
    PackageRejectedEvent => PackageRejected,
    TransactionFinalizedEvent => TransactionFinalized,
    TransactionRejectedEvent => TransactionRejected,
    ResourceLockRequest => ResourceLockRequest,
    ResourceLockResponse => ResourceLockResponse,
    LockStateChangedEvent => LockStateChanged,
    PlaySessionEvent => PlaySession,
}

impl Payload for TransactionSnapshotEvent {
    const MESSAGE_TYPE: MessageType = MessageType::TransactionSnapshot;
    const RELIABLE: bool = false;
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub endpoint_id: EndpointId,
    /// Delivery class requested by the sender
    pub reliable: bool,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Wrap a typed payload.
    pub fn new<P: Payload>(endpoint_id: EndpointId, payload: &P) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(payload, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: P::MESSAGE_TYPE,
            endpoint_id,
            reliable: P::RELIABLE,
            payload,
        })
    }

    /// Create a ping message.
    pub fn ping(endpoint_id: EndpointId) -> Self {
        Self {
            msg_type: MessageType::Ping,
            endpoint_id,
            reliable: true,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(endpoint_id: EndpointId) -> Self {
        Self {
            msg_type: MessageType::Pong,
            endpoint_id,
            reliable: true,
            payload: Vec::new(),
        }
    }

    /// Parse the payload as `P`, checking the message type.
    pub fn decode_payload<P: Payload>(&self) -> Result<P, ProtocolError> {
        if self.msg_type != P::MESSAGE_TYPE {
            return Err(ProtocolError::InvalidMessageType {
                expected: P::MESSAGE_TYPE,
                got: self.msg_type,
            });
        }
        let (payload, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(payload)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type: expected {expected:?}, got {got:?}")]
    InvalidMessageType { expected: MessageType, got: MessageType },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::{
        ActivityEvent, ActivityLedger, ExportedObject, ObjectId, ObjectPayload, PackageEvent,
        PackageUpdateType,
    };

    #[test]
    fn test_lock_request_roundtrip() {
        let client = Uuid::new_v4();
        let request = ResourceLockRequest {
            client_id: client,
            resource_names: vec!["/Game/Foo:Actor".into()],
            lock_type: LockType::Lock,
            force: false,
        };

        let msg = SyncMessage::new(client, &request).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::ResourceLockRequest);
        assert_eq!(decoded.endpoint_id, client);
        assert!(decoded.reliable);
        assert_eq!(decoded.decode_payload::<ResourceLockRequest>().unwrap(), request);
    }

    #[test]
    fn test_snapshot_is_unreliable() {
        let mut transaction = TransactionEvent::new(Uuid::new_v4(), "Drag");
        transaction.push_object(ExportedObject::new(
            ObjectId::new("/Script/Engine.Actor", "/Game/Foo", "", "Actor"),
            ObjectPayload::Full(vec![1, 2, 3]),
        ));
        let msg = SyncMessage::new(Uuid::new_v4(), &TransactionSnapshotEvent { transaction }).unwrap();
        assert_eq!(msg.msg_type, MessageType::TransactionSnapshot);
        assert!(!msg.reliable);

        let finalized = SyncMessage::new(
            Uuid::new_v4(),
            &TransactionRejectedEvent {
                transaction_id: Uuid::new_v4(),
            },
        )
        .unwrap();
        assert!(finalized.reliable);
    }

    #[test]
    fn test_activity_payload_carries_event() {
        let mut ledger = ActivityLedger::new();
        let event = PackageEvent::new(
            PackageInfo::new("/Game/Foo", PackageUpdateType::Added),
            PackageData::Inline(b"bytes".to_vec()),
        );
        let activity = ledger.append(Uuid::new_v4(), ActivityEvent::Package(event)).unwrap();

        let msg = SyncMessage::new(
            Uuid::nil(),
            &WorkspaceSyncActivityEvent {
                activity: activity.clone(),
                num_remaining_sync_events: 3,
            },
        )
        .unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        let payload: WorkspaceSyncActivityEvent = decoded.decode_payload().unwrap();
        assert_eq!(payload.activity, activity);
        assert_eq!(payload.num_remaining_sync_events, 3);
    }

    #[test]
    fn test_wrong_payload_type_rejected() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert_eq!(
            msg.decode_payload::<ClientJoinedEvent>().unwrap_err(),
            ProtocolError::InvalidMessageType {
                expected: MessageType::ClientJoined,
                got: MessageType::Ping,
            }
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_lock_response_success() {
        let ok = ResourceLockResponse {
            lock_type: LockType::Unlock,
            failed_resources: BTreeMap::new(),
        };
        assert!(ok.is_success());

        let failed = ResourceLockResponse {
            lock_type: LockType::Lock,
            failed_resources: BTreeMap::from([("/Game/Foo".to_string(), Uuid::new_v4())]),
        };
        assert!(!failed.is_success());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::ClientJoined as u8, 1);
        assert_eq!(MessageType::WorkspaceSyncCompleted as u8, 7);
        assert_eq!(MessageType::TransactionFinalized as u8, 10);
        assert_eq!(MessageType::PlaySession as u8, 16);
        assert_eq!(MessageType::Pong as u8, 18);
    }
}
