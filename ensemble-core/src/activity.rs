//! Activity records: the ordered entries of a session ledger.
//!
//! Every accepted client operation becomes exactly one [`Activity`]. The
//! activity row is small and uniform; the operation itself lives in a
//! type-specific event table and is referenced through `event_id`.
//!
//! ```text
//! ┌────────────┬─────────────┬────────────┬────────────┬──────────┐
//! │ activity_id│ endpoint_id │ event_time │ event_type │ event_id │
//! │ i64 (seq)  │ uuid        │ ms epoch   │ tag        │ i64      │
//! └────────────┴─────────────┴────────────┴────────────┴──────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::package::PackageEvent;
use crate::transaction::TransactionEvent;

/// Globally unique, strictly increasing ledger sequence number.
pub type ActivityId = i64;

/// Row id inside one of the type-specific event tables.
pub type EventId = i64;

/// Stable identity of a connected client within a session.
pub type EndpointId = Uuid;

/// Activity kind, selecting the event table `event_id` points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ActivityType {
    Connection = 1,
    Lock = 2,
    Transaction = 3,
    Package = 4,
}

/// One immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub activity_id: ActivityId,
    pub endpoint_id: EndpointId,
    /// Milliseconds since the Unix epoch
    pub event_time: u64,
    pub event_type: ActivityType,
    pub event_id: EventId,
    /// Ignored activities stay in history but are skipped on replay
    pub ignored: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEventType {
    Connected,
    Disconnected,
}

/// An endpoint joined or left the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub event_type: ConnectionEventType,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockEventType {
    Locked,
    Unlocked,
}

/// A non-temporary change of resource ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEvent {
    pub event_type: LockEventType,
    pub resource_names: Vec<String>,
}

/// The event row of an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActivityEvent {
    Connection(ConnectionEvent),
    Lock(LockEvent),
    Transaction(TransactionEvent),
    Package(PackageEvent),
}

impl ActivityEvent {
    pub fn activity_type(&self) -> ActivityType {
        match self {
            ActivityEvent::Connection(_) => ActivityType::Connection,
            ActivityEvent::Lock(_) => ActivityType::Lock,
            ActivityEvent::Transaction(_) => ActivityType::Transaction,
            ActivityEvent::Package(_) => ActivityType::Package,
        }
    }

    pub fn as_transaction(&self) -> Option<&TransactionEvent> {
        match self {
            ActivityEvent::Transaction(event) => Some(event),
            _ => None,
        }
    }

    pub fn as_package(&self) -> Option<&PackageEvent> {
        match self {
            ActivityEvent::Package(event) => Some(event),
            _ => None,
        }
    }
}

/// An activity joined with its event row, the unit that is persisted and
/// replicated to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncActivity {
    pub activity: Activity,
    pub event: ActivityEvent,
}

impl SyncActivity {
    pub fn activity_id(&self) -> ActivityId {
        self.activity.activity_id
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_type_matches_event() {
        let lock = ActivityEvent::Lock(LockEvent {
            event_type: LockEventType::Locked,
            resource_names: vec!["/Game/Foo".into()],
        });
        assert_eq!(lock.activity_type(), ActivityType::Lock);
        assert!(lock.as_transaction().is_none());
        assert!(lock.as_package().is_none());

        let connection = ActivityEvent::Connection(ConnectionEvent {
            event_type: ConnectionEventType::Connected,
            display_name: "Alice".into(),
        });
        assert_eq!(connection.activity_type(), ActivityType::Connection);
    }

    #[test]
    fn test_activity_type_values() {
        assert_eq!(ActivityType::Connection as u8, 1);
        assert_eq!(ActivityType::Lock as u8, 2);
        assert_eq!(ActivityType::Transaction as u8, 3);
        assert_eq!(ActivityType::Package as u8, 4);
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01 in ms
        assert!(now_millis() > 1_577_836_800_000);
    }
}
