//! Persistence integration tests.
//!
//! Verifies:
//! - Activities written through the ledger store survive a restart
//! - The session identity survives a restart
//! - History rewrites are persisted and deleted ids are never reused
//! - Client persisted state skips packages already on disk

use std::collections::BTreeSet;

use ensemble_collab::config::ServerConfig;
use ensemble_collab::protocol::PackageUpdateEvent;
use ensemble_collab::{
    LedgerStore, PackageManager, PackageManagerConfig, ServerWorkspace, StoreConfig, SyncServer,
};
use ensemble_core::{
    ActivityLedger, ActivityType, ExportedObject, ObjectId, ObjectPayload, PackageData, PackageInfo,
    PackageUpdateType, TransactionEvent,
};
use tempfile::tempdir;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn server_config(path: &std::path::Path) -> ServerConfig {
    ServerConfig {
        storage: Some(StoreConfig::for_testing(path)),
        ..ServerConfig::for_testing()
    }
}

/// A workspace writing through a store at `path`, as the server builds it.
fn persistent_workspace(path: &std::path::Path, session_id: Uuid) -> ServerWorkspace {
    let store = LedgerStore::open(StoreConfig::for_testing(path)).unwrap();
    store.set_session_id(session_id).unwrap();
    ServerWorkspace::with_ledger(session_id, ActivityLedger::with_sink(Box::new(store)))
}

fn save(package: &str, bytes: &[u8], update_type: PackageUpdateType) -> PackageUpdateEvent {
    PackageUpdateEvent {
        info: PackageInfo::new(package, update_type),
        data: PackageData::Inline(bytes.to_vec()),
    }
}

fn create_actor(name: &str) -> TransactionEvent {
    let mut event = TransactionEvent::new(Uuid::new_v4(), "Spawn");
    let mut object = ExportedObject::new(
        ObjectId::new("/Script/Engine.Actor", "/Game/Map", "", name),
        ObjectPayload::Full(b"{}".to_vec()),
    );
    object.is_new = true;
    event.push_object(object);
    event
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[test]
fn test_ledger_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ledger");
    let session_id = Uuid::new_v4();

    let last_id = {
        let mut workspace = persistent_workspace(&path, session_id);
        let alice = Uuid::new_v4();
        workspace.handle_client_joined(alice, "Alice".into());
        workspace.handle_package_update(alice, save("/Game/Map", b"v1", PackageUpdateType::Added));
        workspace.handle_package_update(alice, save("/Game/Map", b"v2", PackageUpdateType::Saved));
        workspace.handle_transaction_finalized(alice, create_actor("Cube"));
        workspace.ledger().last_activity_id()
    };

    let server = SyncServer::new(server_config(&path)).unwrap();
    assert_eq!(server.session_id(), session_id);

    let ledger = server.workspace().ledger();
    assert_eq!(ledger.len(), 4);
    assert_eq!(ledger.last_activity_id(), last_id);
    assert_eq!(ledger.head_revision("/Game/Map"), Some(2));
    assert_eq!(
        ledger.head_package("/Game/Map").map(|p| p.data.clone()),
        Some(PackageData::Inline(b"v2".to_vec()))
    );
    let types: Vec<ActivityType> = ledger.iter().map(|a| a.event_type).collect();
    assert_eq!(
        types,
        vec![
            ActivityType::Connection,
            ActivityType::Package,
            ActivityType::Package,
            ActivityType::Transaction
        ]
    );
}

#[test]
fn test_history_rewrite_persisted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ledger");
    let session_id = Uuid::new_v4();

    let deleted = {
        let mut workspace = persistent_workspace(&path, session_id);
        let alice = Uuid::new_v4();
        workspace.handle_client_joined(alice, "Alice".into());
        workspace.handle_package_update(alice, save("/Game/Map", b"v1", PackageUpdateType::Added));
        let added = workspace.ledger().last_activity_id();
        workspace.handle_transaction_finalized(alice, create_actor("Cube"));
        workspace.handle_package_update(alice, save("/Game/Map", b"v2", PackageUpdateType::Saved));

        let analysis = workspace
            .delete_activities(&BTreeSet::from([added]), false)
            .unwrap();
        let mut deleted = analysis.hard_dependencies.clone();
        deleted.insert(added);
        assert_eq!(workspace.ledger().len(), 1);
        deleted
    };
    assert_eq!(deleted.len(), 3);

    let server = SyncServer::new(server_config(&path)).unwrap();
    let ledger = server.workspace().ledger();
    assert_eq!(ledger.len(), 1);
    for id in &deleted {
        assert!(ledger.activity(*id).is_none());
    }
    assert!(ledger.head_package("/Game/Map").is_none());
    // The deleted tail's ids are not handed out again
    assert_eq!(ledger.next_activity_id(), 5);
}

#[test]
fn test_fresh_store_gets_new_session() {
    let dir = tempdir().unwrap();
    let first = SyncServer::new(server_config(&dir.path().join("a"))).unwrap();
    let second = SyncServer::new(server_config(&dir.path().join("b"))).unwrap();
    assert_ne!(first.session_id(), second.session_id());
    assert!(first.workspace().ledger().is_empty());
}

#[test]
fn test_client_skips_packages_already_on_disk() {
    let dir = tempdir().unwrap();
    let content = dir.path().join("Content");
    let state_path = dir.path().join("state.json");
    let session_id = Uuid::new_v4();

    let mut ledger = ActivityLedger::new();
    let endpoint = Uuid::new_v4();
    let sync = ledger
        .append(
            endpoint,
            ensemble_core::ActivityEvent::Package(ensemble_core::PackageEvent::new(
                PackageInfo::new("/Game/Map", PackageUpdateType::Added),
                PackageData::Inline(b"v1".to_vec()),
            )),
        )
        .unwrap();
    let package = sync.event.as_package().unwrap();

    {
        let mut manager = PackageManager::new(PackageManagerConfig::for_testing(&content));
        manager.load_persisted_state(Some(state_path.clone()), session_id).unwrap();
        assert!(manager.apply_package_update(package).unwrap());
        manager.save_persisted_state().unwrap();
    }

    // Reconnect to the same session
    let mut manager = PackageManager::new(PackageManagerConfig::for_testing(&content));
    manager.load_persisted_state(Some(state_path.clone()), session_id).unwrap();
    assert!(!manager.apply_package_update(package).unwrap());
    assert!(manager.pending_hot_reload().is_empty());

    // A different session starts from scratch
    let mut manager = PackageManager::new(PackageManagerConfig::for_testing(&content));
    manager.load_persisted_state(Some(state_path), Uuid::new_v4()).unwrap();
    assert!(manager.apply_package_update(package).unwrap());
}
