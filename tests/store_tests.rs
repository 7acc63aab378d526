//! Store Behaviour Tests
//!
//! Tests for the local side of the sync layer covering:
//! - Obsolete write rejection and concurrent version retention
//! - Listener fan-out and origins
//! - Scope gating of propagation
//! - Registration, tombstones and persistence

mod common;

use common::{memory_manager, persistent_manager, test_config};
use parking_lot::Mutex;
use solisync::cluster::UNASSIGNED_NODE_ID;
use solisync::storage::StorageEngine;
use solisync::sync::byte_array::{encode_key, encode_value};
use solisync::sync::{ByteArray, Occurred};
use solisync::{Scope, SyncError, SyncManager, UpdateOrigin, VectorClock, Versioned};
use std::sync::Arc;
use std::time::Duration;

fn key(k: &str) -> ByteArray {
    encode_key(&k.to_string()).unwrap()
}

fn remote_value(value: &str, node: i16, counter: u64, timestamp: i64) -> Versioned<Vec<u8>> {
    Versioned::of(
        encode_value(&value.to_string()).unwrap(),
        VectorClock::from_entries([(node, counter)], timestamp),
    )
}

type Seen = Arc<Mutex<Vec<(Vec<String>, UpdateOrigin)>>>;

// ============================================================================
// Conflict policy
// ============================================================================

#[test]
fn test_obsolete_write_rejected_and_store_unchanged() {
    let manager = memory_manager();
    manager.register_store("apps", Scope::Global).unwrap();
    let client = manager.get_store_client::<String, String>("apps").unwrap();
    let k = "app".to_string();

    client.put(&k, "v1".to_string()).unwrap();
    client.put(&k, "v2".to_string()).unwrap();
    let before = client.get(&k).unwrap();

    // built on the empty clock, so it lands before what is stored
    let stale = Versioned::new(Some("stale".to_string()), VectorClock::new());
    let err = client.put_versioned(&k, stale).unwrap_err();
    assert!(matches!(err, SyncError::ObsoleteVersion(_)));
    assert!(err.is_obsolete());

    let after = client.get(&k).unwrap();
    assert_eq!(after.value(), Some(&"v2".to_string()));
    assert_eq!(after.version().compare(before.version()), Occurred::Equal);
    assert_eq!(client.get_versions(&k).unwrap().len(), 1);
}

#[test]
fn test_put_if_not_obsolete_reports_stale_version() {
    let manager = memory_manager();
    manager.register_store("apps", Scope::Local).unwrap();
    let client = manager.get_store_client::<String, u32>("apps").unwrap();
    let k = "counter".to_string();

    let first = client.put(&k, 1).unwrap();
    assert!(client
        .put_if_not_obsolete(&k, Versioned::of(2, first.clone()))
        .unwrap());
    assert!(!client.put_if_not_obsolete(&k, Versioned::of(3, first)).unwrap());
    assert_eq!(client.get_value(&k).unwrap(), Some(2));
}

#[test]
fn test_concurrent_versions_retained() {
    let manager = memory_manager();
    manager.register_store("apps", Scope::Global).unwrap();
    let client = manager.get_store_client::<String, String>("apps").unwrap();
    let k = "app".to_string();

    client.put(&k, "local".to_string()).unwrap();
    let changed = manager
        .write_sync_value("apps", &key("app"), vec![remote_value("remote", 2, 1, 0)])
        .unwrap();
    assert!(changed);

    let versions = client.get_versions(&k).unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].compare(&versions[1]), Occurred::Concurrent);

    // the remote sibling carries the older timestamp
    let resolved = client.get(&k).unwrap();
    assert_eq!(resolved.value(), Some(&"local".to_string()));
    assert!(resolved.version().version(2) >= 1);

    // a local write on top of the resolved version collapses the siblings
    client.put(&k, "merged".to_string()).unwrap();
    let versions = client.get_versions(&k).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].value(), Some(&"merged".to_string()));
}

#[test]
fn test_sync_value_already_present_is_not_a_change() {
    let manager = memory_manager();
    manager.register_store("apps", Scope::Global).unwrap();
    let value = remote_value("remote", 3, 4, 10);

    assert!(manager
        .write_sync_value("apps", &key("k"), vec![value.clone()])
        .unwrap());
    assert!(!manager.write_sync_value("apps", &key("k"), vec![value]).unwrap());
    assert!(!manager
        .write_sync_value("apps", &key("k"), vec![remote_value("older", 3, 2, 10)])
        .unwrap());
}

// ============================================================================
// Listeners
// ============================================================================

fn recording_listener(
    client: &solisync::StoreClient<String, String>,
) -> (Seen, solisync::sync::ListenerHandle) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = client.add_listener(move |keys, origin| sink.lock().push((keys, origin)));
    (seen, handle)
}

#[tokio::test]
async fn test_listener_fan_out() {
    let manager = memory_manager();
    manager.register_store("apps", Scope::Global).unwrap();
    let client = manager.get_store_client::<String, String>("apps").unwrap();

    let (first, _h1) = recording_listener(&client);
    let (second, _h2) = recording_listener(&client);

    client.put(&"a".to_string(), "1".to_string()).unwrap();

    let (late, _h3) = recording_listener(&client);
    manager
        .write_sync_value("apps", &key("b"), vec![remote_value("2", 5, 1, 0)])
        .unwrap();

    assert!(common::wait_for(Duration::from_secs(2), || first.lock().len() == 2).await);
    assert!(common::wait_for(Duration::from_secs(2), || second.lock().len() == 2).await);
    assert!(common::wait_for(Duration::from_secs(2), || late.lock().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let expected = vec![
        (vec!["a".to_string()], UpdateOrigin::Local),
        (vec!["b".to_string()], UpdateOrigin::Remote),
    ];
    assert_eq!(*first.lock(), expected);
    assert_eq!(*second.lock(), expected);
    assert_eq!(
        *late.lock(),
        vec![(vec!["b".to_string()], UpdateOrigin::Remote)]
    );
}

#[tokio::test]
async fn test_unsubscribed_listener_stops_receiving() {
    let manager = memory_manager();
    manager.register_store("apps", Scope::Local).unwrap();
    let client = manager.get_store_client::<String, String>("apps").unwrap();

    let (seen, handle) = recording_listener(&client);
    client.put(&"a".to_string(), "1".to_string()).unwrap();
    assert!(common::wait_for(Duration::from_secs(2), || seen.lock().len() == 1).await);

    handle.unsubscribe();
    client.put(&"a".to_string(), "2".to_string()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn test_failing_listener_does_not_fail_the_write() {
    let manager = memory_manager();
    manager.register_store("apps", Scope::Global).unwrap();
    let handle = manager.store_handle("apps").unwrap();
    handle.subscribe(Arc::new(
        |_keys: &[ByteArray], _origin: UpdateOrigin| -> anyhow::Result<()> {
            anyhow::bail!("listener broke")
        },
    ));
    let client = manager.get_store_client::<String, String>("apps").unwrap();
    let (seen, _h) = recording_listener(&client);

    client.put(&"a".to_string(), "1".to_string()).unwrap();
    client.put(&"a".to_string(), "2".to_string()).unwrap();
    assert!(common::wait_for(Duration::from_secs(2), || seen.lock().len() == 2).await);
    assert_eq!(client.get_value(&"a".to_string()).unwrap(), Some("2".to_string()));
}

// ============================================================================
// Scope gating and registration
// ============================================================================

#[test]
fn test_scope_gating() {
    let manager = memory_manager();
    manager.register_store("global", Scope::Global).unwrap();
    manager.register_store("local", Scope::Local).unwrap();
    manager.register_store("unsync", Scope::Unsynchronized).unwrap();

    for name in ["global", "local", "unsync"] {
        let client = manager.get_store_client::<String, String>(name).unwrap();
        client.put(&"k".to_string(), "v".to_string()).unwrap();
        client.delete(&"k".to_string()).unwrap();
    }

    assert_eq!(manager.queued_sync_tasks("global").unwrap(), 2);
    assert_eq!(manager.queued_sync_tasks("local").unwrap(), 0);
    assert_eq!(manager.queued_sync_tasks("unsync").unwrap(), 0);
}

#[test]
fn test_unassigned_writes_carry_the_shared_placeholder_id() {
    let manager = memory_manager();
    manager.register_store("global", Scope::Global).unwrap();
    let client = manager.get_store_client::<String, String>("global").unwrap();

    let clock = client.put(&"k".to_string(), "mine".to_string()).unwrap();
    assert_eq!(clock.version(UNASSIGNED_NODE_ID), 1);
    assert_eq!(clock.entries().count(), 1);
    assert_eq!(manager.queued_sync_tasks("global").unwrap(), 1);

    // another unassigned node's first write compares equal and is dropped
    let other = Versioned::of(
        encode_value(&"theirs".to_string()).unwrap(),
        VectorClock::from_entries([(UNASSIGNED_NODE_ID, 1)], 0),
    );
    let batch = vec![solisync::rpc::KeyedValues::new(key("k"), vec![other])];
    assert_eq!(manager.handle_sync_values("global", batch).unwrap(), 0);
    assert_eq!(client.get_value(&"k".to_string()).unwrap(), Some("mine".to_string()));
}

#[test]
fn test_remote_writes_only_accepted_by_global_stores() {
    let manager = memory_manager();
    manager.register_store("local", Scope::Local).unwrap();
    manager.register_store("global", Scope::Global).unwrap();
    let batch = || {
        vec![solisync::rpc::KeyedValues::new(
            key("k"),
            vec![remote_value("v", 2, 1, 0)],
        )]
    };

    assert!(matches!(
        manager.handle_sync_values("local", batch()),
        Err(SyncError::Protocol(_))
    ));
    assert_eq!(manager.handle_sync_values("global", batch()).unwrap(), 1);
    assert_eq!(manager.handle_sync_values("global", batch()).unwrap(), 0);
}

#[test]
fn test_register_store_twice_is_a_no_op() {
    let manager = memory_manager();
    let before = manager.store_names().len();
    manager.register_store("apps", Scope::Global).unwrap();
    let client = manager.get_store_client::<String, String>("apps").unwrap();
    client.put(&"k".to_string(), "v".to_string()).unwrap();

    manager.register_store("apps", Scope::Global).unwrap();
    manager.register_persistent_store("apps", Scope::Global).unwrap();

    assert_eq!(manager.store_names().len(), before + 1);
    let again = manager.get_store_client::<String, String>("apps").unwrap();
    assert_eq!(again.get_value(&"k".to_string()).unwrap(), Some("v".to_string()));
}

#[test]
fn test_unknown_store() {
    let manager = memory_manager();
    let err = manager
        .get_store_client::<String, String>("missing")
        .err()
        .unwrap();
    assert!(matches!(err, SyncError::UnknownStore(ref name) if name == "missing"));
    assert_eq!(err.exit_code(), 4);
}

#[test]
fn test_system_stores_exist_before_any_application_store() {
    let manager = memory_manager();
    assert_eq!(
        manager.store_names(),
        vec![
            solisync::sync::SYSTEM_NODE_STORE.to_string(),
            solisync::sync::SYSTEM_UNSYNC_STORE.to_string(),
        ]
    );
}

// ============================================================================
// Tombstones and persistence
// ============================================================================

#[test]
fn test_delete_writes_replicable_tombstone() {
    let manager = memory_manager();
    manager.register_store("apps", Scope::Global).unwrap();
    let client = manager.get_store_client::<String, String>("apps").unwrap();
    let k = "app".to_string();

    let written = client.put(&k, "v".to_string()).unwrap();
    client.delete(&k).unwrap();

    assert_eq!(client.get_value(&k).unwrap(), None);
    assert!(client.keys().unwrap().is_empty());
    let versions = client.get_versions(&k).unwrap();
    assert_eq!(versions.len(), 1);
    assert!(versions[0].is_tombstone());
    assert_eq!(versions[0].version().compare(&written), Occurred::After);

    let snapshot = manager.full_sync_messages().unwrap();
    assert_eq!(snapshot.len(), 1);
}

#[test]
fn test_entries_are_typed_and_ordered() {
    let manager = memory_manager();
    manager.register_store("apps", Scope::Local).unwrap();
    let client = manager.get_store_client::<String, u64>("apps").unwrap();
    for (k, v) in [("b", 2), ("a", 1), ("c", 3)] {
        client.put(&k.to_string(), v).unwrap();
    }
    client.delete(&"c".to_string()).unwrap();

    let entries: Vec<(String, Option<u64>)> = client
        .entries()
        .unwrap()
        .into_iter()
        .map(|(k, v)| (k, v.into_value()))
        .collect();
    assert_eq!(
        entries,
        vec![("a".to_string(), Some(1)), ("b".to_string(), Some(2))]
    );
    assert_eq!(client.get_value_or(&"c".to_string(), 9).unwrap(), 9);
}

#[tokio::test]
async fn test_persistent_store_survives_restart() {
    let (manager, dir) = persistent_manager();
    manager.register_persistent_store("apps", Scope::Global).unwrap();
    manager.register_store("scratch", Scope::Global).unwrap();
    assert!(manager.store_handle("apps").unwrap().engine().is_persistent());
    assert!(!manager.store_handle("scratch").unwrap().engine().is_persistent());

    let client = manager.get_store_client::<String, String>("apps").unwrap();
    let version = client.put(&"k".to_string(), "kept".to_string()).unwrap();
    manager
        .get_store_client::<String, String>("scratch")
        .unwrap()
        .put(&"k".to_string(), "lost".to_string())
        .unwrap();
    manager.shutdown().await;

    let reopened = SyncManager::new(test_config(&dir)).unwrap();
    reopened.register_persistent_store("apps", Scope::Global).unwrap();
    reopened.register_store("scratch", Scope::Global).unwrap();
    let apps = reopened.get_store_client::<String, String>("apps").unwrap();
    let stored = apps.get(&"k".to_string()).unwrap();
    assert_eq!(stored.value(), Some(&"kept".to_string()));
    assert_eq!(stored.version().compare(&version), Occurred::Equal);
    let scratch = reopened.get_store_client::<String, String>("scratch").unwrap();
    assert_eq!(scratch.get_value(&"k".to_string()).unwrap(), None);
    reopened.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_twice_and_use_after_shutdown() {
    let (manager, _dir) = persistent_manager();
    manager.register_persistent_store("apps", Scope::Global).unwrap();
    let client = manager.get_store_client::<String, String>("apps").unwrap();
    client.put(&"k".to_string(), "v".to_string()).unwrap();

    let other = manager.clone();
    let first = tokio::spawn(async move { other.shutdown().await });
    manager.shutdown().await;
    first.await.unwrap();

    assert!(matches!(
        manager.get_store_client::<String, String>("apps"),
        Err(SyncError::Shutdown)
    ));
    assert!(client.put(&"k".to_string(), "v2".to_string()).is_err());
}
