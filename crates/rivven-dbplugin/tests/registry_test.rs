//! Tests for shared driver registration across stages

use rivven_dbplugin::prelude::*;
use rivven_dbplugin::registry::DriverKey;
use rivven_dbplugin::testing::{MemoryDatabase, MemoryDriver, MemoryDriverClass};
use std::sync::Arc;

const URL: &str = "jdbc:memory://shared";

fn class() -> (MemoryDatabase, MemoryDriverClass) {
    let db = MemoryDatabase::new();
    (db.clone(), MemoryDriverClass::new(MemoryDriver::with_database(db)))
}

fn key() -> DriverKey {
    DriverKey::new("jdbc", "memory")
}

#[test]
fn test_single_registration_per_key() {
    let manager = Arc::new(DriverManager::new());
    let registry = DriverRegistry::new(Arc::clone(&manager));
    let (_db, class) = class();

    let a = registry.ensure_available(&class, URL, "jdbc", "memory").unwrap();
    let b = registry.ensure_available(&class, URL, "jdbc", "memory").unwrap();
    assert_eq!(class.instantiations(), 1);
    assert_eq!(manager.len(), 1);
    assert_eq!(registry.active_references(&key()), 2);

    registry.release(a);
    assert!(registry.is_registered(&key()));
    assert_eq!(manager.len(), 1);

    registry.release(b);
    assert!(!registry.is_registered(&key()));
    assert!(manager.is_empty());
}

#[test]
fn test_reregisters_after_full_release() {
    let registry = DriverRegistry::new(Arc::new(DriverManager::new()));
    let (_db, class) = class();

    let handle = registry.ensure_available(&class, URL, "jdbc", "memory").unwrap();
    registry.release(handle);
    let handle = registry.ensure_available(&class, URL, "jdbc", "memory").unwrap();
    assert_eq!(class.instantiations(), 2);
    registry.release(handle);
}

#[test]
fn test_distinct_keys_are_independent() {
    let manager = Arc::new(DriverManager::new());
    let registry = DriverRegistry::new(Arc::clone(&manager));
    let (_db, class) = class();

    let a = registry.ensure_available(&class, URL, "jdbc", "memory").unwrap();
    let b = registry.ensure_available(&class, URL, "jdbc", "memory-2").unwrap();
    assert_eq!(manager.len(), 2);

    registry.release(a);
    assert!(registry.is_registered(&DriverKey::new("jdbc", "memory-2")));
    registry.release(b);
    assert!(manager.is_empty());
}

#[test]
fn test_load_failures() {
    let registry = DriverRegistry::new(Arc::new(DriverManager::new()));
    let (_db, class) = class();

    let failing = class.clone().failing("class not found");
    let err = registry
        .ensure_available(&failing, URL, "jdbc", "memory")
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::DriverLoad);

    let err = registry
        .ensure_available(&class, "jdbc:other://x", "jdbc", "memory")
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::DriverLoad);
    assert!(!registry.is_registered(&key()));
}

#[tokio::test]
async fn test_connection_outlives_handle() {
    let manager = Arc::new(DriverManager::new());
    let registry = DriverRegistry::new(Arc::clone(&manager));
    let (db, class) = class();

    let handle = registry.ensure_available(&class, URL, "jdbc", "memory").unwrap();
    let conn = handle.connect(URL, &Properties::new()).await.unwrap();
    registry.release(handle);

    assert!(registry.is_registered(&key()));
    assert!(conn.is_valid().await);
    assert_eq!(db.open_connections(), 1);

    drop(conn);
    assert!(!registry.is_registered(&key()));
    assert!(manager.is_empty());
    assert_eq!(db.open_connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_release() {
    let manager = Arc::new(DriverManager::new());
    let registry = DriverRegistry::new(Arc::clone(&manager));
    let (_db, class) = class();
    let class = Arc::new(class);

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let class = Arc::clone(&class);
            tokio::spawn(async move {
                for _ in 0..20 {
                    let handle = registry
                        .ensure_available(class.as_ref(), URL, "jdbc", "memory")
                        .unwrap();
                    let conn = handle.connect(URL, &Properties::new()).await.unwrap();
                    tokio::task::yield_now().await;
                    drop(conn);
                    registry.release(handle);
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(registry.active_references(&key()), 0);
    assert!(!registry.is_registered(&key()));
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_handles_connect_through_their_own_driver() {
    let manager = Arc::new(DriverManager::new());
    let registry = DriverRegistry::new(Arc::clone(&manager));
    let (db_a, class_a) = class();
    let (db_b, class_b) = class();
    let key_a = DriverKey::new("jdbc", "driver-a");
    let key_b = DriverKey::new("jdbc", "driver-b");

    let ha = registry.ensure_available(&class_a, URL, "jdbc", "driver-a").unwrap();
    let hb = registry.ensure_available(&class_b, URL, "jdbc", "driver-b").unwrap();

    let conn_b = hb.connect(URL, &Properties::new()).await.unwrap();
    assert_eq!(db_a.open_connections(), 0);
    assert_eq!(db_b.open_connections(), 1);

    registry.release(ha);
    assert!(!registry.is_registered(&key_a));
    assert!(registry.is_registered(&key_b));
    assert_eq!(manager.len(), 1);
    assert!(conn_b.is_valid().await);

    registry.release(hb);
    assert!(registry.is_registered(&key_b));
    drop(conn_b);
    assert_eq!(db_b.open_connections(), 0);
    assert!(!registry.is_registered(&key_b));
    assert!(manager.is_empty());
}
