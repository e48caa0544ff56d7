//! Persistence through a running server: periodic flush, shutdown drain,
//! recovery into a fresh server, and the RocksDB backend.

use replica_collab::client::{ClientConfig, ClientEvent, SyncClient};
use replica_collab::server::{ServerConfig, SyncServer};
use replica_collab::storage::{MemoryStorage, StorageBackend};
use replica_collab::store::{DefaultHooks, DocumentHooks};
use replica_core::{TrackedDocument, Value};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

/// Adds a hydrated cache that must never leave the server.
struct CachingHooks;

impl DocumentHooks for CachingHooks {
    fn hydrate(&self, _name: &str, doc: &mut TrackedDocument) {
        let _ = doc.set("/$cache", "warm");
    }
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server(
    config: ServerConfig,
    storage: Arc<dyn StorageBackend>,
    hooks: Arc<dyn DocumentHooks>,
) -> (Arc<SyncServer>, JoinHandle<()>) {
    let server = Arc::new(SyncServer::new(config, storage, hooks));
    let running = server.clone();
    let task = tokio::spawn(async move {
        running.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, task)
}

async fn wait_for(rx: &mut mpsc::Receiver<ClientEvent>, pred: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Connect, subscribe, and wait for the snapshot.
async fn subscribed_client(port: u16, name: &str) -> (SyncClient, mpsc::Receiver<ClientEvent>) {
    let mut client = SyncClient::new(ClientConfig::for_testing(format!("ws://127.0.0.1:{port}")));
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    client.subscribe(name).await.unwrap();
    let loaded = name.to_string();
    wait_for(&mut rx, move |e| *e == ClientEvent::DocumentLoaded(loaded.clone())).await;
    (client, rx)
}

/// Poll storage until `pred` holds for the stored document.
async fn wait_stored(storage: &dyn StorageBackend, name: &str, pred: impl Fn(&Value) -> bool) -> Value {
    timeout(Duration::from_secs(2), async {
        loop {
            if let Some(doc) = storage.load(name).unwrap() {
                if pred(&doc) {
                    return doc;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for a save")
}

#[tokio::test]
async fn test_periodic_flush_persists_changes() {
    let port = free_port().await;
    let storage = Arc::new(MemoryStorage::new());
    let config = ServerConfig::for_testing(format!("127.0.0.1:{port}"));
    let (_server, _task) = start_server(config, storage.clone(), Arc::new(CachingHooks)).await;

    let (client, _rx) = subscribed_client(port, "notes").await;
    client.update("notes", |doc| doc.set("/title", "draft")).await.unwrap().unwrap();

    let stored = wait_stored(storage.as_ref(), "notes", |doc| doc.get("title").is_some()).await;
    assert_eq!(stored.get("title"), Some(&Value::from("draft")));
    assert!(stored.get("$cache").is_none(), "hydrated keys are not persisted");
}

#[tokio::test]
async fn test_hydrated_keys_stay_on_server() {
    let port = free_port().await;
    let config = ServerConfig::for_testing(format!("127.0.0.1:{port}"));
    let (server, _task) = start_server(config, Arc::new(MemoryStorage::new()), Arc::new(CachingHooks)).await;

    let (client, _rx) = subscribed_client(port, "notes").await;
    let mirror = client.document("notes").await.unwrap();
    assert!(mirror.get("$cache").is_none());

    let entry = server.store().get("notes").unwrap();
    let state = entry.lock().await;
    assert_eq!(state.doc().get("/$cache"), Some(&Value::from("warm")));
}

#[tokio::test]
async fn test_shutdown_flushes_pending_saves() {
    let port = free_port().await;
    let storage = Arc::new(MemoryStorage::new());
    let config = ServerConfig {
        // only the shutdown drain can save
        persist_interval: Duration::from_secs(3600),
        ..ServerConfig::for_testing(format!("127.0.0.1:{port}"))
    };
    let (server, task) = start_server(config, storage.clone(), Arc::new(DefaultHooks)).await;

    let (client, mut rx) = subscribed_client(port, "ledger").await;
    client
        .update("ledger", |doc| doc.set("/entities/1", Value::from(json!({"balance": 12}))))
        .await
        .unwrap()
        .unwrap();
    wait_for(&mut rx, |e| matches!(e, ClientEvent::Patched { .. })).await;
    assert!(storage.load("ledger").unwrap().is_none());

    server.shutdown_handle().shutdown();
    timeout(Duration::from_secs(3), task).await.unwrap().unwrap();

    let stored = storage.load("ledger").unwrap().unwrap();
    assert_eq!(stored.pointer("/entities/1/balance"), Some(&Value::Int(12)));
    assert_eq!(server.stats().await.store.saves, 1);
}

#[tokio::test]
async fn test_restart_recovers_documents() {
    let storage = Arc::new(MemoryStorage::new());

    let port = free_port().await;
    let config = ServerConfig::for_testing(format!("127.0.0.1:{port}"));
    let (server, task) = start_server(config, storage.clone(), Arc::new(DefaultHooks)).await;
    let (client, mut rx) = subscribed_client(port, "world").await;
    client.update("world", |doc| doc.set("/entities/2", Value::from(json!({"name": "tree"})))).await.unwrap().unwrap();
    wait_for(&mut rx, |e| matches!(e, ClientEvent::Patched { .. })).await;
    server.shutdown_handle().shutdown();
    timeout(Duration::from_secs(3), task).await.unwrap().unwrap();

    let port = free_port().await;
    let config = ServerConfig::for_testing(format!("127.0.0.1:{port}"));
    let (server, _task) = start_server(config, storage.clone(), Arc::new(DefaultHooks)).await;
    assert!(server.store().get("world").is_some(), "recovered before accepting connections");

    let (client, _rx) = subscribed_client(port, "world").await;
    let doc = client.document("world").await.unwrap();
    assert_eq!(doc.pointer("/entities/2/name"), Some(&Value::from("tree")));
}

#[cfg(feature = "rocksdb")]
#[tokio::test]
async fn test_rocksdb_backend_round_trip() {
    use replica_collab::storage::{RocksConfig, RocksStorage};

    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(RocksStorage::open(RocksConfig::for_testing(dir.path())).unwrap());

    let port = free_port().await;
    let config = ServerConfig::for_testing(format!("127.0.0.1:{port}"));
    let (_server, _task) = start_server(config, storage.clone(), Arc::new(DefaultHooks)).await;

    let (client, _rx) = subscribed_client(port, "atlas").await;
    client.update("atlas", |doc| doc.set("/region", "north")).await.unwrap().unwrap();

    let stored = wait_stored(storage.as_ref(), "atlas", |doc| doc.get("region").is_some()).await;
    assert_eq!(stored.get("region"), Some(&Value::from("north")));

    let meta = storage.load_metadata("atlas").unwrap().unwrap();
    assert_eq!(meta.name, "atlas");
    assert!(meta.version >= 1);
    assert_eq!(storage.list().unwrap(), vec!["atlas".to_string()]);
}
