//! Standalone replication server.
//!
//! Environment:
//! - `REPLICA_BIND`    : listen address (default `127.0.0.1:9090`)
//! - `REPLICA_TICK_MS` : tick period in milliseconds (default 50)
//! - `REPLICA_DATA_DIR`: RocksDB directory; needs the `rocksdb` feature
//! - `RUST_LOG`        : log filter (default `info`)

use std::sync::Arc;
use std::time::Duration;

use replica_collab::storage::{MemoryStorage, StorageBackend};
use replica_collab::{DefaultHooks, ServerConfig, SyncServer};

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("REPLICA_BIND") {
        config.bind_addr = bind;
    }
    if let Ok(tick) = std::env::var("REPLICA_TICK_MS") {
        match tick.parse::<u64>() {
            Ok(ms) if ms > 0 => config.tick = Duration::from_millis(ms),
            _ => log::warn!("Ignoring invalid REPLICA_TICK_MS={tick}"),
        }
    }
    config
}

#[cfg(feature = "rocksdb")]
fn open_storage() -> Result<Arc<dyn StorageBackend>, Box<dyn std::error::Error + Send + Sync>> {
    use replica_collab::storage::{RocksConfig, RocksStorage};
    match std::env::var("REPLICA_DATA_DIR") {
        Ok(dir) => {
            let config = RocksConfig { path: dir.into(), ..RocksConfig::default() };
            Ok(Arc::new(RocksStorage::open(config)?))
        }
        Err(_) => Ok(Arc::new(MemoryStorage::new())),
    }
}

#[cfg(not(feature = "rocksdb"))]
fn open_storage() -> Result<Arc<dyn StorageBackend>, Box<dyn std::error::Error + Send + Sync>> {
    if std::env::var("REPLICA_DATA_DIR").is_ok() {
        log::warn!("REPLICA_DATA_DIR set but built without the rocksdb feature; using memory storage");
    }
    Ok(Arc::new(MemoryStorage::new()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from_env();
    let server = SyncServer::new(config, open_storage()?, Arc::new(DefaultHooks));

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupt received");
            shutdown.shutdown();
        }
    });

    server.run().await
}
