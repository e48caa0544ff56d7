//! WebSocket replication server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── DocumentStore ── StorageBackend
//!             ├── SessionRegistry ─────┤        │
//! Client B ──┘   (queues, subs)       │        │ lock per document
//!        ▲                            └── SyncLoop (tick)
//!        │                                      │
//!        └──────── patch / fpatch ◄─────────────┘
//! ```
//!
//! Each connection task:
//! - decodes inbound frames (reassembling chunks)
//! - applies `sync` batches under the document lock, op by op
//! - forwards its outbound queue to the socket
//!
//! Changes reach the other subscribers on the next tick. The session that
//! sent them is not sent its own ops back.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;

use replica_core::patch;
use replica_core::FieldPolicy;

use crate::broadcast::{SessionInfo, SessionRegistry};
use crate::chunk::{ReassemblyConfig, Reassembler, TransportLimits};
use crate::clock;
use crate::protocol::{CompressionConfig, SignalKind, SyncMessage};
use crate::storage::{MemoryStorage, StorageBackend};
use crate::store::{DefaultHooks, DocumentHooks, DocumentStore, StoreConfig, StoreError, StoreStats};
use crate::sync_loop::{stop_requested, SyncLoop, SyncLoopConfig};
use crate::transport::{EncodedFrames, PeerNegotiator, PeerTransportFactory, TransportManager};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Replication tick period
    pub tick: Duration,
    /// Fast patches go out every N ticks
    pub fast_patch_every: u64,
    /// How often dirty documents are considered for saving
    pub persist_interval: Duration,
    /// Minimum time between two saves of one document
    pub persist_debounce: Duration,
    /// Outbound queue capacity per session
    pub outbound_capacity: usize,
    /// Upper bound on the shutdown flush
    pub shutdown_grace: Duration,
    pub limits: TransportLimits,
    pub compression: CompressionConfig,
    pub reassembly: ReassemblyConfig,
    pub field_policy: FieldPolicy,
    /// Byte order of ids inside fast-patch blocks
    pub little_endian: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            tick: Duration::from_millis(50),
            fast_patch_every: 1,
            persist_interval: Duration::from_secs(5),
            persist_debounce: Duration::from_secs(5),
            outbound_capacity: 256,
            shutdown_grace: Duration::from_secs(5),
            limits: TransportLimits::default(),
            compression: CompressionConfig::default(),
            reassembly: ReassemblyConfig::default(),
            field_policy: FieldPolicy::default(),
            little_endian: false,
        }
    }
}

impl ServerConfig {
    /// Fast ticks and no persistence debounce.
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            tick: Duration::from_millis(10),
            persist_interval: Duration::from_millis(50),
            persist_debounce: Duration::ZERO,
            shutdown_grace: Duration::from_secs(1),
            reassembly: ReassemblyConfig::for_testing(),
            ..Self::default()
        }
    }

    pub fn sync_loop_config(&self) -> SyncLoopConfig {
        SyncLoopConfig {
            tick: self.tick,
            fast_patch_every: self.fast_patch_every,
            persist_interval: self.persist_interval,
            compression: self.compression.clone(),
            limits: self.limits.clone(),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            persist_debounce: self.persist_debounce,
            field_policy: self.field_policy,
            little_endian: self.little_endian,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_frames: u64,
    pub applied_ops: u64,
    pub failed_ops: u64,
    /// Ops skipped by authorization. Not reported to clients.
    pub denied_ops: u64,
    pub fast_dropped: u64,
    pub sessions_kicked: u64,
    pub store: StoreStats,
}

/// State shared by the accept loop and every connection task.
struct ServerContext {
    config: ServerConfig,
    store: Arc<DocumentStore>,
    sessions: Arc<SessionRegistry>,
    sync: Arc<SyncLoop>,
    stats: RwLock<ServerStats>,
    peers: OnceLock<Arc<dyn PeerTransportFactory>>,
}

/// Triggers a graceful stop of [`SyncServer::run`].
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

/// The sync server.
pub struct SyncServer {
    ctx: Arc<ServerContext>,
    stop: Arc<watch::Sender<bool>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, storage: Arc<dyn StorageBackend>, hooks: Arc<dyn DocumentHooks>) -> Self {
        let store = Arc::new(DocumentStore::new(storage, hooks, config.store_config()));
        let sessions = Arc::new(SessionRegistry::new());
        let sync = Arc::new(SyncLoop::new(store.clone(), sessions.clone(), config.sync_loop_config()));
        let (stop, _) = watch::channel(false);
        let ctx = ServerContext {
            config,
            store,
            sessions,
            sync,
            stats: RwLock::new(ServerStats::default()),
            peers: OnceLock::new(),
        };
        Self { ctx: Arc::new(ctx), stop: Arc::new(stop) }
    }

    /// In-memory storage, every operation allowed.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(MemoryStorage::new()), Arc::new(DefaultHooks))
    }

    /// Enable secondary-channel negotiation. Only the first call takes effect.
    pub fn set_peer_factory(&self, factory: Arc<dyn PeerTransportFactory>) -> bool {
        self.ctx.peers.set(factory).is_ok()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.stop.clone())
    }

    /// Load every stored document so reconnecting clients find them warm.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        self.ctx.store.recover().await
    }

    /// Accept connections and tick until shut down, then drain.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from storage");
        }

        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.ctx.config.bind_addr);

        let mut sync_task = tokio::spawn(self.ctx.sync.clone().run(self.stop.subscribe()));
        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(ctx, stream, addr).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = stop_requested(&mut stop) => break,
            }
        }

        let deadline = tokio::time::Instant::now() + self.ctx.config.shutdown_grace;
        drop(listener);
        log::info!("Shutting down");
        if tokio::time::timeout_at(deadline, &mut sync_task).await.is_err() {
            log::warn!("Sync loop did not stop before the shutdown deadline");
            sync_task.abort();
        }
        self.ctx.sync.shutdown_by("server shutting down", deadline).await;
        Ok(())
    }

    async fn handle_connection(
        ctx: Arc<ServerContext>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<EncodedFrames>(ctx.config.outbound_capacity);
        let session = ctx.sessions.register(addr, TransportManager::new(out_tx), clock::now_ms()).await;
        log::info!("Session {} connected from {addr}", session.id);
        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut reassembler = Reassembler::new(ctx.config.reassembly.clone());
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = ctx.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            ctx.handle_frame(&session, &data, &mut reassembler).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Session {} closed", session.id);
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frames = out_rx.recv() => {
                    let Some(frames) = frames else {
                        log::info!("Session {} dropped by server", session.id);
                        break;
                    };
                    let mut failed = false;
                    for frame in frames.frames.iter() {
                        if let Err(e) = ws_sender.send(Message::Binary(frame.clone().into())).await {
                            log::warn!("Send of {} to session {} failed: {e}", frames.kind, session.id);
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        break;
                    }
                }
            }
        }

        ctx.sessions.unregister(session.id).await;
        {
            let mut s = ctx.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        let _ = ws_sender.close().await;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.ctx.stats.read().await.clone();
        let broadcast = self.ctx.sessions.stats().await;
        stats.fast_dropped = broadcast.fast_dropped;
        stats.sessions_kicked = broadcast.sessions_kicked;
        stats.store = self.ctx.store.stats();
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.ctx.config.bind_addr
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.ctx.store
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.ctx.sessions
    }

    pub fn sync_loop(&self) -> &Arc<SyncLoop> {
        &self.ctx.sync
    }
}

impl ServerContext {
    async fn reply(&self, session: &SessionInfo, msg: &SyncMessage) {
        match self.sync.encode(msg) {
            Ok(frames) => {
                self.sessions.send_to(session.id, frames).await;
            }
            Err(e) => log::error!("Failed to encode {} for session {}: {e}", msg.kind(), session.id),
        }
    }

    async fn handle_frame(&self, session: &SessionInfo, data: &[u8], reassembler: &mut Reassembler) {
        let max_size = reassembler.max_message_size();
        let msg = match SyncMessage::decode_limited(data, max_size) {
            Ok(SyncMessage::Chunk(chunk)) => match reassembler.accept(chunk, std::time::Instant::now()) {
                Ok(Some(frame)) => SyncMessage::decode_limited(&frame, max_size),
                Ok(None) => return,
                Err(e) => {
                    log::warn!("Dropping chunk from session {}: {e}", session.id);
                    return;
                }
            },
            other => other,
        };
        match msg {
            Ok(SyncMessage::Chunk(_)) => log::warn!("Nested chunk from session {}", session.id),
            Ok(msg) => self.handle_message(session, msg).await,
            Err(e) => {
                self.stats.write().await.malformed_frames += 1;
                log::warn!("Failed to decode message from session {}: {e}", session.id);
            }
        }
    }

    async fn handle_message(&self, session: &SessionInfo, msg: SyncMessage) {
        match msg {
            SyncMessage::Subscribe { name } => self.subscribe(session, &name).await,
            SyncMessage::Unsubscribe { name } => {
                if self.sessions.unsubscribe(session.id, &name).await {
                    log::info!("Session {} unsubscribed from {name}", session.id);
                }
            }
            SyncMessage::Sync { name, ops, .. } => self.apply_sync(session, &name, ops).await,
            SyncMessage::Ping { client_time } => {
                let pong = SyncMessage::Pong { client_time, server_time: clock::now_ms() };
                self.reply(session, &pong).await;
            }
            SyncMessage::Peng { rtt_ms } => {
                log::trace!("Session {} rtt {rtt_ms}ms", session.id);
                self.sessions.set_rtt(session.id, rtt_ms).await;
            }
            SyncMessage::Signal { kind, payload } => self.signal(session, kind, &payload).await,
            other => log::warn!("Unexpected {} message from session {}", other.kind(), session.id),
        }
    }

    /// Flush pending ops to current subscribers, then snapshot and register
    /// the new one, all under the document lock.
    async fn subscribe(&self, session: &SessionInfo, name: &str) {
        let entry = match self.store.get_or_load(name, Some(session.id)).await {
            Ok(entry) => entry,
            Err(e) => {
                log::info!("Subscribe to {name} by session {} refused: {e}", session.id);
                let reason = e.to_string();
                self.reply(session, &SyncMessage::Error { name: name.to_string(), reason }).await;
                return;
            }
        };

        let mut state = entry.lock().await;
        self.sync.publish_pending(name, &mut state).await;
        self.sessions.subscribe(session.id, name).await;
        let full = state.full_snapshot(clock::now_ms());
        self.reply(session, &full).await;
        drop(state);
        log::info!("Session {} subscribed to {name}", session.id);
    }

    async fn apply_sync(&self, session: &SessionInfo, name: &str, ops: Vec<replica_core::WireOp>) {
        if !self.sessions.is_subscribed(session.id, name).await {
            log::warn!("Sync for {name} from unsubscribed session {}", session.id);
            return;
        }
        let Some(entry) = self.store.get(name) else {
            return;
        };
        let (changes, undecodable) = patch::decode_batch(ops);
        let hooks = self.store.hooks().clone();
        let report = {
            let mut state = entry.lock().await;
            state.apply_from(session.id, &changes, |c| hooks.can_sync(session.id, name, c))
        };
        if report.denied > 0 {
            log::debug!("Session {}: {} op(s) on {name} denied", session.id, report.denied);
        }
        let mut s = self.stats.write().await;
        s.applied_ops += report.applied as u64;
        s.failed_ops += (report.failed + undecodable) as u64;
        s.denied_ops += report.denied as u64;
    }

    async fn signal(&self, session: &SessionInfo, kind: SignalKind, payload: &str) {
        let Some(transport) = self.sessions.transport(session.id).await else {
            return;
        };
        if kind == SignalKind::Offer && transport.with_negotiator(|_| ()).is_none() {
            let Some(factory) = self.peers.get() else {
                log::debug!("Offer from session {} ignored: no peer transport", session.id);
                return;
            };
            transport.set_negotiator(PeerNegotiator::new(factory.create(session.id)));
        }
        let replies = match transport.with_negotiator(|n| n.handle_signal(kind, payload)) {
            Some(Ok(replies)) => replies,
            Some(Err(e)) => {
                log::warn!("Signal {kind:?} from session {} rejected: {e}", session.id);
                return;
            }
            None => {
                log::debug!("Signal {kind:?} from session {} before offer", session.id);
                return;
            }
        };
        for reply in &replies {
            self.reply(session, reply).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.tick, Duration::from_millis(50));
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.sync_loop_config().fast_patch_every, 1);
        assert_eq!(config.store_config().persist_debounce, Duration::from_secs(5));
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.denied_ops, 0);
        assert_eq!(stats.store, StoreStats::default());
    }

    #[tokio::test]
    async fn test_server_recovery() {
        let storage = Arc::new(MemoryStorage::new());
        storage.save("world", &replica_core::Value::map()).unwrap();
        let server = SyncServer::new(ServerConfig::for_testing("127.0.0.1:0"), storage, Arc::new(DefaultHooks));
        assert_eq!(server.recover().await.unwrap(), 1);
        assert!(server.store().get("world").is_some());
    }

    #[test]
    fn test_peer_factory_set_once() {
        let server = SyncServer::with_defaults();
        assert!(server.set_peer_factory(Arc::new(crate::transport::testing::FakeFactory)));
        assert!(!server.set_peer_factory(Arc::new(crate::transport::testing::FakeFactory)));
    }
}
