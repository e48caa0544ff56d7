//! Session registry and subscription fan-out.
//!
//! Every connection registers one session holding a [`TransportManager`].
//! The registry owns the only sender of each session's outbound queue, so
//! dropping a session closes that queue and ends its connection task.
//!
//! ```text
//!             ┌───────────────────────────────┐
//!   frames ──►│ SessionRegistry               │
//!   (Arc)     │  "world" → {1, 3}             │──► session 1 queue
//!             │  "lobby" → {2}                │──► session 3 queue
//!             └───────────────────────────────┘
//! ```
//!
//! Sends never block: reliable frames that hit a full queue disconnect the
//! session, fast frames are dropped.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::transport::{EncodedFrames, SendOutcome, TransportError, TransportManager};

pub type SessionId = u64;

/// Diagnostics about one connected session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    /// Opaque token for correlating logs across reconnects.
    pub token: Uuid,
    pub addr: SocketAddr,
    pub connected_at_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub fast_dropped: u64,
    pub sessions_kicked: u64,
    pub active_sessions: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    fast_dropped: AtomicU64,
    sessions_kicked: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            fast_dropped: AtomicU64::new(0),
            sessions_kicked: AtomicU64::new(0),
        }
    }
}

struct Session {
    info: SessionInfo,
    transport: Arc<TransportManager>,
    subscriptions: BTreeSet<String>,
    rtt_ms: Option<u64>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Session>,
    subscribers: HashMap<String, BTreeSet<SessionId>>,
}

impl Registry {
    fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        for name in &session.subscriptions {
            if let Some(set) = self.subscribers.get_mut(name) {
                set.remove(&id);
                if set.is_empty() {
                    self.subscribers.remove(name);
                }
            }
        }
        Some(session)
    }
}

/// Sessions, their subscriptions, and non-blocking delivery to them.
pub struct SessionRegistry {
    next_id: AtomicU64,
    inner: RwLock<Registry>,
    atomic_stats: AtomicBroadcastStats,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), inner: RwLock::new(Registry::default()), atomic_stats: AtomicBroadcastStats::new() }
    }

    /// Register a connection. The registry takes the only handle to its
    /// outbound queue.
    pub async fn register(&self, addr: SocketAddr, transport: TransportManager, now_ms: u64) -> SessionInfo {
        let info = SessionInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            token: Uuid::new_v4(),
            addr,
            connected_at_ms: now_ms,
        };
        let session = Session {
            info: info.clone(),
            transport: Arc::new(transport),
            subscriptions: BTreeSet::new(),
            rtt_ms: None,
        };
        self.inner.write().await.sessions.insert(info.id, session);
        log::debug!("Session {} ({}) registered from {addr}", info.id, info.token);
        info
    }

    /// Remove a session and all of its subscriptions.
    pub async fn unregister(&self, id: SessionId) -> Option<SessionInfo> {
        let removed = self.inner.write().await.remove(id)?;
        log::debug!("Session {id} unregistered");
        Some(removed.info)
    }

    pub async fn subscribe(&self, id: SessionId, name: &str) -> bool {
        let mut reg = self.inner.write().await;
        let Some(session) = reg.sessions.get_mut(&id) else {
            return false;
        };
        session.subscriptions.insert(name.to_string());
        reg.subscribers.entry(name.to_string()).or_default().insert(id);
        true
    }

    /// Returns whether the session was subscribed.
    pub async fn unsubscribe(&self, id: SessionId, name: &str) -> bool {
        let mut reg = self.inner.write().await;
        let was = reg.sessions.get_mut(&id).is_some_and(|s| s.subscriptions.remove(name));
        if let Some(set) = reg.subscribers.get_mut(name) {
            set.remove(&id);
            if set.is_empty() {
                reg.subscribers.remove(name);
            }
        }
        was
    }

    pub async fn is_subscribed(&self, id: SessionId, name: &str) -> bool {
        self.inner.read().await.subscribers.get(name).is_some_and(|s| s.contains(&id))
    }

    pub async fn subscribers(&self, name: &str) -> Vec<SessionId> {
        self.inner
            .read()
            .await
            .subscribers
            .get(name)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Documents with at least one subscriber.
    pub async fn subscribed_documents(&self) -> Vec<String> {
        self.inner.read().await.subscribers.keys().cloned().collect()
    }

    pub async fn info(&self, id: SessionId) -> Option<SessionInfo> {
        self.inner.read().await.sessions.get(&id).map(|s| s.info.clone())
    }

    pub async fn transport(&self, id: SessionId) -> Option<Arc<TransportManager>> {
        self.inner.read().await.sessions.get(&id).map(|s| s.transport.clone())
    }

    pub async fn set_rtt(&self, id: SessionId, rtt_ms: u64) {
        if let Some(session) = self.inner.write().await.sessions.get_mut(&id) {
            session.rtt_ms = Some(rtt_ms);
        }
    }

    pub async fn rtt(&self, id: SessionId) -> Option<u64> {
        self.inner.read().await.sessions.get(&id).and_then(|s| s.rtt_ms)
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Send to one session.
    pub async fn send_to(&self, id: SessionId, frames: EncodedFrames) -> Option<SendOutcome> {
        let result = {
            let reg = self.inner.read().await;
            let session = reg.sessions.get(&id)?;
            self.deliver(session, frames)
        };
        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                self.kick(&[id], &e).await;
                None
            }
        }
    }

    /// Send to every subscriber of `name`. Returns the number of sessions
    /// the frames were handed to.
    pub async fn broadcast(&self, name: &str, frames: &EncodedFrames) -> usize {
        self.broadcast_except(name, frames, &BTreeSet::new()).await
    }

    /// Send to every subscriber of `name` not in `skip`.
    pub async fn broadcast_except(&self, name: &str, frames: &EncodedFrames, skip: &BTreeSet<SessionId>) -> usize {
        let (delivered, failed) = {
            let reg = self.inner.read().await;
            let Some(ids) = reg.subscribers.get(name) else {
                return 0;
            };
            self.deliver_all(&reg, ids.difference(skip).copied(), frames)
        };
        self.kick_failed(failed).await;
        delivered
    }

    /// Send to one session if it is still subscribed to `name`.
    pub async fn send_to_subscriber(&self, id: SessionId, name: &str, frames: &EncodedFrames) -> bool {
        let (delivered, failed) = {
            let reg = self.inner.read().await;
            if !reg.subscribers.get(name).is_some_and(|s| s.contains(&id)) {
                return false;
            }
            self.deliver_all(&reg, std::iter::once(id), frames)
        };
        self.kick_failed(failed).await;
        delivered == 1
    }

    /// Send to every session, subscribed or not.
    pub async fn broadcast_all(&self, frames: &EncodedFrames) -> usize {
        let (delivered, failed) = {
            let reg = self.inner.read().await;
            self.deliver_all(&reg, reg.sessions.keys().copied(), frames)
        };
        self.kick_failed(failed).await;
        delivered
    }

    /// Drop every session, closing all outbound queues.
    pub async fn close_all(&self) -> usize {
        let mut reg = self.inner.write().await;
        let count = reg.sessions.len();
        reg.sessions.clear();
        reg.subscribers.clear();
        count
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            fast_dropped: self.atomic_stats.fast_dropped.load(Ordering::Relaxed),
            sessions_kicked: self.atomic_stats.sessions_kicked.load(Ordering::Relaxed),
            active_sessions: self.inner.read().await.sessions.len(),
        }
    }

    fn deliver(&self, session: &Session, frames: EncodedFrames) -> Result<SendOutcome, TransportError> {
        let outcome = session.transport.send(frames)?;
        match outcome {
            SendOutcome::Dropped => self.atomic_stats.fast_dropped.fetch_add(1, Ordering::Relaxed),
            _ => self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed),
        };
        Ok(outcome)
    }

    fn deliver_all(
        &self,
        reg: &Registry,
        ids: impl Iterator<Item = SessionId>,
        frames: &EncodedFrames,
    ) -> (usize, Vec<(SessionId, TransportError)>) {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for id in ids {
            let Some(session) = reg.sessions.get(&id) else {
                continue;
            };
            match self.deliver(session, frames.clone()) {
                Ok(SendOutcome::Dropped) => {}
                Ok(_) => delivered += 1,
                Err(e) => failed.push((id, e)),
            }
        }
        (delivered, failed)
    }

    async fn kick_failed(&self, failed: Vec<(SessionId, TransportError)>) {
        for (id, e) in failed {
            self.kick(&[id], &e).await;
        }
    }

    async fn kick(&self, ids: &[SessionId], reason: &TransportError) {
        let mut reg = self.inner.write().await;
        for id in ids {
            if reg.remove(*id).is_some() {
                self.atomic_stats.sessions_kicked.fetch_add(1, Ordering::Relaxed);
                log::warn!("Disconnecting session {id}: {reason}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SyncMessage;
    use tokio::sync::mpsc;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn frames(msg: &SyncMessage) -> EncodedFrames {
        EncodedFrames {
            frames: Arc::new(vec![msg.encode(&Default::default()).unwrap()]),
            fast: msg.is_fast(),
            kind: msg.kind(),
        }
    }

    async fn session(reg: &SessionRegistry, capacity: usize) -> (SessionInfo, mpsc::Receiver<EncodedFrames>) {
        let (tx, rx) = mpsc::channel(capacity);
        (reg.register(addr(), TransportManager::new(tx), 0).await, rx)
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let reg = SessionRegistry::new();
        let (a, _ra) = session(&reg, 4).await;
        let (b, _rb) = session(&reg, 4).await;
        assert_ne!(a.id, b.id);
        assert_ne!(a.token, b.token);
        assert_eq!(reg.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_broadcast_only_to_subscribers() {
        let reg = SessionRegistry::new();
        let (a, mut ra) = session(&reg, 4).await;
        let (b, mut rb) = session(&reg, 4).await;
        reg.subscribe(a.id, "world").await;
        reg.subscribe(b.id, "lobby").await;

        let sent = reg.broadcast("world", &frames(&SyncMessage::Ping { client_time: 1 })).await;
        assert_eq!(sent, 1);
        assert!(ra.try_recv().is_ok());
        assert!(rb.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_listed_sessions() {
        let reg = SessionRegistry::new();
        let (a, mut ra) = session(&reg, 4).await;
        let (b, mut rb) = session(&reg, 4).await;
        let (c, mut rc) = session(&reg, 4).await;
        for id in [a.id, b.id] {
            reg.subscribe(id, "world").await;
        }
        let msg = frames(&SyncMessage::Ping { client_time: 1 });

        assert_eq!(reg.broadcast_except("world", &msg, &BTreeSet::from([a.id])).await, 1);
        assert!(ra.try_recv().is_err());
        assert!(rb.try_recv().is_ok());

        assert!(reg.send_to_subscriber(a.id, "world", &msg).await);
        assert!(ra.try_recv().is_ok());
        assert!(!reg.send_to_subscriber(c.id, "world", &msg).await);
        assert!(rc.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let reg = SessionRegistry::new();
        let (a, mut ra) = session(&reg, 4).await;
        reg.subscribe(a.id, "world").await;
        assert!(reg.unsubscribe(a.id, "world").await);
        assert!(!reg.unsubscribe(a.id, "world").await);
        assert_eq!(reg.broadcast("world", &frames(&SyncMessage::Ping { client_time: 1 })).await, 0);
        assert!(ra.try_recv().is_err());
        assert!(reg.subscribed_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_clears_subscriptions() {
        let reg = SessionRegistry::new();
        let (a, _ra) = session(&reg, 4).await;
        reg.subscribe(a.id, "world").await;
        assert!(reg.is_subscribed(a.id, "world").await);
        assert_eq!(reg.unregister(a.id).await.map(|i| i.id), Some(a.id));
        assert!(reg.subscribers("world").await.is_empty());
        assert!(!reg.subscribe(a.id, "world").await);
    }

    #[tokio::test]
    async fn test_full_reliable_queue_kicks_session() {
        let reg = SessionRegistry::new();
        let (a, mut ra) = session(&reg, 1).await;
        reg.subscribe(a.id, "world").await;
        let msg = frames(&SyncMessage::Ping { client_time: 1 });
        assert_eq!(reg.broadcast("world", &msg).await, 1);
        assert_eq!(reg.broadcast("world", &msg).await, 0);

        assert_eq!(reg.session_count().await, 0);
        assert_eq!(reg.stats().await.sessions_kicked, 1);
        // queue drains then reports closed
        assert!(ra.recv().await.is_some());
        assert!(ra.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_fast_queue_drops_frame() {
        let reg = SessionRegistry::new();
        let (a, _ra) = session(&reg, 1).await;
        reg.subscribe(a.id, "world").await;
        let fast = frames(&SyncMessage::FastPatch {
            server_time: 0,
            counter: 1,
            name: "world".into(),
            fdata: Default::default(),
        });
        reg.broadcast("world", &fast).await;
        assert_eq!(reg.broadcast("world", &fast).await, 0);

        let stats = reg.stats().await;
        assert_eq!(stats.fast_dropped, 1);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_send_to_closed_session_unregisters() {
        let reg = SessionRegistry::new();
        let (a, ra) = session(&reg, 4).await;
        drop(ra);
        assert!(reg.send_to(a.id, frames(&SyncMessage::Ping { client_time: 1 })).await.is_none());
        assert_eq!(reg.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_all_and_close_all() {
        let reg = SessionRegistry::new();
        let (_a, mut ra) = session(&reg, 4).await;
        let (_b, mut rb) = session(&reg, 4).await;
        let sent = reg.broadcast_all(&frames(&SyncMessage::Shutdown { reason: "bye".into() })).await;
        assert_eq!(sent, 2);
        assert_eq!(reg.close_all().await, 2);
        assert!(ra.recv().await.is_some());
        assert!(ra.recv().await.is_none());
        assert!(rb.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_rtt() {
        let reg = SessionRegistry::new();
        let (a, _ra) = session(&reg, 4).await;
        assert_eq!(reg.rtt(a.id).await, None);
        reg.set_rtt(a.id, 42).await;
        assert_eq!(reg.rtt(a.id).await, Some(42));
    }
}
