//! Fixed-period replication tick.
//!
//! ```text
//!  every tick                         every persist_interval
//!  ┌──────────────────────────────┐   ┌────────────────────────┐
//!  │ for each loaded document:    │   │ DocumentStore          │
//!  │   lock                       │   │   .flush_dirty(false)  │
//!  │   hooks.on_update(dt)        │   │ (own task, one at a    │
//!  │   patch  → subscribers       │   │  time)                 │
//!  │   fpatch → subscribers (1/N) │   └────────────────────────┘
//!  │   unlock                     │
//!  └──────────────────────────────┘
//! ```
//!
//! Patches are broadcast while the document lock is held, so a subscriber
//! registered under the same lock never receives ops already contained in
//! its snapshot. A session is never sent back ops it sent itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broadcast::SessionRegistry;
use crate::chunk::{Chunker, TransportLimits};
use crate::clock;
use crate::protocol::{CompressionConfig, ProtocolError, SyncMessage};
use crate::store::{DocumentState, DocumentStore, FlushReport, PendingPatch};
use crate::transport::EncodedFrames;

/// Resolves once `stop` reads true. Drops the borrowed value before
/// returning, so it can sit in a `select!` of a spawned task.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

#[derive(Debug, Clone)]
pub struct SyncLoopConfig {
    pub tick: Duration,
    /// Fast patches go out every N ticks.
    pub fast_patch_every: u64,
    pub persist_interval: Duration,
    pub compression: CompressionConfig,
    pub limits: TransportLimits,
}

impl Default for SyncLoopConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            fast_patch_every: 1,
            persist_interval: Duration::from_secs(5),
            compression: CompressionConfig::default(),
            limits: TransportLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub patches: usize,
    pub fast_patches: usize,
}

pub struct SyncLoop {
    store: Arc<DocumentStore>,
    sessions: Arc<SessionRegistry>,
    config: SyncLoopConfig,
    chunker: std::sync::Mutex<Chunker>,
    tick: AtomicU64,
    flush_task: std::sync::Mutex<Option<JoinHandle<FlushReport>>>,
}

impl SyncLoop {
    pub fn new(store: Arc<DocumentStore>, sessions: Arc<SessionRegistry>, config: SyncLoopConfig) -> Self {
        let chunker = std::sync::Mutex::new(Chunker::new(config.limits.clone()));
        Self { store, sessions, config, chunker, tick: AtomicU64::new(0), flush_task: std::sync::Mutex::new(None) }
    }

    pub fn config(&self) -> &SyncLoopConfig {
        &self.config
    }

    pub fn tick_count(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    /// Encode (and chunk if needed) for the transport.
    pub fn encode(&self, msg: &SyncMessage) -> Result<EncodedFrames, ProtocolError> {
        let mut chunker = match self.chunker.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        EncodedFrames::encode(msg, &mut chunker, &self.config.compression, self.tick_count(), clock::now_ms())
    }

    async fn publish(&self, name: &str, msg: &SyncMessage) -> bool {
        match self.encode(msg) {
            Ok(frames) => {
                let sent = self.sessions.broadcast(name, &frames).await;
                log::trace!("{} {name} → {sent} session(s), {} bytes", msg.kind(), frames.byte_len());
                true
            }
            Err(e) => {
                log::error!("Failed to encode {} for {name}: {e}", msg.kind());
                false
            }
        }
    }

    /// Everyone but the senders gets the whole patch; each sender gets the
    /// patch without its own ops.
    async fn publish_patch(&self, name: &str, pending: &PendingPatch) -> bool {
        let origins = pending.origins();
        let mut ok = true;
        if let Some(msg) = pending.message_for(None) {
            match self.encode(&msg) {
                Ok(frames) => {
                    let sent = self.sessions.broadcast_except(name, &frames, &origins).await;
                    log::trace!("patch {name} → {sent} session(s), {} ops", pending.len());
                }
                Err(e) => {
                    log::error!("Failed to encode patch for {name}: {e}");
                    ok = false;
                }
            }
        }
        for origin in origins {
            let Some(msg) = pending.message_for(Some(origin)) else {
                continue;
            };
            match self.encode(&msg) {
                Ok(frames) => {
                    self.sessions.send_to_subscriber(origin, name, &frames).await;
                }
                Err(e) => {
                    log::error!("Failed to encode patch for {name} to session {origin}: {e}");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Flush recorded changes of a locked document to its subscribers.
    pub async fn publish_pending(&self, name: &str, state: &mut DocumentState) -> bool {
        match state.take_patch(clock::now_ms()) {
            Some(pending) => self.publish_patch(name, &pending).await,
            None => false,
        }
    }

    pub async fn publish_fast(&self, name: &str, state: &mut DocumentState) -> bool {
        match state.take_fast_patch(clock::now_ms()) {
            Some(msg) => self.publish(name, &msg).await,
            None => false,
        }
    }

    /// One tick over every loaded document.
    pub async fn tick_once(&self, dt: Duration) -> TickReport {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        let fast_due = tick % self.config.fast_patch_every.max(1) == 0;
        let hooks = self.store.hooks().clone();
        let mut report = TickReport::default();

        for entry in self.store.documents() {
            let name = entry.name();
            let mut state = entry.lock().await;
            hooks.on_update(name, state.doc_mut(), dt);
            if self.publish_pending(name, &mut state).await {
                report.patches += 1;
            }
            if fast_due && self.publish_fast(name, &mut state).await {
                report.fast_patches += 1;
            }
        }
        report
    }

    /// Tick until `stop` turns true.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut persist = tokio::time::interval(self.config.persist_interval);
        persist.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = Instant::now();

        log::info!(
            "Sync loop started (tick {:?}, fast every {}, persist {:?})",
            self.config.tick,
            self.config.fast_patch_every,
            self.config.persist_interval
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.tick_once(now - last).await;
                    last = now;
                }
                _ = persist.tick() => self.start_periodic_flush(),
                _ = stop_requested(&mut stop) => break,
            }
        }
        log::info!("Sync loop stopped after {} ticks", self.tick_count());
    }

    /// Spawn a debounced flush unless the previous one is still running.
    fn start_periodic_flush(&self) {
        let mut slot = match self.flush_task.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let store = self.store.clone();
        *slot = Some(tokio::spawn(async move { store.flush_dirty(false).await }));
    }

    fn take_flush_task(&self) -> Option<JoinHandle<FlushReport>> {
        match self.flush_task.lock() {
            Ok(mut s) => s.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// [`shutdown_by`](Self::shutdown_by) with a deadline `grace` from now.
    pub async fn shutdown(&self, reason: &str, grace: Duration) -> Option<FlushReport> {
        self.shutdown_by(reason, tokio::time::Instant::now() + grace).await
    }

    /// Best-effort drain: notify sessions, flush pending patches and dirty
    /// documents until `deadline`, then close every session. A periodic
    /// flush still running counts against the same deadline.
    pub async fn shutdown_by(&self, reason: &str, deadline: tokio::time::Instant) -> Option<FlushReport> {
        for entry in self.store.documents() {
            let mut state = entry.lock().await;
            self.publish_pending(entry.name(), &mut state).await;
        }
        match self.encode(&SyncMessage::Shutdown { reason: reason.to_string() }) {
            Ok(frames) => {
                let notified = self.sessions.broadcast_all(&frames).await;
                log::info!("Shutdown notice sent to {notified} session(s)");
            }
            Err(e) => log::error!("Failed to encode shutdown notice: {e}"),
        }

        let report = self.final_flush(deadline).await;
        let closed = self.sessions.close_all().await;
        log::info!("Closed {closed} session(s)");
        report
    }

    async fn final_flush(&self, deadline: tokio::time::Instant) -> Option<FlushReport> {
        if let Some(task) = self.take_flush_task() {
            // saves of one document never overlap
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                log::warn!("Periodic flush still running at the shutdown deadline");
                return None;
            }
        }
        match tokio::time::timeout_at(deadline, self.store.flush_dirty(true)).await {
            Ok(report) => Some(report),
            Err(_) => {
                log::warn!("Shutdown flush did not finish before the deadline");
                None
            }
        }
    }
}
