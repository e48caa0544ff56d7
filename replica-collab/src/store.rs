//! Server-side document registry.
//!
//! ```text
//!  subscribe("world")
//!        │
//!        ▼
//!  ┌─────────────┐ miss ┌───────────────────┐ None ┌──────────────┐
//!  │ OnceCell    │─────►│ StorageBackend    │─────►│ can_create?  │
//!  │ per name    │      │ load (blocking)   │      │ default doc  │
//!  └─────┬───────┘      └─────────┬─────────┘      └──────┬───────┘
//!        │ hit                    └──────────┬────────────┘
//!        ▼                                   ▼
//!  Arc<DocumentEntry>  ◄──── hydrate + discard changes
//! ```
//!
//! Concurrent requests for a cold name await the same initialization. A
//! failed initialization leaves the cell empty so a later request retries.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, OnceCell};

use replica_core::{ApplyReport, ChangeRecord, FieldPolicy, TrackMode, TrackedDocument, Value};

use crate::broadcast::SessionId;
use crate::protocol::SyncMessage;
use crate::storage::{StorageBackend, StorageError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Policy and lifecycle callbacks for documents.
pub trait DocumentHooks: Send + Sync + 'static {
    /// `session` is `None` for server-initiated loads.
    fn can_create(&self, _session: Option<SessionId>, _name: &str) -> bool {
        true
    }

    fn can_sync(&self, _session: SessionId, _name: &str, _change: &ChangeRecord) -> bool {
        true
    }

    fn default_document(&self, _name: &str) -> Value {
        let mut root = Value::map();
        if let Some(map) = root.as_map_mut() {
            map.insert("entities".to_string(), Value::map());
        }
        root
    }

    fn track_mode(&self, _name: &str) -> TrackMode {
        TrackMode::Patch
    }

    /// Runs once after load or create. Changes made here are not replicated.
    fn hydrate(&self, _name: &str, _doc: &mut TrackedDocument) {}

    /// Runs every tick before pending changes are flushed.
    fn on_update(&self, _name: &str, _doc: &mut TrackedDocument, _dt: Duration) {}
}

/// Allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl DocumentHooks for DefaultHooks {}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Minimum time between two saves of one document.
    pub persist_debounce: Duration,
    pub field_policy: FieldPolicy,
    /// Byte order of ids inside fast-patch blocks.
    pub little_endian: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { persist_debounce: Duration::from_secs(5), field_policy: FieldPolicy::default(), little_endian: false }
    }
}

impl StoreConfig {
    pub fn for_testing() -> Self {
        Self { persist_debounce: Duration::ZERO, ..Self::default() }
    }
}

/// Consecutive ops from one source. `None` is the server itself.
#[derive(Debug, Clone, PartialEq)]
struct OpRun {
    origin: Option<SessionId>,
    changes: Vec<ChangeRecord>,
}

/// Ops drained from a document in one flush, grouped by sender.
///
/// A sender's own ops are already in its mirror, so they are left out of
/// the `patch` it receives.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPatch {
    pub server_time: u64,
    pub counter: u64,
    pub name: String,
    runs: Vec<OpRun>,
}

impl PendingPatch {
    /// Sessions with at least one op in this flush.
    pub fn origins(&self) -> BTreeSet<SessionId> {
        self.runs.iter().filter_map(|r| r.origin).collect()
    }

    pub fn len(&self) -> usize {
        self.runs.iter().map(|r| r.changes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `patch` for `recipient`, or `None` if only its own ops remain.
    /// A `None` recipient gets every op.
    pub fn message_for(&self, recipient: Option<SessionId>) -> Option<SyncMessage> {
        let ops: Vec<_> = self
            .runs
            .iter()
            .filter(|r| recipient.is_none() || r.origin != recipient)
            .flat_map(|r| r.changes.iter().map(ChangeRecord::to_wire))
            .collect();
        (!ops.is_empty()).then(|| SyncMessage::Patch {
            server_time: self.server_time,
            counter: self.counter,
            name: self.name.clone(),
            ops,
        })
    }
}

/// Mutable state of one document, behind its entry lock.
pub struct DocumentState {
    doc: TrackedDocument,
    pending: Vec<OpRun>,
    patch_counter: u64,
    persisted_revision: Option<u64>,
    last_save_attempt: Option<Instant>,
}

impl DocumentState {
    pub fn doc(&self) -> &TrackedDocument {
        &self.doc
    }

    pub fn doc_mut(&mut self) -> &mut TrackedDocument {
        &mut self.doc
    }

    /// Counter of the last emitted `patch`.
    pub fn patch_counter(&self) -> u64 {
        self.patch_counter
    }

    /// Changed since the last successful save, or never saved.
    pub fn is_dirty(&self) -> bool {
        self.persisted_revision != Some(self.doc.revision())
    }

    fn save_due(&self, now: Instant, debounce: Duration) -> bool {
        self.last_save_attempt.map_or(true, |t| now.duration_since(t) >= debounce)
    }

    /// Move recorded changes into the pending runs under `origin`.
    fn absorb(&mut self, origin: Option<SessionId>) {
        let changes = self.doc.drain_changes();
        if changes.is_empty() {
            return;
        }
        match self.pending.last_mut() {
            Some(run) if run.origin == origin => run.changes.extend(changes),
            _ => self.pending.push(OpRun { origin, changes }),
        }
    }

    /// Apply a client's `sync` batch, remembering the sender of each
    /// applied op.
    pub fn apply_from<F>(&mut self, session: SessionId, changes: &[ChangeRecord], authorize: F) -> ApplyReport
    where
        F: FnMut(&ChangeRecord) -> bool,
    {
        self.absorb(None);
        let report = self.doc.apply_batch(changes, authorize);
        self.absorb(Some(session));
        report
    }

    /// Drain everything recorded since the last flush.
    pub fn take_patch(&mut self, server_time: u64) -> Option<PendingPatch> {
        self.absorb(None);
        if self.pending.is_empty() {
            return None;
        }
        self.patch_counter += 1;
        Some(PendingPatch {
            server_time,
            counter: self.patch_counter,
            name: self.doc.name().to_string(),
            runs: std::mem::take(&mut self.pending),
        })
    }

    /// Encode dirty fast fields into an `fpatch`.
    pub fn take_fast_patch(&mut self, server_time: u64) -> Option<SyncMessage> {
        let (counter, fdata) = self.doc.encode_fast_changes()?;
        Some(SyncMessage::FastPatch { server_time, counter, name: self.doc.name().to_string(), fdata })
    }

    /// Snapshot for a new subscriber.
    pub fn full_snapshot(&self, server_time: u64) -> SyncMessage {
        let fast = self.doc.fast_encoder();
        let fdata = (self.doc.mode() == TrackMode::FastPatch).then(|| self.doc.fast_snapshot());
        SyncMessage::Full {
            server_time,
            name: self.doc.name().to_string(),
            doc: self.doc.replicable(),
            little_endian: fast.little_endian(),
            counter: fast.counter(),
            fdata,
        }
    }
}

pub struct DocumentEntry {
    name: String,
    state: Mutex<DocumentState>,
}

impl DocumentEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-document lock. Mutation and patch flushing happen under it.
    pub async fn lock(&self) -> MutexGuard<'_, DocumentState> {
        self.state.lock().await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub saved: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub documents: usize,
    pub loads: u64,
    pub creates: u64,
    pub saves: u64,
    pub save_failures: u64,
}

#[derive(Default)]
struct AtomicStoreStats {
    loads: AtomicU64,
    creates: AtomicU64,
    saves: AtomicU64,
    save_failures: AtomicU64,
}

type Cell = Arc<OnceCell<Arc<DocumentEntry>>>;

pub struct DocumentStore {
    storage: Arc<dyn StorageBackend>,
    hooks: Arc<dyn DocumentHooks>,
    config: StoreConfig,
    cells: std::sync::Mutex<HashMap<String, Cell>>,
    stats: AtomicStoreStats,
}

impl DocumentStore {
    pub fn new(storage: Arc<dyn StorageBackend>, hooks: Arc<dyn DocumentHooks>, config: StoreConfig) -> Self {
        Self { storage, hooks, config, cells: std::sync::Mutex::new(HashMap::new()), stats: AtomicStoreStats::default() }
    }

    pub fn hooks(&self) -> &Arc<dyn DocumentHooks> {
        &self.hooks
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn cell(&self, name: &str) -> Cell {
        let mut cells = match self.cells.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        cells.entry(name.to_string()).or_default().clone()
    }

    /// Loaded document, without triggering a load.
    pub fn get(&self, name: &str) -> Option<Arc<DocumentEntry>> {
        let cells = self.cells.lock().ok()?;
        cells.get(name)?.get().cloned()
    }

    /// All loaded documents.
    pub fn documents(&self) -> Vec<Arc<DocumentEntry>> {
        match self.cells.lock() {
            Ok(cells) => cells.values().filter_map(|c| c.get().cloned()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Loaded document, or load it, or create it if `session` may.
    pub async fn get_or_load(&self, name: &str, session: Option<SessionId>) -> Result<Arc<DocumentEntry>, StoreError> {
        let cell = self.cell(name);
        let entry = cell.get_or_try_init(|| self.load_or_create(name, session)).await?;
        Ok(entry.clone())
    }

    async fn load_or_create(&self, name: &str, session: Option<SessionId>) -> Result<Arc<DocumentEntry>, StoreError> {
        let storage = self.storage.clone();
        let key = name.to_string();
        let loaded = tokio::task::spawn_blocking(move || storage.load(&key))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?;
        self.stats.loads.fetch_add(1, Ordering::Relaxed);

        let (root, from_storage) = match loaded {
            Ok(Some(root)) => (root, true),
            Ok(None) => (self.create(name, session)?, false),
            Err(e) => {
                log::error!("Failed to load {name}, treating as absent: {e}");
                (self.create(name, session)?, false)
            }
        };

        let mut doc = TrackedDocument::new(name, root)
            .with_mode(self.hooks.track_mode(name))
            .with_policy(self.config.field_policy)
            .with_little_endian(self.config.little_endian);
        self.hooks.hydrate(name, &mut doc);
        doc.discard_changes();

        let persisted_revision = from_storage.then(|| doc.revision());
        log::info!("{} document {name}", if from_storage { "Loaded" } else { "Created" });
        Ok(Arc::new(DocumentEntry {
            name: name.to_string(),
            state: Mutex::new(DocumentState {
                doc,
                pending: Vec::new(),
                patch_counter: 0,
                persisted_revision,
                last_save_attempt: None,
            }),
        }))
    }

    fn create(&self, name: &str, session: Option<SessionId>) -> Result<Value, StoreError> {
        if !self.hooks.can_create(session, name) {
            log::debug!("Creation of {name} denied for session {session:?}");
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.stats.creates.fetch_add(1, Ordering::Relaxed);
        Ok(self.hooks.default_document(name))
    }

    /// Load every stored document. Returns how many are now resident.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let storage = self.storage.clone();
        let names = tokio::task::spawn_blocking(move || storage.list())
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        let mut recovered = 0;
        for name in &names {
            match self.get_or_load(name, None).await {
                Ok(_) => recovered += 1,
                Err(e) => log::warn!("Could not recover {name}: {e}"),
            }
        }
        log::info!("Recovery complete: {recovered}/{} documents restored", names.len());
        Ok(recovered)
    }

    /// Save dirty documents whose debounce has elapsed, or all dirty
    /// documents when `force` is set. Failed saves stay dirty.
    pub async fn flush_dirty(&self, force: bool) -> FlushReport {
        let mut report = FlushReport::default();
        for entry in self.documents() {
            let now = Instant::now();
            let (revision, snapshot) = {
                let mut state = entry.lock().await;
                if !state.is_dirty() || (!force && !state.save_due(now, self.config.persist_debounce)) {
                    continue;
                }
                state.last_save_attempt = Some(now);
                (state.doc.revision(), state.doc.persistable())
            };

            let storage = self.storage.clone();
            let name = entry.name.clone();
            let result = tokio::task::spawn_blocking(move || storage.save(&name, &snapshot))
                .await
                .map_err(|e| StoreError::Task(e.to_string()))
                .and_then(|r| r.map_err(StoreError::from));
            match result {
                Ok(()) => {
                    entry.lock().await.persisted_revision = Some(revision);
                    self.stats.saves.fetch_add(1, Ordering::Relaxed);
                    report.saved += 1;
                    log::debug!("Persisted {} at revision {revision}", entry.name);
                }
                Err(e) => {
                    self.stats.save_failures.fetch_add(1, Ordering::Relaxed);
                    report.failed += 1;
                    log::error!("Failed to persist {}: {e}", entry.name);
                }
            }
        }
        if report.saved > 0 || report.failed > 0 {
            log::info!("Flush: {} saved, {} failed", report.saved, report.failed);
        }
        report
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            documents: self.documents().len(),
            loads: self.stats.loads.load(Ordering::Relaxed),
            creates: self.stats.creates.load(Ordering::Relaxed),
            saves: self.stats.saves.load(Ordering::Relaxed),
            save_failures: self.stats.save_failures.load(Ordering::Relaxed),
        }
    }
}
