//! Change tracking over a [`Value`] tree.
//!
//! ```text
//!   set / insert / remove / delete
//!              │
//!              ▼
//!   TrackedDocument ── apply_op ──► root
//!              │
//!              ├── excluded key (`_`, `$`)  → nothing
//!              ├── fast field (FastPatch)   → FastPatchEncoder::mark_dirty
//!              └── otherwise                → ChangeSink::record
//! ```
//!
//! Every mutation goes through one entry point, so each external change
//! produces exactly one record. Inbound remote batches go through
//! [`TrackedDocument::apply_remote`], which records nothing.

use crate::error::{PatchError, TrackError};
use crate::fast_patch::{self, FastField, FastPatchData, FastPatchEncoder};
use crate::patch::{self, ApplyReport, ChangeRecord, OpKind};
use crate::pointer;
use crate::value::Value;

/// Key prefixes kept out of replication and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPolicy {
    /// Never replicated, never persisted.
    pub private_marker: char,
    /// Never replicated, never persisted; set up by hydration.
    pub hydrate_marker: char,
}

impl Default for FieldPolicy {
    fn default() -> Self {
        Self { private_marker: '_', hydrate_marker: '$' }
    }
}

impl FieldPolicy {
    pub fn markers(&self) -> [char; 2] {
        [self.private_marker, self.hydrate_marker]
    }

    pub fn is_excluded_key(&self, key: &str) -> bool {
        key.starts_with(self.markers())
    }

    /// True when any segment of the path is an excluded key.
    pub fn is_excluded<S: AsRef<str>>(&self, segments: &[S]) -> bool {
        segments.iter().any(|s| self.is_excluded_key(s.as_ref()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackMode {
    /// Every replicated field goes to the record stream.
    #[default]
    Patch,
    /// Fast fields of numeric entities go to the fast-patch encoder.
    FastPatch,
}

/// Receives change records as they are emitted.
pub trait ChangeSink: Send {
    fn record(&mut self, document: &str, change: ChangeRecord);

    /// Take buffered records, if the sink buffers.
    fn drain(&mut self) -> Vec<ChangeRecord> {
        Vec::new()
    }
}

/// Buffering sink, drained in FIFO order.
#[derive(Debug, Default)]
pub struct ChangeLog {
    records: Vec<ChangeRecord>,
}

impl ChangeLog {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ChangeSink for ChangeLog {
    fn record(&mut self, _document: &str, change: ChangeRecord) {
        self.records.push(change);
    }

    fn drain(&mut self) -> Vec<ChangeRecord> {
        std::mem::take(&mut self.records)
    }
}

/// Match `entities/<u32>/<fast field>[/...]`.
fn fast_target<S: AsRef<str>>(segments: &[S]) -> Option<(u32, FastField)> {
    match segments {
        [root, id, field, ..] if root.as_ref() == "entities" => {
            Some((fast_patch::entity_id(id.as_ref())?, FastField::from_name(field.as_ref())?))
        }
        _ => None,
    }
}

/// A named document whose mutations are recorded.
pub struct TrackedDocument {
    name: String,
    root: Value,
    mode: TrackMode,
    policy: FieldPolicy,
    sink: Box<dyn ChangeSink>,
    fast: FastPatchEncoder,
    revision: u64,
}

impl std::fmt::Debug for TrackedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedDocument")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

impl TrackedDocument {
    pub fn new(name: impl Into<String>, root: Value) -> Self {
        Self {
            name: name.into(),
            root,
            mode: TrackMode::default(),
            policy: FieldPolicy::default(),
            sink: Box::new(ChangeLog::default()),
            fast: FastPatchEncoder::default(),
            revision: 0,
        }
    }

    pub fn with_mode(mut self, mode: TrackMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_policy(mut self, policy: FieldPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn ChangeSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Byte order announced for fast-patch ids.
    pub fn with_little_endian(mut self, little_endian: bool) -> Self {
        self.fast = FastPatchEncoder::new(little_endian);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> TrackMode {
        self.mode
    }

    pub fn policy(&self) -> &FieldPolicy {
        &self.policy
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.root.pointer(path)
    }

    /// Increases on every mutation, tracked or not.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<(), TrackError> {
        self.mutate(ChangeRecord::replace(path, value))
    }

    pub fn insert(&mut self, path: &str, value: impl Into<Value>) -> Result<(), TrackError> {
        self.mutate(ChangeRecord::add(path, value))
    }

    pub fn remove(&mut self, path: &str) -> Result<(), TrackError> {
        self.mutate(ChangeRecord::remove(path))
    }

    pub fn delete(&mut self, path: &str) -> Result<(), TrackError> {
        self.mutate(ChangeRecord::delete(path))
    }

    /// Equality check. Never emits.
    pub fn test(&self, path: &str, expected: impl Into<Value>) -> Result<(), TrackError> {
        let segments = pointer::parse(path).map_err(PatchError::from)?;
        let current = patch::lookup(&self.root, &segments).ok_or_else(|| PatchError::NotFound(path.to_string()))?;
        if *current != expected.into() {
            return Err(PatchError::TestFailed(path.to_string()).into());
        }
        Ok(())
    }

    fn mutate(&mut self, change: ChangeRecord) -> Result<(), TrackError> {
        let segments = pointer::parse(&change.path).map_err(PatchError::from)?;
        patch::apply_op(&mut self.root, &change)?;
        if change.op != OpKind::Test {
            self.revision += 1;
        }
        self.emit(&segments, change);
        Ok(())
    }

    fn emit(&mut self, segments: &[String], mut change: ChangeRecord) {
        if change.op == OpKind::Test || self.policy.is_excluded(segments) {
            return;
        }
        if self.mode == TrackMode::FastPatch {
            if let Some((entity, field)) = fast_target(segments) {
                self.fast.mark_dirty(field, entity);
                return;
            }
            self.mark_written_entities(segments, change.value.as_ref());
        }
        if let Some(value) = change.value.take() {
            change.value = Some(value.without_prefixed_keys(&self.policy.markers()));
        }
        log::trace!("{}: {} {}", self.name, change.op.name(), change.path);
        self.sink.record(&self.name, change);
    }

    /// A write of a whole entity (or the entity map) also carries fast
    /// fields; flag them so the fast channel catches up.
    fn mark_written_entities(&mut self, segments: &[String], value: Option<&Value>) {
        let Some(value) = value else {
            return;
        };
        let mark = |fast: &mut FastPatchEncoder, id: u32, entity: &Value| {
            for field in FastField::ALL {
                if entity.get(field.name()).is_some() {
                    fast.mark_dirty(field, id);
                }
            }
        };
        match segments {
            [root, id] if root == "entities" => {
                if let Some(id) = fast_patch::entity_id(id) {
                    mark(&mut self.fast, id, value);
                }
            }
            [root] if root == "entities" => {
                for (key, entity) in value.as_map().into_iter().flatten() {
                    if let Some(id) = fast_patch::entity_id(key) {
                        mark(&mut self.fast, id, entity);
                    }
                }
            }
            _ => {}
        }
    }

    /// Apply a batch coming from a peer and record each applied op as if it
    /// were local. Ops touching excluded keys count as denied.
    pub fn apply_batch<F>(&mut self, changes: &[ChangeRecord], mut authorize: F) -> ApplyReport
    where
        F: FnMut(&ChangeRecord) -> bool,
    {
        let mut report = ApplyReport::default();
        for change in changes {
            let excluded = pointer::parse(&change.path)
                .map(|segments| self.policy.is_excluded(&segments))
                .unwrap_or(false);
            if excluded || !authorize(change) {
                log::debug!("{}: denied {} at {}", self.name, change.op.name(), change.path);
                report.denied += 1;
                continue;
            }
            match self.mutate(change.clone()) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    log::warn!("{}: skipping {} at {}: {e}", self.name, change.op.name(), change.path);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Apply an authoritative inbound batch. Nothing is recorded.
    pub fn apply_remote(&mut self, changes: &[ChangeRecord]) -> ApplyReport {
        let report = patch::apply_batch(&mut self.root, changes, |_| true);
        self.revision += report.applied as u64;
        report
    }

    /// Replace the whole tree without recording (full snapshot).
    pub fn replace_root(&mut self, root: Value) {
        self.root = root;
        self.revision += 1;
    }

    /// Untracked write access.
    pub fn raw_mut<R>(&mut self, f: impl FnOnce(&mut Value) -> R) -> R {
        self.revision += 1;
        f(&mut self.root)
    }

    /// Signal that `entities/<entity>/<field>` changed outside the tracker.
    ///
    /// In `FastPatch` mode this flags the field dirty. In `Patch` mode only
    /// the revision moves; no change record is emitted either way.
    pub fn property_changed(&mut self, entity: u32, field: &str) -> Result<(), TrackError> {
        let fast = FastField::from_name(field).ok_or_else(|| TrackError::UnknownField(field.to_string()))?;
        if self.mode == TrackMode::FastPatch {
            self.fast.mark_dirty(fast, entity);
        }
        self.revision += 1;
        Ok(())
    }

    pub fn drain_changes(&mut self) -> Vec<ChangeRecord> {
        self.sink.drain()
    }

    /// Drop pending records and dirty flags (after hydration).
    pub fn discard_changes(&mut self) {
        let dropped = self.sink.drain().len();
        self.fast.clear();
        if dropped > 0 {
            log::debug!("{}: discarded {dropped} change(s)", self.name);
        }
    }

    pub fn fast_encoder(&self) -> &FastPatchEncoder {
        &self.fast
    }

    pub fn encode_fast_changes(&mut self) -> Option<(u64, FastPatchData)> {
        self.fast.encode_changes(&self.root)
    }

    pub fn fast_snapshot(&self) -> FastPatchData {
        self.fast.encode_snapshot(&self.root)
    }

    /// Copy for storage: excluded keys stripped at any depth.
    pub fn persistable(&self) -> Value {
        self.root.without_prefixed_keys(&self.policy.markers())
    }

    /// Copy for full snapshots.
    pub fn replicable(&self) -> Value {
        self.persistable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn world() -> TrackedDocument {
        TrackedDocument::new("world", Value::from(json!({"entities": {"5": {"hp": 10}}, "_ai": {}})))
    }

    #[test]
    fn test_one_record_per_mutation() {
        let mut doc = world();
        doc.set("/entities/5/position", vec![1, 2, 3]).unwrap();
        doc.insert("/entities/6", json!({"hp": 1})).unwrap();
        doc.delete("/entities/6").unwrap();
        let changes = doc.drain_changes();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0], ChangeRecord::replace("/entities/5/position", vec![1, 2, 3]));
        assert_eq!(changes[1].op, OpKind::Add);
        assert_eq!(changes[2].op, OpKind::Delete);
        assert!(doc.drain_changes().is_empty());
    }

    #[test]
    fn test_excluded_keys_not_emitted() {
        let mut doc = world();
        doc.set("/_ai/target", 5).unwrap();
        doc.set("/entities/5/$cache", 1).unwrap();
        doc.set("/entities/5/_seen", true).unwrap();
        assert!(doc.drain_changes().is_empty());
        assert_eq!(doc.revision(), 3);
    }

    #[test]
    fn test_nested_private_keys_stripped_from_records() {
        let mut doc = world();
        doc.set("/entities/7", json!({"hp": 3, "_brain": {"x": 1}})).unwrap();
        let changes = doc.drain_changes();
        assert_eq!(changes[0].value, Some(Value::from(json!({"hp": 3}))));
        assert_eq!(doc.get("/entities/7/_brain/x"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_failed_mutation_emits_nothing() {
        let mut doc = world();
        assert!(doc.set("/missing/x", 1).is_err());
        assert!(doc.set("no-slash", 1).is_err());
        assert!(doc.drain_changes().is_empty());
        assert_eq!(doc.revision(), 0);
    }

    #[test]
    fn test_test_never_emits() {
        let mut doc = world();
        assert!(doc.test("/entities/5/hp", 10).is_ok());
        assert!(doc.test("/entities/5/hp", 11).is_err());
        assert!(doc.drain_changes().is_empty());
        let report = doc.apply_batch(&[ChangeRecord::test("/entities/5/hp", 10)], |_| true);
        assert_eq!(report.applied, 1);
        assert!(doc.drain_changes().is_empty());
    }

    #[test]
    fn test_apply_remote_emits_nothing() {
        let mut doc = world();
        let report = doc.apply_remote(&[
            ChangeRecord::replace("/entities/5/hp", 1),
            ChangeRecord::add("/entities/9", json!({})),
        ]);
        assert_eq!(report.applied, 2);
        assert!(doc.drain_changes().is_empty());
        assert_eq!(doc.revision(), 2);
    }

    #[test]
    fn test_apply_batch_records_and_denies() {
        let mut doc = world();
        let report = doc.apply_batch(
            &[
                ChangeRecord::replace("/entities/5/hp", 1),
                ChangeRecord::replace("/_ai/x", 1),
                ChangeRecord::replace("/entities/5/locked", 1),
            ],
            |c| !c.path.ends_with("locked"),
        );
        assert_eq!(report, ApplyReport { applied: 1, failed: 0, denied: 2 });
        assert_eq!(doc.drain_changes(), vec![ChangeRecord::replace("/entities/5/hp", 1)]);
    }

    #[test]
    fn test_fast_patch_mode_routes_fast_fields() {
        let mut doc = world().with_mode(TrackMode::FastPatch);
        doc.set("/entities/5/position", vec![1.0, 2.0, 3.0]).unwrap();
        doc.set("/entities/5/hp", 3).unwrap();
        doc.set("/entities/npc", json!({"position": [0, 0, 0]})).unwrap();
        let changes = doc.drain_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path, "/entities/5/hp");
        assert!(doc.fast_encoder().is_dirty(FastField::Position, 5));

        let (u, data) = doc.encode_fast_changes().unwrap();
        assert_eq!(u, 1);
        assert!(data.contains_key("position"));
    }

    #[test]
    fn test_entity_write_flags_fast_fields() {
        let mut doc = world().with_mode(TrackMode::FastPatch);
        doc.set("/entities/8", json!({"position": [1, 1, 1], "animation": "idle"})).unwrap();
        assert_eq!(doc.drain_changes().len(), 1);
        assert!(doc.fast_encoder().is_dirty(FastField::Position, 8));
        assert!(doc.fast_encoder().is_dirty(FastField::Animation, 8));
    }

    #[test]
    fn test_property_changed() {
        let mut doc = world().with_mode(TrackMode::FastPatch);
        doc.raw_mut(|root| {
            if let Some(entity) = root.get_mut("entities").and_then(|e| e.get_mut("5")).and_then(Value::as_map_mut) {
                entity.insert("rotation".into(), Value::from([0.0, 0.0, 0.0, 1.0]));
            }
        });
        doc.property_changed(5, "rotation").unwrap();
        assert!(doc.fast_encoder().is_dirty(FastField::Rotation, 5));
        assert!(doc.drain_changes().is_empty());
        assert_eq!(doc.property_changed(5, "hp"), Err(TrackError::UnknownField("hp".into())));

        let mut patch_doc = world();
        patch_doc.raw_mut(|root| {
            if let Some(entity) = root.get_mut("entities").and_then(|e| e.get_mut("5")).and_then(Value::as_map_mut) {
                entity.insert("status".into(), Value::from("idle"));
            }
        });
        let before = patch_doc.revision();
        patch_doc.property_changed(5, "status").unwrap();
        assert!(patch_doc.drain_changes().is_empty());
        assert!(patch_doc.revision() > before);
        assert!(!patch_doc.fast_encoder().is_dirty(FastField::Status, 5));
    }

    #[test]
    fn test_persistable_strips_markers() {
        let mut doc = world();
        doc.set("/entities/5/$mesh", 1).unwrap();
        let stored = doc.persistable();
        assert_eq!(serde_json::Value::from(&stored), json!({"entities": {"5": {"hp": 10}}}));
        assert_eq!(doc.replicable(), stored);
    }

    #[test]
    fn test_discard_changes() {
        let mut doc = world().with_mode(TrackMode::FastPatch);
        doc.set("/entities/5/hp", 2).unwrap();
        doc.set("/entities/5/position", vec![1, 2, 3]).unwrap();
        doc.discard_changes();
        assert!(doc.drain_changes().is_empty());
        assert!(!doc.fast_encoder().has_changes());
    }
}
