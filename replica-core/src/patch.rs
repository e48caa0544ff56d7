//! JSON-Patch-like change records and their compact wire form.
//!
//! Wire codes:
//! ```text
//! replace → (absent)   add → 'a'   remove → 'r'   delete → 'd'   test → 't'
//! ```
//!
//! Batches apply op-by-op: a failed op is logged and skipped, the rest of
//! the batch still applies.

use serde::{Deserialize, Serialize};

use crate::error::PatchError;
use crate::pointer;
use crate::value::Value;

/// Kind of a single mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Replace,
    Add,
    /// Unset a key / remove a sequence element (shifting the rest).
    Remove,
    /// Unset a key / null a sequence slot in place.
    Delete,
    Test,
}

impl OpKind {
    /// One-letter wire code. Replace has none.
    pub fn code(self) -> Option<char> {
        match self {
            OpKind::Replace => None,
            OpKind::Add => Some('a'),
            OpKind::Remove => Some('r'),
            OpKind::Delete => Some('d'),
            OpKind::Test => Some('t'),
        }
    }

    pub fn from_code(code: Option<char>) -> Result<Self, PatchError> {
        match code {
            None => Ok(OpKind::Replace),
            Some('a') => Ok(OpKind::Add),
            Some('r') => Ok(OpKind::Remove),
            Some('d') => Ok(OpKind::Delete),
            Some('t') => Ok(OpKind::Test),
            Some(other) => Err(PatchError::UnknownCode(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::Replace => "replace",
            OpKind::Add => "add",
            OpKind::Remove => "remove",
            OpKind::Delete => "delete",
            OpKind::Test => "test",
        }
    }
}

/// One mutation event on a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub op: OpKind,
    pub path: String,
    pub value: Option<Value>,
}

impl ChangeRecord {
    pub fn replace(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { op: OpKind::Replace, path: path.into(), value: Some(value.into()) }
    }

    pub fn add(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { op: OpKind::Add, path: path.into(), value: Some(value.into()) }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self { op: OpKind::Remove, path: path.into(), value: None }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self { op: OpKind::Delete, path: path.into(), value: None }
    }

    pub fn test(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { op: OpKind::Test, path: path.into(), value: Some(value.into()) }
    }

    pub fn to_wire(&self) -> WireOp {
        WireOp { o: self.op.code(), p: self.path.clone(), v: self.value.clone() }
    }
}

/// Compact wire form of a [`ChangeRecord`]: `{o?, p, v?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOp {
    pub o: Option<char>,
    pub p: String,
    pub v: Option<Value>,
}

impl WireOp {
    pub fn decode(self) -> Result<ChangeRecord, PatchError> {
        Ok(ChangeRecord { op: OpKind::from_code(self.o)?, path: self.p, value: self.v })
    }
}

pub fn encode_batch(changes: &[ChangeRecord]) -> Vec<WireOp> {
    changes.iter().map(ChangeRecord::to_wire).collect()
}

/// Decode a wire batch. Ops with unknown codes are logged and returned
/// as the second element so callers can count them as failures.
pub fn decode_batch(ops: Vec<WireOp>) -> (Vec<ChangeRecord>, usize) {
    let mut decoded = Vec::with_capacity(ops.len());
    let mut failed = 0;
    for op in ops {
        let path = op.p.clone();
        match op.decode() {
            Ok(change) => decoded.push(change),
            Err(e) => {
                log::warn!("Skipping undecodable op at {path}: {e}");
                failed += 1;
            }
        }
    }
    (decoded, failed)
}

/// Outcome of applying a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: usize,
    pub denied: usize,
}

impl ApplyReport {
    pub fn merge(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.failed += other.failed;
        self.denied += other.denied;
    }
}

/// Apply a single change with pointer semantics.
pub fn apply_op(root: &mut Value, change: &ChangeRecord) -> Result<(), PatchError> {
    let segments = pointer::parse(&change.path)?;

    if change.op == OpKind::Test {
        let current = lookup(root, &segments).ok_or_else(|| PatchError::NotFound(change.path.clone()))?;
        let expected = change.value.as_ref().unwrap_or(&Value::Null);
        if current != expected {
            return Err(PatchError::TestFailed(change.path.clone()));
        }
        return Ok(());
    }

    let Some((leaf, parents)) = segments.split_last() else {
        return match change.op {
            OpKind::Replace => {
                *root = required_value(change)?.clone();
                Ok(())
            }
            other => Err(PatchError::InvalidRootOp { op: other.name() }),
        };
    };

    let parent = lookup_mut(root, parents).ok_or_else(|| PatchError::NotFound(change.path.clone()))?;
    match parent {
        Value::Map(map) => match change.op {
            OpKind::Replace | OpKind::Add => {
                map.insert(leaf.clone(), required_value(change)?.clone());
                Ok(())
            }
            OpKind::Remove => map
                .remove(leaf)
                .map(|_| ())
                .ok_or_else(|| PatchError::NotFound(change.path.clone())),
            // unset is idempotent
            OpKind::Delete => {
                map.remove(leaf);
                Ok(())
            }
            OpKind::Test => unreachable!("handled above"),
        },
        Value::Seq(seq) => {
            let len = seq.len();
            let index = pointer::seq_index(leaf, len)?;
            let out_of_bounds = || PatchError::OutOfBounds { path: change.path.clone(), index, len };
            match change.op {
                OpKind::Replace if index < len => seq[index] = required_value(change)?.clone(),
                OpKind::Replace if index == len => seq.push(required_value(change)?.clone()),
                OpKind::Add if index <= len => seq.insert(index, required_value(change)?.clone()),
                OpKind::Remove if index < len => {
                    seq.remove(index);
                }
                OpKind::Delete if index < len => seq[index] = Value::Null,
                _ => return Err(out_of_bounds()),
            }
            Ok(())
        }
        _ => Err(PatchError::NotContainer(change.path.clone())),
    }
}

/// Apply a batch op-by-op. `authorize` is consulted first; denied and
/// failed ops are skipped without aborting the batch.
pub fn apply_batch<F>(root: &mut Value, changes: &[ChangeRecord], mut authorize: F) -> ApplyReport
where
    F: FnMut(&ChangeRecord) -> bool,
{
    let mut report = ApplyReport::default();
    for change in changes {
        if !authorize(change) {
            log::debug!("Denied {} at {}", change.op.name(), change.path);
            report.denied += 1;
            continue;
        }
        match apply_op(root, change) {
            Ok(()) => report.applied += 1,
            Err(e) => {
                log::warn!("Skipping {} at {}: {e}", change.op.name(), change.path);
                report.failed += 1;
            }
        }
    }
    report
}

fn required_value(change: &ChangeRecord) -> Result<&Value, PatchError> {
    change.value.as_ref().ok_or(PatchError::MissingValue { op: change.op.name() })
}

pub(crate) fn lookup<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for seg in segments {
        node = match node {
            Value::Map(m) => m.get(seg)?,
            Value::Seq(s) => s.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

pub(crate) fn lookup_mut<'a>(root: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut node = root;
    for seg in segments {
        node = match node {
            Value::Map(m) => m.get_mut(seg)?,
            Value::Seq(s) => s.get_mut(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}
