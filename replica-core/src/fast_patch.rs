//! Binary delta batches for the schema-known high-frequency entity fields.
//!
//! ```text
//!  writer ──mark_dirty(field, id)──► FastPatchEncoder ──(u, fdata)──► wire
//!                                                                     │
//!  consumer ◄── FieldSample{previous, current} ◄── FastPatchDecoder ◄─┘
//!                                                   (drops u <= last_seen)
//! ```
//!
//! A batch is one [`FieldBlock`] per field with at least one dirty entity.
//! Only entities keyed by a decimal `u32` under `entities` take part.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::CodecError;
use crate::fixed_point::{self, FixedFormat};
use crate::value::Value;

/// Entity fields carried by the fast-patch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FastField {
    Position,
    Rotation,
    Scale,
    Type,
    Status,
    Model,
    Animation,
    Sound,
    Effect,
}

impl FastField {
    pub const ALL: [FastField; 9] = [
        FastField::Position,
        FastField::Rotation,
        FastField::Scale,
        FastField::Type,
        FastField::Status,
        FastField::Model,
        FastField::Animation,
        FastField::Sound,
        FastField::Effect,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FastField::Position => "position",
            FastField::Rotation => "rotation",
            FastField::Scale => "scale",
            FastField::Type => "type",
            FastField::Status => "status",
            FastField::Model => "model",
            FastField::Animation => "animation",
            FastField::Sound => "sound",
            FastField::Effect => "effect",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Fixed-point format for numeric fields, `None` for dictionary fields.
    pub fn format(self) -> Option<FixedFormat> {
        match self {
            FastField::Position => Some(FixedFormat::Fp168),
            FastField::Rotation => Some(FixedFormat::Fp412),
            FastField::Scale => Some(FixedFormat::Fp1616),
            _ => None,
        }
    }
}

/// Encoded data for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldBlock {
    pub dict: Option<BTreeMap<String, u32>>,
    pub pdata: Vec<u8>,
}

/// Field name → block.
pub type FastPatchData = BTreeMap<String, FieldBlock>;

/// The document's position origin, `[0, 0, 0]` when absent.
pub fn document_origin(root: &Value) -> [f64; 3] {
    root.get("origin").and_then(Value::as_f64_array::<3>).unwrap_or([0.0; 3])
}

/// Parse a fast-patch entity key.
pub fn entity_id(key: &str) -> Option<u32> {
    if key.len() > 1 && key.starts_with('0') {
        return None;
    }
    key.parse().ok()
}

/// Encode one field for the given entities, skipping entities that lack
/// the field or hold a value of the wrong shape.
fn encode_field<I>(root: &Value, field: FastField, ids: I, little_endian: bool) -> Option<FieldBlock>
where
    I: IntoIterator<Item = u32>,
{
    let entities = root.get("entities")?.as_map()?;
    let values = ids.into_iter().filter_map(|id| {
        let v = entities.get(&id.to_string())?.get(field.name())?;
        Some((id, v))
    });

    match field {
        FastField::Position => {
            let records: Vec<_> = values.filter_map(|(id, v)| Some((id, v.as_f64_array::<3>()?))).collect();
            (!records.is_empty()).then(|| FieldBlock {
                dict: None,
                pdata: fixed_point::encode_records(&records, FixedFormat::Fp168, document_origin(root), little_endian),
            })
        }
        FastField::Rotation => {
            let records: Vec<_> = values.filter_map(|(id, v)| Some((id, v.as_f64_array::<4>()?))).collect();
            (!records.is_empty()).then(|| FieldBlock {
                dict: None,
                pdata: fixed_point::encode_records(&records, FixedFormat::Fp412, [0.0; 4], little_endian),
            })
        }
        FastField::Scale => {
            let records: Vec<_> = values.filter_map(|(id, v)| Some((id, v.as_f64_array::<3>()?))).collect();
            (!records.is_empty()).then(|| FieldBlock {
                dict: None,
                pdata: fixed_point::encode_records(&records, FixedFormat::Fp1616, [0.0; 3], little_endian),
            })
        }
        _ => {
            let records: Vec<_> = values.filter_map(|(id, v)| Some((id, v.as_str()?))).collect();
            (!records.is_empty()).then(|| {
                let (dict, pdata) = fixed_point::encode_labels(&records, little_endian);
                FieldBlock { dict: Some(dict), pdata }
            })
        }
    }
}

/// Per-field dirty tracking plus the per-document update counter.
#[derive(Debug, Default)]
pub struct FastPatchEncoder {
    dirty: BTreeMap<FastField, BTreeSet<u32>>,
    counter: u64,
    little_endian: bool,
}

impl FastPatchEncoder {
    pub fn new(little_endian: bool) -> Self {
        Self { little_endian, ..Self::default() }
    }

    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    /// Counter of the most recently encoded batch.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn mark_dirty(&mut self, field: FastField, entity: u32) {
        self.dirty.entry(field).or_default().insert(entity);
    }

    pub fn is_dirty(&self, field: FastField, entity: u32) -> bool {
        self.dirty.get(&field).is_some_and(|ids| ids.contains(&entity))
    }

    pub fn has_changes(&self) -> bool {
        self.dirty.values().any(|ids| !ids.is_empty())
    }

    pub fn clear(&mut self) {
        self.dirty.clear();
    }

    /// Encode every dirty entity and clear the flags. Returns `None` (and
    /// keeps the counter) when nothing encodable was dirty.
    pub fn encode_changes(&mut self, root: &Value) -> Option<(u64, FastPatchData)> {
        let dirty = std::mem::take(&mut self.dirty);
        let data: FastPatchData = dirty
            .into_iter()
            .filter_map(|(field, ids)| {
                encode_field(root, field, ids, self.little_endian).map(|b| (field.name().to_string(), b))
            })
            .collect();
        if data.is_empty() {
            return None;
        }
        self.counter += 1;
        Some((self.counter, data))
    }

    /// Encode every entity for every fast field. Leaves dirty flags alone.
    pub fn encode_snapshot(&self, root: &Value) -> FastPatchData {
        let ids: Vec<u32> = root
            .get("entities")
            .and_then(Value::as_map)
            .map(|m| m.keys().filter_map(|k| entity_id(k)).collect())
            .unwrap_or_default();
        FastField::ALL
            .into_iter()
            .filter_map(|field| {
                encode_field(root, field, ids.iter().copied(), self.little_endian)
                    .map(|b| (field.name().to_string(), b))
            })
            .collect()
    }
}

/// A decoded fast-patch value.
#[derive(Debug, Clone, PartialEq)]
pub enum FastValue {
    Vec3([f64; 3]),
    Quat([f64; 4]),
    Label(String),
}

impl FastValue {
    pub fn to_value(&self) -> Value {
        match self {
            FastValue::Vec3(v) => Value::from(*v),
            FastValue::Quat(q) => Value::from(*q),
            FastValue::Label(s) => Value::from(s.as_str()),
        }
    }
}

/// Previous and latest value of one (entity, field), with arrival times.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSample {
    pub previous: Option<FastValue>,
    pub current: FastValue,
    pub previous_at_ms: Option<u64>,
    pub received_at_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FastPatchStats {
    pub batches: u64,
    pub lost_updates: u64,
    pub stale_dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    Applied { lost: u64, samples: usize },
    Stale,
}

#[derive(Debug, Default)]
pub struct FastPatchDecoder {
    last_seen: Option<u64>,
    samples: HashMap<(u32, FastField), FieldSample>,
    /// Pairs decoded by the most recent batch.
    touched: Vec<(u32, FastField)>,
    little_endian: bool,
    stats: FastPatchStats,
}

impl FastPatchDecoder {
    pub fn new(little_endian: bool) -> Self {
        Self { little_endian, ..Self::default() }
    }

    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    pub fn stats(&self) -> FastPatchStats {
        self.stats
    }

    /// Start over after a full snapshot: new byte order, new counter base.
    pub fn reset(&mut self, counter: u64, little_endian: bool) {
        self.last_seen = Some(counter);
        self.little_endian = little_endian;
        self.samples.clear();
        self.touched.clear();
    }

    pub fn sample(&self, entity: u32, field: FastField) -> Option<&FieldSample> {
        self.samples.get(&(entity, field))
    }

    pub fn samples(&self) -> impl Iterator<Item = (&(u32, FastField), &FieldSample)> + '_ {
        self.samples.iter()
    }

    /// Apply a counted batch. Batches at or below the last seen counter are
    /// dropped.
    pub fn apply(&mut self, counter: u64, data: &FastPatchData, origin: [f64; 3], now_ms: u64) -> DecodeOutcome {
        let lost = match self.last_seen {
            Some(last) if counter <= last => {
                log::trace!("Dropping stale fast patch {counter} (last seen {last})");
                self.stats.stale_dropped += 1;
                return DecodeOutcome::Stale;
            }
            Some(last) => counter - last - 1,
            None => 0,
        };
        if lost > 0 {
            log::debug!("{lost} fast patch update(s) lost before {counter}");
        }
        self.last_seen = Some(counter);
        self.stats.batches += 1;
        self.stats.lost_updates += lost;
        let samples = self.apply_blocks(data, origin, now_ms);
        DecodeOutcome::Applied { lost, samples }
    }

    /// Apply a snapshot's blocks without touching the counter.
    pub fn apply_snapshot(&mut self, data: &FastPatchData, origin: [f64; 3], now_ms: u64) -> usize {
        self.apply_blocks(data, origin, now_ms)
    }

    fn apply_blocks(&mut self, data: &FastPatchData, origin: [f64; 3], now_ms: u64) -> usize {
        self.touched.clear();
        for (name, block) in data {
            match self.decode_block(name, block, origin) {
                Ok(values) => {
                    for (entity, field, value) in values {
                        self.record(entity, field, value, now_ms);
                        self.touched.push((entity, field));
                    }
                }
                Err(e) => log::warn!("Dropping fast patch block {name}: {e}"),
            }
        }
        self.touched.len()
    }

    /// Forget samples of entities no longer under `entities` in `root`.
    pub fn retain_entities(&mut self, root: &Value) {
        let entities = root.get("entities").and_then(Value::as_map);
        let before = self.samples.len();
        self.samples.retain(|(entity, _), _| entities.is_some_and(|m| m.contains_key(&entity.to_string())));
        self.touched.retain(|(entity, _)| entities.is_some_and(|m| m.contains_key(&entity.to_string())));
        let dropped = before - self.samples.len();
        if dropped > 0 {
            log::debug!("Dropped {dropped} fast sample(s) of removed entities");
        }
    }

    fn decode_block(
        &self,
        name: &str,
        block: &FieldBlock,
        origin: [f64; 3],
    ) -> Result<Vec<(u32, FastField, FastValue)>, CodecError> {
        let field = FastField::from_name(name).ok_or_else(|| CodecError::UnknownField(name.to_string()))?;
        let le = self.little_endian;
        let values = match field {
            FastField::Position => fixed_point::decode_records::<3>(&block.pdata, FixedFormat::Fp168, origin, le)?
                .into_iter()
                .map(|(id, v)| (id, field, FastValue::Vec3(v)))
                .collect(),
            FastField::Rotation => fixed_point::decode_records::<4>(&block.pdata, FixedFormat::Fp412, [0.0; 4], le)?
                .into_iter()
                .map(|(id, v)| (id, field, FastValue::Quat(v)))
                .collect(),
            FastField::Scale => fixed_point::decode_records::<3>(&block.pdata, FixedFormat::Fp1616, [0.0; 3], le)?
                .into_iter()
                .map(|(id, v)| (id, field, FastValue::Vec3(v)))
                .collect(),
            _ => {
                let empty = BTreeMap::new();
                let dict = block.dict.as_ref().unwrap_or(&empty);
                fixed_point::decode_labels(&block.pdata, dict, le)?
                    .into_iter()
                    .map(|(id, s)| (id, field, FastValue::Label(s)))
                    .collect()
            }
        };
        Ok(values)
    }

    fn record(&mut self, entity: u32, field: FastField, value: FastValue, now_ms: u64) {
        match self.samples.get_mut(&(entity, field)) {
            Some(sample) => {
                let previous = std::mem::replace(&mut sample.current, value);
                sample.previous = Some(previous);
                sample.previous_at_ms = Some(sample.received_at_ms);
                sample.received_at_ms = now_ms;
            }
            None => {
                self.samples.insert(
                    (entity, field),
                    FieldSample { previous: None, current: value, previous_at_ms: None, received_at_ms: now_ms },
                );
            }
        }
    }

    /// Write the values decoded by the most recent batch into a mirror tree.
    pub fn materialize_into(&self, root: &mut Value) {
        let Some(map) = root.as_map_mut() else {
            return;
        };
        let entities = map.entry("entities".to_string()).or_insert_with(Value::map);
        let Some(entities) = entities.as_map_mut() else {
            return;
        };
        for &(entity, field) in &self.touched {
            let Some(sample) = self.samples.get(&(entity, field)) else {
                continue;
            };
            let node = entities.entry(entity.to_string()).or_insert_with(Value::map);
            if let Some(node) = node.as_map_mut() {
                node.insert(field.name().to_string(), sample.current.to_value());
            }
        }
    }
}
