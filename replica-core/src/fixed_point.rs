//! Fixed-point and dictionary encodings for the fast-patch channel.
//!
//! ```text
//! fp168   [S|iiiiiii iiiiiiii ffffffff]            3 bytes, scale 2^8
//! fp412   [S|iii ffff ffffffff]                    2 bytes, scale 2^12
//! fp1616  [S|iiiiiii iiiiiiii ffffffff ffffffff]   4 bytes, scale 2^16
//!
//! numeric record: [entity:u32][c0][c1]..[cN]       stride = 4 + N * width
//! dict record:    [entity:u32][dict id:u32]        stride = 8
//! ```
//!
//! Values are big-endian. The sign lives in the top bit of the first byte;
//! the remaining bits hold `round(|x| * scale)`.

use std::collections::{BTreeMap, HashMap};

use crate::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixedFormat {
    Fp168,
    Fp412,
    Fp1616,
}

impl FixedFormat {
    pub const fn width(self) -> usize {
        match self {
            FixedFormat::Fp168 => 3,
            FixedFormat::Fp412 => 2,
            FixedFormat::Fp1616 => 4,
        }
    }

    pub const fn scale(self) -> f64 {
        match self {
            FixedFormat::Fp168 => 256.0,
            FixedFormat::Fp412 => 4096.0,
            FixedFormat::Fp1616 => 65536.0,
        }
    }

    /// Largest magnitude integer that fits next to the sign bit.
    const fn max_raw(self) -> u32 {
        ((1u64 << (self.width() * 8 - 1)) - 1) as u32
    }

    /// Largest representable magnitude.
    pub fn max_value(self) -> f64 {
        self.max_raw() as f64 / self.scale()
    }

    /// Bytes per record carrying `components` values after a u32 id.
    pub const fn stride(self, components: usize) -> usize {
        4 + components * self.width()
    }
}

/// Append the encoding of `x` to `out`.
pub fn encode_into(x: f64, format: FixedFormat, out: &mut Vec<u8>) {
    let width = format.width();
    let x = if x.is_finite() { x } else { 0.0 };
    let scaled = (x.abs() * format.scale()).round();
    let raw = if scaled > format.max_raw() as f64 {
        log::debug!("Saturating {x} to {:?} range", format);
        format.max_raw()
    } else {
        scaled as u32
    };
    let bytes = raw.to_be_bytes();
    let start = out.len();
    out.extend_from_slice(&bytes[4 - width..]);
    if x < 0.0 && raw != 0 {
        out[start] |= 0x80;
    }
}

/// Decode one value from the first `format.width()` bytes of `bytes`.
pub fn decode(bytes: &[u8], format: FixedFormat) -> Result<f64, CodecError> {
    let width = format.width();
    if bytes.len() < width {
        return Err(CodecError::Truncated { needed: width, available: bytes.len() });
    }
    let negative = bytes[0] & 0x80 != 0;
    let mut buf = [0u8; 4];
    buf[4 - width..].copy_from_slice(&bytes[..width]);
    buf[4 - width] &= 0x7f;
    let raw = u32::from_be_bytes(buf) as f64;
    let scale = if negative { -format.scale() } else { format.scale() };
    Ok(raw / scale)
}

pub fn encode_fp168(x: f64) -> [u8; 3] {
    let mut out = Vec::with_capacity(3);
    encode_into(x, FixedFormat::Fp168, &mut out);
    [out[0], out[1], out[2]]
}

pub fn decode_fp168(bytes: [u8; 3]) -> f64 {
    decode(&bytes, FixedFormat::Fp168).unwrap_or(0.0)
}

fn put_u32(out: &mut Vec<u8>, v: u32, little_endian: bool) {
    if little_endian {
        out.extend_from_slice(&v.to_le_bytes());
    } else {
        out.extend_from_slice(&v.to_be_bytes());
    }
}

fn get_u32(bytes: &[u8], little_endian: bool) -> u32 {
    let arr = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if little_endian {
        u32::from_le_bytes(arr)
    } else {
        u32::from_be_bytes(arr)
    }
}

fn check_stride(pdata: &[u8], stride: usize) -> Result<usize, CodecError> {
    let whole = pdata.len() / stride;
    if pdata.len() % stride != 0 {
        return Err(CodecError::Truncated { needed: (whole + 1) * stride, available: pdata.len() });
    }
    Ok(whole)
}

/// Pack `(entity, components)` records back to back. `origin` is
/// subtracted before encoding (position is sent relative to it).
pub fn encode_records<const N: usize>(
    records: &[(u32, [f64; N])],
    format: FixedFormat,
    origin: [f64; N],
    little_endian: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * format.stride(N));
    for (entity, components) in records {
        put_u32(&mut out, *entity, little_endian);
        for (c, o) in components.iter().zip(origin.iter()) {
            encode_into(c - o, format, &mut out);
        }
    }
    out
}

pub fn decode_records<const N: usize>(
    pdata: &[u8],
    format: FixedFormat,
    origin: [f64; N],
    little_endian: bool,
) -> Result<Vec<(u32, [f64; N])>, CodecError> {
    let stride = format.stride(N);
    let count = check_stride(pdata, stride)?;
    let mut records = Vec::with_capacity(count);
    for record in pdata.chunks_exact(stride) {
        let entity = get_u32(record, little_endian);
        let mut components = [0.0; N];
        for (i, slot) in components.iter_mut().enumerate() {
            let at = 4 + i * format.width();
            *slot = decode(&record[at..], format)? + origin[i];
        }
        records.push((entity, components));
    }
    Ok(records)
}

/// Per-batch string interning, ids assigned from 1 in first-seen order.
#[derive(Debug, Default)]
pub struct Dictionary {
    ids: BTreeMap<String, u32>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(id) = self.ids.get(value) {
            return *id;
        }
        let id = self.ids.len() as u32 + 1;
        self.ids.insert(value.to_string(), id);
        id
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn into_map(self) -> BTreeMap<String, u32> {
        self.ids
    }
}

/// Encode `(entity, label)` pairs as `(entity, dict id)` records plus the
/// batch dictionary.
pub fn encode_labels(records: &[(u32, &str)], little_endian: bool) -> (BTreeMap<String, u32>, Vec<u8>) {
    let mut dict = Dictionary::new();
    let mut out = Vec::with_capacity(records.len() * 8);
    for (entity, label) in records {
        let id = dict.intern(label);
        put_u32(&mut out, *entity, little_endian);
        put_u32(&mut out, id, little_endian);
    }
    (dict.into_map(), out)
}

pub fn decode_labels(
    pdata: &[u8],
    dict: &BTreeMap<String, u32>,
    little_endian: bool,
) -> Result<Vec<(u32, String)>, CodecError> {
    let count = check_stride(pdata, 8)?;
    let inverse: HashMap<u32, &str> = dict.iter().map(|(k, v)| (*v, k.as_str())).collect();
    let mut records = Vec::with_capacity(count);
    for record in pdata.chunks_exact(8) {
        let entity = get_u32(record, little_endian);
        let id = get_u32(&record[4..], little_endian);
        let label = inverse.get(&id).ok_or(CodecError::UnknownDictId(id))?;
        records.push((entity, label.to_string()));
    }
    Ok(records)
}
