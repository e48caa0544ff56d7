//! Binary wire protocol for document replication.
//!
//! Frame layout:
//! ```text
//! ┌──────────┬──────────────────────────────────────────────┐
//! │ flag     │ body                                         │
//! │ 1 byte   │ bincode(SyncMessage), LZ4 when flag == 1     │
//! └──────────┴──────────────────────────────────────────────┘
//! ```
//!
//! The enum variant index is the message tag. Compression is applied only
//! to bodies inside `[min_size, max_size]` and kept only when it shrinks
//! the frame.

use replica_core::{FastPatchData, Value, WireOp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const FLAG_RAW: u8 = 0;
const FLAG_LZ4: u8 = 1;

/// Largest decoded message body accepted by default.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Signaling payload kinds, relayed verbatim between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// One fragment of an oversized frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFrame {
    /// `"{tick}:{timestamp}:{n}"`
    pub mid: String,
    pub seq: u32,
    pub offset: u32,
    pub len: u32,
    pub total: u32,
    pub data: Vec<u8>,
    pub last: bool,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Full snapshot sent on subscribe.
    Full {
        server_time: u64,
        name: String,
        doc: Value,
        /// Byte order of ids inside fast-patch blocks.
        little_endian: bool,
        /// Fast-patch counter the snapshot corresponds to.
        counter: u64,
        fdata: Option<FastPatchData>,
    },
    Patch {
        server_time: u64,
        counter: u64,
        name: String,
        ops: Vec<WireOp>,
    },
    FastPatch {
        server_time: u64,
        counter: u64,
        name: String,
        fdata: FastPatchData,
    },
    /// Client → server op batch.
    Sync {
        client_time: u64,
        name: String,
        ops: Vec<WireOp>,
    },
    Subscribe {
        name: String,
    },
    Unsubscribe {
        name: String,
    },
    Ping {
        client_time: u64,
    },
    Pong {
        client_time: u64,
        server_time: u64,
    },
    Peng {
        rtt_ms: u64,
    },
    Signal {
        kind: SignalKind,
        payload: String,
    },
    Chunk(ChunkFrame),
    Error {
        name: String,
        reason: String,
    },
    Shutdown {
        reason: String,
    },
}

impl SyncMessage {
    pub fn subscribe(name: impl Into<String>) -> Self {
        Self::Subscribe { name: name.into() }
    }

    pub fn unsubscribe(name: impl Into<String>) -> Self {
        Self::Unsubscribe { name: name.into() }
    }

    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Full { .. } => "full",
            Self::Patch { .. } => "patch",
            Self::FastPatch { .. } => "fpatch",
            Self::Sync { .. } => "sync",
            Self::Subscribe { .. } => "sub",
            Self::Unsubscribe { .. } => "unsub",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Peng { .. } => "peng",
            Self::Signal { .. } => "signal",
            Self::Chunk(_) => "chunk",
            Self::Error { .. } => "error",
            Self::Shutdown { .. } => "shutdown",
        }
    }

    /// Fast-patch frames may travel the best-effort channel.
    pub fn is_fast(&self) -> bool {
        matches!(self, Self::FastPatch { .. })
    }

    /// Serialize and frame.
    pub fn encode(&self, compression: &CompressionConfig) -> Result<Vec<u8>, ProtocolError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(frame(body, compression))
    }

    /// Unframe and deserialize, capped at `DEFAULT_MAX_MESSAGE_SIZE`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode_limited(bytes, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Unframe and deserialize. Bodies larger than `max_size` are rejected
    /// before any buffer is allocated for them.
    pub fn decode_limited(bytes: &[u8], max_size: usize) -> Result<Self, ProtocolError> {
        let body = unframe(bytes, max_size)?;
        let (msg, _) = bincode::serde::decode_from_slice(&body, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Compression filter thresholds.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Bodies smaller than this are sent raw.
    pub min_size: usize,
    /// Bodies larger than this are sent raw to bound CPU cost.
    pub max_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { min_size: 512, max_size: 1024 * 1024 }
    }
}

impl CompressionConfig {
    /// Never compress.
    pub fn disabled() -> Self {
        Self { min_size: usize::MAX, max_size: 0 }
    }

    fn applies(&self, len: usize) -> bool {
        len >= self.min_size && len <= self.max_size
    }
}

fn frame(body: Vec<u8>, compression: &CompressionConfig) -> Vec<u8> {
    if compression.applies(body.len()) {
        let compressed = lz4_flex::compress_prepend_size(&body);
        if compressed.len() < body.len() {
            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(FLAG_LZ4);
            out.extend_from_slice(&compressed);
            return out;
        }
    }
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(FLAG_RAW);
    out.extend_from_slice(&body);
    out
}

fn unframe(bytes: &[u8], max_size: usize) -> Result<std::borrow::Cow<'_, [u8]>, ProtocolError> {
    let (flag, body) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
    match *flag {
        FLAG_RAW if body.len() > max_size => Err(ProtocolError::TooLarge { size: body.len(), max: max_size }),
        FLAG_RAW => Ok(std::borrow::Cow::Borrowed(body)),
        FLAG_LZ4 => decompress_bounded(body, max_size).map(std::borrow::Cow::Owned),
        other => Err(ProtocolError::UnknownFrameFlag(other)),
    }
}

/// LZ4 block with a little-endian u32 length prefix.
fn decompress_bounded(body: &[u8], max_size: usize) -> Result<Vec<u8>, ProtocolError> {
    let (prefix, block) = body
        .split_first_chunk::<4>()
        .ok_or_else(|| ProtocolError::Decompression("missing size prefix".to_string()))?;
    let size = u32::from_le_bytes(*prefix) as usize;
    if size > max_size {
        return Err(ProtocolError::TooLarge { size, max: max_size });
    }
    let mut out = vec![0u8; size];
    let written =
        lz4_flex::decompress_into(block, &mut out).map_err(|e| ProtocolError::Decompression(e.to_string()))?;
    if written != size {
        return Err(ProtocolError::Decompression(format!("expected {size} bytes, got {written}")));
    }
    Ok(out)
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Unknown frame flag: {0}")]
    UnknownFrameFlag(u8),
    #[error("Message of {size} bytes exceeds limit {max}")]
    TooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_core::ChangeRecord;
    use serde_json::json;

    #[test]
    fn test_full_roundtrip() {
        let msg = SyncMessage::Full {
            server_time: 1234,
            name: "world".into(),
            doc: Value::from(json!({"entities": {}})),
            little_endian: false,
            counter: 0,
            fdata: None,
        };
        let encoded = msg.encode(&CompressionConfig::default()).unwrap();
        assert_eq!(encoded[0], FLAG_RAW);
        assert_eq!(SyncMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_patch_roundtrip_keeps_wire_codes() {
        let msg = SyncMessage::Patch {
            server_time: 1,
            counter: 7,
            name: "world".into(),
            ops: vec![
                ChangeRecord::replace("/entities/5/position", vec![1, 2, 3]).to_wire(),
                ChangeRecord::remove("/entities/4").to_wire(),
            ],
        };
        let decoded = SyncMessage::decode(&msg.encode(&CompressionConfig::default()).unwrap()).unwrap();
        match decoded {
            SyncMessage::Patch { ops, counter, .. } => {
                assert_eq!(counter, 7);
                assert_eq!(ops[0].o, None);
                assert_eq!(ops[1].o, Some('r'));
            }
            other => panic!("Expected Patch, got {other:?}"),
        }
    }

    #[test]
    fn test_large_body_compressed() {
        let msg = SyncMessage::Error { name: "world".into(), reason: "x".repeat(4096) };
        let encoded = msg.encode(&CompressionConfig::default()).unwrap();
        assert_eq!(encoded[0], FLAG_LZ4);
        assert!(encoded.len() < 4096);
        assert_eq!(SyncMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_compression_bounds() {
        let msg = SyncMessage::Error { name: "world".into(), reason: "x".repeat(4096) };
        let raw = msg.encode(&CompressionConfig::disabled()).unwrap();
        assert_eq!(raw[0], FLAG_RAW);
        let capped = CompressionConfig { min_size: 16, max_size: 1024 };
        assert_eq!(msg.encode(&capped).unwrap()[0], FLAG_RAW);
    }

    #[test]
    fn test_incompressible_stays_raw() {
        let mut rng = fastrand::Rng::with_seed(7);
        let payload: String = (0..2048).map(|_| rng.alphanumeric()).collect();
        let msg = SyncMessage::Signal { kind: SignalKind::Offer, payload };
        let encoded = msg.encode(&CompressionConfig { min_size: 1, max_size: usize::MAX }).unwrap();
        assert_eq!(SyncMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert_eq!(SyncMessage::decode(&[]), Err(ProtocolError::EmptyFrame));
        assert_eq!(SyncMessage::decode(&[9, 1, 2]), Err(ProtocolError::UnknownFrameFlag(9)));
        assert!(matches!(SyncMessage::decode(&[0, 0xFF, 0xFE, 0xFD]), Err(ProtocolError::Deserialization(_))));
        assert!(matches!(SyncMessage::decode(&[1, 0xFF]), Err(ProtocolError::Decompression(_))));
    }

    #[test]
    fn test_lz4_size_prefix_checked_before_allocation() {
        // prefix claims 4 GiB with a one-byte block behind it
        let frame = [FLAG_LZ4, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];
        assert_eq!(
            SyncMessage::decode(&frame),
            Err(ProtocolError::TooLarge { size: u32::MAX as usize, max: DEFAULT_MAX_MESSAGE_SIZE })
        );
    }

    #[test]
    fn test_decode_limited_rejects_large_bodies() {
        let msg = SyncMessage::Signal { kind: SignalKind::Answer, payload: "candidate ".repeat(600) };

        let raw = msg.encode(&CompressionConfig::disabled()).unwrap();
        assert!(matches!(SyncMessage::decode_limited(&raw, 1024), Err(ProtocolError::TooLarge { max: 1024, .. })));

        let packed = msg.encode(&CompressionConfig { min_size: 1, max_size: usize::MAX }).unwrap();
        assert_eq!(packed[0], FLAG_LZ4);
        assert!(matches!(SyncMessage::decode_limited(&packed, 1024), Err(ProtocolError::TooLarge { max: 1024, .. })));
        assert_eq!(SyncMessage::decode_limited(&packed, 8192).unwrap(), msg);
    }

    #[test]
    fn test_lz4_length_mismatch_rejected() {
        let body = bincode::serde::encode_to_vec(SyncMessage::subscribe("world"), bincode::config::standard()).unwrap();
        let mut packed = lz4_flex::compress_prepend_size(&body);
        packed[..4].copy_from_slice(&((body.len() + 8) as u32).to_le_bytes());
        let mut frame = vec![FLAG_LZ4];
        frame.extend_from_slice(&packed);
        assert!(matches!(SyncMessage::decode(&frame), Err(ProtocolError::Decompression(_))));
    }

    #[test]
    fn test_kind_and_is_fast() {
        let msg = SyncMessage::FastPatch {
            server_time: 0,
            counter: 1,
            name: "w".into(),
            fdata: FastPatchData::new(),
        };
        assert_eq!(msg.kind(), "fpatch");
        assert!(msg.is_fast());
        assert!(!SyncMessage::subscribe("w").is_fast());
    }

    #[test]
    fn test_ping_is_small() {
        let encoded = SyncMessage::Ping { client_time: 1_700_000_000_000 }.encode(&CompressionConfig::default()).unwrap();
        assert!(encoded.len() < 16, "ping frame is {} bytes", encoded.len());
    }
}
