//! Splitting oversized frames and reassembling them.
//!
//! ```text
//! frame (S bytes) ──Chunker──► [seq 0 | ofs 0][seq 1 | ofs M]..[seq k | last]
//!                                     │ any arrival order
//!                                     ▼
//!                  Reassembler: mid → parts, complete at last_seq + 1
//! ```
//!
//! Chunk payloads stay `margin` bytes under the transport's hard limit so
//! the `Chunk` envelope around them still fits.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::protocol::{ChunkFrame, CompressionConfig, ProtocolError, SyncMessage, DEFAULT_MAX_MESSAGE_SIZE};

/// Transport size limits.
#[derive(Debug, Clone)]
pub struct TransportLimits {
    /// Largest frame the transport accepts.
    pub hard_limit: usize,
    /// Room left for the chunk envelope.
    pub margin: usize,
    /// Largest whole message, before splitting.
    pub max_message_size: usize,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self { hard_limit: 65536, margin: 136, max_message_size: DEFAULT_MAX_MESSAGE_SIZE }
    }
}

impl TransportLimits {
    /// Small limits so tests exercise chunking with small payloads.
    pub fn for_testing() -> Self {
        Self { hard_limit: 1024, margin: 136, max_message_size: 64 * 1024 }
    }

    pub fn chunk_payload(&self) -> usize {
        self.hard_limit.saturating_sub(self.margin).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Incomplete messages older than this are evicted.
    pub timeout: Duration,
    /// Most messages buffered at once; the oldest goes first.
    pub max_pending: usize,
    /// Messages declaring a larger total are refused.
    pub max_message_size: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), max_pending: 64, max_message_size: DEFAULT_MAX_MESSAGE_SIZE }
    }
}

impl ReassemblyConfig {
    pub fn for_testing() -> Self {
        Self { timeout: Duration::from_millis(200), max_pending: 4, max_message_size: 64 * 1024 }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChunkError {
    #[error("Chunk {mid}#{seq} carries {actual} bytes, header says {declared}")]
    LengthMismatch { mid: String, seq: u32, declared: u32, actual: usize },
    #[error("Chunk {mid}#{seq} ends at {end}, beyond total {total}")]
    OutOfRange { mid: String, seq: u32, end: u64, total: u32 },
    #[error("Chunk {mid}#{seq} declares total {got}, expected {expected}")]
    InconsistentTotal { mid: String, seq: u32, expected: u32, got: u32 },
    #[error("Message {mid} has gaps after reassembly")]
    Gap { mid: String },
    #[error("Chunk {mid}#{seq} declares total {total}, limit is {max}")]
    TooLarge { mid: String, seq: u32, total: u32, max: usize },
}

/// Produces chunk frames with unique message ids.
#[derive(Debug, Default)]
pub struct Chunker {
    limits: TransportLimits,
    next: u64,
}

impl Chunker {
    pub fn new(limits: TransportLimits) -> Self {
        Self { limits, next: 0 }
    }

    pub fn limits(&self) -> &TransportLimits {
        &self.limits
    }

    pub fn needs_split(&self, len: usize) -> bool {
        len > self.limits.chunk_payload()
    }

    /// Split `frame` into chunks of at most `chunk_payload()` bytes.
    pub fn split(&mut self, frame: &[u8], tick: u64, now_ms: u64) -> Vec<ChunkFrame> {
        let mid = format!("{tick}:{now_ms}:{}", self.next);
        self.next += 1;
        let size = self.limits.chunk_payload();
        let count = frame.len().div_ceil(size);
        frame
            .chunks(size)
            .enumerate()
            .map(|(i, part)| ChunkFrame {
                mid: mid.clone(),
                seq: i as u32,
                offset: (i * size) as u32,
                len: part.len() as u32,
                total: frame.len() as u32,
                data: part.to_vec(),
                last: i + 1 == count,
            })
            .collect()
    }

    /// Encode `msg` into one or more transport frames.
    pub fn encode(
        &mut self,
        msg: &SyncMessage,
        compression: &CompressionConfig,
        tick: u64,
        now_ms: u64,
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let frame = msg.encode(compression)?;
        if frame.len() > self.limits.max_message_size {
            return Err(ProtocolError::TooLarge { size: frame.len(), max: self.limits.max_message_size });
        }
        if !self.needs_split(frame.len()) {
            return Ok(vec![frame]);
        }
        let chunks = self.split(&frame, tick, now_ms);
        log::debug!("Split {} frame of {} bytes into {} chunks", msg.kind(), frame.len(), chunks.len());
        let raw = CompressionConfig::disabled();
        chunks.into_iter().map(|c| SyncMessage::Chunk(c).encode(&raw)).collect()
    }
}

struct Pending {
    total: u32,
    last_seq: Option<u32>,
    parts: BTreeMap<u32, (u32, Vec<u8>)>,
    started: Instant,
}

/// Buffers chunks per message id until every part is present.
pub struct Reassembler {
    pending: HashMap<String, Pending>,
    config: ReassemblyConfig,
}

impl Reassembler {
    pub fn new(config: ReassemblyConfig) -> Self {
        Self { pending: HashMap::new(), config }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn max_message_size(&self) -> usize {
        self.config.max_message_size
    }

    /// Drop incomplete messages older than the timeout.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let timeout = self.config.timeout;
        let before = self.pending.len();
        self.pending.retain(|mid, p| {
            let keep = now.saturating_duration_since(p.started) < timeout;
            if !keep {
                log::debug!("Evicting stale reassembly {mid} ({} parts)", p.parts.len());
            }
            keep
        });
        before - self.pending.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self.pending.iter().min_by_key(|(_, p)| p.started).map(|(mid, _)| mid.clone());
        if let Some(mid) = oldest {
            log::warn!("Reassembly buffer full, evicting {mid}");
            self.pending.remove(&mid);
        }
    }

    /// Accept one chunk. Returns the whole frame once every part arrived.
    pub fn accept(&mut self, chunk: ChunkFrame, now: Instant) -> Result<Option<Vec<u8>>, ChunkError> {
        self.evict_expired(now);

        if chunk.data.len() != chunk.len as usize {
            return Err(ChunkError::LengthMismatch {
                mid: chunk.mid,
                seq: chunk.seq,
                declared: chunk.len,
                actual: chunk.data.len(),
            });
        }
        if chunk.total as usize > self.config.max_message_size {
            return Err(ChunkError::TooLarge {
                mid: chunk.mid,
                seq: chunk.seq,
                total: chunk.total,
                max: self.config.max_message_size,
            });
        }
        let end = chunk.offset as u64 + chunk.len as u64;
        if end > chunk.total as u64 {
            return Err(ChunkError::OutOfRange { mid: chunk.mid, seq: chunk.seq, end, total: chunk.total });
        }

        if !self.pending.contains_key(&chunk.mid) && self.pending.len() >= self.config.max_pending {
            self.evict_oldest();
        }
        let pending = self.pending.entry(chunk.mid.clone()).or_insert_with(|| Pending {
            total: chunk.total,
            last_seq: None,
            parts: BTreeMap::new(),
            started: now,
        });
        if pending.total != chunk.total {
            return Err(ChunkError::InconsistentTotal {
                mid: chunk.mid,
                seq: chunk.seq,
                expected: pending.total,
                got: chunk.total,
            });
        }
        if chunk.last {
            pending.last_seq = Some(chunk.seq);
        }
        pending.parts.insert(chunk.seq, (chunk.offset, chunk.data));

        let complete = pending.last_seq.is_some_and(|last| pending.parts.len() as u64 == last as u64 + 1);
        if !complete {
            return Ok(None);
        }

        let Some(pending) = self.pending.remove(&chunk.mid) else {
            return Ok(None);
        };
        let mut ordered: Vec<(u32, Vec<u8>)> = pending.parts.into_values().collect();
        ordered.sort_by_key(|(offset, _)| *offset);
        let mut buf = Vec::with_capacity(pending.total as usize);
        for (offset, data) in ordered {
            if offset as usize != buf.len() {
                return Err(ChunkError::Gap { mid: chunk.mid });
            }
            buf.extend_from_slice(&data);
        }
        if buf.len() != pending.total as usize {
            return Err(ChunkError::Gap { mid: chunk.mid });
        }
        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_default_chunk_payload() {
        assert_eq!(TransportLimits::default().chunk_payload(), 65400);
    }

    #[test]
    fn test_200kb_splits_into_four() {
        let mut chunker = Chunker::new(TransportLimits::default());
        let data = payload(200 * 1024);
        let chunks = chunker.split(&data, 42, 1000);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.data.len() <= 65400 && c.mid == "42:1000:0"));
        assert!(chunks[3].last && !chunks[2].last);

        let mut r = Reassembler::new(ReassemblyConfig::default());
        let now = Instant::now();
        let mut out = None;
        for c in chunks {
            out = r.accept(c, now).unwrap();
        }
        assert_eq!(out, Some(data));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_reverse_order_reassembly() {
        let mut chunker = Chunker::new(TransportLimits::for_testing());
        let data = payload(5000);
        let mut chunks = chunker.split(&data, 1, 1);
        chunks.reverse();
        let mut r = Reassembler::new(ReassemblyConfig::default());
        let now = Instant::now();
        let results: Vec<_> = chunks.into_iter().map(|c| r.accept(c, now).unwrap()).collect();
        assert!(results[..results.len() - 1].iter().all(Option::is_none));
        assert_eq!(results.last().cloned().flatten(), Some(data));
    }

    #[test]
    fn test_ids_unique_within_tick() {
        let mut chunker = Chunker::new(TransportLimits::for_testing());
        let a = chunker.split(&payload(2000), 3, 9);
        let b = chunker.split(&payload(2000), 3, 9);
        assert_ne!(a[0].mid, b[0].mid);
    }

    #[test]
    fn test_stale_entry_evicted() {
        let mut chunker = Chunker::new(TransportLimits::for_testing());
        let chunks = chunker.split(&payload(3000), 1, 1);
        let mut r = Reassembler::new(ReassemblyConfig::for_testing());
        let start = Instant::now();
        assert_eq!(r.accept(chunks[0].clone(), start).unwrap(), None);
        assert_eq!(r.pending_count(), 1);

        let later = start + Duration::from_secs(1);
        assert_eq!(r.accept(chunks[1].clone(), later).unwrap(), None);
        // the first part is gone; the late chunk started a fresh entry
        assert_eq!(r.pending_count(), 1);
        assert_eq!(r.accept(chunks[2].clone(), later).unwrap(), None);
        assert_eq!(r.accept(chunks[3].clone(), later).unwrap(), None);
    }

    #[test]
    fn test_max_pending_evicts_oldest() {
        let mut chunker = Chunker::new(TransportLimits::for_testing());
        let mut r = Reassembler::new(ReassemblyConfig::for_testing());
        let start = Instant::now();
        for i in 0..5u64 {
            let chunks = chunker.split(&payload(2000), i, 0);
            r.accept(chunks[0].clone(), start + Duration::from_millis(i)).unwrap();
        }
        assert_eq!(r.pending_count(), 4);
    }

    #[test]
    fn test_rejects_inconsistent_chunks() {
        let mut r = Reassembler::new(ReassemblyConfig::default());
        let now = Instant::now();
        let good = ChunkFrame { mid: "m".into(), seq: 0, offset: 0, len: 2, total: 4, data: vec![1, 2], last: false };
        r.accept(good, now).unwrap();

        let other_total = ChunkFrame { mid: "m".into(), seq: 1, offset: 2, len: 2, total: 5, data: vec![3, 4], last: true };
        assert!(matches!(r.accept(other_total, now), Err(ChunkError::InconsistentTotal { .. })));

        let overflow = ChunkFrame { mid: "m".into(), seq: 1, offset: 3, len: 2, total: 4, data: vec![3, 4], last: true };
        assert!(matches!(r.accept(overflow, now), Err(ChunkError::OutOfRange { .. })));

        let short = ChunkFrame { mid: "m".into(), seq: 1, offset: 2, len: 2, total: 4, data: vec![3], last: true };
        assert!(matches!(r.accept(short, now), Err(ChunkError::LengthMismatch { .. })));

        let fine = ChunkFrame { mid: "m".into(), seq: 1, offset: 2, len: 2, total: 4, data: vec![3, 4], last: true };
        assert_eq!(r.accept(fine, now).unwrap(), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_rejects_total_over_limit() {
        let mut r = Reassembler::new(ReassemblyConfig::for_testing());
        let now = Instant::now();
        let huge = ChunkFrame { mid: "m".into(), seq: 0, offset: 0, len: 2, total: u32::MAX, data: vec![1, 2], last: false };
        assert!(matches!(r.accept(huge, now), Err(ChunkError::TooLarge { total: u32::MAX, max: 65536, .. })));
        assert_eq!(r.pending_count(), 0);

        let at_limit = ChunkFrame { mid: "n".into(), seq: 0, offset: 0, len: 2, total: 65536, data: vec![1, 2], last: false };
        assert_eq!(r.accept(at_limit, now).unwrap(), None);
        assert_eq!(r.pending_count(), 1);
    }

    #[test]
    fn test_encode_refuses_message_over_limit() {
        let limits = TransportLimits { max_message_size: 4096, ..TransportLimits::for_testing() };
        let mut chunker = Chunker::new(limits);
        let msg = SyncMessage::Error { name: "world".into(), reason: "x".repeat(8000) };
        let err = chunker.encode(&msg, &CompressionConfig::disabled(), 0, 0).unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge { max: 4096, .. }));
    }

    #[test]
    fn test_encode_small_message_unchunked() {
        let mut chunker = Chunker::new(TransportLimits::default());
        let frames = chunker.encode(&SyncMessage::subscribe("world"), &CompressionConfig::default(), 0, 0).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(SyncMessage::decode(&frames[0]).unwrap(), SyncMessage::subscribe("world"));
    }

    #[test]
    fn test_encode_large_message_roundtrip() {
        let limits = TransportLimits::for_testing();
        let mut chunker = Chunker::new(limits.clone());
        let mut rng = fastrand::Rng::with_seed(1);
        let reason: String = (0..10_000).map(|_| rng.alphanumeric()).collect();
        let msg = SyncMessage::Error { name: "world".into(), reason };
        let frames = chunker.encode(&msg, &CompressionConfig::disabled(), 7, 70).unwrap();
        assert!(frames.len() > 1);
        assert!(frames.iter().all(|f| f.len() <= limits.hard_limit));

        let mut r = Reassembler::new(ReassemblyConfig::default());
        let mut whole = None;
        for f in frames {
            match SyncMessage::decode(&f).unwrap() {
                SyncMessage::Chunk(c) => whole = r.accept(c, Instant::now()).unwrap().or(whole),
                other => panic!("Expected Chunk, got {other:?}"),
            }
        }
        assert_eq!(SyncMessage::decode(&whole.unwrap()).unwrap(), msg);
    }
}
