//! Dual transport: reliable primary queue plus optional data channel.
//!
//! ```text
//!                     ┌──────────────────┐   reliable, ordered
//!   EncodedFrames ───►│ TransportManager │──────────────────────► primary (WebSocket)
//!                     │                  │   fast frames only
//!                     │                  │──────────────────────► DataChannel (best effort)
//!                     └────────┬─────────┘
//!                              │ signaling
//!                              ▼
//!                     PeerNegotiator: Idle → OfferCreated → AwaitingAnswer → Connected | Failed
//! ```
//!
//! When no data channel is connected, fast frames take the primary queue.
//! A full primary queue drops fast frames and rejects reliable ones.

use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::chunk::Chunker;
use crate::protocol::{CompressionConfig, ProtocolError, SignalKind, SyncMessage};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,
    #[error("Outbound queue full")]
    QueueFull,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Signal {signal:?} not valid in state {state:?}")]
    InvalidState { state: NegotiationState, signal: SignalKind },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A best-effort secondary channel.
pub trait DataChannel: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    fn is_open(&self) -> bool {
        true
    }
}

/// A pluggable peer-to-peer transport (WebRTC or similar).
pub trait PeerTransport: Send {
    fn create_offer(&mut self) -> Result<String, TransportError>;
    fn create_answer(&mut self, offer: &str) -> Result<String, TransportError>;
    fn apply_remote_description(&mut self, description: &str) -> Result<(), TransportError>;
    fn add_remote_candidate(&mut self, candidate: &str) -> Result<(), TransportError>;
    fn data_channel(&self) -> Option<Arc<dyn DataChannel>>;
}

/// Builds the answering side of a peer transport for a session.
pub trait PeerTransportFactory: Send + Sync {
    fn create(&self, session: u64) -> Box<dyn PeerTransport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferCreated,
    AwaitingAnswer,
    Connected,
    Failed,
}

/// Drives secondary-channel signaling for either side.
pub struct PeerNegotiator {
    transport: Box<dyn PeerTransport>,
    state: NegotiationState,
    description_sent: bool,
    gathering_complete: bool,
    remote_applied: bool,
    local_candidates: Vec<String>,
    remote_candidates: Vec<String>,
}

impl PeerNegotiator {
    pub fn new(transport: Box<dyn PeerTransport>) -> Self {
        Self {
            transport,
            state: NegotiationState::Idle,
            description_sent: false,
            gathering_complete: false,
            remote_applied: false,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    fn fail(&mut self, e: TransportError) -> TransportError {
        log::warn!("Peer negotiation failed: {e}");
        self.state = NegotiationState::Failed;
        e
    }

    /// Offering side: produce the offer signal.
    pub fn create_offer(&mut self) -> Result<SyncMessage, TransportError> {
        if self.state != NegotiationState::Idle {
            return Err(TransportError::InvalidState { state: self.state, signal: SignalKind::Offer });
        }
        let offer = self.transport.create_offer().map_err(|e| self.fail(e))?;
        self.state = NegotiationState::OfferCreated;
        Ok(SyncMessage::Signal { kind: SignalKind::Offer, payload: offer })
    }

    /// The offer went out on the primary channel. Returns any queued
    /// candidates that may now be sent.
    pub fn mark_offer_sent(&mut self) -> Vec<SyncMessage> {
        if self.state == NegotiationState::OfferCreated {
            self.state = NegotiationState::AwaitingAnswer;
        }
        self.description_sent = true;
        self.flush_local()
    }

    pub fn on_local_candidate(&mut self, candidate: String) -> Vec<SyncMessage> {
        self.local_candidates.push(candidate);
        self.flush_local()
    }

    pub fn on_gathering_complete(&mut self) -> Vec<SyncMessage> {
        self.gathering_complete = true;
        self.flush_local()
    }

    fn flush_local(&mut self) -> Vec<SyncMessage> {
        if !(self.description_sent && self.gathering_complete) {
            return Vec::new();
        }
        self.local_candidates
            .drain(..)
            .map(|payload| SyncMessage::Signal { kind: SignalKind::Candidate, payload })
            .collect()
    }

    fn flush_remote(&mut self) -> Result<(), TransportError> {
        for candidate in std::mem::take(&mut self.remote_candidates) {
            self.transport.add_remote_candidate(&candidate)?;
        }
        Ok(())
    }

    /// Handle a signal relayed from the other side. Returns signals to
    /// send back.
    pub fn handle_signal(&mut self, kind: SignalKind, payload: &str) -> Result<Vec<SyncMessage>, TransportError> {
        match (kind, self.state) {
            (SignalKind::Offer, NegotiationState::Idle) => {
                let answer = self.transport.create_answer(payload).map_err(|e| self.fail(e))?;
                self.remote_applied = true;
                self.flush_remote().map_err(|e| self.fail(e))?;
                self.state = NegotiationState::Connected;
                self.description_sent = true;
                let mut out = vec![SyncMessage::Signal { kind: SignalKind::Answer, payload: answer }];
                out.extend(self.flush_local());
                Ok(out)
            }
            (SignalKind::Answer, NegotiationState::AwaitingAnswer | NegotiationState::OfferCreated) => {
                self.transport.apply_remote_description(payload).map_err(|e| self.fail(e))?;
                self.remote_applied = true;
                self.flush_remote().map_err(|e| self.fail(e))?;
                self.state = NegotiationState::Connected;
                Ok(Vec::new())
            }
            (SignalKind::Candidate, state) if state != NegotiationState::Failed => {
                if self.remote_applied {
                    self.transport.add_remote_candidate(payload)?;
                } else {
                    self.remote_candidates.push(payload.to_string());
                }
                Ok(Vec::new())
            }
            (signal, state) => Err(TransportError::InvalidState { state, signal }),
        }
    }

    /// The data channel, once negotiation completed and it is open.
    pub fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        if self.state != NegotiationState::Connected {
            return None;
        }
        self.transport.data_channel().filter(|dc| dc.is_open())
    }
}

/// An encoded message, possibly split into chunk frames.
#[derive(Debug, Clone)]
pub struct EncodedFrames {
    pub frames: Arc<Vec<Vec<u8>>>,
    pub fast: bool,
    pub kind: &'static str,
}

impl EncodedFrames {
    pub fn encode(
        msg: &SyncMessage,
        chunker: &mut Chunker,
        compression: &CompressionConfig,
        tick: u64,
        now_ms: u64,
    ) -> Result<Self, ProtocolError> {
        let frames = chunker.encode(msg, compression, tick, now_ms)?;
        Ok(Self { frames: Arc::new(frames), fast: msg.is_fast(), kind: msg.kind() })
    }

    pub fn byte_len(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    DataChannel,
    /// Fast frame dropped on a full queue.
    Dropped,
}

/// Routes encoded messages for one connection.
pub struct TransportManager {
    primary: mpsc::Sender<EncodedFrames>,
    negotiator: Mutex<Option<PeerNegotiator>>,
}

impl TransportManager {
    pub fn new(primary: mpsc::Sender<EncodedFrames>) -> Self {
        Self { primary, negotiator: Mutex::new(None) }
    }

    pub fn set_negotiator(&self, negotiator: PeerNegotiator) {
        if let Ok(mut slot) = self.negotiator.lock() {
            *slot = Some(negotiator);
        }
    }

    /// Run `f` against the negotiator, if one is installed.
    pub fn with_negotiator<R>(&self, f: impl FnOnce(&mut PeerNegotiator) -> R) -> Option<R> {
        let mut slot = self.negotiator.lock().ok()?;
        slot.as_mut().map(f)
    }

    pub fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.with_negotiator(|n| n.data_channel()).flatten()
    }

    pub fn is_closed(&self) -> bool {
        self.primary.is_closed()
    }

    /// Send without blocking.
    pub fn send(&self, frames: EncodedFrames) -> Result<SendOutcome, TransportError> {
        if frames.fast {
            if let Some(dc) = self.data_channel() {
                match frames.frames.iter().try_for_each(|f| dc.send(f)) {
                    Ok(()) => return Ok(SendOutcome::DataChannel),
                    Err(e) => log::debug!("Data channel send failed, using primary: {e}"),
                }
            }
        }
        match self.primary.try_send(frames) {
            Ok(()) => Ok(SendOutcome::Queued),
            Err(mpsc::error::TrySendError::Full(f)) if f.fast => {
                log::trace!("Dropping {} frame on full queue", f.kind);
                Ok(SendOutcome::Dropped)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records frames sent over the data channel.
    #[derive(Default)]
    pub struct RecordingChannel {
        pub sent: Mutex<Vec<Vec<u8>>>,
    }

    impl DataChannel for RecordingChannel {
        fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
            self.sent.lock().map_err(|e| TransportError::Send(e.to_string()))?.push(frame.to_vec());
            Ok(())
        }
    }

    /// Scripted peer transport.
    #[derive(Default)]
    pub struct FakePeer {
        pub remote_description: Option<String>,
        pub remote_candidates: Arc<Mutex<Vec<String>>>,
        pub channel: Arc<RecordingChannel>,
    }

    impl PeerTransport for FakePeer {
        fn create_offer(&mut self) -> Result<String, TransportError> {
            Ok("offer-sdp".into())
        }

        fn create_answer(&mut self, offer: &str) -> Result<String, TransportError> {
            self.remote_description = Some(offer.to_string());
            Ok(format!("answer-to-{offer}"))
        }

        fn apply_remote_description(&mut self, description: &str) -> Result<(), TransportError> {
            if description.is_empty() {
                return Err(TransportError::Negotiation("empty description".into()));
            }
            self.remote_description = Some(description.to_string());
            Ok(())
        }

        fn add_remote_candidate(&mut self, candidate: &str) -> Result<(), TransportError> {
            if self.remote_description.is_none() {
                return Err(TransportError::Negotiation("candidate before description".into()));
            }
            if let Ok(mut c) = self.remote_candidates.lock() {
                c.push(candidate.to_string());
            }
            Ok(())
        }

        fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
            Some(self.channel.clone() as Arc<dyn DataChannel>)
        }
    }

    pub struct FakeFactory;

    impl PeerTransportFactory for FakeFactory {
        fn create(&self, _session: u64) -> Box<dyn PeerTransport> {
            Box::new(FakePeer::default())
        }
    }
}
