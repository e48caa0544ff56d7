//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, jittered auto-reconnect)
//! - Document mirrors fed by full snapshots, patches and fast patches
//! - Clock sync on every connect
//! - Optional secondary data channel negotiation
//!
//! Inbound handling lives in [`ClientCore`], which has no I/O, so the
//! protocol logic is testable without a socket.

use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;

use replica_core::fast_patch::{self, DecodeOutcome, FastField, FastPatchDecoder, FieldSample};
use replica_core::patch;
use replica_core::{TrackError, TrackedDocument, Value};

use crate::chunk::{Chunker, ReassemblyConfig, Reassembler, TransportLimits};
use crate::clock::{self, ClockSync};
use crate::protocol::{CompressionConfig, ProtocolError, SyncMessage};
use crate::transport::{PeerNegotiator, PeerTransport, TransportError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// A full snapshot replaced the mirror.
    DocumentLoaded(String),
    Patched {
        name: String,
        counter: u64,
        applied: usize,
        failed: usize,
    },
    FastPatched {
        name: String,
        counter: u64,
        lost: u64,
    },
    ClockSynced {
        rtt_ms: u64,
        offset_ms: i64,
    },
    Error {
        name: String,
        reason: String,
    },
    ServerShutdown(String),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Unknown document: {0}")]
    UnknownDocument(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Track(#[from] TrackError),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub auto_reconnect: bool,
    pub reconnect_base: Duration,
    pub reconnect_jitter: Duration,
    pub outbound_capacity: usize,
    pub event_capacity: usize,
    pub compression: CompressionConfig,
    pub limits: TransportLimits,
    pub reassembly: ReassemblyConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            auto_reconnect: true,
            reconnect_base: Duration::from_millis(500),
            reconnect_jitter: Duration::from_millis(500),
            outbound_capacity: 256,
            event_capacity: 256,
            compression: CompressionConfig::default(),
            limits: TransportLimits::default(),
            reassembly: ReassemblyConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    pub fn for_testing(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auto_reconnect: false,
            reconnect_base: Duration::from_millis(20),
            reconnect_jitter: Duration::from_millis(20),
            ..Self::default()
        }
    }
}

/// Connect / disconnect / reconnect bookkeeping.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    auto_reconnect: bool,
    manual_disconnect: bool,
    generation: u64,
    base: Duration,
    jitter: Duration,
}

impl ConnectionStateMachine {
    pub fn new(auto_reconnect: bool, base: Duration, jitter: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            auto_reconnect,
            manual_disconnect: false,
            generation: 0,
            base,
            jitter,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Bumped by every accepted connect and every disconnect. Tasks of an
    /// older generation must not touch the connection.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// User-initiated connect. Ignored unless disconnected.
    pub fn begin_connect(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            log::debug!("Connect ignored while {:?}", self.state);
            return false;
        }
        self.manual_disconnect = false;
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        true
    }

    /// Reconnect attempt. Refused after a manual disconnect.
    pub fn begin_reconnect(&mut self) -> bool {
        if self.manual_disconnect || self.state != ConnectionState::Disconnected {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    pub fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
    }

    /// Close or failed attempt. Returns whether a live connection was
    /// lost, and the delay before the next attempt if one is due.
    pub fn on_closed(&mut self) -> (bool, Option<Duration>) {
        let was_connected = self.state == ConnectionState::Connected;
        self.state = ConnectionState::Disconnected;
        let retry = (self.auto_reconnect && !self.manual_disconnect).then(|| self.reconnect_delay());
        (was_connected, retry)
    }

    /// Idempotent. Cancels any pending reconnect.
    pub fn disconnect(&mut self) -> bool {
        self.manual_disconnect = true;
        self.generation += 1;
        let changed = self.state != ConnectionState::Disconnected;
        self.state = ConnectionState::Disconnected;
        changed
    }

    /// `base + rand(0, jitter)`.
    pub fn reconnect_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 { 0 } else { fastrand::u64(0..jitter_ms) };
        self.base + Duration::from_millis(extra)
    }
}

struct Mirror {
    doc: TrackedDocument,
    decoder: FastPatchDecoder,
}

/// What a handled message asks the caller to do.
#[derive(Debug, Default, PartialEq)]
pub struct Reaction {
    pub events: Vec<ClientEvent>,
    pub replies: Vec<SyncMessage>,
}

impl Reaction {
    fn event(event: ClientEvent) -> Self {
        Self { events: vec![event], replies: Vec::new() }
    }

    fn merge(&mut self, other: Reaction) {
        self.events.extend(other.events);
        self.replies.extend(other.replies);
    }
}

/// Protocol state of a client, independent of the socket.
pub struct ClientCore {
    subscriptions: BTreeSet<String>,
    mirrors: HashMap<String, Mirror>,
    clock: ClockSync,
    reassembler: Reassembler,
    negotiator: Option<PeerNegotiator>,
}

impl ClientCore {
    pub fn new(reassembly: ReassemblyConfig) -> Self {
        Self {
            subscriptions: BTreeSet::new(),
            mirrors: HashMap::new(),
            clock: ClockSync::default(),
            reassembler: Reassembler::new(reassembly),
            negotiator: None,
        }
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &String> + '_ {
        self.subscriptions.iter()
    }

    pub fn subscribe(&mut self, name: &str) -> SyncMessage {
        self.subscriptions.insert(name.to_string());
        SyncMessage::subscribe(name)
    }

    pub fn unsubscribe(&mut self, name: &str) -> SyncMessage {
        self.subscriptions.remove(name);
        self.mirrors.remove(name);
        SyncMessage::unsubscribe(name)
    }

    /// Messages to send right after a (re)connect. Clock samples of the
    /// previous connection are dropped.
    pub fn on_connected(&mut self, now_ms: u64) -> Vec<SyncMessage> {
        self.clock.reset();
        let mut out = vec![SyncMessage::Ping { client_time: now_ms }];
        out.extend(self.subscriptions.iter().map(SyncMessage::subscribe));
        out
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn document(&self, name: &str) -> Option<&TrackedDocument> {
        self.mirrors.get(name).map(|m| &m.doc)
    }

    pub fn fast_sample(&self, name: &str, entity: u32, field: FastField) -> Option<&FieldSample> {
        self.mirrors.get(name)?.decoder.sample(entity, field)
    }

    pub fn fast_stats(&self, name: &str) -> Option<fast_patch::FastPatchStats> {
        self.mirrors.get(name).map(|m| m.decoder.stats())
    }

    /// Run a local mutation and return the `sync` message for it, if any.
    pub fn update<R>(
        &mut self,
        name: &str,
        now_ms: u64,
        f: impl FnOnce(&mut TrackedDocument) -> R,
    ) -> Result<(R, Option<SyncMessage>), ClientError> {
        let mirror = self.mirrors.get_mut(name).ok_or_else(|| ClientError::UnknownDocument(name.to_string()))?;
        let out = f(&mut mirror.doc);
        let changes = mirror.doc.drain_changes();
        let msg = (!changes.is_empty()).then(|| SyncMessage::Sync {
            client_time: now_ms,
            name: name.to_string(),
            ops: patch::encode_batch(&changes),
        });
        Ok((out, msg))
    }

    pub fn start_peer(&mut self, transport: Box<dyn PeerTransport>) -> Result<SyncMessage, ClientError> {
        let mut negotiator = PeerNegotiator::new(transport);
        let offer = negotiator.create_offer()?;
        self.negotiator = Some(negotiator);
        Ok(offer)
    }

    /// The offer was handed to the socket.
    pub fn offer_sent(&mut self) -> Vec<SyncMessage> {
        self.negotiator.as_mut().map(PeerNegotiator::mark_offer_sent).unwrap_or_default()
    }

    pub fn on_local_candidate(&mut self, candidate: String) -> Vec<SyncMessage> {
        self.negotiator.as_mut().map(|n| n.on_local_candidate(candidate)).unwrap_or_default()
    }

    pub fn on_gathering_complete(&mut self) -> Vec<SyncMessage> {
        self.negotiator.as_mut().map(PeerNegotiator::on_gathering_complete).unwrap_or_default()
    }

    /// Decode and handle one inbound frame.
    pub fn handle_frame(&mut self, bytes: &[u8], now: Instant, now_ms: u64) -> Reaction {
        match SyncMessage::decode_limited(bytes, self.reassembler.max_message_size()) {
            Ok(msg) => self.handle(msg, now, now_ms),
            Err(e) => {
                log::warn!("Dropping malformed frame ({} bytes): {e}", bytes.len());
                Reaction::default()
            }
        }
    }

    pub fn handle(&mut self, msg: SyncMessage, now: Instant, now_ms: u64) -> Reaction {
        match msg {
            SyncMessage::Full { name, doc, little_endian, counter, fdata, .. } => {
                let mut decoder = FastPatchDecoder::new(little_endian);
                decoder.reset(counter, little_endian);
                if let Some(fdata) = fdata {
                    decoder.apply_snapshot(&fdata, fast_patch::document_origin(&doc), now_ms);
                }
                log::info!("Loaded {name} (fast counter {counter})");
                self.mirrors.insert(name.clone(), Mirror { doc: TrackedDocument::new(name.clone(), doc), decoder });
                Reaction::event(ClientEvent::DocumentLoaded(name))
            }
            SyncMessage::Patch { counter, name, ops, .. } => {
                let Some(mirror) = self.mirrors.get_mut(&name) else {
                    log::debug!("Patch for unknown document {name}");
                    return Reaction::default();
                };
                let (changes, undecodable) = patch::decode_batch(ops);
                let report = mirror.doc.apply_remote(&changes);
                mirror.decoder.retain_entities(mirror.doc.root());
                Reaction::event(ClientEvent::Patched {
                    name,
                    counter,
                    applied: report.applied,
                    failed: report.failed + undecodable,
                })
            }
            SyncMessage::FastPatch { counter, name, fdata, .. } => {
                let Some(mirror) = self.mirrors.get_mut(&name) else {
                    log::debug!("Fast patch for unknown document {name}");
                    return Reaction::default();
                };
                let origin = fast_patch::document_origin(mirror.doc.root());
                match mirror.decoder.apply(counter, &fdata, origin, now_ms) {
                    DecodeOutcome::Applied { lost, .. } => {
                        let decoder = &mirror.decoder;
                        mirror.doc.raw_mut(|root| decoder.materialize_into(root));
                        Reaction::event(ClientEvent::FastPatched { name, counter, lost })
                    }
                    DecodeOutcome::Stale => Reaction::default(),
                }
            }
            SyncMessage::Pong { client_time, server_time } => {
                let sample = self.clock.on_pong(client_time, server_time, now_ms);
                Reaction {
                    events: vec![ClientEvent::ClockSynced { rtt_ms: sample.rtt_ms, offset_ms: self.clock.offset_ms() }],
                    replies: vec![SyncMessage::Peng { rtt_ms: sample.rtt_ms }],
                }
            }
            SyncMessage::Signal { kind, payload } => {
                let Some(negotiator) = self.negotiator.as_mut() else {
                    log::debug!("Signal {kind:?} without a peer transport");
                    return Reaction::default();
                };
                match negotiator.handle_signal(kind, &payload) {
                    Ok(replies) => Reaction { events: Vec::new(), replies },
                    Err(e) => {
                        log::warn!("Signal {kind:?} rejected: {e}");
                        Reaction::default()
                    }
                }
            }
            SyncMessage::Chunk(chunk) => match self.reassembler.accept(chunk, now) {
                Ok(Some(frame)) => self.handle_frame(&frame, now, now_ms),
                Ok(None) => Reaction::default(),
                Err(e) => {
                    log::warn!("Dropping chunk: {e}");
                    Reaction::default()
                }
            },
            SyncMessage::Error { name, reason } => {
                log::warn!("Server error for {name}: {reason}");
                self.subscriptions.remove(&name);
                self.mirrors.remove(&name);
                Reaction::event(ClientEvent::Error { name, reason })
            }
            SyncMessage::Shutdown { reason } => {
                log::info!("Server shutting down: {reason}");
                Reaction::event(ClientEvent::ServerShutdown(reason))
            }
            other => {
                log::warn!("Unexpected {} message from server", other.kind());
                Reaction::default()
            }
        }
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

/// Resolves once the current generation differs from `generation`.
async fn superseded(current: &mut watch::Receiver<u64>, generation: u64) {
    let _ = current.wait_for(|g| *g != generation).await;
}

struct Inner {
    config: ClientConfig,
    core: Mutex<ClientCore>,
    machine: std::sync::Mutex<ConnectionStateMachine>,
    /// Writer queue of the live socket, tagged with its generation.
    outgoing: Mutex<Option<(u64, mpsc::Sender<Vec<u8>>)>>,
    chunker: Mutex<Chunker>,
    event_tx: mpsc::Sender<ClientEvent>,
    /// Mirrors the state machine's generation to wake stale tasks.
    generation: watch::Sender<u64>,
}

impl Inner {
    fn machine<R>(&self, f: impl FnOnce(&mut ConnectionStateMachine) -> R) -> R {
        match self.machine.lock() {
            Ok(mut m) => f(&mut *m),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }

    async fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event).await;
    }

    async fn send(&self, msg: &SyncMessage) -> Result<(), ClientError> {
        let frames = self.chunker.lock().await.encode(msg, &self.config.compression, 0, clock::now_ms())?;
        let tx = self.outgoing.lock().await.as_ref().map(|(_, tx)| tx.clone()).ok_or(ClientError::NotConnected)?;
        for frame in frames {
            tx.send(frame).await.map_err(|_| ClientError::NotConnected)?;
        }
        Ok(())
    }

    /// Open the socket, start the writer, announce clock sync and
    /// subscriptions. Fails with `NotConnected` if `generation` was
    /// superseded while the socket opened.
    async fn open(&self, generation: u64) -> Result<WsReader, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut ws_writer, ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.outbound_capacity);
        {
            let mut outgoing = self.outgoing.lock().await;
            let current = self.machine(|m| {
                let current = m.generation() == generation;
                if current {
                    m.on_connected();
                }
                current
            });
            if !current {
                log::debug!("Connection {generation} superseded while opening");
                return Err(ClientError::NotConnected);
            }
            *outgoing = Some((generation, out_tx));
        }

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        log::info!("Connected to {}", self.config.url);
        self.emit(ClientEvent::Connected).await;

        let hello = self.core.lock().await.on_connected(clock::now_ms());
        for msg in &hello {
            self.send(msg).await?;
        }
        Ok(ws_reader)
    }

    async fn read_until_closed(&self, mut reader: WsReader, generation: u64) {
        let mut current = self.generation.subscribe();
        loop {
            let frame = tokio::select! {
                frame = reader.next() => frame,
                _ = superseded(&mut current, generation) => break,
            };
            let data = match frame {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::warn!("Socket error: {e}");
                    break;
                }
                Some(Ok(_)) => continue,
            };
            let reaction = self.core.lock().await.handle_frame(&data, Instant::now(), clock::now_ms());
            for reply in &reaction.replies {
                if let Err(e) = self.send(reply).await {
                    log::debug!("Reply {} not sent: {e}", reply.kind());
                }
            }
            for event in reaction.events {
                self.emit(event).await;
            }
        }
        let mut outgoing = self.outgoing.lock().await;
        if outgoing.as_ref().is_some_and(|(g, _)| *g == generation) {
            *outgoing = None;
        }
    }

    /// Reads the connection of `generation`, then keeps reconnecting until
    /// superseded or reconnects are off.
    async fn supervise(self: Arc<Self>, generation: u64, first: Option<WsReader>) {
        let mut current = self.generation.subscribe();
        let mut reader = first;
        loop {
            if let Some(r) = reader.take() {
                self.read_until_closed(r, generation).await;
            }
            let closed = self.machine(|m| (m.generation() == generation).then(|| m.on_closed()));
            let Some((was_connected, retry)) = closed else {
                log::debug!("Connection {generation} superseded");
                break;
            };
            if was_connected {
                log::info!("Disconnected from {}", self.config.url);
                self.emit(ClientEvent::Disconnected).await;
            }
            let Some(delay) = retry else {
                break;
            };
            log::debug!("Reconnecting in {delay:?}");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = superseded(&mut current, generation) => break,
            }
            if !self.machine(|m| m.generation() == generation && m.begin_reconnect()) {
                break;
            }
            match self.open(generation).await {
                Ok(r) => reader = Some(r),
                Err(e) => log::warn!("Reconnect failed: {e}"),
            }
        }
    }
}

/// The sync client.
pub struct SyncClient {
    inner: Arc<Inner>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let (generation, _) = watch::channel(0);
        let machine = ConnectionStateMachine::new(config.auto_reconnect, config.reconnect_base, config.reconnect_jitter);
        let inner = Inner {
            core: Mutex::new(ClientCore::new(config.reassembly.clone())),
            machine: std::sync::Mutex::new(machine),
            outgoing: Mutex::new(None),
            chunker: Mutex::new(Chunker::new(config.limits.clone())),
            event_tx,
            generation,
            config,
        };
        Self { inner: Arc::new(inner), event_rx: Some(event_rx) }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.machine(|m| m.state())
    }

    /// Connect to the server. A call while connecting or connected is a
    /// no-op.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let Some(generation) = self.inner.machine(|m| m.begin_connect().then(|| m.generation())) else {
            return Ok(());
        };
        self.inner.generation.send_replace(generation);
        match self.inner.open(generation).await {
            Ok(reader) => {
                tokio::spawn(self.inner.clone().supervise(generation, Some(reader)));
                Ok(())
            }
            Err(e) => {
                tokio::spawn(self.inner.clone().supervise(generation, None));
                Err(e)
            }
        }
    }

    /// Close the connection and cancel reconnects. Safe to repeat.
    pub async fn disconnect(&self) {
        let (changed, generation) = self.inner.machine(|m| (m.disconnect(), m.generation()));
        self.inner.generation.send_replace(generation);
        let mut outgoing = self.inner.outgoing.lock().await;
        if outgoing.as_ref().is_some_and(|(g, _)| *g < generation) {
            *outgoing = None;
        }
        drop(outgoing);
        if changed {
            log::info!("Disconnect requested");
        }
    }

    pub async fn subscribe(&self, name: &str) -> Result<(), ClientError> {
        let msg = self.inner.core.lock().await.subscribe(name);
        match self.inner.send(&msg).await {
            // sent on the next connect
            Err(ClientError::NotConnected) => Ok(()),
            other => other,
        }
    }

    pub async fn unsubscribe(&self, name: &str) -> Result<(), ClientError> {
        let msg = self.inner.core.lock().await.unsubscribe(name);
        match self.inner.send(&msg).await {
            Err(ClientError::NotConnected) => Ok(()),
            other => other,
        }
    }

    /// Mutate a mirror locally and send the resulting ops.
    pub async fn update<R>(&self, name: &str, f: impl FnOnce(&mut TrackedDocument) -> R) -> Result<R, ClientError> {
        let (out, msg) = self.inner.core.lock().await.update(name, clock::now_ms(), f)?;
        if let Some(msg) = msg {
            self.inner.send(&msg).await?;
        }
        Ok(out)
    }

    /// Copy of a mirror's current tree.
    pub async fn document(&self, name: &str) -> Option<Value> {
        self.inner.core.lock().await.document(name).map(|d| d.root().clone())
    }

    pub async fn fast_sample(&self, name: &str, entity: u32, field: FastField) -> Option<FieldSample> {
        self.inner.core.lock().await.fast_sample(name, entity, field).cloned()
    }

    pub async fn clock(&self) -> ClockSync {
        self.inner.core.lock().await.clock().clone()
    }

    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.inner.send(&SyncMessage::Ping { client_time: clock::now_ms() }).await
    }

    /// Start secondary-channel negotiation as the offering side.
    pub async fn start_peer(&self, transport: Box<dyn PeerTransport>) -> Result<(), ClientError> {
        let offer = self.inner.core.lock().await.start_peer(transport)?;
        self.inner.send(&offer).await?;
        let queued = self.inner.core.lock().await.offer_sent();
        for msg in &queued {
            self.inner.send(msg).await?;
        }
        Ok(())
    }

    pub async fn on_local_candidate(&self, candidate: String) -> Result<(), ClientError> {
        let ready = self.inner.core.lock().await.on_local_candidate(candidate);
        for msg in &ready {
            self.inner.send(msg).await?;
        }
        Ok(())
    }

    pub async fn on_gathering_complete(&self) -> Result<(), ClientError> {
        let ready = self.inner.core.lock().await.on_gathering_complete();
        for msg in &ready {
            self.inner.send(msg).await?;
        }
        Ok(())
    }

    /// Feed a frame received on the data channel.
    pub async fn deliver_data_frame(&self, bytes: &[u8]) {
        let reaction = self.inner.core.lock().await.handle_frame(bytes, Instant::now(), clock::now_ms());
        for event in reaction.events {
            self.inner.emit(event).await;
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        let generation = self.inner.machine(|m| {
            m.disconnect();
            m.generation()
        });
        self.inner.generation.send_replace(generation);
    }
}
