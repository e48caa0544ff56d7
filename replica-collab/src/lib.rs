//! # replica-collab — Networked document replication
//!
//! Server-authoritative replication of `replica-core` documents over
//! WebSocket, with an optional best-effort data channel for fast patches.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer  │
//! │ (mirrors)   │  bincode + LZ4     │ (authority) │
//! └──────┬──────┘                    └──────┬──────┘
//!        │  data channel (fpatch)           │
//!        │◄─────────────────────────────────┤
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌──────────────┐    ┌────────────────┐
//! │ ClientCore  │                    │ DocumentStore│───►│ StorageBackend │
//! │ ClockSync   │                    │ SyncLoop     │    │ memory / rocks │
//! └─────────────┘                    │ Sessions     │    └────────────────┘
//!                                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — `SyncMessage` envelope, framing, compression filter
//! - [`chunk`] — Splitting and reassembly of oversized frames
//! - [`transport`] — Reliable queue plus negotiated data channel
//! - [`clock`] — Ping/pong clock offset estimation
//! - [`client`] — Sync client and its connection state machine
//! - [`broadcast`] — Session registry and subscription fan-out
//! - [`store`] — Race-safe document loading, hooks, persistence
//! - [`storage`] — Pluggable backends (memory, RocksDB)
//! - [`sync_loop`] — Replication tick and shutdown drain
//! - [`server`] — WebSocket sync server

pub mod broadcast;
pub mod chunk;
pub mod client;
pub mod clock;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod store;
pub mod sync_loop;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, SessionId, SessionInfo, SessionRegistry};
pub use chunk::{ChunkError, Chunker, ReassemblyConfig, Reassembler, TransportLimits};
pub use client::{ClientConfig, ClientError, ClientEvent, ConnectionState, SyncClient};
pub use clock::{ClockSample, ClockSync};
pub use protocol::{ChunkFrame, CompressionConfig, ProtocolError, SignalKind, SyncMessage};
pub use server::{ServerConfig, ServerStats, ShutdownHandle, SyncServer};
pub use storage::{MemoryStorage, StorageBackend, StorageError};
pub use store::{DefaultHooks, DocumentHooks, DocumentStore, StoreConfig, StoreError};
pub use sync_loop::{SyncLoop, SyncLoopConfig};
pub use transport::{
    DataChannel, PeerNegotiator, PeerTransport, PeerTransportFactory, TransportError, TransportManager,
};
