//! # replica-core — document model and codecs for replica
//!
//! Tracks mutations of JSON-like documents and encodes them for the wire.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────┐
//!   set/insert ──►│ TrackedDocument  │──► ChangeRecord stream ──► patch (a/r/d/t codes)
//!   remove/...    │ (value tree)     │
//!                 └────────┬─────────┘
//!                          │ fast fields
//!                          ▼
//!                 ┌──────────────────┐       ┌──────────────────┐
//!                 │ FastPatchEncoder │──────►│ FastPatchDecoder │──► FieldSample
//!                 │ (dirty flags)    │ fdata │ (counter, lost)  │
//!                 └──────────────────┘       └──────────────────┘
//!                          │
//!                          ▼
//!                 fp168 / fp412 / fp1616 + dictionary ids
//! ```
//!
//! ## Modules
//!
//! - [`value`] — Tagged-value document tree
//! - [`pointer`] — Slash-delimited paths
//! - [`patch`] — Change records, wire codes, batch apply
//! - [`tracker`] — Mutation entry point and change sinks
//! - [`fixed_point`] — Fixed-point and dictionary encodings
//! - [`fast_patch`] — Dirty-flag batches for high-frequency fields

pub mod error;
pub mod fast_patch;
pub mod fixed_point;
pub mod patch;
pub mod pointer;
pub mod tracker;
pub mod value;

pub use error::{CodecError, PatchError, PointerError, TrackError};
pub use fast_patch::{
    DecodeOutcome, FastField, FastPatchData, FastPatchDecoder, FastPatchEncoder, FastPatchStats,
    FastValue, FieldBlock, FieldSample,
};
pub use fixed_point::FixedFormat;
pub use patch::{apply_batch, apply_op, ApplyReport, ChangeRecord, OpKind, WireOp};
pub use tracker::{ChangeLog, ChangeSink, FieldPolicy, TrackMode, TrackedDocument};
pub use value::Value;
