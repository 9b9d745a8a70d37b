//! # coremap - Shared-Memory Key-Value Store
//!
//! coremap is a persistent, concurrent key-value store whose entire data
//! structure lives in a single memory-mapped region. Multiple threads *and
//! multiple processes* on one host may open the same backing file and
//! operate on it simultaneously; all coordination happens through atomics
//! inside the region itself. This Rust implementation prioritizes:
//!
//! - **Zero-copy data access**: entry bytes are read in place from the mapping
//! - **Per-segment concurrency**: N segments ⇒ up to N disjoint writers
//! - **Crash robustness**: checksummed entries plus an exclusive recovery
//!   scan that rebuilds the index and discards torn writes
//!
//! ## Quick Start
//!
//! ```ignore
//! use coremap::Store;
//!
//! let store = Store::builder()
//!     .segments(16)
//!     .entries_per_segment(100_000)
//!     .create("/data/users.cmap")?;
//!
//! store.put(b"user:42", b"{\"name\":\"alice\"}")?;
//! assert_eq!(store.get(b"user:42")?.as_deref(), Some(&b"{\"name\":\"alice\"}"[..]));
//!
//! // Multi-step operations hold the segment lock across calls.
//! let mut ctx = store.query_update(b"user:42")?;
//! if ctx.entry()?.is_some() {
//!     ctx.replace_value(b"{\"name\":\"bob\"}")?;
//! }
//! drop(ctx);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │    Public API (Store / QueryContext)      │
//! ├──────────────────────────────────────────┤
//! │  Marshalling │ Iteration │ Recovery       │
//! ├──────────────────────────────────────────┤
//! │  Segments: lock, slot array, tier chain   │
//! ├──────────────────────────────────────────┤
//! │  Entry framing, varints, checksums        │
//! ├──────────────────────────────────────────┤
//! │  Region: header, layout, mmap             │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Region Layout
//!
//! ```text
//! offset 0       header: magic "CMAP", version, configuration record
//! 4096           segment headers (lock word, counters, chain head)
//! …              slot arrays (one power-of-two array per segment)
//! …              primary tiers (one per segment)
//! …              extra tier pool (drawn on overflow, up to the bloat bound)
//! ```
//!
//! Keys hash with xxh3; the high bits select a segment, a 16-bit
//! fingerprint screens slot probes, and the low bits seed the linear probe.
//! Each segment is protected by an inter-process read/update/write lock
//! packed into one atomic word colocated with its header.
//!
//! ## Durability Model
//!
//! Mutations go straight into the shared mapping and become visible to
//! other processes as soon as the mutating lock is released; `flush` is a
//! best-effort `msync`. After a crash, reopening in recovery mode rebuilds
//! every slot array from the tier payloads, dropping entries whose
//! checksum fails. A store without checksums (the in-memory default)
//! trades that repair precision for write throughput.
//!
//! ## Module Overview
//!
//! - [`store`]: public API — builder, map operations, query contexts,
//!   iteration, recovery
//! - [`segment`]: segment lock, slot arrays, tier chains, entry codec
//! - [`region`]: mapped region, self-describing header, layout arithmetic
//! - [`marshal`]: writer/reader capabilities for typed keys and values
//! - [`set`]: set facade over a store with empty values
//! - [`encoding`]: varint length encoding
//! - [`hash`]: key hashing, segment selection, entry checksums

pub mod config;
pub mod encoding;
pub mod error;
pub mod hash;
pub mod marshal;
pub mod region;
pub mod segment;
pub mod set;
pub mod store;

pub use error::StoreError;
pub use marshal::{BytesReader, BytesWriter, RawBytes, Utf8};
pub use region::StoreConfig;
pub use segment::lock::LockLevel;
pub use set::StoreSet;
pub use store::builder::StoreBuilder;
pub use store::iter::EntryView;
pub use store::query::{AbsentEntry, EntryRef, QueryContext};
pub use store::{SegmentStats, Store};
