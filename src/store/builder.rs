//! # Store Builder
//!
//! Fluent configuration for creating, opening, and recovering stores.
//!
//! ```ignore
//! use coremap::Store;
//!
//! let store = Store::builder()
//!     .segments(32)
//!     .entries_per_segment(10_000)
//!     .average_key_size(24)
//!     .average_value_size(128)
//!     .create("/dev/shm/sessions.cmap")?;
//!
//! store.put(b"session:1", b"payload")?;
//! ```
//!
//! ## Geometry Is Creation-Time Only
//!
//! `open` reads the authoritative configuration from the region header;
//! geometry options set on the builder apply to `create` and to
//! `recover(..., same_config = true)`, which asserts the builder's
//! configuration matches the one the region was created with.
//!
//! ## Checksums
//!
//! `checksum_entries` defaults by backing: on for files (which survive
//! crashes and need recovery to tell good entries from torn ones), off for
//! purely in-memory stores.

use std::path::Path;

use eyre::Result;

use crate::region::StoreConfig;
use crate::store::Store;

/// Builder for [`Store`] handles.
#[derive(Debug, Clone)]
pub struct StoreBuilder {
    segments: u32,
    entries_per_segment: u32,
    average_key_size: u32,
    average_value_size: u32,
    constant_key_size: Option<u32>,
    constant_value_size: Option<u32>,
    checksum_entries: Option<bool>,
    max_bloat_factor: f64,
    pre_touch: bool,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self {
            segments: 16,
            entries_per_segment: 1024,
            average_key_size: 16,
            average_value_size: 32,
            constant_key_size: None,
            constant_value_size: None,
            checksum_entries: None,
            max_bloat_factor: 1.0,
            pre_touch: false,
        }
    }

    /// Number of segments — the concurrency ceiling. Rounded up to the
    /// next power of two.
    pub fn segments(mut self, segments: u32) -> Self {
        self.segments = segments.max(1).next_power_of_two();
        self
    }

    /// Primary tier capacity per segment, in entries. Size the store as
    /// `segments * entries_per_segment` expected entries.
    pub fn entries_per_segment(mut self, entries: u32) -> Self {
        self.entries_per_segment = entries;
        self
    }

    /// Byte hint for tier sizing under variable-size keys.
    pub fn average_key_size(mut self, bytes: u32) -> Self {
        self.average_key_size = bytes;
        self
    }

    /// Byte hint for tier sizing under variable-size values.
    pub fn average_value_size(mut self, bytes: u32) -> Self {
        self.average_value_size = bytes;
        self
    }

    /// Fixes both key and value sizes, enabling the fixed-stride entry
    /// layout with in-place space reuse.
    pub fn constant_sizes(mut self, key_bytes: u32, value_bytes: u32) -> Self {
        self.constant_key_size = Some(key_bytes);
        self.constant_value_size = Some(value_bytes);
        self
    }

    /// Overrides the per-backing checksum default.
    pub fn checksum_entries(mut self, enabled: bool) -> Self {
        self.checksum_entries = Some(enabled);
        self
    }

    /// Maximum multiple of primary capacity a segment may grow to by
    /// chaining overflow tiers. Must be in `1.0..=10.0`.
    pub fn max_bloat_factor(mut self, factor: f64) -> Self {
        self.max_bloat_factor = factor;
        self
    }

    /// Faults the whole region in right after mapping, trading open latency
    /// for predictable access latency.
    pub fn pre_touch(mut self, enabled: bool) -> Self {
        self.pre_touch = enabled;
        self
    }

    /// Creates a new file-backed store. The file must not exist or must be
    /// empty.
    pub fn create<P: AsRef<Path>>(self, path: P) -> Result<Store> {
        let store = Store::create_file_backed(self.config(true), path.as_ref())?;
        self.finish(store)
    }

    /// Creates an in-memory store (anonymous mapping, single process).
    pub fn create_in_memory(self) -> Result<Store> {
        let store = Store::create_in_memory(self.config(false))?;
        self.finish(store)
    }

    /// Opens an existing store, taking all geometry from the region header.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Store> {
        let store = Store::open_path(path.as_ref())?;
        self.finish(store)
    }

    /// Opens a store in recovery mode, rescanning and repairing it.
    ///
    /// Requires exclusive access to the region. With `same_config = true`
    /// the builder's configuration is asserted to match creation time and
    /// can replace a corrupted header; with `false` the header must pass
    /// its own sanity checks or recovery fails.
    pub fn recover<P: AsRef<Path>>(self, path: P, same_config: bool) -> Result<Store> {
        let asserted = same_config.then(|| self.config(true));
        let store = Store::recover_path(path.as_ref(), asserted)?;
        self.finish(store)
    }

    fn finish(self, store: Store) -> Result<Store> {
        if self.pre_touch {
            store.region().pre_touch();
        }
        Ok(store)
    }

    fn config(&self, file_backed: bool) -> StoreConfig {
        StoreConfig {
            segments: self.segments,
            entries_per_segment: self.entries_per_segment,
            average_key_size: self.average_key_size,
            average_value_size: self.average_value_size,
            constant_key_size: self.constant_key_size,
            constant_value_size: self.constant_value_size,
            checksum_entries: self.checksum_entries.unwrap_or(file_backed),
            max_bloat_factor: self.max_bloat_factor,
        }
    }
}
