//! # Store Module
//!
//! The public face of the crate. A [`Store`] is a handle onto a mapped
//! region; any number of handles in any number of processes may be open on
//! the same backing file at once, coordinating purely through the segment
//! locks inside the region.
//!
//! ## API Layers
//!
//! Two levels of access share one implementation:
//!
//! - **Map-style convenience**: [`Store::get`], [`Store::put`],
//!   [`Store::remove`], [`Store::contains_key`] — each acquires the right
//!   segment lock, does its work, and releases before returning.
//! - **Query contexts**: [`Store::query`], [`Store::query_update`],
//!   [`Store::query_write`] hand back a [`QueryContext`](query::QueryContext)
//!   that *holds* the segment lock until dropped, supports upgrades, and
//!   exposes present/absent entry views for multi-step operations.
//!
//! ## Module Organization
//!
//! - [`builder`]: configuration and the create/open/recover entry points
//! - [`query`]: the lock-holding query context
//! - [`iter`]: visitor-driven iteration
//! - [`recovery`]: the exclusive rescan that repairs a crashed region

pub mod builder;
pub mod iter;
pub mod query;
pub mod recovery;

use std::path::Path;
use std::sync::atomic::Ordering;

use eyre::{ensure, Result, WrapErr};

use crate::error::StoreError;
use crate::hash;
use crate::region::{Region, RegionHeader, RegionLayout, StoreConfig, REGION_HEADER_SIZE};
use crate::segment::lock::LockLevel;
use crate::segment::SegmentRef;
use builder::StoreBuilder;
use query::QueryContext;

/// Per-segment usage numbers, as reported by [`Store::segment_stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    pub used_bytes: u64,
    pub size_in_bytes: u64,
    pub tiers: u32,
}

/// A handle onto a persistent, concurrent, inter-process key-value store.
pub struct Store {
    region: Region,
    layout: RegionLayout,
    cfg: StoreConfig,
}

impl Store {
    /// Starts configuring a store.
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    pub(crate) fn create_file_backed(cfg: StoreConfig, path: &Path) -> Result<Self> {
        let layout = RegionLayout::from_config(&cfg)?;
        let region = Region::create_file(path, layout.total_len())
            .wrap_err_with(|| format!("failed to create store at '{}'", path.display()))?;
        Self::initialize(region, layout, cfg)
    }

    pub(crate) fn create_in_memory(cfg: StoreConfig) -> Result<Self> {
        let layout = RegionLayout::from_config(&cfg)?;
        let region = Region::create_anonymous(layout.total_len())?;
        Self::initialize(region, layout, cfg)
    }

    fn initialize(region: Region, layout: RegionLayout, cfg: StoreConfig) -> Result<Self> {
        let header = RegionHeader::new(&cfg);
        region.write_bytes(0, zerocopy::IntoBytes::as_bytes(&header));

        let store = Self {
            region,
            layout,
            cfg,
        };
        for seg in 0..store.layout.seg_count {
            store.segment(seg).init();
        }
        store.region.flush_async()?;

        tracing::debug!(
            segments = store.layout.seg_count,
            entries_per_segment = store.cfg.entries_per_segment,
            total_bytes = store.layout.total_len(),
            "initialized store region"
        );
        Ok(store)
    }

    pub(crate) fn open_path(path: &Path) -> Result<Self> {
        let region = Region::open_file(path)
            .wrap_err_with(|| format!("failed to open store at '{}'", path.display()))?;

        let header_len = REGION_HEADER_SIZE.min(region.len());
        let header = RegionHeader::from_bytes(region.bytes(0, header_len))?;
        let cfg = header.config();
        cfg.validate()
            .map_err(|e| StoreError::CorruptFormat(format!("header configuration: {e}")))?;

        let layout = RegionLayout::from_config(&cfg)?;
        ensure!(
            region.len() == layout.total_len(),
            StoreError::CorruptFormat(format!(
                "region is {} bytes but the header describes {}",
                region.len(),
                layout.total_len()
            ))
        );

        tracing::debug!(
            path = %path.display(),
            segments = layout.seg_count,
            "opened store region"
        );
        Ok(Self {
            region,
            layout,
            cfg,
        })
    }

    /// The configuration the store was created with.
    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    /// Opens a query context for `key` holding the segment's **read** lock.
    pub fn query<'s>(&'s self, key: &[u8]) -> Result<QueryContext<'s>> {
        QueryContext::acquire(self, key, LockLevel::Read)
    }

    /// Opens a query context for `key` holding the segment's **update**
    /// lock: readers may still enter, other updaters and writers may not.
    pub fn query_update<'s>(&'s self, key: &[u8]) -> Result<QueryContext<'s>> {
        QueryContext::acquire(self, key, LockLevel::Update)
    }

    /// Opens a query context for `key` holding the segment's **write** lock.
    pub fn query_write<'s>(&'s self, key: &[u8]) -> Result<QueryContext<'s>> {
        QueryContext::acquire(self, key, LockLevel::Write)
    }

    /// Non-blocking [`Store::query`]: `Ok(None)` when the segment's lock
    /// could not be taken immediately. Lock acquisitions cannot be
    /// cancelled once parked, so bounded-wait retry loops are built from
    /// these try variants.
    pub fn try_query<'s>(&'s self, key: &[u8]) -> Result<Option<QueryContext<'s>>> {
        QueryContext::try_acquire(self, key, LockLevel::Read)
    }

    /// Non-blocking [`Store::query_update`].
    pub fn try_query_update<'s>(&'s self, key: &[u8]) -> Result<Option<QueryContext<'s>>> {
        QueryContext::try_acquire(self, key, LockLevel::Update)
    }

    /// Non-blocking [`Store::query_write`].
    pub fn try_query_write<'s>(&'s self, key: &[u8]) -> Result<Option<QueryContext<'s>>> {
        QueryContext::try_acquire(self, key, LockLevel::Write)
    }

    /// Returns the value mapped to `key`, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let ctx = self.query(key)?;
        Ok(ctx.entry()?.map(|e| e.value().to_vec()))
    }

    /// Reads the value for `key` into `buf`, returning whether it was
    /// present. `buf` is cleared either way; a hit avoids allocating when
    /// its capacity suffices.
    pub fn get_using(&self, key: &[u8], buf: &mut Vec<u8>) -> Result<bool> {
        buf.clear();
        let ctx = self.query(key)?;
        match ctx.entry()? {
            Some(e) => {
                buf.extend_from_slice(e.value());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Maps `key` to `value`, returning the previous value if any.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut ctx = self.query_update(key)?;
        let previous = ctx.entry()?.map(|e| e.value().to_vec());
        if previous.is_some() {
            ctx.replace_value(value)?;
        } else {
            ctx.insert(value)?;
        }
        Ok(previous)
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let mut ctx = self.query_update(key)?;
        if ctx.entry()?.is_none() {
            return Ok(false);
        }
        ctx.remove()?;
        Ok(true)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        let ctx = self.query(key)?;
        Ok(ctx.entry()?.is_some())
    }

    /// Number of entries across all segments.
    ///
    /// Sums per-segment counters without taking locks; exact when quiescent,
    /// approximate under concurrent mutation.
    pub fn len(&self) -> u64 {
        (0..self.layout.seg_count)
            .map(|seg| self.segment(seg).entry_count().load(Ordering::Acquire) as u64)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort synchronous flush of the mapped region.
    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    /// Recomputes every entry's checksum under per-segment read locks,
    /// failing with `ChecksumMismatch` at the first bad entry.
    ///
    /// This is the explicit verification path; normal reads never check.
    /// Stores without checksums verify trivially.
    pub fn verify_checksums(&self) -> Result<()> {
        for seg_ix in 0..self.layout.seg_count {
            let seg = self.segment(seg_ix);
            let lock = seg.lock();
            lock.lock_read()?;

            let scan = seg.slots().for_each_occupied(|_, slot| {
                if !seg.decode(slot)?.checksum_ok() {
                    return Err(StoreError::ChecksumMismatch { segment: seg_ix }.into());
                }
                Ok(true)
            });

            lock.unlock_read();
            scan?;
        }
        Ok(())
    }

    /// Schedules a flush without waiting for it.
    pub fn flush_async(&self) -> Result<()> {
        self.region.flush_async()
    }

    /// Free space across all tiers as a percentage, 0–100.
    ///
    /// A full scan of tier headers; cheap, but takes no locks, so treat the
    /// number as advisory under concurrent writes.
    pub fn percentage_free_space(&self) -> u8 {
        let mut used = 0u64;
        let mut total = 0u64;
        for seg in 0..self.layout.seg_count {
            let segment = self.segment(seg);
            used += segment.used_bytes();
            total += segment.tier_count().load(Ordering::Acquire) as u64
                * self.layout.tier_payload_bytes as u64;
        }
        if total == 0 {
            return 100;
        }
        (100u64.saturating_sub(used * 100 / total)) as u8
    }

    /// Per-segment usage: bytes used, bytes available, tiers attached.
    pub fn segment_stats(&self) -> Vec<SegmentStats> {
        (0..self.layout.seg_count)
            .map(|seg| {
                let segment = self.segment(seg);
                let tiers = segment.tier_count().load(Ordering::Acquire);
                SegmentStats {
                    used_bytes: segment.used_bytes(),
                    size_in_bytes: tiers as u64 * self.layout.tier_payload_bytes as u64,
                    tiers,
                }
            })
            .collect()
    }

    /// How many overflow tiers are still drawable from the shared pool.
    pub fn remaining_auto_resizes(&self) -> u32 {
        let allocated = self
            .region
            .atomic_u32(self.layout.tier_alloc_offset())
            .load(Ordering::Acquire);
        self.layout.extra_tiers.saturating_sub(allocated)
    }

    /// The configured bloat bound.
    pub fn max_bloat_factor(&self) -> f64 {
        self.cfg.max_bloat_factor
    }

    pub(crate) fn segment(&self, segment: u32) -> SegmentRef<'_> {
        SegmentRef::new(&self.region, &self.layout, segment)
    }

    pub(crate) fn segment_for_hash(&self, hashed: u64) -> u32 {
        hash::segment_of(hashed, self.layout.segment_shift)
    }

    pub(crate) fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub(crate) fn region(&self) -> &Region {
        &self.region
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Best-effort: persistence does not depend on this flush.
        let _ = self.region.flush_async();
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("segments", &self.layout.seg_count)
            .field("entries_per_segment", &self.cfg.entries_per_segment)
            .field("len", &self.len())
            .finish()
    }
}
