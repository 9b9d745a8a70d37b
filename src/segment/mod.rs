//! # Segment Module
//!
//! A segment is the unit of concurrency and hashing: one lock, one slot
//! array, one tier chain. This module owns everything below the store API:
//!
//! - [`lock`]: the inter-process read/update/write lock
//! - [`slots`]: the open-addressed slot array with atomic publication
//! - [`tier`]: tier blocks, bump allocation, free lists, chain links
//! - [`entry`]: entry payload encoding and checksums
//!
//! [`SegmentRef`] glues these together into the operations the query
//! context and iteration layers call: probe, insert, replace, remove. Every
//! mutating method documents the lock level it requires; none of them
//! acquire locks themselves except the brief internal update→write upgrade
//! that guards free-cell reuse.

pub mod entry;
pub mod lock;
pub mod slots;
pub mod tier;

use std::sync::atomic::{AtomicU32, Ordering};

use eyre::{Result, WrapErr};

use crate::config::{
    SEG_ENTRY_COUNT, SEG_FLAGS, SEG_HEAD_TIER, SEG_LAST_HOLDER_PID, SEG_LOCK_WORD, SEG_TIER_COUNT,
};
use crate::error::StoreError;
use crate::hash;
use crate::region::{Region, RegionLayout};
use entry::Decoded;
use lock::{LockLevel, SegmentLock};
use slots::{Probe, SlotArray, SlotEntry};
use tier::TierRef;

/// One segment, viewed in place.
#[derive(Clone, Copy)]
pub struct SegmentRef<'a> {
    region: &'a Region,
    layout: &'a RegionLayout,
    segment: u32,
    hdr_base: usize,
}

impl<'a> SegmentRef<'a> {
    pub fn new(region: &'a Region, layout: &'a RegionLayout, segment: u32) -> Self {
        Self {
            region,
            layout,
            segment,
            hdr_base: layout.seg_hdr_offset(segment),
        }
    }

    pub fn segment(&self) -> u32 {
        self.segment
    }

    pub fn layout(&self) -> &'a RegionLayout {
        self.layout
    }

    pub fn lock(&self) -> SegmentLock<'a> {
        SegmentLock::new(
            self.region.atomic_u64(self.hdr_base + SEG_LOCK_WORD),
            self.region.atomic_u32(self.hdr_base + SEG_FLAGS),
            self.region.atomic_u32(self.hdr_base + SEG_LAST_HOLDER_PID),
            self.segment,
        )
    }

    pub fn entry_count(&self) -> &'a AtomicU32 {
        self.region.atomic_u32(self.hdr_base + SEG_ENTRY_COUNT)
    }

    pub fn tier_count(&self) -> &'a AtomicU32 {
        self.region.atomic_u32(self.hdr_base + SEG_TIER_COUNT)
    }

    pub fn head_tier(&self) -> u32 {
        self.region
            .atomic_u32(self.hdr_base + SEG_HEAD_TIER)
            .load(Ordering::Acquire)
    }

    pub fn set_head_tier(&self, tier_ix: u32) {
        self.region
            .atomic_u32(self.hdr_base + SEG_HEAD_TIER)
            .store(tier_ix, Ordering::Release);
    }

    pub fn slots(&self) -> SlotArray<'a> {
        SlotArray::new(self.region.atomic_u64_slice(
            self.layout.slots_offset(self.segment),
            self.layout.slot_capacity as usize,
        ))
    }

    pub fn tier(&self, tier_ix: u32) -> TierRef<'a> {
        TierRef::new(self.region, self.layout, tier_ix)
    }

    /// Called once at region creation, with exclusive access: wires the
    /// primary tier to the segment.
    pub(crate) fn init(&self) {
        self.tier(self.segment).set_owner(self.segment);
        self.set_head_tier(self.segment);
        self.tier_count().store(1, Ordering::Release);
    }

    /// Probes for `key`. Requires any lock level.
    pub fn find(&self, hashed: u64, key: &[u8]) -> Result<Probe> {
        self.slots().probe(hashed, |slot| {
            let decoded = self.decode(slot)?;
            Ok(decoded.key == key)
        })
    }

    /// Decodes the entry a slot points at.
    ///
    /// Variable-layout entries take their length from the frame word, which
    /// survives the entry's death; fixed-layout entries take their sizes
    /// from the layout, so a dead frame (whose length bits hold a free-list
    /// link) can never mislead the decoder.
    pub fn decode(&self, slot: SlotEntry) -> Result<Decoded<'a>> {
        let tier = self.tier(slot.tier_ix);
        let payload_len = match self.layout.fixed_stride {
            Some(_) => self.layout.entry_payload_len(
                self.layout.const_key.unwrap_or(0) as usize,
                self.layout.const_value.unwrap_or(0) as usize,
            ),
            None => {
                let frame = tier.frame_word(slot.entry_offset).load(Ordering::Acquire);
                (frame & crate::config::FRAME_LEN_MASK) as usize
            }
        };
        entry::decode_payload(self.layout, tier.entry_payload(slot.entry_offset, payload_len))
            .wrap_err_with(|| {
                format!(
                    "undecodable entry at segment {} tier {} offset {}",
                    self.segment, slot.tier_ix, slot.entry_offset
                )
            })
    }

    /// Inserts a new entry and publishes its slot.
    ///
    /// Requires update or write lock; `level` is the level actually held,
    /// which gates free-cell reuse (see [`Self::allocate_entry`]).
    pub fn insert(
        &self,
        insert_ix: u32,
        hashed: u64,
        key: &[u8],
        value: &[u8],
        level: LockLevel,
        payload_buf: &mut Vec<u8>,
    ) -> Result<()> {
        debug_assert!(level >= LockLevel::Update);
        entry::check_sizes(self.layout, key, value)?;
        entry::encode_payload(self.layout, key, value, payload_buf);
        self.layout.check_entry_size(payload_buf.len())?;

        let (tier_ix, entry_off) = self.allocate_entry(payload_buf.len(), level)?;
        self.tier(tier_ix).write_entry(entry_off, payload_buf);
        self.slots()
            .publish(insert_ix, tier_ix, entry_off, hash::fingerprint(hashed));
        self.entry_count().fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Replaces the value of an existing entry.
    ///
    /// Same-size values are overwritten in place and the checksum is
    /// recomputed before returning (the lock is still held). Different
    /// sizes allocate a new entry, republish the slot, then retire the old
    /// entry. Requires update or write lock.
    pub fn replace(
        &self,
        slot_ix: u32,
        old: SlotEntry,
        hashed: u64,
        key: &[u8],
        value: &[u8],
        level: LockLevel,
        payload_buf: &mut Vec<u8>,
    ) -> Result<()> {
        debug_assert!(level >= LockLevel::Update);
        entry::check_sizes(self.layout, key, value)?;
        let decoded = self.decode(old)?;

        if decoded.value.len() == value.len() {
            let value_offset = decoded.value_offset;
            let tier = self.tier(old.tier_ix);
            let payload_off = tier.entry_payload_offset(old.entry_offset);

            // Readers holding only a read lock must see the pre- or
            // post-state, never a torn mixture, so the overwrite drains
            // them: an update holder briefly takes the write seat.
            let lock = self.lock();
            let upgraded = level == LockLevel::Update;
            if upgraded {
                lock.upgrade_update_to_write()?;
            }
            self.region.write_bytes(payload_off + value_offset, value);
            if self.layout.checksum {
                let checksum_off = payload_off + value_offset + value.len();
                self.region
                    .write_bytes(checksum_off, &hash::entry_checksum(key, value).to_le_bytes());
            }
            if upgraded {
                lock.downgrade_write_to_update();
            }
            return Ok(());
        }

        entry::encode_payload(self.layout, key, value, payload_buf);
        self.layout.check_entry_size(payload_buf.len())?;
        let (tier_ix, entry_off) = self.allocate_entry(payload_buf.len(), level)?;
        self.tier(tier_ix).write_entry(entry_off, payload_buf);
        self.slots()
            .publish(slot_ix, tier_ix, entry_off, hash::fingerprint(hashed));
        self.retire_entry(old);
        Ok(())
    }

    /// Tombstones the slot, then retires the entry bytes. Requires update
    /// or write lock. The tombstone goes first so a reader that loaded the
    /// slot beforehand still sees intact payload bytes.
    pub fn remove(&self, slot_ix: u32, old: SlotEntry) {
        self.slots().tombstone(slot_ix);
        self.retire_entry(old);
        self.entry_count().fetch_sub(1, Ordering::AcqRel);
    }

    fn retire_entry(&self, old: SlotEntry) {
        let tier = self.tier(old.tier_ix);
        if self.layout.fixed_stride.is_some() {
            tier.push_free(old.entry_offset);
        } else {
            tier.mark_dead(old.entry_offset);
        }
    }

    /// Finds space for a new entry: bump the head tier, reuse a dead
    /// fixed-stride cell, or attach a tier from the pool.
    ///
    /// Free-cell reuse rewrites bytes an old reader could still be
    /// dereferencing, so under an update lock the reuse path briefly
    /// upgrades to write (draining readers) and downgrades back. Bump
    /// allocation hands out bytes no slot has ever referenced and needs no
    /// such fence.
    fn allocate_entry(&self, payload_len: usize, level: LockLevel) -> Result<(u32, u32)> {
        let footprint = self.layout.entry_footprint(payload_len) as u32;
        let head = self.tier(self.head_tier());

        if let Some(off) = head.allocate(footprint) {
            return Ok((head.tier_ix(), off));
        }

        if self.layout.fixed_stride.is_some() {
            if let Some(found) = self.pop_free_anywhere(level)? {
                return Ok(found);
            }
        }

        let attached = self.attach_tier()?;
        let off = attached.allocate(footprint).ok_or_else(|| {
            eyre::eyre!(
                "fresh tier of {} payload bytes cannot fit an entry of {}",
                self.layout.tier_payload_bytes,
                footprint
            )
        })?;
        Ok((attached.tier_ix(), off))
    }

    fn pop_free_anywhere(&self, level: LockLevel) -> Result<Option<(u32, u32)>> {
        let lock = self.lock();
        let upgraded = level == LockLevel::Update;
        if upgraded {
            lock.upgrade_update_to_write()?;
        }

        let mut found = None;
        let mut tier_ix = Some(self.head_tier());
        while let Some(ix) = tier_ix {
            let tier = self.tier(ix);
            if let Some(off) = tier.pop_free() {
                found = Some((ix, off));
                break;
            }
            tier_ix = tier.next_tier();
        }

        if upgraded {
            lock.downgrade_write_to_update();
        }
        Ok(found)
    }

    /// Draws a tier from the pool and pushes it at the chain head.
    fn attach_tier(&self) -> Result<TierRef<'a>> {
        let capacity_exhausted = || StoreError::CapacityExhausted {
            segment: self.segment,
            max_bloat_factor: self.layout.max_bloat_factor,
        };

        if self.tier_count().load(Ordering::Acquire) >= self.layout.max_tiers_per_segment {
            return Err(capacity_exhausted().into());
        }

        let alloc = self.region.atomic_u32(self.layout.tier_alloc_offset());
        let pool_ix = loop {
            let cur = alloc.load(Ordering::Acquire);
            if cur >= self.layout.extra_tiers {
                return Err(capacity_exhausted().into());
            }
            if alloc
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break cur;
            }
        };

        let tier_ix = self.layout.seg_count + pool_ix;
        let tier = self.tier(tier_ix);
        tier.set_owner(self.segment);
        tier.set_next_tier(Some(self.head_tier()));
        self.set_head_tier(tier_ix);
        self.tier_count().fetch_add(1, Ordering::AcqRel);

        tracing::debug!(
            segment = self.segment,
            tier_ix,
            tiers = self.tier_count().load(Ordering::Relaxed),
            "attached overflow tier"
        );
        Ok(tier)
    }

    /// Walks the tier chain head-to-primary, bounded against cycles.
    pub fn for_each_tier(&self, mut f: impl FnMut(TierRef<'a>) -> bool) {
        let mut tier_ix = Some(self.head_tier());
        let mut hops = 0u32;
        while let Some(ix) = tier_ix {
            if hops > self.layout.total_tiers {
                return;
            }
            hops += 1;
            let tier = self.tier(ix);
            if !f(tier) {
                return;
            }
            tier_ix = tier.next_tier();
        }
    }

    /// Bytes in use across the chain, for the free-space statistics.
    pub fn used_bytes(&self) -> u64 {
        let mut used = 0u64;
        self.for_each_tier(|tier| {
            used += (tier.alloc_cursor() as u64).saturating_sub(tier.freed_bytes() as u64);
            true
        });
        used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::header::StoreConfig;

    struct Fixture {
        region: Region,
        layout: RegionLayout,
    }

    impl Fixture {
        fn new(cfg: &StoreConfig) -> Self {
            let layout = RegionLayout::from_config(cfg).unwrap();
            let region = Region::create_anonymous(layout.total_len()).unwrap();
            let fixture = Self { region, layout };
            for seg in 0..cfg.segments {
                fixture.segment(seg).init();
            }
            fixture
        }

        fn segment(&self, seg: u32) -> SegmentRef<'_> {
            SegmentRef::new(&self.region, &self.layout, seg)
        }
    }

    fn variable_config() -> StoreConfig {
        StoreConfig {
            segments: 1,
            entries_per_segment: 16,
            average_key_size: 8,
            average_value_size: 16,
            constant_key_size: None,
            constant_value_size: None,
            checksum_entries: true,
            max_bloat_factor: 1.0,
        }
    }

    fn insert_kv(seg: &SegmentRef<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        let hashed = hash::hash_key(key);
        let mut buf = Vec::new();
        match seg.find(hashed, key)? {
            Probe::Absent { insert_ix } => {
                seg.insert(insert_ix, hashed, key, value, LockLevel::Write, &mut buf)
            }
            Probe::Present { slot_ix, entry } => {
                seg.replace(slot_ix, entry, hashed, key, value, LockLevel::Write, &mut buf)
            }
        }
    }

    fn get_kv(seg: &SegmentRef<'_>, key: &[u8]) -> Option<Vec<u8>> {
        let hashed = hash::hash_key(key);
        match seg.find(hashed, key).unwrap() {
            Probe::Present { entry, .. } => Some(seg.decode(entry).unwrap().value.to_vec()),
            Probe::Absent { .. } => None,
        }
    }

    #[test]
    fn insert_find_roundtrip() {
        let fixture = Fixture::new(&variable_config());
        let seg = fixture.segment(0);

        insert_kv(&seg, b"alpha", b"one").unwrap();
        insert_kv(&seg, b"beta", b"two").unwrap();

        assert_eq!(get_kv(&seg, b"alpha").as_deref(), Some(&b"one"[..]));
        assert_eq!(get_kv(&seg, b"beta").as_deref(), Some(&b"two"[..]));
        assert_eq!(get_kv(&seg, b"gamma"), None);
        assert_eq!(seg.entry_count().load(Ordering::Relaxed), 2);
    }

    #[test]
    fn replace_same_size_is_in_place() {
        let fixture = Fixture::new(&variable_config());
        let seg = fixture.segment(0);

        insert_kv(&seg, b"k", b"aaaa").unwrap();
        let before = match seg.find(hash::hash_key(b"k"), b"k").unwrap() {
            Probe::Present { entry, .. } => entry,
            _ => unreachable!(),
        };

        insert_kv(&seg, b"k", b"bbbb").unwrap();
        let after = match seg.find(hash::hash_key(b"k"), b"k").unwrap() {
            Probe::Present { entry, .. } => entry,
            _ => unreachable!(),
        };

        assert_eq!(before, after, "same-size replace must not move the entry");
        assert_eq!(get_kv(&seg, b"k").as_deref(), Some(&b"bbbb"[..]));
        let decoded = seg.decode(after).unwrap();
        assert!(decoded.checksum_ok(), "in-place replace must refresh checksum");
        assert_eq!(seg.entry_count().load(Ordering::Relaxed), 1);
    }

    #[test]
    fn replace_different_size_swaps_entry() {
        let fixture = Fixture::new(&variable_config());
        let seg = fixture.segment(0);

        insert_kv(&seg, b"k", b"short").unwrap();
        insert_kv(&seg, b"k", b"a much longer value").unwrap();

        assert_eq!(get_kv(&seg, b"k").as_deref(), Some(&b"a much longer value"[..]));
        assert_eq!(seg.entry_count().load(Ordering::Relaxed), 1);
    }

    #[test]
    fn remove_tombstones_and_decrements() {
        let fixture = Fixture::new(&variable_config());
        let seg = fixture.segment(0);

        insert_kv(&seg, b"k", b"v").unwrap();
        let (slot_ix, entry) = match seg.find(hash::hash_key(b"k"), b"k").unwrap() {
            Probe::Present { slot_ix, entry } => (slot_ix, entry),
            _ => unreachable!(),
        };

        seg.remove(slot_ix, entry);
        assert_eq!(get_kv(&seg, b"k"), None);
        assert_eq!(seg.entry_count().load(Ordering::Relaxed), 0);
    }

    #[test]
    fn capacity_exhausted_when_bloat_disallows_tiers() {
        let cfg = StoreConfig {
            segments: 1,
            entries_per_segment: 2,
            average_key_size: 4,
            average_value_size: 4,
            constant_key_size: Some(4),
            constant_value_size: Some(4),
            checksum_entries: true,
            max_bloat_factor: 1.0,
        };
        let fixture = Fixture::new(&cfg);
        let seg = fixture.segment(0);

        insert_kv(&seg, b"aaaa", b"1111").unwrap();
        insert_kv(&seg, b"bbbb", b"2222").unwrap();

        let err = insert_kv(&seg, b"cccc", b"3333").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::CapacityExhausted { segment: 0, .. })
        ));

        // The failed insert left the segment unchanged.
        assert_eq!(seg.entry_count().load(Ordering::Relaxed), 2);
        assert_eq!(get_kv(&seg, b"aaaa").as_deref(), Some(&b"1111"[..]));
        assert_eq!(get_kv(&seg, b"bbbb").as_deref(), Some(&b"2222"[..]));
    }

    #[test]
    fn fixed_layout_reuses_freed_cells() {
        let cfg = StoreConfig {
            segments: 1,
            entries_per_segment: 2,
            average_key_size: 4,
            average_value_size: 4,
            constant_key_size: Some(4),
            constant_value_size: Some(4),
            checksum_entries: true,
            max_bloat_factor: 1.0,
        };
        let fixture = Fixture::new(&cfg);
        let seg = fixture.segment(0);

        insert_kv(&seg, b"aaaa", b"1111").unwrap();
        insert_kv(&seg, b"bbbb", b"2222").unwrap();

        let (slot_ix, entry) = match seg.find(hash::hash_key(b"aaaa"), b"aaaa").unwrap() {
            Probe::Present { slot_ix, entry } => (slot_ix, entry),
            _ => unreachable!(),
        };
        seg.remove(slot_ix, entry);

        // The tier is nominally full, but the freed cell makes room.
        insert_kv(&seg, b"cccc", b"3333").unwrap();
        assert_eq!(get_kv(&seg, b"cccc").as_deref(), Some(&b"3333"[..]));
        assert_eq!(get_kv(&seg, b"bbbb").as_deref(), Some(&b"2222"[..]));
        assert_eq!(seg.entry_count().load(Ordering::Relaxed), 2);
    }

    #[test]
    fn bloat_factor_attaches_tiers_up_to_limit() {
        let cfg = StoreConfig {
            segments: 1,
            entries_per_segment: 2,
            average_key_size: 4,
            average_value_size: 4,
            constant_key_size: Some(4),
            constant_value_size: Some(4),
            checksum_entries: true,
            max_bloat_factor: 2.0,
        };
        let fixture = Fixture::new(&cfg);
        let seg = fixture.segment(0);

        for i in 0..4u32 {
            let key = i.to_le_bytes();
            insert_kv(&seg, &key, b"vvvv").unwrap();
        }
        assert_eq!(seg.tier_count().load(Ordering::Relaxed), 2);

        let err = insert_kv(&seg, b"zzzz", b"vvvv").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::CapacityExhausted { .. })
        ));

        for i in 0..4u32 {
            let key = i.to_le_bytes();
            assert!(get_kv(&seg, &key).is_some(), "key {} lost after tiering", i);
        }
    }

    #[test]
    fn keys_hash_to_distinct_segments() {
        let mut cfg = variable_config();
        cfg.segments = 16;
        let fixture = Fixture::new(&cfg);

        let mut seen = std::collections::BTreeSet::new();
        for i in 0..64u32 {
            let key = i.to_le_bytes();
            let seg_ix =
                hash::segment_of(hash::hash_key(&key), fixture.layout.segment_shift);
            assert!(seg_ix < 16);
            seen.insert(seg_ix);
        }
        assert!(seen.len() > 1, "64 keys all landed in one of 16 segments");
    }
}
