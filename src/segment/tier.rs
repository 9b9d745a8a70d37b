//! # Tiers
//!
//! A tier is a contiguous block inside the region: a 64-byte header followed
//! by packed, framed entries. Tier index `i < seg_count` is segment `i`'s
//! primary tier; higher indices are pool tiers drawn on demand when a
//! segment overflows, chained through the `next` link (newest tier first,
//! primary last).
//!
//! ## Entry Framing
//!
//! Every entry starts with a 4-byte frame word at an 8-byte-aligned offset:
//!
//! ```text
//! live entry        frame = payload_len            (dead bit clear)
//! dead, variable    frame = DEAD | payload_len     (skip during walks)
//! dead, fixed       frame = DEAD | next_free + 1   (free-list link)
//! unwritten         frame = 0                      (end of used space)
//! ```
//!
//! Fixed-stride tiers thread their free list *through the frame words* of
//! dead cells: the stride is constant, so a dead cell's length field is free
//! to hold the link. This keeps removal from ever scribbling over payload
//! bytes a concurrent reader may still be dereferencing — death and
//! resurrection of a cell are both single atomic frame-word transitions.
//!
//! Variable-layout tiers never reuse dead space in place; they account it in
//! `freed_bytes` and leave compaction to recovery-time rebuilds.
//!
//! Allocation is a bump cursor. Only the segment's update or write holder
//! allocates, so the cursor needs no CAS; atomics are used for the
//! cross-process visibility, not for mutual exclusion.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::{
    FRAME_DEAD_BIT, FRAME_LEN_MASK, FRAME_SIZE, TIER_ALLOC_CURSOR, TIER_FREED_BYTES,
    TIER_FREE_HEAD_PLUS_ONE, TIER_NEXT_PLUS_ONE, TIER_OWNER_PLUS_ONE,
};
use crate::region::{Region, RegionLayout};

/// One tier, viewed in place.
#[derive(Clone, Copy)]
pub struct TierRef<'a> {
    region: &'a Region,
    layout: &'a RegionLayout,
    tier_ix: u32,
    base: usize,
}

impl<'a> TierRef<'a> {
    pub fn new(region: &'a Region, layout: &'a RegionLayout, tier_ix: u32) -> Self {
        Self {
            region,
            layout,
            tier_ix,
            base: layout.tier_offset(tier_ix),
        }
    }

    pub fn tier_ix(&self) -> u32 {
        self.tier_ix
    }

    #[inline]
    fn hdr(&self, field: usize) -> &AtomicU32 {
        self.region.atomic_u32(self.base + field)
    }

    pub fn next_tier(&self) -> Option<u32> {
        match self.hdr(TIER_NEXT_PLUS_ONE).load(Ordering::Acquire) {
            0 => None,
            v => Some(v - 1),
        }
    }

    pub fn set_next_tier(&self, next: Option<u32>) {
        self.hdr(TIER_NEXT_PLUS_ONE)
            .store(next.map_or(0, |t| t + 1), Ordering::Release);
    }

    pub fn owner(&self) -> Option<u32> {
        match self.hdr(TIER_OWNER_PLUS_ONE).load(Ordering::Acquire) {
            0 => None,
            v => Some(v - 1),
        }
    }

    pub fn set_owner(&self, segment: u32) {
        self.hdr(TIER_OWNER_PLUS_ONE)
            .store(segment + 1, Ordering::Release);
    }

    pub fn alloc_cursor(&self) -> u32 {
        self.hdr(TIER_ALLOC_CURSOR).load(Ordering::Acquire)
    }

    pub fn freed_bytes(&self) -> u32 {
        self.hdr(TIER_FREED_BYTES).load(Ordering::Acquire)
    }

    /// Bump-allocates `footprint` payload bytes; `None` when the tier is
    /// full. Caller holds the owning segment's update or write lock.
    pub fn allocate(&self, footprint: u32) -> Option<u32> {
        let cursor = self.alloc_cursor();
        let end = cursor.checked_add(footprint)?;
        if end > self.layout.tier_payload_bytes {
            return None;
        }
        self.hdr(TIER_ALLOC_CURSOR).store(end, Ordering::Release);
        Some(cursor)
    }

    /// Pops a dead fixed-stride cell off the free list.
    ///
    /// Caller must hold the segment's *write* lock: the popped cell will be
    /// rewritten, and only write exclusion guarantees no reader still
    /// dereferences its old bytes.
    pub fn pop_free(&self) -> Option<u32> {
        let head = self.hdr(TIER_FREE_HEAD_PLUS_ONE).load(Ordering::Acquire);
        if head == 0 {
            return None;
        }
        let off = head - 1;
        let link = self.frame_word(off).load(Ordering::Acquire) & FRAME_LEN_MASK;
        self.hdr(TIER_FREE_HEAD_PLUS_ONE)
            .store(link, Ordering::Release);
        Some(off)
    }

    /// Marks a fixed-stride cell dead and links it onto the free list, all
    /// through the frame word — payload bytes stay untouched for any reader
    /// that loaded the slot before the tombstone.
    pub fn push_free(&self, entry_off: u32) {
        let head = self.hdr(TIER_FREE_HEAD_PLUS_ONE).load(Ordering::Acquire);
        self.frame_word(entry_off)
            .store(FRAME_DEAD_BIT | head, Ordering::Release);
        self.hdr(TIER_FREE_HEAD_PLUS_ONE)
            .store(entry_off + 1, Ordering::Release);
    }

    /// Marks a variable-layout entry dead, keeping its length for walks.
    pub fn mark_dead(&self, entry_off: u32) {
        let frame = self.frame_word(entry_off).load(Ordering::Acquire);
        let len = frame & FRAME_LEN_MASK;
        self.frame_word(entry_off)
            .store(FRAME_DEAD_BIT | len, Ordering::Release);
        self.hdr(TIER_FREED_BYTES).fetch_add(
            self.layout.entry_footprint(len as usize) as u32,
            Ordering::AcqRel,
        );
    }

    #[inline]
    pub fn frame_word(&self, entry_off: u32) -> &AtomicU32 {
        self.region
            .atomic_u32(self.payload_base() + entry_off as usize)
    }

    /// Writes an entry's payload (everything after the frame word) and then
    /// its frame, in that order, so a complete frame implies complete bytes.
    pub fn write_entry(&self, entry_off: u32, payload: &[u8]) {
        self.region
            .write_bytes(self.payload_base() + entry_off as usize + FRAME_SIZE, payload);
        self.frame_word(entry_off)
            .store(payload.len() as u32, Ordering::Release);
    }

    /// Payload bytes of the entry at `entry_off`, `len` bytes long.
    pub fn entry_payload(&self, entry_off: u32, len: usize) -> &'a [u8] {
        self.region
            .bytes(self.payload_base() + entry_off as usize + FRAME_SIZE, len)
    }

    /// Region-absolute offset of an entry's payload, for in-place value
    /// rewrites through raw pointers.
    pub fn entry_payload_offset(&self, entry_off: u32) -> usize {
        self.payload_base() + entry_off as usize + FRAME_SIZE
    }

    pub fn region(&self) -> &'a Region {
        self.region
    }

    /// Walks the used portion of the tier, calling `f(offset, frame_word)`
    /// for every framed entry, live or dead. Stops at an unwritten frame
    /// (a crash can leave one at the allocation frontier) or when `f`
    /// returns false.
    pub fn walk(&self, mut f: impl FnMut(u32, u32) -> bool) {
        let cursor = self.alloc_cursor().min(self.layout.tier_payload_bytes);
        let mut off = 0u32;

        while off + FRAME_SIZE as u32 <= cursor {
            let frame = self.frame_word(off).load(Ordering::Acquire);
            if frame == 0 {
                return;
            }
            let advance = match self.layout.fixed_stride {
                Some(stride) => stride,
                None => self
                    .layout
                    .entry_footprint((frame & FRAME_LEN_MASK) as usize) as u32,
            };
            if !f(off, frame) || advance == 0 {
                return;
            }
            match off.checked_add(advance) {
                Some(next) => off = next,
                None => return,
            }
        }
    }

    /// Recovery only: rewrite the header fields wholesale.
    pub(crate) fn reset_header(
        &self,
        owner: Option<u32>,
        next: Option<u32>,
        cursor: u32,
        free_head_plus_one: u32,
        freed_bytes: u32,
    ) {
        self.hdr(TIER_OWNER_PLUS_ONE)
            .store(owner.map_or(0, |s| s + 1), Ordering::Release);
        self.hdr(TIER_NEXT_PLUS_ONE)
            .store(next.map_or(0, |t| t + 1), Ordering::Release);
        self.hdr(TIER_ALLOC_CURSOR).store(cursor, Ordering::Release);
        self.hdr(TIER_FREE_HEAD_PLUS_ONE)
            .store(free_head_plus_one, Ordering::Release);
        self.hdr(TIER_FREED_BYTES)
            .store(freed_bytes, Ordering::Release);
    }

    #[inline]
    fn payload_base(&self) -> usize {
        self.base + crate::config::TIER_HDR_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::header::StoreConfig;

    fn fixture(fixed: bool) -> (Region, RegionLayout) {
        let cfg = StoreConfig {
            segments: 1,
            entries_per_segment: 8,
            average_key_size: 8,
            average_value_size: 16,
            constant_key_size: if fixed { Some(4) } else { None },
            constant_value_size: if fixed { Some(4) } else { None },
            checksum_entries: true,
            max_bloat_factor: 1.0,
        };
        let layout = RegionLayout::from_config(&cfg).unwrap();
        let region = Region::create_anonymous(layout.total_len()).unwrap();
        (region, layout)
    }

    #[test]
    fn bump_allocation_respects_capacity() {
        let (region, layout) = fixture(true);
        let tier = TierRef::new(&region, &layout, 0);
        let stride = layout.fixed_stride.unwrap();

        for i in 0..8 {
            assert_eq!(tier.allocate(stride), Some(i * stride));
        }
        assert_eq!(tier.allocate(stride), None);
    }

    #[test]
    fn write_then_walk_sees_live_entries() {
        let (region, layout) = fixture(false);
        let tier = TierRef::new(&region, &layout, 0);

        let payload = vec![0xABu8; 20];
        let footprint = layout.entry_footprint(payload.len()) as u32;
        let off0 = tier.allocate(footprint).unwrap();
        tier.write_entry(off0, &payload);
        let off1 = tier.allocate(footprint).unwrap();
        tier.write_entry(off1, &payload);

        let mut seen = Vec::new();
        tier.walk(|off, frame| {
            seen.push((off, frame & FRAME_LEN_MASK, frame & FRAME_DEAD_BIT != 0));
            true
        });
        assert_eq!(seen, vec![(off0, 20, false), (off1, 20, false)]);
        assert_eq!(tier.entry_payload(off0, 20), &payload[..]);
    }

    #[test]
    fn walk_stops_at_unwritten_frame() {
        let (region, layout) = fixture(false);
        let tier = TierRef::new(&region, &layout, 0);

        let payload = vec![1u8; 10];
        let footprint = layout.entry_footprint(payload.len()) as u32;
        let off0 = tier.allocate(footprint).unwrap();
        tier.write_entry(off0, &payload);
        // Allocated but never written: simulates a crash mid-insert.
        let _hole = tier.allocate(footprint).unwrap();

        let mut count = 0;
        tier.walk(|_, _| {
            count += 1;
            true
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn fixed_free_list_roundtrip() {
        let (region, layout) = fixture(true);
        let tier = TierRef::new(&region, &layout, 0);
        let stride = layout.fixed_stride.unwrap();

        let a = tier.allocate(stride).unwrap();
        let b = tier.allocate(stride).unwrap();
        tier.write_entry(a, &[1u8; 12]);
        tier.write_entry(b, &[2u8; 12]);

        assert_eq!(tier.pop_free(), None);
        tier.push_free(a);
        tier.push_free(b);

        // LIFO order, and the frames carry the links.
        assert_eq!(tier.pop_free(), Some(b));
        assert_eq!(tier.pop_free(), Some(a));
        assert_eq!(tier.pop_free(), None);
    }

    #[test]
    fn dead_fixed_cells_are_skipped_by_walk_liveness() {
        let (region, layout) = fixture(true);
        let tier = TierRef::new(&region, &layout, 0);
        let stride = layout.fixed_stride.unwrap();

        let a = tier.allocate(stride).unwrap();
        let b = tier.allocate(stride).unwrap();
        tier.write_entry(a, &[1u8; 12]);
        tier.write_entry(b, &[2u8; 12]);
        tier.push_free(a);

        let mut live = Vec::new();
        tier.walk(|off, frame| {
            if frame & FRAME_DEAD_BIT == 0 {
                live.push(off);
            }
            true
        });
        assert_eq!(live, vec![b]);
    }

    #[test]
    fn mark_dead_accounts_freed_bytes() {
        let (region, layout) = fixture(false);
        let tier = TierRef::new(&region, &layout, 0);

        let payload = vec![7u8; 20];
        let footprint = layout.entry_footprint(payload.len()) as u32;
        let off = tier.allocate(footprint).unwrap();
        tier.write_entry(off, &payload);

        tier.mark_dead(off);
        assert_eq!(tier.freed_bytes(), footprint);

        let mut live = 0;
        tier.walk(|_, frame| {
            if frame & FRAME_DEAD_BIT == 0 {
                live += 1;
            }
            true
        });
        assert_eq!(live, 0);
    }

    #[test]
    fn chain_links_roundtrip() {
        let (region, layout) = fixture(true);
        let tier = TierRef::new(&region, &layout, 0);

        assert_eq!(tier.next_tier(), None);
        assert_eq!(tier.owner(), None);

        tier.set_owner(0);
        tier.set_next_tier(Some(0));
        assert_eq!(tier.owner(), Some(0));
        assert_eq!(tier.next_tier(), Some(0));

        tier.set_next_tier(None);
        assert_eq!(tier.next_tier(), None);
    }
}
