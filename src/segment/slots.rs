//! # Slot Array
//!
//! Each segment owns one open-addressed, power-of-two slot array. A slot is
//! a single u64 published atomically, which is what lets readers holding
//! only a read lock race an update holder safely:
//!
//! ```text
//! bits 63..62   status: 0 empty, 1 occupied, 2 tombstone
//! bits 61..30   entry offset within the tier payload (bytes)
//! bits 29..16   tier index (global)
//! bits 15..0    key fingerprint
//! ```
//!
//! Writers fully write the entry bytes, then release-store the slot word;
//! readers acquire-load the word before dereferencing the entry. A zeroed
//! array is all-empty, so fresh regions need no slot initialization.
//!
//! Probing is linear with wrap-around. A lookup ends at the first *empty*
//! slot; tombstones are skipped but never terminate the probe, and inserts
//! reuse the first tombstone found on their path.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;

use crate::hash;

pub const STATUS_EMPTY: u8 = 0;
pub const STATUS_OCCUPIED: u8 = 1;
pub const STATUS_TOMBSTONE: u8 = 2;

const STATUS_SHIFT: u32 = 62;
const OFFSET_SHIFT: u32 = 30;
const OFFSET_MASK: u64 = 0xFFFF_FFFF;
const TIER_SHIFT: u32 = 16;
const TIER_MASK: u64 = 0x3FFF;
const FP_MASK: u64 = 0xFFFF;

/// A decoded occupied slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEntry {
    pub tier_ix: u32,
    pub entry_offset: u32,
    pub fingerprint: u16,
}

#[inline]
pub fn pack_occupied(tier_ix: u32, entry_offset: u32, fingerprint: u16) -> u64 {
    debug_assert!(tier_ix as u64 <= TIER_MASK);
    ((STATUS_OCCUPIED as u64) << STATUS_SHIFT)
        | ((entry_offset as u64 & OFFSET_MASK) << OFFSET_SHIFT)
        | ((tier_ix as u64 & TIER_MASK) << TIER_SHIFT)
        | (fingerprint as u64 & FP_MASK)
}

#[inline]
pub fn slot_status(word: u64) -> u8 {
    (word >> STATUS_SHIFT) as u8
}

#[inline]
pub fn unpack(word: u64) -> SlotEntry {
    SlotEntry {
        tier_ix: ((word >> TIER_SHIFT) & TIER_MASK) as u32,
        entry_offset: ((word >> OFFSET_SHIFT) & OFFSET_MASK) as u32,
        fingerprint: (word & FP_MASK) as u16,
    }
}

/// Outcome of probing for a key.
#[derive(Debug, Clone, Copy)]
pub enum Probe {
    /// The key is present: slot index plus the decoded slot.
    Present { slot_ix: u32, entry: SlotEntry },
    /// The key is absent; `insert_ix` is where an insert should publish
    /// (the first tombstone on the path, else the terminating empty slot).
    Absent { insert_ix: u32 },
}

/// One segment's slot array, viewed in place.
pub struct SlotArray<'a> {
    slots: &'a [AtomicU64],
    mask: u64,
}

impl<'a> SlotArray<'a> {
    /// # Safety-adjacent contract
    ///
    /// `slots` must be the segment's full array; its length must be a power
    /// of two. The caller provides lock-level guarantees; the array itself
    /// is safe to read at any level because slots are single atomic words.
    pub fn new(slots: &'a [AtomicU64]) -> Self {
        debug_assert!(slots.len().is_power_of_two());
        Self {
            mask: (slots.len() - 1) as u64,
            slots,
        }
    }

    /// Linear-probes for the key with `hash`, calling `key_match` on every
    /// fingerprint hit to compare full key bytes.
    pub fn probe(
        &self,
        hash: u64,
        mut key_match: impl FnMut(SlotEntry) -> Result<bool>,
    ) -> Result<Probe> {
        let fingerprint = hash::fingerprint(hash);
        let start = hash::probe_start(hash, self.mask);
        let mut first_tombstone: Option<u32> = None;

        for step in 0..self.slots.len() as u64 {
            let ix = ((start + step) & self.mask) as usize;
            let word = self.slots[ix].load(Ordering::Acquire);

            match slot_status(word) {
                STATUS_EMPTY => {
                    return Ok(Probe::Absent {
                        insert_ix: first_tombstone.unwrap_or(ix as u32),
                    });
                }
                STATUS_TOMBSTONE => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(ix as u32);
                    }
                }
                _ => {
                    let entry = unpack(word);
                    if entry.fingerprint == fingerprint && key_match(entry)? {
                        return Ok(Probe::Present {
                            slot_ix: ix as u32,
                            entry,
                        });
                    }
                }
            }
        }

        // The array is sized with headroom over the reachable entry count,
        // so a full sweep without an empty slot means every slot is
        // occupied or tombstoned; treat the first tombstone as insertable.
        Ok(Probe::Absent {
            insert_ix: first_tombstone
                .ok_or_else(|| eyre::eyre!("slot array unexpectedly full"))?,
        })
    }

    /// Publishes an occupied slot. Release ordering makes the entry bytes
    /// written before this call visible to any reader that sees the word.
    pub fn publish(&self, slot_ix: u32, tier_ix: u32, entry_offset: u32, fingerprint: u16) {
        self.slots[slot_ix as usize].store(
            pack_occupied(tier_ix, entry_offset, fingerprint),
            Ordering::Release,
        );
    }

    /// Marks a slot as a tombstone.
    pub fn tombstone(&self, slot_ix: u32) {
        self.slots[slot_ix as usize].store(
            (STATUS_TOMBSTONE as u64) << STATUS_SHIFT,
            Ordering::Release,
        );
    }

    /// Visits every occupied slot in index order.
    pub fn for_each_occupied(
        &self,
        mut f: impl FnMut(u32, SlotEntry) -> Result<bool>,
    ) -> Result<()> {
        for (ix, slot) in self.slots.iter().enumerate() {
            let word = slot.load(Ordering::Acquire);
            if slot_status(word) == STATUS_OCCUPIED && !f(ix as u32, unpack(word))? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Recovery only: zero the whole array.
    pub(crate) fn reset(&self) {
        for slot in self.slots {
            slot.store(0, Ordering::Relaxed);
        }
    }

    /// Number of occupied slots. Exact only while the caller holds a lock
    /// level that excludes publication; recovery uses it to cross-check the
    /// rebuilt entry count against the slot array.
    pub fn occupied_count(&self) -> u32 {
        self.slots
            .iter()
            .filter(|s| slot_status(s.load(Ordering::Acquire)) == STATUS_OCCUPIED)
            .count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array_of(n: usize) -> Vec<AtomicU64> {
        (0..n).map(|_| AtomicU64::new(0)).collect()
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let word = pack_occupied(0x3FFF, 0xFFFF_FFFF, 0xABCD);
        assert_eq!(slot_status(word), STATUS_OCCUPIED);
        let entry = unpack(word);
        assert_eq!(entry.tier_ix, 0x3FFF);
        assert_eq!(entry.entry_offset, 0xFFFF_FFFF);
        assert_eq!(entry.fingerprint, 0xABCD);
    }

    #[test]
    fn probe_empty_array_is_absent() {
        let slots = array_of(16);
        let array = SlotArray::new(&slots);

        match array.probe(hash::hash_key(b"k"), |_| Ok(false)).unwrap() {
            Probe::Absent { .. } => {}
            other => panic!("expected absent, got {:?}", other),
        }
    }

    #[test]
    fn publish_then_probe_finds_entry() {
        let slots = array_of(16);
        let array = SlotArray::new(&slots);
        let hash = hash::hash_key(b"k");

        let insert_ix = match array.probe(hash, |_| Ok(false)).unwrap() {
            Probe::Absent { insert_ix } => insert_ix,
            other => panic!("expected absent, got {:?}", other),
        };
        array.publish(insert_ix, 3, 128, hash::fingerprint(hash));

        match array.probe(hash, |e| Ok(e.entry_offset == 128)).unwrap() {
            Probe::Present { slot_ix, entry } => {
                assert_eq!(slot_ix, insert_ix);
                assert_eq!(entry.tier_ix, 3);
                assert_eq!(entry.entry_offset, 128);
            }
            other => panic!("expected present, got {:?}", other),
        }
    }

    #[test]
    fn fingerprint_collision_defers_to_key_match() {
        let slots = array_of(16);
        let array = SlotArray::new(&slots);
        let hash = hash::hash_key(b"k");

        let insert_ix = match array.probe(hash, |_| Ok(false)).unwrap() {
            Probe::Absent { insert_ix } => insert_ix,
            _ => unreachable!(),
        };
        array.publish(insert_ix, 0, 0, hash::fingerprint(hash));

        // Same fingerprint, but key_match rejects: probe must continue and
        // land absent, not report a false present.
        match array.probe(hash, |_| Ok(false)).unwrap() {
            Probe::Absent { .. } => {}
            other => panic!("expected absent, got {:?}", other),
        }
    }

    #[test]
    fn tombstones_are_skipped_and_reused() {
        let slots = array_of(16);
        let array = SlotArray::new(&slots);
        let hash = hash::hash_key(b"k");
        let fp = hash::fingerprint(hash);

        let first_ix = match array.probe(hash, |_| Ok(false)).unwrap() {
            Probe::Absent { insert_ix } => insert_ix,
            _ => unreachable!(),
        };
        array.publish(first_ix, 0, 0, fp);
        // A second entry further down the probe path.
        let second_ix = (first_ix + 1) % 16;
        array.publish(second_ix, 0, 64, fp);

        array.tombstone(first_ix);

        // The second entry is still reachable through the tombstone.
        match array.probe(hash, |e| Ok(e.entry_offset == 64)).unwrap() {
            Probe::Present { slot_ix, .. } => assert_eq!(slot_ix, second_ix),
            other => panic!("expected present, got {:?}", other),
        }

        // And an insert reuses the tombstoned slot.
        match array.probe(hash, |_| Ok(false)).unwrap() {
            Probe::Absent { insert_ix } => assert_eq!(insert_ix, first_ix),
            other => panic!("expected absent, got {:?}", other),
        }
    }

    #[test]
    fn for_each_occupied_visits_each_once() {
        let slots = array_of(16);
        let array = SlotArray::new(&slots);
        array.publish(2, 0, 0, 1);
        array.publish(9, 0, 64, 2);
        array.tombstone(2);
        array.publish(5, 0, 128, 3);

        let mut seen = Vec::new();
        array
            .for_each_occupied(|ix, entry| {
                seen.push((ix, entry.entry_offset));
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen, vec![(5, 128), (9, 64)]);
        assert_eq!(array.occupied_count(), 2);
    }

    #[test]
    fn occupied_count_ignores_tombstones_and_reset_clears() {
        let slots = array_of(16);
        let array = SlotArray::new(&slots);

        array.publish(1, 0, 0, 1);
        array.publish(4, 0, 64, 2);
        assert_eq!(array.occupied_count(), 2);

        array.tombstone(1);
        assert_eq!(array.occupied_count(), 1);

        array.reset();
        assert_eq!(array.occupied_count(), 0);
    }
}
