//! # Recovery
//!
//! An exclusive open that repairs a region left inconsistent by an abnormal
//! termination: lock words are force-reset, every slot array is rebuilt
//! from the entry payloads in the tier chains, and entries that fail their
//! checksum or no longer decode are discarded. Recovery is idempotent — on
//! a consistent region it is a full read pass that changes nothing
//! observable.
//!
//! ## Header Trust
//!
//! Two modes, per the caller's assertion:
//!
//! - **Same-configuration**: the caller asserts the creation-time
//!   configuration. A header that fails its sanity checks is rewritten from
//!   that configuration; a sane header must *match* the assertion.
//! - **Self-describing**: the header is authoritative; if it fails sanity
//!   checks recovery aborts with `RecoveryFailed`.
//!
//! ## What The Scan Repairs
//!
//! - Slot arrays: rebuilt from scratch; every surviving entry is published
//!   exactly once. Where a crash mid-replace left two live entries for one
//!   key, the newer one (later in allocation order) wins and the older is
//!   retired.
//! - Tier chains: cycles, foreign tiers, and double-claimed tiers truncate
//!   the chain; the segment's primary tier is always restored to it.
//! - Allocation cursors: clamped back over the torn frontier a crashed
//!   insert can leave, so the space is reused and later walks stay sound.
//! - Free lists and freed-byte accounting: rebuilt from the dead frames.
//! - The extra-tier allocation word: reset to the highest pool tier still
//!   referenced by any chain. Pool tiers orphaned by chain truncation are
//!   leaked rather than reused; the monotonic allocator cannot re-issue
//!   them, and leaking bounded space is preferred over aliasing two chains.
//!
//! The scan of one segment runs in two phases: first walk every tier,
//! validating and publishing entries while only *recording* which frames
//! are dead or newly retired; then rewrite each tier's free list, freed
//! bytes, cursor, and chain link in one pass. Mutating free lists during
//! the walk would corrupt links when a later tier supersedes an entry in an
//! already-processed one.
//!
//! Concurrent access during recovery is undefined; the caller guarantees
//! exclusivity.

use std::path::Path;

use eyre::{Result, WrapErr};
use hashbrown::HashSet;
use zerocopy::IntoBytes;

use crate::config::{FRAME_DEAD_BIT, FRAME_LEN_MASK, FRAME_SIZE};
use crate::error::StoreError;
use crate::hash;
use crate::region::{Region, RegionHeader, RegionLayout, StoreConfig, REGION_HEADER_SIZE};
use crate::segment::entry::decode_payload;
use crate::segment::slots::Probe;
use crate::segment::SegmentRef;
use crate::store::Store;

#[derive(Debug, Default)]
struct ScanStats {
    kept: u64,
    discarded: u64,
    superseded: u64,
    truncated_chains: u32,
}

struct WalkedFrame {
    offset: u32,
    footprint: u32,
    dead: bool,
}

struct WalkedTier {
    tier_ix: u32,
    walk_end: u32,
    frames: Vec<WalkedFrame>,
}

enum Revalidated {
    Keep,
    Superseded { old: (u32, u32) },
    Discard,
}

impl Store {
    pub(crate) fn recover_path(path: &Path, asserted: Option<StoreConfig>) -> Result<Self> {
        let region = Region::open_file(path)
            .wrap_err_with(|| format!("failed to open '{}' for recovery", path.display()))?;

        let header_len = REGION_HEADER_SIZE.min(region.len());
        let cfg = match (
            RegionHeader::sanity_checked(region.bytes(0, header_len)),
            asserted,
        ) {
            (Ok(header_cfg), Some(asserted_cfg)) => {
                if header_cfg != asserted_cfg {
                    return Err(StoreError::RecoveryFailed(
                        "asserted configuration does not match the region header".into(),
                    )
                    .into());
                }
                header_cfg
            }
            (Ok(header_cfg), None) => header_cfg,
            (Err(e), Some(asserted_cfg)) => {
                tracing::warn!(error = %e, "header failed sanity checks; rewriting from asserted configuration");
                region.write_bytes(0, RegionHeader::new(&asserted_cfg).as_bytes());
                asserted_cfg
            }
            (Err(e), None) => {
                return Err(StoreError::RecoveryFailed(format!(
                    "header failed sanity checks and no configuration was asserted: {e}"
                ))
                .into());
            }
        };

        let layout = RegionLayout::from_config(&cfg)?;
        if region.len() != layout.total_len() {
            return Err(StoreError::RecoveryFailed(format!(
                "region is {} bytes but the configuration describes {}",
                region.len(),
                layout.total_len()
            ))
            .into());
        }

        let store = Self {
            region,
            layout,
            cfg,
        };
        store.rescan()?;
        store.flush()?;
        Ok(store)
    }

    fn rescan(&self) -> Result<()> {
        let mut claimed: HashSet<u32> = HashSet::new();
        let mut pool_watermark = 0u32;
        let mut stats = ScanStats::default();

        for seg_ix in 0..self.layout().seg_count {
            let seg = self.segment(seg_ix);
            seg.lock().force_reset();
            seg.lock().lock_write()?;
            let result = self.rescan_segment(&seg, &mut claimed, &mut pool_watermark, &mut stats);
            seg.lock().unlock_write();
            result?;
        }

        self.region()
            .atomic_u32(self.layout().tier_alloc_offset())
            .store(pool_watermark, std::sync::atomic::Ordering::Release);

        tracing::info!(
            kept = stats.kept,
            discarded = stats.discarded,
            superseded = stats.superseded,
            truncated_chains = stats.truncated_chains,
            "recovery scan complete"
        );
        Ok(())
    }

    fn rescan_segment(
        &self,
        seg: &SegmentRef<'_>,
        claimed: &mut HashSet<u32>,
        pool_watermark: &mut u32,
        stats: &mut ScanStats,
    ) -> Result<()> {
        let layout = self.layout();
        let seg_ix = seg.segment();

        let chain = self.rebuild_chain(seg, claimed, stats);
        for &ix in &chain {
            claimed.insert(ix);
            if ix >= layout.seg_count {
                *pool_watermark = (*pool_watermark).max(ix - layout.seg_count + 1);
            }
        }

        seg.slots().reset();

        // Phase one: walk oldest-first (primary is last in the chain,
        // front-to-back within a tier) so on duplicate keys the newest
        // publication wins. Only slots and the retired set are mutated.
        let mut retired: HashSet<(u32, u32)> = HashSet::new();
        let mut walked: Vec<WalkedTier> = Vec::with_capacity(chain.len());
        let mut kept = 0u64;

        for &tier_ix in chain.iter().rev() {
            let mut tier = self.walk_tier(seg, tier_ix);
            for frame in &mut tier.frames {
                if frame.dead {
                    continue;
                }
                let payload_len = match layout.fixed_stride {
                    Some(_) => layout.entry_payload_len(
                        layout.const_key.unwrap_or(0) as usize,
                        layout.const_value.unwrap_or(0) as usize,
                    ),
                    None => {
                        let word = seg
                            .tier(tier_ix)
                            .frame_word(frame.offset)
                            .load(std::sync::atomic::Ordering::Acquire);
                        (word & FRAME_LEN_MASK) as usize
                    }
                };
                match self.revalidate_entry(seg, tier_ix, frame.offset, payload_len)? {
                    Revalidated::Keep => kept += 1,
                    Revalidated::Superseded { old } => {
                        stats.superseded += 1;
                        retired.insert(old);
                    }
                    Revalidated::Discard => {
                        stats.discarded += 1;
                        frame.dead = true;
                    }
                }
            }
            walked.push(tier);
        }

        // Phase two: rewrite each tier's frames, free list, cursor, and
        // chain link from what the walk found.
        for tier_state in &walked {
            let tier = seg.tier(tier_state.tier_ix);
            let mut free_head_plus_one = 0u32;
            let mut freed_bytes = 0u64;

            for frame in &tier_state.frames {
                let dead = frame.dead || retired.contains(&(tier_state.tier_ix, frame.offset));
                if !dead {
                    continue;
                }
                if layout.fixed_stride.is_some() {
                    tier.frame_word(frame.offset).store(
                        FRAME_DEAD_BIT | free_head_plus_one,
                        std::sync::atomic::Ordering::Release,
                    );
                    free_head_plus_one = frame.offset + 1;
                } else {
                    let word = tier
                        .frame_word(frame.offset)
                        .load(std::sync::atomic::Ordering::Acquire);
                    tier.frame_word(frame.offset).store(
                        FRAME_DEAD_BIT | (word & FRAME_LEN_MASK),
                        std::sync::atomic::Ordering::Release,
                    );
                    freed_bytes += frame.footprint as u64;
                }
            }

            let position = chain
                .iter()
                .position(|&ix| ix == tier_state.tier_ix)
                .unwrap_or(0); // INVARIANT: walked tiers come from the chain
            tier.reset_header(
                Some(seg_ix),
                chain.get(position + 1).copied(),
                tier_state.walk_end,
                free_head_plus_one,
                freed_bytes.min(u32::MAX as u64) as u32,
            );
        }

        seg.set_head_tier(chain[0]);
        seg.tier_count()
            .store(chain.len() as u32, std::sync::atomic::Ordering::Release);

        // Cross-check the rebuilt index: live entries, occupied slots, and
        // the counter must agree (recovery holds the write lock, so the
        // slot array is quiescent).
        let occupied = seg.slots().occupied_count() as u64;
        if occupied != kept {
            return Err(StoreError::RecoveryFailed(format!(
                "segment {}: rebuilt {} entries but {} slots are occupied",
                seg_ix, kept, occupied
            ))
            .into());
        }
        seg.entry_count().store(
            kept.min(u32::MAX as u64) as u32,
            std::sync::atomic::Ordering::Release,
        );
        stats.kept += kept;
        Ok(())
    }

    /// Follows the head pointer, truncating at out-of-range, foreign,
    /// already-claimed, or repeated tiers; guarantees the primary tier.
    fn rebuild_chain(
        &self,
        seg: &SegmentRef<'_>,
        claimed: &HashSet<u32>,
        stats: &mut ScanStats,
    ) -> Vec<u32> {
        let layout = self.layout();
        let seg_ix = seg.segment();

        let mut chain: Vec<u32> = Vec::new();
        let mut next = Some(seg.head_tier());
        while let Some(ix) = next {
            let valid = ix < layout.total_tiers
                && !claimed.contains(&ix)
                && !chain.contains(&ix)
                && seg.tier(ix).owner() == Some(seg_ix);
            if !valid {
                stats.truncated_chains += 1;
                break;
            }
            chain.push(ix);
            next = seg.tier(ix).next_tier();
        }
        if !chain.contains(&seg_ix) {
            chain.push(seg_ix);
        }
        chain
    }

    /// Walks one tier's frames without mutating anything, stopping (and
    /// clamping the cursor) at a torn or undecodable frontier.
    fn walk_tier(&self, seg: &SegmentRef<'_>, tier_ix: u32) -> WalkedTier {
        let layout = self.layout();
        let tier = seg.tier(tier_ix);
        let cursor = tier.alloc_cursor().min(layout.tier_payload_bytes);

        let mut frames = Vec::new();
        let mut off = 0u32;
        let walk_end = loop {
            if off + FRAME_SIZE as u32 > cursor {
                break off.min(cursor);
            }
            let frame = tier
                .frame_word(off)
                .load(std::sync::atomic::Ordering::Acquire);
            if frame == 0 {
                // The torn frontier of a crashed insert; reclaim it.
                break off;
            }

            let dead = frame & FRAME_DEAD_BIT != 0;
            let footprint = match layout.fixed_stride {
                Some(stride) => stride as usize,
                None => layout.entry_footprint((frame & FRAME_LEN_MASK) as usize),
            };
            let payload_len = match layout.fixed_stride {
                Some(_) => layout.entry_payload_len(
                    layout.const_key.unwrap_or(0) as usize,
                    layout.const_value.unwrap_or(0) as usize,
                ),
                None => (frame & FRAME_LEN_MASK) as usize,
            };
            if footprint == 0
                || (!dead
                    && off as usize + FRAME_SIZE + payload_len
                        > layout.tier_payload_bytes as usize)
            {
                // Garbage length; nothing beyond it can be delimited.
                break off;
            }

            frames.push(WalkedFrame {
                offset: off,
                footprint: footprint as u32,
                dead,
            });

            match off.checked_add(footprint as u32) {
                Some(n) => off = n,
                None => break cursor,
            }
        };

        WalkedTier {
            tier_ix,
            walk_end,
            frames,
        }
    }

    fn revalidate_entry(
        &self,
        seg: &SegmentRef<'_>,
        tier_ix: u32,
        entry_off: u32,
        payload_len: usize,
    ) -> Result<Revalidated> {
        let layout = self.layout();
        let tier = seg.tier(tier_ix);
        if entry_off as usize + FRAME_SIZE + payload_len > layout.tier_payload_bytes as usize {
            return Ok(Revalidated::Discard);
        }
        let payload = tier.entry_payload(entry_off, payload_len);

        let decoded = match decode_payload(layout, payload) {
            Ok(d) => d,
            Err(_) => return Ok(Revalidated::Discard),
        };
        if !decoded.checksum_ok() {
            return Ok(Revalidated::Discard);
        }

        let hashed = hash::hash_key(decoded.key);
        if hash::segment_of(hashed, layout.segment_shift) != seg.segment() {
            return Ok(Revalidated::Discard);
        }

        let key = decoded.key.to_vec();
        drop(decoded);

        match seg.find(hashed, &key)? {
            Probe::Absent { insert_ix } => {
                seg.slots()
                    .publish(insert_ix, tier_ix, entry_off, hash::fingerprint(hashed));
                Ok(Revalidated::Keep)
            }
            Probe::Present { slot_ix, entry } => {
                // Crash between publishing a replacement and retiring the
                // old entry: the one being walked now is newer.
                seg.slots()
                    .publish(slot_ix, tier_ix, entry_off, hash::fingerprint(hashed));
                Ok(Revalidated::Superseded {
                    old: (entry.tier_ix, entry.entry_offset),
                })
            }
        }
    }
}
