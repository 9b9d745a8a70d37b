//! # Region Layout
//!
//! Pure arithmetic mapping a [`StoreConfig`] to byte offsets inside the
//! region. Everything downstream — segment headers, slot arrays, tier
//! blocks, entry frames — addresses the mapping exclusively through this
//! type, so the format lives in exactly one place.
//!
//! ```text
//! 0 ───────────────┐ header (4 KiB): magic, version, config record,
//!                  │                 extra-tier allocation word
//! HEADER_SIZE ─────┤ segment headers   seg_count × 32
//! slots_offset ────┤ slot arrays       seg_count × slot_capacity × 8
//! tiers_offset ────┤ primary tiers     seg_count × tier_bytes
//!                  │ extra tier pool   extra_tiers × tier_bytes
//! total_len ───────┘
//! ```
//!
//! Tier indices are global: tier `i < seg_count` is the primary tier of
//! segment `i`; indices from `seg_count` up are pool tiers handed out by the
//! allocation word in the header page.

use eyre::{ensure, Result};

use crate::config::{
    CHECKSUM_SIZE, ENTRY_ALIGN, FRAME_LEN_MASK, FRAME_SIZE, HEADER_SIZE, MAX_TIERS,
    MAX_TIER_BYTES, SEG_HDR_SIZE, SLOT_SIZE, TIER_ALLOC_OFFSET, TIER_HDR_SIZE,
};
use crate::encoding::varint_len;
use crate::region::header::StoreConfig;

/// Slot arrays are sized to twice the reachable entry count so linear
/// probes stay short and always terminate at an empty slot.
const SLOT_HEADROOM: u32 = 2;

const MIN_SLOT_CAPACITY: u32 = 8;

#[derive(Debug, Clone)]
pub struct RegionLayout {
    pub seg_count: u32,
    /// `64 - log2(seg_count)`; see [`crate::hash::segment_of`].
    pub segment_shift: u32,
    pub slot_capacity: u32,
    pub slot_mask: u64,
    pub tier_bytes: usize,
    pub tier_payload_bytes: u32,
    pub extra_tiers: u32,
    pub total_tiers: u32,
    pub max_tiers_per_segment: u32,
    pub max_bloat_factor: f64,
    pub checksum: bool,
    pub const_key: Option<u32>,
    pub const_value: Option<u32>,
    /// Full framed, padded stride when the fixed entry layout applies.
    pub fixed_stride: Option<u32>,
    slots_offset: usize,
    tiers_offset: usize,
    total_len: usize,
}

impl RegionLayout {
    pub fn from_config(cfg: &StoreConfig) -> Result<Self> {
        cfg.validate()?;

        let seg_count = cfg.segments;
        let segment_shift = 64 - seg_count.ilog2();
        let max_tiers_per_segment = cfg.max_tiers_per_segment();

        let reachable_entries = (cfg.entries_per_segment as u64)
            .saturating_mul(max_tiers_per_segment as u64)
            .saturating_mul(SLOT_HEADROOM as u64);
        ensure!(
            reachable_entries <= u32::MAX as u64 / 2,
            "entries_per_segment * max_bloat_factor too large"
        );
        let slot_capacity = (reachable_entries as u32)
            .max(MIN_SLOT_CAPACITY)
            .next_power_of_two();

        let per_entry = match (cfg.constant_key_size, cfg.constant_value_size) {
            (Some(ck), Some(cv)) => {
                fixed_entry_stride(ck as usize, cv as usize, cfg.checksum_entries)
            }
            _ => {
                let k = cfg.average_key_size as usize;
                let v = cfg.average_value_size as usize;
                let payload = varint_len(k as u64) + k + varint_len(v as u64) + v
                    + if cfg.checksum_entries { CHECKSUM_SIZE } else { 0 };
                align_entry(FRAME_SIZE + payload)
            }
        };

        let tier_payload = (cfg.entries_per_segment as u64).saturating_mul(per_entry as u64);
        ensure!(
            tier_payload < MAX_TIER_BYTES && tier_payload <= u32::MAX as u64,
            "tier payload of {} bytes exceeds the addressable tier size",
            tier_payload
        );
        let tier_payload_bytes = tier_payload as u32;
        let tier_bytes = TIER_HDR_SIZE + tier_payload_bytes as usize;

        let extra_tiers =
            ((cfg.max_bloat_factor - 1.0) * seg_count as f64).ceil().max(0.0) as u32;
        let total_tiers = seg_count
            .checked_add(extra_tiers)
            .filter(|&t| t <= MAX_TIERS)
            .ok_or_else(|| {
                eyre::eyre!("tier count {}+{} exceeds limit {}", seg_count, extra_tiers, MAX_TIERS)
            })?;

        let seg_hdrs_len = seg_count as usize * SEG_HDR_SIZE;
        let slots_offset = HEADER_SIZE + seg_hdrs_len;
        let slots_len = seg_count as usize * slot_capacity as usize * SLOT_SIZE;
        let tiers_offset = slots_offset + slots_len;
        let tiers_len = total_tiers as usize * tier_bytes;
        let total_len = tiers_offset
            .checked_add(tiers_len)
            .ok_or_else(|| eyre::eyre!("region layout overflows usize"))?;

        Ok(Self {
            seg_count,
            segment_shift,
            slot_capacity,
            slot_mask: (slot_capacity - 1) as u64,
            tier_bytes,
            tier_payload_bytes,
            extra_tiers,
            total_tiers,
            max_tiers_per_segment,
            max_bloat_factor: cfg.max_bloat_factor,
            checksum: cfg.checksum_entries,
            const_key: cfg.constant_key_size,
            const_value: cfg.constant_value_size,
            fixed_stride: cfg.constant_key_size.map(|ck| {
                fixed_entry_stride(
                    ck as usize,
                    cfg.constant_value_size.unwrap_or(0) as usize,
                    cfg.checksum_entries,
                ) as u32
            }),
            slots_offset,
            tiers_offset,
            total_len,
        })
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Offset of the extra-tier allocation word in the header page.
    pub fn tier_alloc_offset(&self) -> usize {
        TIER_ALLOC_OFFSET
    }

    pub fn seg_hdr_offset(&self, segment: u32) -> usize {
        debug_assert!(segment < self.seg_count);
        HEADER_SIZE + segment as usize * SEG_HDR_SIZE
    }

    pub fn slots_offset(&self, segment: u32) -> usize {
        debug_assert!(segment < self.seg_count);
        self.slots_offset + segment as usize * self.slot_capacity as usize * SLOT_SIZE
    }

    pub fn tier_offset(&self, tier_ix: u32) -> usize {
        debug_assert!(tier_ix < self.total_tiers);
        self.tiers_offset + tier_ix as usize * self.tier_bytes
    }

    pub fn tier_payload_offset(&self, tier_ix: u32) -> usize {
        self.tier_offset(tier_ix) + TIER_HDR_SIZE
    }

    /// Payload bytes of an entry with the given key and value lengths
    /// (sizes, key, value, optional checksum — everything after the frame
    /// word).
    pub fn entry_payload_len(&self, key_len: usize, value_len: usize) -> usize {
        let cs = if self.checksum { CHECKSUM_SIZE } else { 0 };
        match self.const_key {
            Some(_) => key_len + value_len + cs,
            None => {
                varint_len(key_len as u64) + key_len + varint_len(value_len as u64) + value_len + cs
            }
        }
    }

    /// Full framed, padded footprint of an entry in a tier.
    pub fn entry_footprint(&self, payload_len: usize) -> usize {
        align_entry(FRAME_SIZE + payload_len)
    }

    /// Checks an entry's payload length fits the frame word and one tier.
    pub fn check_entry_size(&self, payload_len: usize) -> Result<()> {
        ensure!(
            payload_len as u64 <= FRAME_LEN_MASK as u64,
            "entry payload of {} bytes exceeds the frame limit",
            payload_len
        );
        ensure!(
            self.entry_footprint(payload_len) <= self.tier_payload_bytes as usize,
            "entry of {} bytes can never fit a tier of {} payload bytes",
            payload_len,
            self.tier_payload_bytes
        );
        Ok(())
    }
}

fn align_entry(len: usize) -> usize {
    (len + ENTRY_ALIGN - 1) & !(ENTRY_ALIGN - 1)
}

fn fixed_entry_stride(key: usize, value: usize, checksum: bool) -> usize {
    let cs = if checksum { CHECKSUM_SIZE } else { 0 };
    align_entry(FRAME_SIZE + key + value + cs)
}
