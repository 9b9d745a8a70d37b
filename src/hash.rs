//! # Key Hashing and Checksums
//!
//! One 64-bit xxh3 hash per key drives three independent reductions:
//!
//! ```text
//! hash = xxh3_64(key_bytes)
//!
//! bits 63..=(64-log2(segments))   segment selector (high bits)
//! bits 55..=40                    slot fingerprint (16 bits)
//! bits (slot bits)..=0            slot-array probe start (low bits)
//! ```
//!
//! The fingerprint is stored in the slot word so probes can reject
//! non-matching keys without touching entry bytes; a fingerprint match is
//! followed by a full key comparison. Entry checksums use xxh32 over
//! `key_bytes ‖ value_bytes`, which gives the avalanche quality a corruption
//! check needs (a CRC would detect burst errors but smears poorly over the
//! partial-write patterns recovery has to catch).
//!
//! Hash placement is part of the persistent format: recovery re-derives the
//! owning segment of every entry from its key bytes, so these reductions
//! must never change for a given format version.

use xxhash_rust::xxh3::xxh3_64;
use xxhash_rust::xxh32::Xxh32;

/// Full 64-bit hash of the key bytes.
#[inline]
pub fn hash_key(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// Segment selector: the high bits of the hash.
///
/// `segment_shift` is `64 - log2(segment_count)`; a single-segment store
/// uses shift 64, which always selects segment 0.
#[inline]
pub fn segment_of(hash: u64, segment_shift: u32) -> u32 {
    if segment_shift >= 64 {
        0
    } else {
        (hash >> segment_shift) as u32
    }
}

/// 16-bit slot fingerprint, taken from the middle of the hash so it stays
/// decorrelated from both the segment selector and the probe start.
#[inline]
pub fn fingerprint(hash: u64) -> u16 {
    (hash >> 40) as u16
}

/// Starting slot index for the linear probe, masked by the caller to the
/// slot array's power-of-two capacity.
#[inline]
pub fn probe_start(hash: u64, slot_mask: u64) -> u64 {
    hash & slot_mask
}

/// 32-bit entry checksum over `key_bytes ‖ value_bytes`.
#[inline]
pub fn entry_checksum(key: &[u8], value: &[u8]) -> u32 {
    let mut h = Xxh32::new(0);
    h.update(key);
    h.update(value);
    h.digest()
}
