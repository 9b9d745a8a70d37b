//! # Entry Encoding
//!
//! An entry's payload (the bytes after its frame word) is:
//!
//! ```text
//! variable layout   key_size (varint) ‖ key ‖ value_size (varint) ‖ value ‖ [checksum]
//! fixed layout      key ‖ value ‖ [checksum]
//! ```
//!
//! The checksum tail is a 32-bit xxh32 over `key ‖ value`, present when the
//! store was created with `checksum_entries`. Fixed layout applies when both
//! constant sizes are configured; the sizes then come from the layout, not
//! the bytes.

use eyre::{ensure, Result};

use crate::config::CHECKSUM_SIZE;
use crate::encoding::{decode_varint, encode_varint, MAX_VARINT_LEN};
use crate::hash;
use crate::region::RegionLayout;

/// A decoded entry payload, borrowing the mapped bytes.
#[derive(Debug)]
pub struct Decoded<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    /// Byte offset of the value within the payload, for in-place rewrites.
    pub value_offset: usize,
    pub checksum: Option<u32>,
}

impl Decoded<'_> {
    /// Recomputes the checksum and compares; never mutates.
    pub fn checksum_ok(&self) -> bool {
        match self.checksum {
            Some(stored) => hash::entry_checksum(self.key, self.value) == stored,
            None => true,
        }
    }
}

/// Rejects keys and values whose lengths disagree with a fixed layout.
pub fn check_sizes(layout: &RegionLayout, key: &[u8], value: &[u8]) -> Result<()> {
    if let (Some(ck), Some(cv)) = (layout.const_key, layout.const_value) {
        ensure!(
            key.len() == ck as usize,
            "key of {} bytes in a store with constant key size {}",
            key.len(),
            ck
        );
        ensure!(
            value.len() == cv as usize,
            "value of {} bytes in a store with constant value size {}",
            value.len(),
            cv
        );
    }
    Ok(())
}

/// Builds an entry payload into `buf` (cleared first).
pub fn encode_payload(layout: &RegionLayout, key: &[u8], value: &[u8], buf: &mut Vec<u8>) {
    buf.clear();
    buf.reserve(layout.entry_payload_len(key.len(), value.len()));

    if layout.const_key.is_none() {
        let mut varint = [0u8; MAX_VARINT_LEN];
        let n = encode_varint(key.len() as u64, &mut varint);
        buf.extend_from_slice(&varint[..n]);
        buf.extend_from_slice(key);
        let n = encode_varint(value.len() as u64, &mut varint);
        buf.extend_from_slice(&varint[..n]);
        buf.extend_from_slice(value);
    } else {
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
    }

    if layout.checksum {
        buf.extend_from_slice(&hash::entry_checksum(key, value).to_le_bytes());
    }
}

/// Decodes an entry payload in place.
pub fn decode_payload<'a>(layout: &RegionLayout, payload: &'a [u8]) -> Result<Decoded<'a>> {
    let cs = if layout.checksum { CHECKSUM_SIZE } else { 0 };

    let (key, value, value_offset) = match (layout.const_key, layout.const_value) {
        (Some(ck), Some(cv)) => {
            let (ck, cv) = (ck as usize, cv as usize);
            ensure!(
                payload.len() >= ck + cv + cs,
                "fixed entry truncated: {} < {}",
                payload.len(),
                ck + cv + cs
            );
            (&payload[..ck], &payload[ck..ck + cv], ck)
        }
        _ => {
            let (key_len, n) = decode_varint(payload)?;
            let key_end = n + key_len as usize;
            ensure!(payload.len() >= key_end, "entry key truncated");
            let key = &payload[n..key_end];

            let (value_len, m) = decode_varint(&payload[key_end..])?;
            let value_offset = key_end + m;
            let value_end = value_offset + value_len as usize;
            ensure!(payload.len() >= value_end + cs, "entry value truncated");
            (key, &payload[value_offset..value_end], value_offset)
        }
    };

    let checksum = if layout.checksum {
        let tail = value_offset + value.len();
        Some(u32::from_le_bytes(payload[tail..tail + CHECKSUM_SIZE].try_into().unwrap())) // INVARIANT: bounds ensured above
    } else {
        None
    };

    Ok(Decoded {
        key,
        value,
        value_offset,
        checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::header::StoreConfig;

    fn layout(fixed: bool, checksum: bool) -> RegionLayout {
        RegionLayout::from_config(&StoreConfig {
            segments: 1,
            entries_per_segment: 4,
            average_key_size: 8,
            average_value_size: 8,
            constant_key_size: if fixed { Some(3) } else { None },
            constant_value_size: if fixed { Some(5) } else { None },
            checksum_entries: checksum,
            max_bloat_factor: 1.0,
        })
        .unwrap()
    }

    #[test]
    fn variable_roundtrip_with_checksum() {
        let layout = layout(false, true);
        let mut buf = Vec::new();
        encode_payload(&layout, b"key", b"value bytes", &mut buf);
        assert_eq!(buf.len(), layout.entry_payload_len(3, 11));

        let decoded = decode_payload(&layout, &buf).unwrap();
        assert_eq!(decoded.key, b"key");
        assert_eq!(decoded.value, b"value bytes");
        assert!(decoded.checksum_ok());
    }

    #[test]
    fn fixed_roundtrip_without_checksum() {
        let layout = layout(true, false);
        let mut buf = Vec::new();
        encode_payload(&layout, b"abc", b"12345", &mut buf);
        assert_eq!(buf.len(), 8);

        let decoded = decode_payload(&layout, &buf).unwrap();
        assert_eq!(decoded.key, b"abc");
        assert_eq!(decoded.value, b"12345");
        assert_eq!(decoded.value_offset, 3);
        assert_eq!(decoded.checksum, None);
        assert!(decoded.checksum_ok());
    }

    #[test]
    fn corrupted_value_fails_checksum() {
        let layout = layout(false, true);
        let mut buf = Vec::new();
        encode_payload(&layout, b"key", b"value", &mut buf);
        // Flip a value byte, leaving the stored checksum behind.
        let decoded_clean = decode_payload(&layout, &buf).unwrap();
        let tamper_at = decoded_clean.value_offset;
        drop(decoded_clean);
        buf[tamper_at] ^= 0xFF;

        let decoded = decode_payload(&layout, &buf).unwrap();
        assert!(!decoded.checksum_ok());
    }

    #[test]
    fn empty_value_is_allowed() {
        let layout = layout(false, true);
        let mut buf = Vec::new();
        encode_payload(&layout, b"just-a-key", b"", &mut buf);

        let decoded = decode_payload(&layout, &buf).unwrap();
        assert_eq!(decoded.key, b"just-a-key");
        assert!(decoded.value.is_empty());
        assert!(decoded.checksum_ok());
    }

    #[test]
    fn truncated_payload_fails_cleanly() {
        let layout = layout(false, true);
        let mut buf = Vec::new();
        encode_payload(&layout, b"key", b"value", &mut buf);
        buf.truncate(4);

        assert!(decode_payload(&layout, &buf).is_err());
    }
}
