//! # Variable-Length Integer Encoding
//!
//! Marker-byte varints encode the `key_size` and `value_size` fields of
//! variable-layout entries. The common case — sizes up to 240 bytes — costs
//! a single byte, and the encoding is self-delimiting so an entry payload
//! can be decoded front to back without out-of-band lengths.
//!
//! ## Format
//!
//! The first byte dispatches the width. Small values are stored inline or
//! with a bias folded into the marker; wide values put the marker first and
//! the magnitude big-endian after it.
//!
//! ```text
//! marker 0..=240     value is the marker itself
//! marker 241..=248   value = 240 + ((marker - 241) << 8 | next byte)
//! marker 249         value = 2288 + 2-byte big-endian tail
//! marker 250         value = 3-byte big-endian tail
//! marker 251         value = 4-byte big-endian tail
//! marker 255         value = 8-byte big-endian tail
//! ```
//!
//! Markers 252–254 are reserved; decoding them fails, which doubles as a
//! cheap corruption tripwire when recovery walks a damaged tier.
//!
//! All functions are pure, allocation-free, and operate on byte slices.

use eyre::{bail, ensure, Result};

/// Worst-case encoded size of a u64.
pub const MAX_VARINT_LEN: usize = 9;

/// Largest value stored inline in the marker byte.
const MAX_INLINE: u64 = 240;

/// The two-byte form folds `value - TWO_BYTE_BIAS` into the marker's low
/// three values-of-eight plus one tail byte.
const TWO_BYTE_BIAS: u64 = MAX_INLINE;
const TWO_BYTE_MARKER: u8 = 241;
const MAX_TWO_BYTE: u64 = TWO_BYTE_BIAS + 0x7FF;

/// The three-byte form starts where the two-byte form ends.
const THREE_BYTE_BIAS: u64 = MAX_TWO_BYTE + 1;
const MAX_THREE_BYTE: u64 = THREE_BYTE_BIAS + 0xFFFF;

const U16_MARKER: u8 = 249;
const U24_MARKER: u8 = 250;
const U32_MARKER: u8 = 251;
const U64_MARKER: u8 = 255;

/// Encoded length of `value` without encoding it.
pub fn varint_len(value: u64) -> usize {
    match value {
        0..=MAX_INLINE => 1,
        ..=MAX_TWO_BYTE => 2,
        ..=MAX_THREE_BYTE => 3,
        ..=0xFF_FFFF => 4,
        ..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Encodes `value` into `buf`, returning the number of bytes written.
///
/// `buf` must have room for `varint_len(value)` bytes.
pub fn encode_varint(value: u64, buf: &mut [u8]) -> usize {
    let len = varint_len(value);
    match len {
        1 => buf[0] = value as u8,
        2 => {
            let spread = value - TWO_BYTE_BIAS;
            buf[0] = TWO_BYTE_MARKER + (spread >> 8) as u8;
            buf[1] = spread as u8;
        }
        3 => {
            buf[0] = U16_MARKER;
            put_be(&mut buf[1..3], value - THREE_BYTE_BIAS);
        }
        4 => {
            buf[0] = U24_MARKER;
            put_be(&mut buf[1..4], value);
        }
        5 => {
            buf[0] = U32_MARKER;
            put_be(&mut buf[1..5], value);
        }
        _ => {
            buf[0] = U64_MARKER;
            put_be(&mut buf[1..9], value);
        }
    }
    len
}

/// Decodes a varint from the front of `buf`, returning `(value, bytes_read)`.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let &marker = buf.first().ok_or_else(|| eyre::eyre!("empty buffer for varint decode"))?;

    let decoded = match marker {
        0..=240 => (marker as u64, 1),
        241..=248 => {
            ensure!(buf.len() >= 2, "truncated 2-byte varint");
            let spread = ((marker - TWO_BYTE_MARKER) as u64) << 8 | buf[1] as u64;
            (TWO_BYTE_BIAS + spread, 2)
        }
        U16_MARKER => {
            ensure!(buf.len() >= 3, "truncated 3-byte varint");
            (THREE_BYTE_BIAS + get_be(&buf[1..3]), 3)
        }
        U24_MARKER => {
            ensure!(buf.len() >= 4, "truncated 4-byte varint");
            (get_be(&buf[1..4]), 4)
        }
        U32_MARKER => {
            ensure!(buf.len() >= 5, "truncated 5-byte varint");
            (get_be(&buf[1..5]), 5)
        }
        U64_MARKER => {
            ensure!(buf.len() >= 9, "truncated 9-byte varint");
            (get_be(&buf[1..9]), 9)
        }
        _ => bail!("invalid varint marker: {}", marker),
    };
    Ok(decoded)
}

/// Writes the low `out.len()` bytes of `value`, big-endian.
fn put_be(out: &mut [u8], value: u64) {
    let full = value.to_be_bytes();
    out.copy_from_slice(&full[full.len() - out.len()..]);
}

/// Reads `bytes` as a big-endian magnitude.
fn get_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| acc << 8 | b as u64)
}
