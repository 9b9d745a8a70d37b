//! # Encoding Module
//!
//! Byte-level encoding utilities for the entry format:
//!
//! - **Varint encoding**: marker-byte variable-length integers used for the
//!   key-size and value-size fields of variable-layout entries

pub mod varint;

pub use varint::{decode_varint, encode_varint, varint_len, MAX_VARINT_LEN};
