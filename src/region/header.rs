//! # Region Header
//!
//! The first bytes of every region are a self-describing header: magic,
//! format version, library stamp, creation timestamp, and the configuration
//! record the store was created with. The header is written once on create
//! and never rewritten during normal operation; only configuration-asserting
//! recovery may reconstruct it.
//!
//! ## Layout
//!
//! ```text
//! offset  size  field
//! ------  ----  -----
//!  0       4    magic "CMAP"
//!  4       4    format version (u32 LE)
//!  8      16    library stamp
//! 24       8    creation epoch milliseconds (u64 LE)
//! 32       4    config record length (u32 LE)
//! 36      64    config record (see ConfigRecord)
//! 512      4    extra-tier allocation word (mutable, outside the header
//!               structs; see region::layout)
//! ```
//!
//! All structs use zerocopy little-endian fields so the header can be read
//! in place from the mapping without copies, and `Unaligned` so reads work
//! at any offset.

use std::time::SystemTime;

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    CONFIG_RECORD_SIZE, FORMAT_VERSION, LIBRARY_STAMP, MAGIC, MAX_BLOAT_FACTOR,
    MIN_SUPPORTED_VERSION,
};
use crate::error::StoreError;

/// Largest accepted segment count (a power of two).
pub const MAX_SEGMENTS: u32 = 1 << 20;

/// Largest accepted key/value size hint or constant size.
pub const MAX_SIZE_HINT: u32 = 1 << 30;

/// Creation-time configuration of a store.
///
/// Carried in the header as a [`ConfigRecord`]; this is the parsed,
/// validated form the rest of the crate works with.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Number of segments; always a power of two.
    pub segments: u32,
    /// Primary tier capacity per segment, in entries.
    pub entries_per_segment: u32,
    /// Byte hint for tier sizing under variable layout.
    pub average_key_size: u32,
    /// Byte hint for tier sizing under variable layout.
    pub average_value_size: u32,
    /// Fixed key size; set together with `constant_value_size` this enables
    /// the fixed-stride entry layout.
    pub constant_key_size: Option<u32>,
    /// Fixed value size.
    pub constant_value_size: Option<u32>,
    /// Whether each entry carries a 32-bit checksum over key and value.
    pub checksum_entries: bool,
    /// Maximum multiple of primary capacity a segment may grow to by
    /// chaining extra tiers.
    pub max_bloat_factor: f64,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.segments.is_power_of_two() && self.segments <= MAX_SEGMENTS,
            "segments must be a power of two in 1..={}, got {}",
            MAX_SEGMENTS,
            self.segments
        );
        ensure!(
            self.entries_per_segment >= 1,
            "entries_per_segment must be at least 1"
        );
        ensure!(
            self.max_bloat_factor.is_finite()
                && self.max_bloat_factor >= 1.0
                && self.max_bloat_factor <= MAX_BLOAT_FACTOR,
            "max_bloat_factor must be in 1.0..={}, got {}",
            MAX_BLOAT_FACTOR,
            self.max_bloat_factor
        );

        for (name, size) in [
            ("average_key_size", Some(self.average_key_size)),
            ("average_value_size", Some(self.average_value_size)),
            ("constant_key_size", self.constant_key_size),
            ("constant_value_size", self.constant_value_size),
        ] {
            if let Some(size) = size {
                ensure!(size <= MAX_SIZE_HINT, "{} too large: {}", name, size);
            }
        }
        if let Some(k) = self.constant_key_size {
            ensure!(k >= 1, "constant_key_size must be at least 1");
        }
        ensure!(
            self.constant_key_size.is_some() == self.constant_value_size.is_some(),
            "constant_key_size and constant_value_size must be set together"
        );
        ensure!(
            self.average_key_size >= 1 || self.constant_key_size.is_some(),
            "average_key_size must be at least 1"
        );

        Ok(())
    }

    /// True when both constant sizes are set and the fixed-stride entry
    /// layout applies.
    pub fn fixed_layout(&self) -> bool {
        self.constant_key_size.is_some()
    }

    /// Highest tier count one segment may reach.
    pub fn max_tiers_per_segment(&self) -> u32 {
        self.max_bloat_factor.ceil() as u32
    }
}

/// Persistent form of [`StoreConfig`]; 64 bytes inside the header.
///
/// `constant_*_size` fields store 0 for "unset" (a constant size of zero is
/// not meaningful). `max_bloat_factor` stores raw f64 bits.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ConfigRecord {
    segments: U32,
    entries_per_segment: U32,
    average_key_size: U32,
    average_value_size: U32,
    constant_key_size: U32,
    constant_value_size: U32,
    checksum_entries: u8,
    _pad: [u8; 3],
    max_bloat_factor_bits: U64,
    reserved: [u8; 28],
}

const _: () = assert!(std::mem::size_of::<ConfigRecord>() == CONFIG_RECORD_SIZE);

impl ConfigRecord {
    pub fn from_config(cfg: &StoreConfig) -> Self {
        Self {
            segments: U32::new(cfg.segments),
            entries_per_segment: U32::new(cfg.entries_per_segment),
            average_key_size: U32::new(cfg.average_key_size),
            average_value_size: U32::new(cfg.average_value_size),
            constant_key_size: U32::new(cfg.constant_key_size.unwrap_or(0)),
            constant_value_size: U32::new(cfg.constant_value_size.unwrap_or(0)),
            checksum_entries: cfg.checksum_entries as u8,
            _pad: [0; 3],
            max_bloat_factor_bits: U64::new(cfg.max_bloat_factor.to_bits()),
            reserved: [0; 28],
        }
    }

    pub fn to_config(&self) -> StoreConfig {
        let opt = |v: u32| if v == 0 { None } else { Some(v) };
        StoreConfig {
            segments: self.segments.get(),
            entries_per_segment: self.entries_per_segment.get(),
            average_key_size: self.average_key_size.get(),
            average_value_size: self.average_value_size.get(),
            constant_key_size: opt(self.constant_key_size.get()),
            constant_value_size: opt(self.constant_value_size.get()),
            checksum_entries: self.checksum_entries != 0,
            max_bloat_factor: f64::from_bits(self.max_bloat_factor_bits.get()),
        }
    }
}

/// The fixed leading bytes of the region.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RegionHeader {
    magic: [u8; 4],
    format_version: U32,
    library_stamp: [u8; 16],
    creation_epoch_ms: U64,
    config_len: U32,
    config: ConfigRecord,
}

pub const REGION_HEADER_SIZE: usize = std::mem::size_of::<RegionHeader>();

const _: () = assert!(REGION_HEADER_SIZE == 36 + CONFIG_RECORD_SIZE);

impl RegionHeader {
    pub fn new(cfg: &StoreConfig) -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            magic: MAGIC,
            format_version: U32::new(FORMAT_VERSION),
            library_stamp: LIBRARY_STAMP,
            creation_epoch_ms: U64::new(epoch_ms),
            config_len: U32::new(CONFIG_RECORD_SIZE as u32),
            config: ConfigRecord::from_config(cfg),
        }
    }

    /// Parses the header from the start of the region, enforcing magic and
    /// version compatibility.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= REGION_HEADER_SIZE,
            StoreError::CorruptFormat(format!(
                "region too small for header: {} < {}",
                bytes.len(),
                REGION_HEADER_SIZE
            ))
        );

        let header = Self::ref_from_bytes(&bytes[..REGION_HEADER_SIZE])
            .map_err(|e| StoreError::CorruptFormat(format!("unparsable header: {:?}", e)))?;

        ensure!(
            header.magic == MAGIC,
            StoreError::CorruptFormat(format!("bad magic {:02x?}", header.magic))
        );

        let version = header.format_version.get();
        ensure!(
            (MIN_SUPPORTED_VERSION..=FORMAT_VERSION).contains(&version),
            StoreError::IncompatibleVersion {
                found: version,
                min: MIN_SUPPORTED_VERSION,
                max: FORMAT_VERSION,
            }
        );

        ensure!(
            header.config_len.get() as usize == CONFIG_RECORD_SIZE,
            StoreError::CorruptFormat(format!(
                "unexpected config record length {}",
                header.config_len.get()
            ))
        );

        Ok(header)
    }

    /// Full sanity check: parse plus bounded-range validation of the
    /// configuration. Recovery uses this to decide whether the header can
    /// be trusted.
    pub fn sanity_checked(bytes: &[u8]) -> Result<StoreConfig> {
        let header = Self::from_bytes(bytes)?;
        let cfg = header.config.to_config();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn config(&self) -> StoreConfig {
        self.config.to_config()
    }

    pub fn creation_epoch_ms(&self) -> u64 {
        self.creation_epoch_ms.get()
    }

    pub fn format_version(&self) -> u32 {
        self.format_version.get()
    }
}
