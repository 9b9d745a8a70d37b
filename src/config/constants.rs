//! # Region Format Constants
//!
//! All sizes and offsets of the shared-memory container format. Everything
//! here is part of the persistent format: changing any value is a format
//! version bump.
//!
//! ## Dependency Graph
//!
//! ```text
//! HEADER_SIZE (4096)
//!       │
//!       ├─> header fields live in the first 100 bytes
//!       │     magic(4) version(4) stamp(16) epoch(8) config_len(4)
//!       │     config record (CONFIG_RECORD_SIZE = 64)
//!       │
//!       └─> TIER_ALLOC_OFFSET (512) — the one mutable word in the header
//!             page, must stay clear of the config record
//!
//! SEG_HDR_SIZE (32)
//!       │
//!       └─> field offsets below must pack inside it (28 used + 4 reserved)
//!
//! SLOT_SIZE (8)
//!       │
//!       └─> a slot is one AtomicU64; slot arrays need 8-byte alignment,
//!           which HEADER_SIZE and SEG_HDR_SIZE multiples guarantee
//!
//! TIER_HDR_SIZE (64)
//!       │
//!       └─> entry frames start at the tier payload, 8-byte aligned
//!           (ENTRY_ALIGN) so frame words can be read as AtomicU32
//! ```

/// Magic at offset 0 of every region.
pub const MAGIC: [u8; 4] = *b"CMAP";

/// Current container format version.
pub const FORMAT_VERSION: u32 = 1;

/// Oldest format version this build can open.
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// Library stamp persisted in the header, consulted by recovery diagnostics.
pub const LIBRARY_STAMP: [u8; 16] = *b"coremap 0.1.0\0\0\0";

/// Fixed header size; segment headers start here, 4 KiB aligned.
pub const HEADER_SIZE: usize = 4096;

/// Offset of the extra-tier allocation word inside the header page.
pub const TIER_ALLOC_OFFSET: usize = 512;

/// Size of the self-describing configuration record in the header.
pub const CONFIG_RECORD_SIZE: usize = 64;

/// Per-segment header size.
pub const SEG_HDR_SIZE: usize = 32;

// Field offsets within a segment header.
pub const SEG_LOCK_WORD: usize = 0;
pub const SEG_ENTRY_COUNT: usize = 8;
pub const SEG_TIER_COUNT: usize = 12;
pub const SEG_HEAD_TIER: usize = 16;
pub const SEG_LAST_HOLDER_PID: usize = 20;
pub const SEG_FLAGS: usize = 24;

/// Segment flag: an exclusive lock holder died while holding this segment;
/// contents are suspect until recovery clears the flag.
pub const FLAG_MAYBE_INCONSISTENT: u32 = 1;

/// One slot is a single 64-bit word, published atomically.
pub const SLOT_SIZE: usize = 8;

/// Tier header size; the packed entry payload follows it.
pub const TIER_HDR_SIZE: usize = 64;

// Field offsets within a tier header. Link fields use +1 encoding so the
// zero-initialized region reads as "none"/"unowned".
pub const TIER_NEXT_PLUS_ONE: usize = 0;
pub const TIER_ALLOC_CURSOR: usize = 4;
pub const TIER_FREE_HEAD_PLUS_ONE: usize = 8;
pub const TIER_FREED_BYTES: usize = 12;
pub const TIER_OWNER_PLUS_ONE: usize = 16;

/// Entries begin at offsets aligned to this within a tier payload.
pub const ENTRY_ALIGN: usize = 8;

/// Entry frame word size (31-bit payload length, high dead bit).
pub const FRAME_SIZE: usize = 4;

/// Dead bit in an entry frame word.
pub const FRAME_DEAD_BIT: u32 = 1 << 31;

/// Payload-length mask of an entry frame word.
pub const FRAME_LEN_MASK: u32 = !FRAME_DEAD_BIT;

/// Per-entry checksum size when `checksum_entries` is enabled.
pub const CHECKSUM_SIZE: usize = 4;

/// Hard ceiling on the configured bloat factor.
pub const MAX_BLOAT_FACTOR: f64 = 10.0;

/// Tier indices are stored in 14 bits of the slot word.
pub const MAX_TIERS: u32 = 1 << 14;

/// Largest byte offset a slot word can address inside one tier.
pub const MAX_TIER_BYTES: u64 = 1 << 32;

const _: () = assert!(HEADER_SIZE % ENTRY_ALIGN == 0);
const _: () = assert!(SEG_HDR_SIZE % 8 == 0);
const _: () = assert!(TIER_HDR_SIZE % ENTRY_ALIGN == 0);
const _: () = assert!(SEG_FLAGS + 4 <= SEG_HDR_SIZE);
const _: () = assert!(TIER_OWNER_PLUS_ONE + 4 <= TIER_HDR_SIZE);
const _: () = assert!(TIER_ALLOC_OFFSET >= 36 + CONFIG_RECORD_SIZE);
const _: () = assert!(TIER_ALLOC_OFFSET + 4 <= HEADER_SIZE);
