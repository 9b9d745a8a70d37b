//! # Region Module
//!
//! The foundation of the store: a single memory-mapped region holds every
//! piece of persistent state, addressed by byte offset from the start of
//! the mapping.
//!
//! - [`mmap`]: the `Region` mapping itself (file-backed or anonymous),
//!   atomic cell access, flush, pre-touch
//! - [`header`]: the self-describing header and configuration record
//! - [`layout`]: offset arithmetic from configuration to region addresses
//!
//! No other module computes region offsets or touches the mapping directly;
//! everything funnels through `Region` + `RegionLayout`.

pub mod header;
pub mod layout;
pub mod mmap;

pub use header::{RegionHeader, StoreConfig, REGION_HEADER_SIZE};
pub use layout::RegionLayout;
pub use mmap::Region;
