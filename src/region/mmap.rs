//! # Memory Region Manager
//!
//! `Region` owns the memory mapping that holds the entire store: a shared
//! file mapping for persistent stores, or an anonymous mapping for in-memory
//! stores. It hands out a linear byte window to every other component.
//!
//! ## Shared Mutation Model
//!
//! Unlike a single-process pager, this mapping is mutated concurrently by
//! multiple threads *and multiple processes*. Exclusive `&mut self` access
//! can therefore never be the safety story; instead:
//!
//! - All cross-process coordination state (lock words, slot words, tier
//!   header fields, counters) is accessed through `&AtomicU32`/`&AtomicU64`
//!   references carved out of the mapping at fixed, aligned offsets.
//! - Bulk entry bytes are read and written through raw pointers while the
//!   owning segment's lock is held at the level the operation requires.
//!
//! The `mmap` system call gives all processes on the host a coherent view of
//! a `MAP_SHARED` file mapping; acquire/release atomics on the lock words
//! order the plain byte accesses around them.
//!
//! ## Durability
//!
//! `flush` is best-effort `msync`. The store's crash-safety story does not
//! depend on flush ordering: recovery rebuilds the index from entry payloads
//! and discards entries whose checksum fails.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64};

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapOptions, MmapRaw};

use crate::error::StoreError;

/// A mapped byte region, file-backed or anonymous.
#[derive(Debug)]
pub struct Region {
    raw: MmapRaw,
    len: usize,
    file_backed: bool,
}

impl Region {
    /// Creates a file-backed region of exactly `len` bytes.
    ///
    /// The file must not exist or must be empty; the new bytes are
    /// zero-filled by the OS, which the rest of the format relies on
    /// (zeroed slot arrays and tier headers are valid empty state).
    pub fn create_file<P: AsRef<Path>>(path: P, len: usize) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to create region file '{}'", path.display()))?;

        let existing = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            existing == 0,
            "refusing to create store over non-empty file '{}' ({} bytes)",
            path.display(),
            existing
        );

        file.set_len(len as u64)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), len))?;

        let raw = MmapOptions::new()
            .len(len)
            .map_raw(&file)
            .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?;

        tracing::debug!(path = %path.display(), len, "created file-backed region");

        Ok(Self {
            raw,
            len,
            file_backed: true,
        })
    }

    /// Maps an existing region file in its entirety.
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open region file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(len > 0, "cannot map empty region file '{}'", path.display());
        ensure!(
            len <= usize::MAX as u64,
            "region file '{}' too large to map",
            path.display()
        );

        let len = len as usize;
        let raw = MmapOptions::new()
            .len(len)
            .map_raw(&file)
            .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?;

        tracing::debug!(path = %path.display(), len, "opened file-backed region");

        Ok(Self {
            raw,
            len,
            file_backed: true,
        })
    }

    /// Creates an anonymous region for purely in-memory stores.
    ///
    /// Visible to all threads of this process; other processes can share it
    /// only via a tmpfs-backed file, which goes through [`Region::create_file`].
    pub fn create_anonymous(len: usize) -> Result<Self> {
        let mmap = MmapOptions::new()
            .len(len)
            .map_anon()
            .wrap_err("failed to create anonymous region")?;

        tracing::debug!(len, "created anonymous region");

        Ok(Self {
            raw: MmapRaw::from(mmap),
            len,
            file_backed: false,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.raw.as_mut_ptr()
    }

    /// Immutable view of `len` bytes at `offset`.
    ///
    /// The returned slice aliases shared memory; callers must hold a lock
    /// level that excludes writers of this range for the borrow's duration.
    #[inline]
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        self.check_range(offset, len);
        // SAFETY: the range was bounds-checked against the mapping, the
        // mapping lives as long as self, and the caller upholds the lock
        // discipline that keeps concurrent writers out of this range.
        unsafe { std::slice::from_raw_parts(self.as_ptr().add(offset), len) }
    }

    /// Copies `src` into the region at `offset`.
    ///
    /// Goes through a raw pointer rather than `&mut [u8]` so no exclusive
    /// reference to shared memory is ever materialized. Callers must hold
    /// the owning segment's update or write lock (or have exclusive access
    /// to the whole region, as create and recovery do).
    #[inline]
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        self.check_range(offset, src.len());
        // SAFETY: bounds-checked above; exclusion is provided by the
        // caller's lock level per this method's contract.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(offset), src.len());
        }
    }

    /// Zeroes `len` bytes at `offset` under the same contract as
    /// [`Region::write_bytes`].
    #[inline]
    pub fn zero_bytes(&self, offset: usize, len: usize) {
        self.check_range(offset, len);
        // SAFETY: bounds-checked above; exclusion per the caller's lock.
        unsafe {
            std::ptr::write_bytes(self.as_ptr().add(offset), 0, len);
        }
    }

    /// An atomic u32 cell at `offset` (must be 4-byte aligned).
    #[inline]
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        self.check_range(offset, 4);
        debug_assert_eq!(offset % 4, 0, "misaligned atomic u32 at {}", offset);
        // SAFETY: in-bounds and aligned; AtomicU32 has no invalid bit
        // patterns, and the mapping outlives the returned reference.
        unsafe { &*(self.as_ptr().add(offset) as *const AtomicU32) }
    }

    /// An atomic u64 cell at `offset` (must be 8-byte aligned).
    #[inline]
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        self.check_range(offset, 8);
        debug_assert_eq!(offset % 8, 0, "misaligned atomic u64 at {}", offset);
        // SAFETY: as for atomic_u32.
        unsafe { &*(self.as_ptr().add(offset) as *const AtomicU64) }
    }

    /// A contiguous run of atomic u64 cells (8-byte aligned), used for the
    /// slot arrays.
    #[inline]
    pub fn atomic_u64_slice(&self, offset: usize, count: usize) -> &[AtomicU64] {
        self.check_range(offset, count * 8);
        debug_assert_eq!(offset % 8, 0, "misaligned atomic u64 slice at {}", offset);
        // SAFETY: in-bounds, aligned, and AtomicU64 is a transparent u64
        // cell, so reinterpreting the mapped words is sound; the mapping
        // outlives the returned slice.
        unsafe { std::slice::from_raw_parts(self.as_ptr().add(offset) as *const AtomicU64, count) }
    }

    /// Synchronous flush of the whole mapping (no-op for anonymous
    /// regions). A failure is a transient `Io`: state is not corrupted.
    pub fn flush(&self) -> Result<()> {
        if !self.file_backed {
            return Ok(());
        }
        self.raw
            .flush()
            .map_err(StoreError::Io)
            .wrap_err("failed to flush region to disk")
    }

    /// Asynchronous flush request.
    pub fn flush_async(&self) -> Result<()> {
        if !self.file_backed {
            return Ok(());
        }
        self.raw
            .flush_async()
            .map_err(StoreError::Io)
            .wrap_err("failed to schedule region flush")
    }

    /// Advises the kernel to fault the whole region in, so first access
    /// does not pay demand-paging latency.
    pub fn pre_touch(&self) {
        #[cfg(unix)]
        // SAFETY: madvise over the exact mapped range is a kernel hint; the
        // pointer and length describe the live mapping owned by self.
        unsafe {
            libc::madvise(
                self.as_ptr() as *mut libc::c_void,
                self.len,
                libc::MADV_WILLNEED,
            );
        }
    }

    #[inline]
    fn check_range(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "region access out of bounds: offset={} len={} region={}",
            offset,
            len,
            self.len
        );
    }
}

// SAFETY: Region is an owning handle to a mapping whose concurrent use is
// governed by the atomics carved out of it; the handle itself carries no
// thread-affine state.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    #[test]
    fn create_open_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region");

        {
            let region = Region::create_file(&path, 8192).unwrap();
            region.write_bytes(100, b"hello");
            region.flush().unwrap();
        }

        let region = Region::open_file(&path).unwrap();
        assert_eq!(region.len(), 8192);
        assert_eq!(region.bytes(100, 5), b"hello");
    }

    #[test]
    fn create_over_non_empty_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region");
        std::fs::write(&path, b"junk").unwrap();

        assert!(Region::create_file(&path, 4096).is_err());
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempdir().unwrap();
        assert!(Region::open_file(dir.path().join("absent")).is_err());
    }

    #[test]
    fn new_region_is_zeroed() {
        let region = Region::create_anonymous(4096).unwrap();
        assert!(region.bytes(0, 4096).iter().all(|&b| b == 0));
    }

    #[test]
    fn atomics_share_the_underlying_bytes() {
        let region = Region::create_anonymous(4096).unwrap();

        region.atomic_u64(64).store(0xDEAD_BEEF_u64, Ordering::Release);
        assert_eq!(
            u64::from_le_bytes(region.bytes(64, 8).try_into().unwrap()),
            0xDEAD_BEEF_u64
        );

        region.atomic_u32(128).store(7, Ordering::Release);
        assert_eq!(region.atomic_u32(128).load(Ordering::Acquire), 7);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_bounds_access_panics() {
        let region = Region::create_anonymous(4096).unwrap();
        region.bytes(4090, 16);
    }
}
