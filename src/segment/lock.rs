//! # Inter-Process Segment Lock
//!
//! A three-level read/update/write lock packed into one atomic u64 that
//! lives *inside the mapped region*, so every process that maps the file
//! contends on the same word.
//!
//! ## Word Layout
//!
//! ```text
//! bits 63..32   PID of the exclusive (update or write) holder
//! bit  31       write held
//! bit  30       update held
//! bits 29..0    reader count
//! ```
//!
//! ## Levels
//!
//! - **Read** — shared; any number of holders; excluded only by Write.
//! - **Update** — at most one holder; coexists with readers; excludes other
//!   Update and Write. The update holder is the only party allowed to
//!   mutate the segment while readers are present, which is what makes the
//!   publish-last entry protocol work.
//! - **Write** — exclusive against everything.
//!
//! Upgrades: Read→Update (waits for the update seat), Update→Write (waits
//! for readers to drain). Downgrades never open an exclusion gap: the CAS
//! that drops Write simultaneously takes Update, and so on.
//!
//! ## Waiting
//!
//! Acquisition spins briefly, yields, then parks. On Linux the park is a
//! `futex` wait on the low half of the lock word with a bounded timeout;
//! every release that could unblock a waiter wakes the word. Elsewhere the
//! park degrades to a short sleep. The timeout means a missed wake costs a
//! retry, never a hang.
//!
//! ## Dead Holders
//!
//! An exclusive holder records its PID in the word. When an acquisition
//! finds an exclusive holder whose process no longer exists, it clears the
//! exclusive bits (keeping any reader count), flags the segment
//! `MAYBE_INCONSISTENT`, and fails with `Poisoned`: the dead process may
//! have died mid-mutation, so the segment cannot be trusted until recovery
//! rescans it. Reader counts carry no PID; a reader that dies while parked
//! leaks a count until recovery resets the word — the acknowledged residual
//! risk of PID-based liveness.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use eyre::Result;

use crate::config::FLAG_MAYBE_INCONSISTENT;
use crate::error::StoreError;

const READERS_MASK: u64 = 0x3FFF_FFFF;
const UPDATE_BIT: u64 = 1 << 30;
const WRITE_BIT: u64 = 1 << 31;
const STATE_MASK: u64 = 0xFFFF_FFFF;
const EXCLUSIVE_MASK: u64 = UPDATE_BIT | WRITE_BIT;
const PID_SHIFT: u32 = 32;

const SPIN_LIMIT: u32 = 128;
const YIELD_LIMIT: u32 = 32;

/// The level a query context holds on its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    Read,
    Update,
    Write,
}

/// A view of one segment's lock state inside the region.
#[derive(Clone, Copy)]
pub struct SegmentLock<'a> {
    word: &'a AtomicU64,
    flags: &'a AtomicU32,
    last_holder_pid: &'a AtomicU32,
    segment: u32,
}

impl<'a> SegmentLock<'a> {
    pub fn new(
        word: &'a AtomicU64,
        flags: &'a AtomicU32,
        last_holder_pid: &'a AtomicU32,
        segment: u32,
    ) -> Self {
        Self {
            word,
            flags,
            last_holder_pid,
            segment,
        }
    }

    pub fn segment(&self) -> u32 {
        self.segment
    }

    pub fn lock_read(&self) -> Result<()> {
        self.check_poisoned()?;
        let mut attempts = 0u32;
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if cur & WRITE_BIT == 0 && cur & READERS_MASK < READERS_MASK {
                if self
                    .word
                    .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            self.reclaim_if_dead(cur)?;
            self.backoff(&mut attempts, cur);
            self.check_poisoned()?;
        }
    }

    pub fn try_lock_read(&self) -> Result<bool> {
        self.check_poisoned()?;
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if cur & WRITE_BIT != 0 || cur & READERS_MASK == READERS_MASK {
                self.reclaim_if_dead(cur)?;
                return Ok(false);
            }
            if self
                .word
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(true);
            }
        }
    }

    pub fn unlock_read(&self) {
        let prev = self.word.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & READERS_MASK > 0, "unlock_read without a read lock");
        // An upgrade waiter parks until the reader count drains to zero.
        if (prev - 1) & READERS_MASK == 0 {
            self.wake();
        }
    }

    pub fn lock_update(&self) -> Result<()> {
        self.check_poisoned()?;
        let pid_bits = (current_pid() as u64) << PID_SHIFT;
        let mut attempts = 0u32;
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if cur & EXCLUSIVE_MASK == 0 {
                let new = (cur & READERS_MASK) | UPDATE_BIT | pid_bits;
                if self
                    .word
                    .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.record_holder();
                    return Ok(());
                }
                continue;
            }
            self.reclaim_if_dead(cur)?;
            self.backoff(&mut attempts, cur);
            self.check_poisoned()?;
        }
    }

    pub fn try_lock_update(&self) -> Result<bool> {
        self.check_poisoned()?;
        let pid_bits = (current_pid() as u64) << PID_SHIFT;
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if cur & EXCLUSIVE_MASK != 0 {
                self.reclaim_if_dead(cur)?;
                return Ok(false);
            }
            let new = (cur & READERS_MASK) | UPDATE_BIT | pid_bits;
            if self
                .word
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.record_holder();
                return Ok(true);
            }
        }
    }

    pub fn unlock_update(&self) {
        loop {
            let cur = self.word.load(Ordering::Acquire);
            debug_assert!(cur & UPDATE_BIT != 0, "unlock_update without an update lock");
            let new = cur & READERS_MASK;
            if self
                .word
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.wake();
                return;
            }
        }
    }

    pub fn lock_write(&self) -> Result<()> {
        self.check_poisoned()?;
        let pid_bits = (current_pid() as u64) << PID_SHIFT;
        let mut attempts = 0u32;
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if cur & STATE_MASK == 0 {
                if self
                    .word
                    .compare_exchange_weak(
                        cur,
                        WRITE_BIT | pid_bits,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.record_holder();
                    return Ok(());
                }
                continue;
            }
            self.reclaim_if_dead(cur)?;
            self.backoff(&mut attempts, cur);
            self.check_poisoned()?;
        }
    }

    pub fn try_lock_write(&self) -> Result<bool> {
        self.check_poisoned()?;
        let pid_bits = (current_pid() as u64) << PID_SHIFT;
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if cur & STATE_MASK != 0 {
                self.reclaim_if_dead(cur)?;
                return Ok(false);
            }
            if self
                .word
                .compare_exchange_weak(
                    cur,
                    WRITE_BIT | pid_bits,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.record_holder();
                return Ok(true);
            }
        }
    }

    pub fn unlock_write(&self) {
        debug_assert!(
            self.word.load(Ordering::Relaxed) & WRITE_BIT != 0,
            "unlock_write without a write lock"
        );
        // Nothing else can change the word while the write bit is set.
        self.word.store(0, Ordering::Release);
        self.wake();
    }

    /// Read→Update: gives up this holder's reader slot and takes the update
    /// seat in one CAS, waiting for any current update holder to leave.
    pub fn upgrade_read_to_update(&self) -> Result<()> {
        let pid_bits = (current_pid() as u64) << PID_SHIFT;
        let mut attempts = 0u32;
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if cur & EXCLUSIVE_MASK == 0 {
                debug_assert!(cur & READERS_MASK >= 1, "upgrade without a read lock");
                let new = ((cur & READERS_MASK) - 1) | UPDATE_BIT | pid_bits;
                if self
                    .word
                    .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.record_holder();
                    return Ok(());
                }
                continue;
            }
            self.reclaim_if_dead(cur)?;
            self.backoff(&mut attempts, cur);
        }
    }

    /// Update→Write: waits for the reader count to drain, then swaps the
    /// update bit for the write bit in one CAS.
    pub fn upgrade_update_to_write(&self) -> Result<()> {
        let pid_bits = (current_pid() as u64) << PID_SHIFT;
        let mut attempts = 0u32;
        loop {
            let cur = self.word.load(Ordering::Acquire);
            debug_assert!(cur & UPDATE_BIT != 0, "upgrade without an update lock");
            if cur & READERS_MASK == 0 {
                if self
                    .word
                    .compare_exchange_weak(
                        cur,
                        WRITE_BIT | pid_bits,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            self.backoff(&mut attempts, cur);
        }
    }

    /// Write→Update without an exclusion gap.
    pub fn downgrade_write_to_update(&self) {
        let pid_bits = (current_pid() as u64) << PID_SHIFT;
        debug_assert!(self.word.load(Ordering::Relaxed) & WRITE_BIT != 0);
        self.word.store(UPDATE_BIT | pid_bits, Ordering::Release);
        self.wake();
    }

    /// Update→Read without an exclusion gap.
    pub fn downgrade_update_to_read(&self) {
        loop {
            let cur = self.word.load(Ordering::Acquire);
            debug_assert!(cur & UPDATE_BIT != 0);
            let new = (cur & READERS_MASK) + 1;
            if self
                .word
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.wake();
                return;
            }
        }
    }

    /// Whether the segment carries the inconsistency flag.
    pub fn poisoned(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_MAYBE_INCONSISTENT != 0
    }

    /// Recovery only: reset the lock word and clear the inconsistency flag.
    /// Requires exclusive access to the region.
    pub(crate) fn force_reset(&self) {
        self.word.store(0, Ordering::Release);
        self.flags
            .fetch_and(!FLAG_MAYBE_INCONSISTENT, Ordering::AcqRel);
        self.wake();
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned() {
            return Err(StoreError::Poisoned {
                segment: self.segment,
            }
            .into());
        }
        Ok(())
    }

    /// Clears exclusive bits left by a dead process, flags the segment,
    /// and reports `Poisoned`. Keeps any reader count intact.
    fn reclaim_if_dead(&self, observed: u64) -> Result<()> {
        if observed & EXCLUSIVE_MASK == 0 {
            return Ok(());
        }
        let pid = (observed >> PID_SHIFT) as u32;
        if process_alive(pid) {
            return Ok(());
        }
        if self
            .word
            .compare_exchange(
                observed,
                observed & READERS_MASK,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.flags
                .fetch_or(FLAG_MAYBE_INCONSISTENT, Ordering::AcqRel);
            tracing::warn!(
                segment = self.segment,
                pid,
                "reclaimed segment lock from dead holder; segment flagged for recovery"
            );
            self.wake();
            return Err(StoreError::Poisoned {
                segment: self.segment,
            }
            .into());
        }
        Ok(())
    }

    fn record_holder(&self) {
        self.last_holder_pid.store(current_pid(), Ordering::Relaxed);
    }

    fn backoff(&self, attempts: &mut u32, observed: u64) {
        if *attempts < SPIN_LIMIT {
            std::hint::spin_loop();
        } else if *attempts < SPIN_LIMIT + YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            self.park((observed & STATE_MASK) as u32);
        }
        *attempts += 1;
    }

    /// Parks until the low half of the lock word changes from
    /// `expected_state`, with a bounded timeout as a missed-wake safety net.
    #[cfg(all(target_os = "linux", target_endian = "little"))]
    fn park(&self, expected_state: u32) {
        let addr = self.word.as_ptr() as *const u32;
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 1_000_000,
        };
        // SAFETY: addr points at the live low half of the lock word inside
        // the mapping; FUTEX_WAIT on a MAP_SHARED address is the documented
        // cross-process wait primitive and only sleeps, never writes.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                addr,
                libc::FUTEX_WAIT,
                expected_state,
                &timeout as *const libc::timespec,
            );
        }
    }

    #[cfg(not(all(target_os = "linux", target_endian = "little")))]
    fn park(&self, _expected_state: u32) {
        std::thread::sleep(std::time::Duration::from_micros(100));
    }

    #[cfg(all(target_os = "linux", target_endian = "little"))]
    fn wake(&self) {
        let addr = self.word.as_ptr() as *const u32;
        // SAFETY: wakes any futex waiters on the lock word; no memory is
        // accessed beyond the address itself.
        unsafe {
            libc::syscall(libc::SYS_futex, addr, libc::FUTEX_WAKE, i32::MAX);
        }
    }

    #[cfg(not(all(target_os = "linux", target_endian = "little")))]
    fn wake(&self) {}
}

#[inline]
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Whether a process with this PID currently exists on the host.
///
/// `kill(pid, 0)` probes existence without delivering a signal; EPERM means
/// the process exists but belongs to someone else. PID reuse can make a dead
/// holder look alive (false negative); the reverse cannot happen.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 performs validity checks only; no signal is sent.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64};
    use std::sync::{Arc, Barrier};

    struct Cell {
        word: AtomicU64,
        flags: AtomicU32,
        pid: AtomicU32,
    }

    impl Cell {
        fn new() -> Self {
            Self {
                word: AtomicU64::new(0),
                flags: AtomicU32::new(0),
                pid: AtomicU32::new(0),
            }
        }

        fn lock(&self) -> SegmentLock<'_> {
            SegmentLock::new(&self.word, &self.flags, &self.pid, 0)
        }
    }

    #[test]
    fn readers_share() {
        let cell = Cell::new();
        let lock = cell.lock();

        lock.lock_read().unwrap();
        lock.lock_read().unwrap();
        assert!(lock.try_lock_read().unwrap());

        lock.unlock_read();
        lock.unlock_read();
        lock.unlock_read();
        assert_eq!(cell.word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn write_excludes_everything() {
        let cell = Cell::new();
        let lock = cell.lock();

        lock.lock_write().unwrap();
        assert!(!lock.try_lock_read().unwrap());
        assert!(!lock.try_lock_update().unwrap());
        assert!(!lock.try_lock_write().unwrap());

        lock.unlock_write();
        assert!(lock.try_lock_read().unwrap());
        lock.unlock_read();
    }

    #[test]
    fn update_coexists_with_read_but_not_update() {
        let cell = Cell::new();
        let lock = cell.lock();

        lock.lock_update().unwrap();
        assert!(lock.try_lock_read().unwrap());
        assert!(!lock.try_lock_update().unwrap());
        assert!(!lock.try_lock_write().unwrap());

        lock.unlock_read();
        lock.unlock_update();
    }

    #[test]
    fn write_blocked_while_reader_present() {
        let cell = Cell::new();
        let lock = cell.lock();

        lock.lock_read().unwrap();
        assert!(!lock.try_lock_write().unwrap());
        lock.unlock_read();
        assert!(lock.try_lock_write().unwrap());
        lock.unlock_write();
    }

    #[test]
    fn upgrade_read_to_update_consumes_reader_slot() {
        let cell = Cell::new();
        let lock = cell.lock();

        lock.lock_read().unwrap();
        lock.upgrade_read_to_update().unwrap();

        assert_eq!(cell.word.load(Ordering::Relaxed) & READERS_MASK, 0);
        assert!(!lock.try_lock_update().unwrap());

        lock.unlock_update();
        assert_eq!(cell.word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn upgrade_update_to_write_waits_for_readers() {
        let cell = Arc::new(Cell::new());
        let barrier = Arc::new(Barrier::new(2));

        cell.lock().lock_update().unwrap();
        cell.lock().lock_read().unwrap();

        let cell2 = Arc::clone(&cell);
        let barrier2 = Arc::clone(&barrier);
        let handle = std::thread::spawn(move || {
            barrier2.wait();
            // Holds the reader briefly, then releases so the upgrade
            // in the main thread can complete.
            std::thread::sleep(std::time::Duration::from_millis(20));
            cell2.lock().unlock_read();
        });

        barrier.wait();
        cell.lock().upgrade_update_to_write().unwrap();
        assert!(!cell.lock().try_lock_read().unwrap());
        cell.lock().unlock_write();

        handle.join().unwrap();
    }

    #[test]
    fn downgrades_keep_exclusion() {
        let cell = Cell::new();
        let lock = cell.lock();

        lock.lock_write().unwrap();
        lock.downgrade_write_to_update();
        assert!(!lock.try_lock_update().unwrap());
        assert!(lock.try_lock_read().unwrap());
        lock.unlock_read();

        lock.downgrade_update_to_read();
        assert!(lock.try_lock_update().unwrap());
        lock.unlock_update();
        lock.unlock_read();
        assert_eq!(cell.word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn dead_holder_is_reclaimed_and_poisons_segment() {
        let cell = Cell::new();
        // A write lock held by a PID that cannot exist.
        let bogus_pid = 0x3FFF_FFF0u64;
        cell.word
            .store(WRITE_BIT | (bogus_pid << PID_SHIFT), Ordering::Release);

        let lock = cell.lock();
        let err = lock.lock_read().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Poisoned { .. })
        ));
        assert!(lock.poisoned());

        // Every subsequent acquisition keeps failing until recovery.
        let err = lock.lock_update().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Poisoned { .. })
        ));

        lock.force_reset();
        assert!(!lock.poisoned());
        lock.lock_read().unwrap();
        lock.unlock_read();
    }

    #[test]
    fn concurrent_writers_serialize() {
        let cell = Arc::new(Cell::new());
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let cell = Arc::clone(&cell);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let lock = cell.lock();
                    lock.lock_write().unwrap();
                    // Non-atomic read-modify-write made safe by the lock.
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    lock.unlock_write();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
    }

    #[test]
    fn process_alive_detects_self_and_bogus() {
        assert!(process_alive(current_pid()));
        assert!(!process_alive(0));
    }
}
