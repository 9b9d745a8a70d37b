//! # Iteration
//!
//! Visitor-driven iteration over every entry, one segment at a time.
//! Segments are visited in index order; each segment's read lock is held
//! for exactly the duration of its visit, so entries present when the
//! segment's scan starts are each visited exactly once. Entries inserted
//! concurrently into not-yet-visited segments may or may not be seen.
//!
//! The visitor must not acquire a lock on the same or a higher-indexed
//! segment: the read lock already held here composes with the lowest-
//! segment-first acquisition order the rest of the crate requires, and
//! breaking it risks deadlock.

use eyre::Result;

use crate::store::Store;

/// A borrowed view of one entry during iteration.
#[derive(Debug)]
pub struct EntryView<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub segment: u32,
}

impl Store {
    /// Visits every entry. The visitor returns `Ok(())` to continue.
    pub fn for_each_entry(&self, mut visitor: impl FnMut(EntryView<'_>) -> Result<()>) -> Result<()> {
        self.for_each_entry_while(|entry| {
            visitor(entry)?;
            Ok(true)
        })
    }

    /// Visits entries until the visitor returns `Ok(false)`.
    pub fn for_each_entry_while(
        &self,
        mut visitor: impl FnMut(EntryView<'_>) -> Result<bool>,
    ) -> Result<()> {
        for seg_ix in 0..self.layout().seg_count {
            let seg = self.segment(seg_ix);
            let lock = seg.lock();
            lock.lock_read()?;

            let mut keep_going = true;
            let visit = seg.slots().for_each_occupied(|_, slot| {
                let decoded = seg.decode(slot)?;
                keep_going = visitor(EntryView {
                    key: decoded.key,
                    value: decoded.value,
                    segment: seg_ix,
                })?;
                Ok(keep_going)
            });

            lock.unlock_read();
            visit?;
            if !keep_going {
                return Ok(());
            }
        }
        Ok(())
    }
}
