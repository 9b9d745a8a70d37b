//! # Query Context
//!
//! A [`QueryContext`] is the scoped acquisition of one segment's lock on
//! behalf of one key. It exposes the present/absent state of the key,
//! supports upgrading the held lock, and performs mutations under the
//! guaranteed lock level. Dropping the context releases the lock on every
//! exit path, including failures.
//!
//! ## Lock State Machine
//!
//! The context tracks its own level and rejects illegal re-entrant
//! transitions statically — a context already at Update cannot
//! `upgrade_to_update` again, and a Write holder cannot "upgrade" at all.
//! These surface as the `Deadlock` error kind: the underlying lock would
//! wait forever for a seat this same context occupies.
//!
//! ## Raw Value Mutation
//!
//! `value_ptr` hands out a raw pointer to the value bytes (update or write
//! lock required). A caller that mutates through it must call
//! `update_checksum` before the context closes; skipping that is a contract
//! violation which recovery later treats as corruption and discards the
//! entry.

use eyre::{bail, Result};
use smallvec::SmallVec;

use crate::error::StoreError;
use crate::hash;
use crate::segment::lock::LockLevel;
use crate::segment::slots::{Probe, SlotEntry};
use crate::segment::SegmentRef;
use crate::store::Store;

/// A view of the live entry a context's key maps to.
pub struct EntryRef<'a> {
    key: &'a [u8],
    value: &'a [u8],
}

impl<'a> EntryRef<'a> {
    pub fn key(&self) -> &'a [u8] {
        self.key
    }

    pub fn value(&self) -> &'a [u8] {
        self.value
    }
}

/// Marker for the absent state: the key has a reserved insert position.
pub struct AbsentEntry {
    _insert_ix: u32,
}

enum KeyState {
    Present { slot_ix: u32, entry: SlotEntry },
    Absent { insert_ix: u32 },
}

/// Scoped ownership of a segment lock, keyed to one lookup key.
pub struct QueryContext<'s> {
    seg: SegmentRef<'s>,
    level: Option<LockLevel>,
    key: SmallVec<[u8; 32]>,
    hashed: u64,
    state: KeyState,
    payload_buf: Vec<u8>,
}

impl<'s> QueryContext<'s> {
    pub(crate) fn acquire(store: &'s Store, key: &[u8], level: LockLevel) -> Result<Self> {
        let hashed = hash::hash_key(key);
        let seg = store.segment(store.segment_for_hash(hashed));

        let lock = seg.lock();
        match level {
            LockLevel::Read => lock.lock_read()?,
            LockLevel::Update => lock.lock_update()?,
            LockLevel::Write => lock.lock_write()?,
        }

        Self::build(seg, key, hashed, level)
    }

    /// Non-blocking acquisition: `Ok(None)` when the lock is contended.
    pub(crate) fn try_acquire(
        store: &'s Store,
        key: &[u8],
        level: LockLevel,
    ) -> Result<Option<Self>> {
        let hashed = hash::hash_key(key);
        let seg = store.segment(store.segment_for_hash(hashed));

        let lock = seg.lock();
        let acquired = match level {
            LockLevel::Read => lock.try_lock_read()?,
            LockLevel::Update => lock.try_lock_update()?,
            LockLevel::Write => lock.try_lock_write()?,
        };
        if !acquired {
            return Ok(None);
        }

        Self::build(seg, key, hashed, level).map(Some)
    }

    fn build(seg: SegmentRef<'s>, key: &[u8], hashed: u64, level: LockLevel) -> Result<Self> {
        let mut ctx = Self {
            seg,
            level: Some(level),
            key: SmallVec::from_slice(key),
            hashed,
            state: KeyState::Absent { insert_ix: 0 },
            payload_buf: Vec::new(),
        };

        match ctx.reprobe() {
            Ok(()) => Ok(ctx),
            Err(e) => {
                // Drop releases the lock.
                drop(ctx);
                Err(e)
            }
        }
    }

    /// The segment this context holds.
    pub fn segment(&self) -> u32 {
        self.seg.segment()
    }

    /// The lock level currently held.
    pub fn level(&self) -> LockLevel {
        self.level.expect("context already closed")
    }

    /// The context's key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// A view of the live entry for the key, or `None` if absent.
    pub fn entry(&self) -> Result<Option<EntryRef<'_>>> {
        match self.state {
            KeyState::Present { entry, .. } => {
                let decoded = self.seg.decode(entry)?;
                Ok(Some(EntryRef {
                    key: decoded.key,
                    value: decoded.value,
                }))
            }
            KeyState::Absent { .. } => Ok(None),
        }
    }

    /// A handle for the absent state, or `None` if the key is present.
    pub fn absent(&self) -> Option<AbsentEntry> {
        match self.state {
            KeyState::Absent { insert_ix } => Some(AbsentEntry {
                _insert_ix: insert_ix,
            }),
            KeyState::Present { .. } => None,
        }
    }

    /// Read → Update. Fails with `Deadlock` from any other level: this
    /// context already holds the seat it would be waiting for.
    pub fn upgrade_to_update(&mut self) -> Result<()> {
        match self.level() {
            LockLevel::Read => {
                self.seg.lock().upgrade_read_to_update()?;
                self.level = Some(LockLevel::Update);
                Ok(())
            }
            _ => Err(self.deadlock().into()),
        }
    }

    /// Read or Update → Write.
    pub fn upgrade_to_write(&mut self) -> Result<()> {
        match self.level() {
            LockLevel::Read => {
                self.seg.lock().upgrade_read_to_update()?;
                self.level = Some(LockLevel::Update);
                self.seg.lock().upgrade_update_to_write()?;
                self.level = Some(LockLevel::Write);
                Ok(())
            }
            LockLevel::Update => {
                self.seg.lock().upgrade_update_to_write()?;
                self.level = Some(LockLevel::Write);
                Ok(())
            }
            LockLevel::Write => Err(self.deadlock().into()),
        }
    }

    /// Write → Update, without an exclusion gap.
    pub fn downgrade_to_update(&mut self) -> Result<()> {
        match self.level() {
            LockLevel::Write => {
                self.seg.lock().downgrade_write_to_update();
                self.level = Some(LockLevel::Update);
                Ok(())
            }
            other => bail!("cannot downgrade to update from {:?}", other),
        }
    }

    /// Update → Read, without an exclusion gap.
    pub fn downgrade_to_read(&mut self) -> Result<()> {
        match self.level() {
            LockLevel::Update => {
                self.seg.lock().downgrade_update_to_read();
                self.level = Some(LockLevel::Read);
                Ok(())
            }
            other => bail!("cannot downgrade to read from {:?}", other),
        }
    }

    /// Publishes a new entry for the key. Requires the absent state and an
    /// update or write lock.
    pub fn insert(&mut self, value: &[u8]) -> Result<()> {
        self.require_mutable("insert")?;
        let insert_ix = match self.state {
            KeyState::Absent { insert_ix } => insert_ix,
            KeyState::Present { .. } => bail!("insert requires the key to be absent"),
        };

        let mut payload_buf = std::mem::take(&mut self.payload_buf);
        let result = self.seg.insert(
            insert_ix,
            self.hashed,
            &self.key,
            value,
            self.level(),
            &mut payload_buf,
        );
        self.payload_buf = payload_buf;
        result?;
        self.reprobe()
    }

    /// Replaces the value of the present entry: same size in place, else
    /// allocate-and-swap. Requires update or write lock.
    pub fn replace_value(&mut self, value: &[u8]) -> Result<()> {
        self.require_mutable("replace_value")?;
        let (slot_ix, entry) = match self.state {
            KeyState::Present { slot_ix, entry } => (slot_ix, entry),
            KeyState::Absent { .. } => bail!("replace_value requires the key to be present"),
        };

        let mut payload_buf = std::mem::take(&mut self.payload_buf);
        let result = self.seg.replace(
            slot_ix,
            entry,
            self.hashed,
            &self.key,
            value,
            self.level(),
            &mut payload_buf,
        );
        self.payload_buf = payload_buf;
        result?;
        self.reprobe()
    }

    /// Tombstones the present entry. Requires update or write lock.
    pub fn remove(&mut self) -> Result<()> {
        self.require_mutable("remove")?;
        match self.state {
            KeyState::Present { slot_ix, entry } => {
                self.seg.remove(slot_ix, entry);
                self.reprobe()
            }
            KeyState::Absent { .. } => bail!("remove requires the key to be present"),
        }
    }

    /// Raw pointer to the value bytes for direct mutation; the length is
    /// the value size. Requires the present state and an update or write
    /// lock. Mutating through this pointer obligates the caller to
    /// [`QueryContext::update_checksum`] before the context closes.
    pub fn value_ptr(&mut self) -> Result<(*mut u8, usize)> {
        self.require_mutable("value_ptr")?;
        match self.state {
            KeyState::Present { entry, .. } => {
                let decoded = self.seg.decode(entry)?;
                let tier = self.seg.tier(entry.tier_ix);
                let offset = tier.entry_payload_offset(entry.entry_offset) + decoded.value_offset;
                let len = decoded.value.len();
                // SAFETY: offset is within the mapping (derived from a live
                // entry) and the caller holds update/write exclusion.
                Ok((unsafe { tier.region().as_ptr().add(offset) }, len))
            }
            KeyState::Absent { .. } => bail!("value_ptr requires the key to be present"),
        }
    }

    /// Recomputes and stores the entry checksum from the current key and
    /// value bytes. Requires update or write lock.
    pub fn update_checksum(&mut self) -> Result<()> {
        self.require_mutable("update_checksum")?;
        if !self.seg.layout().checksum {
            return Ok(());
        }
        match self.state {
            KeyState::Present { entry, .. } => {
                let decoded = self.seg.decode(entry)?;
                let checksum = hash::entry_checksum(decoded.key, decoded.value);
                let tier = self.seg.tier(entry.tier_ix);
                let offset = tier.entry_payload_offset(entry.entry_offset)
                    + decoded.value_offset
                    + decoded.value.len();
                tier.region().write_bytes(offset, &checksum.to_le_bytes());
                Ok(())
            }
            KeyState::Absent { .. } => bail!("update_checksum requires the key to be present"),
        }
    }

    /// Recomputes the checksum and compares it to the stored one; never
    /// mutates. Entries without checksums verify trivially.
    pub fn verify_checksum(&self) -> Result<bool> {
        match self.state {
            KeyState::Present { entry, .. } => Ok(self.seg.decode(entry)?.checksum_ok()),
            KeyState::Absent { .. } => bail!("verify_checksum requires the key to be present"),
        }
    }

    /// Releases the lock. Equivalent to dropping the context, but lets the
    /// release point read explicitly at call sites.
    pub fn close(mut self) {
        self.release();
    }

    fn reprobe(&mut self) -> Result<()> {
        self.state = match self.seg.find(self.hashed, &self.key)? {
            Probe::Present { slot_ix, entry } => KeyState::Present { slot_ix, entry },
            Probe::Absent { insert_ix } => KeyState::Absent { insert_ix },
        };
        Ok(())
    }

    fn require_mutable(&self, op: &str) -> Result<()> {
        match self.level() {
            LockLevel::Update | LockLevel::Write => Ok(()),
            LockLevel::Read => bail!(
                "{} requires an update or write lock; upgrade the context first",
                op
            ),
        }
    }

    fn deadlock(&self) -> StoreError {
        StoreError::Deadlock {
            segment: self.seg.segment(),
        }
    }

    fn release(&mut self) {
        if let Some(level) = self.level.take() {
            let lock = self.seg.lock();
            match level {
                LockLevel::Read => lock.unlock_read(),
                LockLevel::Update => lock.unlock_update(),
                LockLevel::Write => lock.unlock_write(),
            }
        }
    }
}

impl Drop for QueryContext<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
