//! # Short Transaction Id Pool
//!
//! Log records identify their transaction with a 2-byte short id instead of
//! the engine's full transaction id. Short ids come from a fixed pool and
//! are recycled: claiming scans a bitmap of `AtomicU64` words and sets a
//! bit with a CAS, releasing clears it — no locks on either path.
//!
//! Each id slot additionally carries the state the write hooks need:
//!
//! - the full transaction id, logged once per assignment through a
//!   [`LongTransactionId`](crate::RecordType::LongTransactionId) record
//!   before the transaction's first undo/redo record;
//! - the head of the transaction's undo chain, advanced by the undo
//!   record types' `in_write` hook.
//!
//! Slot state is reset when the id is claimed, so a recycled id never leaks
//! the previous transaction's chain.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eyre::{bail, Result};

use crate::config::SHORT_ID_COUNT;
use crate::lsn::Lsn;

const BITMAP_WORDS: usize = SHORT_ID_COUNT / 64;

struct SlotState {
    long_id: AtomicU64,
    undo_chain: AtomicU64,
    long_id_logged: AtomicBool,
}

impl SlotState {
    const fn new() -> Self {
        Self {
            long_id: AtomicU64::new(0),
            undo_chain: AtomicU64::new(0),
            long_id_logged: AtomicBool::new(false),
        }
    }
}

pub struct ShortIdPool {
    bitmap: [AtomicU64; BITMAP_WORDS],
    slots: Vec<SlotState>,
}

impl ShortIdPool {
    #[allow(clippy::declare_interior_mutable_const)]
    pub fn new() -> Self {
        const WORD_INIT: AtomicU64 = AtomicU64::new(0);
        Self {
            #[allow(clippy::borrow_interior_mutable_const)]
            bitmap: [WORD_INIT; BITMAP_WORDS],
            slots: (0..SHORT_ID_COUNT).map(|_| SlotState::new()).collect(),
        }
    }

    /// Claims a free id for the transaction `long_id`. Ids are 1-based;
    /// 0 is the "no transaction" sentinel used by maintenance records.
    pub fn assign(&self, long_id: u64) -> Result<u16> {
        for (word_idx, word) in self.bitmap.iter().enumerate() {
            let mut current = word.load(Ordering::Relaxed);
            loop {
                let free = !current;
                if free == 0 {
                    break;
                }
                let bit = free.trailing_zeros() as usize;
                match word.compare_exchange_weak(
                    current,
                    current | 1 << bit,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let slot_idx = word_idx * 64 + bit;
                        let slot = &self.slots[slot_idx];
                        slot.long_id.store(long_id, Ordering::Release);
                        slot.undo_chain.store(0, Ordering::Release);
                        slot.long_id_logged.store(false, Ordering::Release);
                        return Ok(slot_idx as u16 + 1);
                    }
                    Err(actual) => current = actual,
                }
            }
        }
        bail!("short id pool exhausted ({SHORT_ID_COUNT} concurrent transactions)")
    }

    /// Returns an id to the pool.
    pub fn release(&self, id: u16) {
        debug_assert!(id != 0 && id as usize <= SHORT_ID_COUNT, "invalid short id {id}");
        let slot_idx = id as usize - 1;
        let word = &self.bitmap[slot_idx / 64];
        let mask = 1u64 << (slot_idx % 64);
        let prev = word.fetch_and(!mask, Ordering::AcqRel);
        debug_assert!(prev & mask != 0, "release of unassigned short id {id}");
    }

    pub fn long_id(&self, id: u16) -> u64 {
        self.slot(id).long_id.load(Ordering::Acquire)
    }

    /// Marks the long id as logged; returns whether this call won the race
    /// and must write the record.
    pub fn mark_long_id_logged(&self, id: u16) -> bool {
        !self.slot(id).long_id_logged.swap(true, Ordering::AcqRel)
    }

    pub fn undo_chain_head(&self, id: u16) -> Lsn {
        Lsn::from_raw(self.slot(id).undo_chain.load(Ordering::Acquire))
    }

    pub fn set_undo_chain_head(&self, id: u16, lsn: Lsn) {
        self.slot(id).undo_chain.store(lsn.raw(), Ordering::Release);
    }

    pub fn assigned_count(&self) -> usize {
        self.bitmap
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    fn slot(&self, id: u16) -> &SlotState {
        debug_assert!(id != 0 && id as usize <= SHORT_ID_COUNT, "invalid short id {id}");
        &self.slots[id as usize - 1]
    }
}

impl Default for ShortIdPool {
    fn default() -> Self {
        Self::new()
    }
}
