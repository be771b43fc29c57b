//! # Write Buffer Pool
//!
//! All record bytes pass through a fixed pool of [`BUFFER_COUNT`] in-memory
//! buffers. Each buffer, while bound, mirrors a contiguous page-aligned
//! byte range of exactly one log file; buffers rotate in a fixed cyclic
//! order as the log grows.
//!
//! ## Locking Discipline
//!
//! There is no log-wide mutex. "Locking the log" means locking the buffer
//! currently at the horizon and re-checking that it is still active — the
//! horizon may have rotated between the index load and the lock
//! acquisition ([`BufferPool::lock_log`]).
//!
//! The only compound acquisition is rotation: while holding buffer `i`, the
//! rotator locks buffer `i+1 mod N`. Locks are never taken against the
//! cycle, which structurally rules out deadlock.
//!
//! ## Write Protocol
//!
//! 1. Lock the log (active buffer).
//! 2. Reserve space: advance the fill cursor, laying down page and chunk
//!    headers; this may finish the current page, rotate to the next
//!    buffer, or roll to a new file.
//! 3. Increment the writer count of every touched buffer.
//! 4. Unlock.
//! 5. Copy payload bytes into the reserved ranges — no lock held; ranges
//!    of concurrent writers are disjoint by construction.
//! 6. Decrement writer counts, waking a flusher waiting for drain.
//!
//! A buffer may be flushed or rebound only once its writer count is zero.
//!
//! ## Placement Visibility
//!
//! Step 2 advances the horizon before step 5 copies the bytes, so the
//! bytes at the horizon are briefly unwritten. Scanners therefore never
//! trust the raw horizon: [`Inflight`] tracks reservations in horizon
//! order and exposes the *placed* horizon — the end of the longest prefix
//! of reservations whose copies have completed. A record is visible to
//! scanners only once every earlier reservation has landed.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::config::{BUFFER_CAPACITY, BUFFER_COUNT, BUFFER_PAGES, PAGE_SIZE};
use crate::lsn::Lsn;

pub(crate) type BufferId = usize;

/// Raw buffer bytes, written outside the buffer lock.
///
/// Reservation hands every writer a disjoint byte range, so concurrent
/// `copy_in` calls never overlap. `copy_out` may race with `copy_in` on
/// bytes beyond the placed horizon; callers never interpret those bytes
/// (readers are clamped to the placed horizon), they only pass through
/// page-sized copies.
pub(crate) struct BufferData {
    bytes: UnsafeCell<Box<[u8]>>,
}

unsafe impl Sync for BufferData {}

impl BufferData {
    fn new() -> Self {
        Self {
            bytes: UnsafeCell::new(vec![0u8; BUFFER_CAPACITY].into_boxed_slice()),
        }
    }

    /// # Safety
    /// The caller must hold a reservation covering `off..off + src.len()`.
    pub(crate) unsafe fn copy_in(&self, off: usize, src: &[u8]) {
        debug_assert!(off + src.len() <= BUFFER_CAPACITY);
        let base = (*self.bytes.get()).as_mut_ptr();
        std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(off), src.len());
    }

    /// # Safety
    /// The caller must hold the buffer lock (metadata stability); racing
    /// writer bytes beyond the placed horizon may be read but are never
    /// interpreted by callers.
    pub(crate) unsafe fn copy_out(&self, off: usize, dst: &mut [u8]) {
        debug_assert!(off + dst.len() <= BUFFER_CAPACITY);
        let base = (*self.bytes.get()).as_ptr();
        std::ptr::copy_nonoverlapping(base.add(off), dst.as_mut_ptr(), dst.len());
    }

    /// # Safety
    /// Same contract as [`Self::copy_in`].
    pub(crate) unsafe fn zero(&self, off: usize, len: usize) {
        debug_assert!(off + len <= BUFFER_CAPACITY);
        let base = (*self.bytes.get()).as_mut_ptr();
        std::ptr::write_bytes(base.add(off), 0, len);
    }
}

/// Metadata of one buffer, guarded by its slot mutex.
pub(crate) struct BufferState {
    /// File this buffer's range belongs to.
    pub file_no: u32,
    /// File offset of byte 0 of the buffer; always page-aligned.
    pub start_offset: u32,
    /// File offset one past the last byte this binding may hold: the file
    /// cap or `start_offset + BUFFER_CAPACITY`, whichever is lower.
    pub end_offset: u32,
    /// Size cap of `file_no`, frozen when the file was first bound so a
    /// concurrent `set_file_max_size` never moves a live file's end.
    pub file_cap: u32,
    /// Bytes reserved so far, relative to `start_offset`.
    pub fill: u32,
    /// Bytes already written to disk this binding, relative.
    pub written_to: u32,
    /// In-flight unlocked copies targeting this buffer.
    pub writers: u32,
    /// This buffer is at the horizon.
    pub active: bool,
    /// This buffer holds live bytes (active or awaiting flush).
    pub bound: bool,
    /// Disk-write generation per page slot, for sector protection.
    pub page_generations: [u8; BUFFER_PAGES],
    /// Predecessor buffer whose trailing partial page this binding carried
    /// over; its image of the shared page must reach disk first.
    pub overlay: Option<BufferId>,
}

impl BufferState {
    fn unbound() -> Self {
        Self {
            file_no: 0,
            start_offset: 0,
            end_offset: 0,
            file_cap: 0,
            fill: 0,
            written_to: 0,
            writers: 0,
            active: false,
            bound: false,
            page_generations: [0; BUFFER_PAGES],
            overlay: None,
        }
    }

    /// Horizon of this buffer as a file offset.
    #[inline]
    pub fn horizon_offset(&self) -> u32 {
        self.start_offset + self.fill
    }

    #[inline]
    pub fn horizon(&self) -> Lsn {
        Lsn::new(self.file_no, self.horizon_offset())
    }

    /// Bytes still reservable in this binding.
    #[inline]
    pub fn remaining(&self) -> u32 {
        self.end_offset - self.horizon_offset()
    }

    #[inline]
    pub fn page_slot(&self, rel_off: u32) -> usize {
        (rel_off as usize) / PAGE_SIZE
    }

    /// Rebinds this buffer to a fresh range.
    pub fn bind(&mut self, file_no: u32, start_offset: u32, end_offset: u32, file_cap: u32) {
        debug_assert_eq!(start_offset % PAGE_SIZE as u32, 0);
        debug_assert!(end_offset > start_offset);
        debug_assert!(end_offset - start_offset <= BUFFER_CAPACITY as u32);
        debug_assert!(end_offset <= file_cap);
        self.file_no = file_no;
        self.start_offset = start_offset;
        self.end_offset = end_offset;
        self.file_cap = file_cap;
        self.fill = 0;
        self.written_to = 0;
        self.active = false;
        self.bound = true;
        self.page_generations = [0; BUFFER_PAGES];
        self.overlay = None;
    }

    pub fn unbind(&mut self) {
        *self = Self::unbound();
    }
}

pub(crate) struct BufferSlot {
    pub state: Mutex<BufferState>,
    /// Signalled on every writer-count decrement; rotation and flush wait
    /// on it for their respective drain levels.
    pub drained: Condvar,
    pub data: BufferData,
}

pub(crate) struct BufferPool {
    slots: Vec<BufferSlot>,
    active: AtomicUsize,
}

impl BufferPool {
    pub fn new() -> Self {
        let slots = (0..BUFFER_COUNT)
            .map(|_| BufferSlot {
                state: Mutex::new(BufferState::unbound()),
                drained: Condvar::new(),
                data: BufferData::new(),
            })
            .collect();
        Self {
            slots,
            active: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn slot(&self, id: BufferId) -> &BufferSlot {
        &self.slots[id]
    }

    #[inline]
    pub fn next_id(&self, id: BufferId) -> BufferId {
        (id + 1) % BUFFER_COUNT
    }

    #[inline]
    pub fn active_id(&self) -> BufferId {
        self.active.load(Ordering::Acquire)
    }

    /// Locks the log: acquires the active buffer's mutex, re-verifying
    /// activity after acquisition since the horizon may have rotated.
    pub fn lock_log(&self) -> (BufferId, MutexGuard<'_, BufferState>) {
        loop {
            let id = self.active_id();
            let guard = self.slots[id].state.lock();
            if guard.active {
                return (id, guard);
            }
        }
    }

    /// Publishes `id` as the active buffer. Both the outgoing and incoming
    /// buffer locks are held by the caller (rotation).
    pub fn publish_active(&self, id: BufferId) {
        self.active.store(id, Ordering::Release);
    }

    /// Waits until `state.writers == 0`.
    pub fn wait_drained<'a>(
        &'a self,
        id: BufferId,
        guard: &mut MutexGuard<'a, BufferState>,
    ) {
        while guard.writers > 0 {
            self.slots[id].drained.wait(guard);
        }
    }

    /// Decrements the writer count after an unlocked copy completes.
    /// Every decrement notifies: rotation waits for a drain down to its
    /// own count, not necessarily to zero.
    pub fn writer_done(&self, id: BufferId) {
        let slot = &self.slots[id];
        let mut state = slot.state.lock();
        debug_assert!(state.writers > 0, "writer_done without reservation");
        state.writers -= 1;
        slot.drained.notify_all();
    }
}

/// One byte range a writer must copy: `rec_range` of the logical record
/// lands at `data_off` of `buffer`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CopySeg {
    pub buffer: BufferId,
    pub data_off: usize,
    pub rec_start: usize,
    pub len: usize,
}

/// Outcome of one reservation (a whole record, or one group of a
/// multi-group record).
pub(crate) struct Reservation {
    /// Address of the first chunk placed.
    pub lsn: Lsn,
    /// Horizon after the reservation.
    pub end: Lsn,
    /// Payload ranges the caller must copy, in record order.
    pub segs: SmallVec<[CopySeg; 8]>,
    /// Buffers whose writer count was incremented.
    pub touched: SmallVec<[BufferId; 2]>,
    /// Chunks laid down (group directories record this).
    pub chunk_count: u16,
    /// Completion token for the inflight queue.
    pub token: u64,
}

/// Horizon-ordered reservation tracker; computes the placed horizon.
pub(crate) struct Inflight {
    queue: Mutex<VecDeque<(u64, bool)>>,
    placed: AtomicU64,
}

impl Inflight {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            placed: AtomicU64::new(0),
        }
    }

    /// Resets the placed horizon (startup/recovery).
    pub fn reset(&self, horizon: Lsn) {
        let mut queue = self.queue.lock();
        queue.clear();
        self.placed.store(horizon.raw(), Ordering::Release);
    }

    /// Registers a reservation ending at `end`. Must be called under the
    /// log lock so ends arrive in non-decreasing order.
    pub fn register(&self, end: Lsn) -> u64 {
        let mut queue = self.queue.lock();
        debug_assert!(
            queue.back().map_or(true, |&(e, _)| e <= end.raw()),
            "reservations must register in horizon order"
        );
        queue.push_back((end.raw(), false));
        end.raw()
    }

    /// Marks the reservation `token` complete and advances the placed
    /// horizon past every leading complete reservation.
    pub fn complete(&self, token: u64) {
        let mut queue = self.queue.lock();
        if let Some(entry) = queue.iter_mut().find(|(e, done)| *e == token && !*done) {
            entry.1 = true;
        } else {
            debug_assert!(false, "unknown inflight token");
        }
        let mut new_placed = None;
        while let Some(&(end, done)) = queue.front() {
            if !done {
                break;
            }
            new_placed = Some(end);
            queue.pop_front();
        }
        if let Some(placed) = new_placed {
            self.placed.store(placed, Ordering::Release);
        }
    }

    /// End of the longest prefix of completed reservations.
    pub fn placed(&self) -> Lsn {
        Lsn::from_raw(self.placed.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_state_geometry() {
        let mut state = BufferState::unbound();
        state.bind(3, PAGE_SIZE as u32, (PAGE_SIZE + BUFFER_CAPACITY) as u32, u32::MAX & !(PAGE_SIZE as u32 - 1));
        assert_eq!(state.horizon(), Lsn::new(3, PAGE_SIZE as u32));
        assert_eq!(state.remaining(), BUFFER_CAPACITY as u32);

        state.fill = PAGE_SIZE as u32 + 100;
        assert_eq!(state.page_slot(state.fill), 1);
        assert_eq!(
            state.horizon(),
            Lsn::new(3, 2 * PAGE_SIZE as u32 + 100)
        );
    }

    #[test]
    fn lock_log_returns_active_buffer() {
        let pool = BufferPool::new();
        {
            let mut guard = pool.slot(0).state.lock();
            guard.bind(1, PAGE_SIZE as u32, (PAGE_SIZE + BUFFER_CAPACITY) as u32, u32::MAX & !(PAGE_SIZE as u32 - 1));
            guard.active = true;
        }
        let (id, guard) = pool.lock_log();
        assert_eq!(id, 0);
        assert!(guard.active);
    }

    #[test]
    fn lock_log_follows_rotation() {
        let pool = BufferPool::new();
        {
            let mut g1 = pool.slot(1).state.lock();
            g1.bind(1, PAGE_SIZE as u32, (PAGE_SIZE + BUFFER_CAPACITY) as u32, u32::MAX & !(PAGE_SIZE as u32 - 1));
            g1.active = true;
        }
        pool.publish_active(1);
        let (id, _) = pool.lock_log();
        assert_eq!(id, 1);
    }

    #[test]
    fn writer_done_notifies_drain() {
        use std::sync::Arc;
        let pool = Arc::new(BufferPool::new());
        {
            let mut guard = pool.slot(0).state.lock();
            guard.bind(1, PAGE_SIZE as u32, (PAGE_SIZE + BUFFER_CAPACITY) as u32, u32::MAX & !(PAGE_SIZE as u32 - 1));
            guard.writers = 2;
        }

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let mut guard = pool.slot(0).state.lock();
                pool.wait_drained(0, &mut guard);
                guard.writers
            })
        };

        pool.writer_done(0);
        pool.writer_done(0);
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn inflight_placed_advances_only_past_complete_prefix() {
        let inflight = Inflight::new();
        inflight.reset(Lsn::new(1, 100));

        let a = inflight.register(Lsn::new(1, 200));
        let b = inflight.register(Lsn::new(1, 300));
        let c = inflight.register(Lsn::new(1, 400));
        assert_eq!(inflight.placed(), Lsn::new(1, 100));

        // Completing out of order must not expose the gap.
        inflight.complete(b);
        assert_eq!(inflight.placed(), Lsn::new(1, 100));
        inflight.complete(c);
        assert_eq!(inflight.placed(), Lsn::new(1, 100));
        inflight.complete(a);
        assert_eq!(inflight.placed(), Lsn::new(1, 400));
    }

    #[test]
    fn buffer_data_copy_roundtrip() {
        let data = BufferData::new();
        let src = [7u8; 64];
        let mut dst = [0u8; 64];
        unsafe {
            data.copy_in(100, &src);
            data.copy_out(100, &mut dst);
        }
        assert_eq!(src, dst);
        unsafe {
            data.zero(100, 64);
            data.copy_out(100, &mut dst);
        }
        assert!(dst.iter().all(|&b| b == 0));
    }
}
