//! # Flusher
//!
//! `flush(target)` makes every log byte at or below `target` durable. One
//! flush runs at a time process-wide — the `FlushInner` mutex serializes
//! callers — which keeps file-sync ordering trivial to reason about.
//!
//! ## Procedure
//!
//! 1. If the target still lives in the active buffer, close it: rotate the
//!    log to the successor exactly as a writer would (carrying the partial
//!    trailing page), leaving the old binding sealed.
//! 2. Walk the sealed bindings in horizon order. For each: wait for its
//!    writers to drain, finalize and hand its pages to the page cache,
//!    write them to the file, and recycle the binding.
//! 3. Fsync every file that may hold unsynced bytes. Buffer rotation on
//!    the write path pushes recycled bindings to disk without syncing, so
//!    the flusher tracks the lowest file not yet synced and syncs from
//!    there up to the active file.
//! 4. Apply pending max-LSN seal raises, unlink files queued by a deferred
//!    purge, fsync the directory if a rollover created a file, and publish
//!    the watermarks.
//!
//! ## Watermarks
//!
//! Three cursors order the log's durability states
//! (`flushed ≤ sent_to_disk ≤ in_buffers_only ≤ horizon`):
//!
//! - `in_buffers_only` — the placed horizon: reservations fully copied
//!   into buffers, visible to scanners, not yet durable;
//! - `sent_to_disk` — written and fsynced;
//! - `flushed` — the externally visible durability floor callers wait on.
//!
//! An I/O error mid-flush poisons the log: it flips to read-only with the
//! watermarks frozen at their last published values.

use std::sync::atomic::Ordering;

use eyre::{ensure, Result};
use tracing::{debug, error};

use crate::config::BUFFER_COUNT;
use crate::log::Log;
use crate::lsn::Lsn;

/// Serialized flush state.
pub(crate) struct FlushInner {
    /// Lowest file number that may hold written-but-unsynced bytes.
    sync_from: u32,
}

impl FlushInner {
    pub(crate) fn new() -> Self {
        Self { sync_from: 1 }
    }

    pub(crate) fn set_sync_from(&mut self, file_no: u32) {
        self.sync_from = file_no;
    }
}

impl Log {
    /// Blocks until every byte at or below `target` is fsynced.
    pub fn flush(&self, target: Lsn) -> Result<()> {
        if target.is_zero() || self.flushed_lsn() >= target {
            return Ok(());
        }
        ensure!(!self.is_read_only(), "log is read-only after a write failure");

        // One flush in flight; a concurrent caller blocks here and very
        // often finds its target already covered when it gets the lock.
        let mut inner = self.flush_inner.lock();
        if self.flushed_lsn() >= target {
            return Ok(());
        }

        let goal = self.placed_horizon();
        ensure!(
            target <= goal,
            "flush target {target} is beyond the placed horizon {goal}"
        );

        match self.flush_up_to(&mut inner, target, goal) {
            Ok(achieved) => {
                debug_assert!(achieved >= target);
                self.sent_to_disk.fetch_max(achieved.raw(), Ordering::AcqRel);
                self.flushed.fetch_max(achieved.raw(), Ordering::AcqRel);
                Ok(())
            }
            Err(err) => {
                self.poison();
                error!("flush to {target} failed: {err:#}");
                Err(err)
            }
        }
    }

    /// Writes and syncs everything up to `goal`; returns the durable LSN.
    fn flush_up_to(&self, inner: &mut FlushInner, target: Lsn, goal: Lsn) -> Result<Lsn> {
        // Close the active buffer if the target needs bytes only it holds.
        {
            let (id, guard) = self.buffers.lock_log();
            let on_disk_floor = Lsn::new(guard.file_no, guard.start_offset + guard.written_to);
            if target > on_disk_floor {
                let (_, next_guard) = self.rotate_binding(id, guard, 0, None)?;
                drop(next_guard);
            }
        }

        // Write out sealed bindings in horizon order, recycling each. Live
        // bindings form a contiguous cyclic run ending at the active
        // buffer, so walking the ring forward from the slot after the
        // active one visits them oldest-first.
        let mut id = self.buffers.next_id(self.buffers.active_id());
        for _ in 0..BUFFER_COUNT {
            let slot = self.buffers.slot(id);
            let mut guard = slot.state.lock();
            if guard.active {
                break;
            }
            if guard.bound {
                self.buffers.wait_drained(id, &mut guard);
                let up_to = guard.fill;
                self.write_buffer_pages(id, &mut guard, up_to)?;
                guard.unbind();
            }
            drop(guard);
            id = self.buffers.next_id(id);
        }

        // Sync every file that may hold unsynced bytes: rotation recycles
        // bindings to disk without fsync, so the range reaches back to the
        // last synced file.
        let active_file = {
            let (_, guard) = self.buffers.lock_log();
            guard.file_no
        };
        let sync_from = inner.sync_from.max(self.files.min_file());
        for file_no in sync_from..=active_file {
            self.files.get(file_no)?.sync()?;
        }
        inner.sync_from = active_file;

        // Sealed max-LSN raises ride on the flush, as do purge unlinks
        // deferred by policy and the directory sync after a rollover.
        self.files.apply_pending_seals()?;
        let unlinked = self.files.drain_unlinks()?;
        if unlinked > 0 {
            debug!(unlinked, "flush unlinked purged files");
        }
        self.files.sync_dir_if_needed()?;

        // Bytes past `goal` may have reached disk too, but only the prefix
        // up to `goal` is known to lie entirely in the bindings this flush
        // (or an earlier one) wrote and synced.
        let (_, guard) = self.buffers.lock_log();
        let floor = Lsn::new(guard.file_no, guard.start_offset + guard.written_to);
        Ok(goal.min(floor))
    }
}
