//! # Purge
//!
//! Log files whose every record lies below the callers' low-water mark —
//! the lowest LSN recovery or any reader still needs — are dead weight.
//! `purge` walks files from the oldest upward and deletes each one whose
//! sealed max-LSN header field proves it holds nothing at or above the
//! mark.
//!
//! Deletion stops at the first file that might still matter:
//!
//! - a file whose sealed max-LSN is at or above the mark (a record in it,
//!   or one whose chunks span into it, is still needed);
//! - the file containing the low-water mark itself;
//! - the active file;
//! - a file with no seal yet (rollover seals files; an unsealed file in
//!   the middle of the range means the seal write has not landed, so it
//!   is kept out of caution).
//!
//! Under [`PurgePolicy::AtNextFlush`] files are queued instead of
//! unlinked; the flusher drains the queue, keeping unlink latency off the
//! caller's path.

use eyre::Result;
use tracing::debug;

use crate::config::PurgePolicy;
use crate::log::Log;
use crate::lsn::Lsn;

/// What a [`Log::purge`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    /// Files unlinked by this call.
    pub files_deleted: u32,
    /// Files queued for unlink at the next flush.
    pub files_queued: u32,
    /// Oldest file the log still keeps (queued files excluded).
    pub first_remaining_file: u32,
}

impl Log {
    /// Deletes (or queues for deletion) every log file strictly below
    /// `low_water_mark` that no reader can still need.
    pub fn purge(&self, low_water_mark: Lsn) -> Result<PurgeReport> {
        let active_file = {
            let (_, guard) = self.buffers.lock_log();
            guard.file_no
        };

        let mut files_deleted = 0;
        let mut files_queued = 0;
        let mut candidate = self.files.min_file();

        while candidate < active_file && candidate < low_water_mark.file_no() {
            let sealed = self.files.read_max_lsn(candidate)?;
            if sealed.is_zero() || sealed >= low_water_mark {
                break;
            }
            self.cache.invalidate_file(candidate);
            match self.config.purge_policy {
                PurgePolicy::Immediate => {
                    self.files.delete(candidate)?;
                    files_deleted += 1;
                }
                PurgePolicy::AtNextFlush => {
                    if self.files.queue_unlink(candidate) {
                        files_queued += 1;
                    }
                }
            }
            candidate += 1;
        }

        if files_deleted > 0 || files_queued > 0 {
            debug!(
                files_deleted,
                files_queued,
                low_water_mark = %low_water_mark,
                "purged log files"
            );
        }
        Ok(PurgeReport {
            files_deleted,
            files_queued,
            first_remaining_file: candidate,
        })
    }
}
