//! # The Log
//!
//! [`Log`] is the one explicit owner of everything the transaction log
//! needs: the file pool, the buffer pool, the read cache, the short-id
//! pool, the durability watermarks, and the read-only poison flag. There
//! is no global state; every operation takes the `Log` by reference.
//!
//! ## Write Path
//!
//! A `write` call runs the type's `pre_write` hook, then reserves log
//! space under the log lock (the active buffer's mutex), copies payload
//! bytes into the reserved ranges without any lock, and completes the
//! reservation. The record's LSN is the address of its head chunk and is
//! assigned inside the reservation, which is what makes LSN order equal
//! lock-acquisition order.
//!
//! Three physical layouts exist (decided per record, see `chunk`):
//!
//! - a page-bounded chunk for fixed/pseudo-fixed types;
//! - a head chunk plus in-place continuation for variable records that fit
//!   the current group capacity (the rest of the active buffer, extended
//!   into the next buffer when the active one is under half full);
//! - multiple groups, each reserved and copied independently, finished by
//!   a head chunk carrying a group directory.
//!
//! ## Failure Semantics
//!
//! Any error once the horizon may have moved permanently poisons the log:
//! it flips to read-only, accepting no further writes while leaving all
//! existing data readable. There is no partial rollback of a reservation;
//! fail-fast keeps half-written records unreachable (they lie past the
//! last completed reservation, which recovery truncates).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use eyre::{bail, ensure, Result};
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, error};

use crate::buffer::{BufferId, BufferPool, BufferState, CopySeg, Inflight, Reservation};
use crate::cache::{PageCache, PageKey};
use crate::chunk::{
    self, encode_length_chunk_header, encode_record_head, varlen_len, GroupEntry, CHUNK_FIXED,
    CHUNK_NOHEADER, MAX_LENGTH_CHUNK_HEADER, MAX_RECORD_HEAD_SIZE, MAX_VARLEN_SIZE,
};
use crate::config::{LogConfig, BUFFER_CAPACITY, BUFFER_COUNT, MAX_RECORD_PARTS, MIN_FILE_MAX_SIZE, PAGE_SIZE};
use crate::files::{FilePool, HEADER_FLAG_CRC, HEADER_FLAG_PROTECTION};
use crate::flush::FlushInner;
use crate::lsn::{encode_compressed_lsn, Lsn, MAX_COMPRESSED_LSN_SIZE};
use crate::page::{self, PageLayout};
use crate::record::{self, RecordClass, RecordHeader, RecordType, WriteHookContext};
use crate::recovery::{self, RecoveryInfo};
use crate::scan::{self, PageSource, RecordReader, ScanCursor};
use crate::short_id::ShortIdPool;

/// Per-page slack subtracted when estimating how many payload bytes fit a
/// run of pages: covers the worst chunk-header overhead on any page.
const PAGE_CAPACITY_SLACK: usize = 8;

pub struct Log {
    pub(crate) config: LogConfig,
    pub(crate) layout: PageLayout,
    pub(crate) file_max_size: AtomicU32,
    pub(crate) files: FilePool,
    pub(crate) buffers: BufferPool,
    pub(crate) cache: PageCache,
    pub(crate) inflight: Inflight,
    pub(crate) flush_inner: Mutex<FlushInner>,
    pub(crate) flushed: AtomicU64,
    pub(crate) sent_to_disk: AtomicU64,
    pub(crate) last_record_lsn: AtomicU64,
    /// File receiving the most recent buffer write (cross-file barrier).
    pub(crate) last_file_written: AtomicU32,
    pub(crate) short_ids: ShortIdPool,
    pub(crate) read_only: AtomicBool,
}

impl Log {
    /// Creates a fresh log in `config.dir`. Fails if log files already
    /// exist there.
    pub fn create(config: LogConfig) -> Result<Log> {
        let (log, existing) = Self::init(config)?;
        ensure!(
            existing.is_none(),
            "log directory '{}' already contains log files",
            log.config.dir.display()
        );
        let file = log.files.create_next()?;
        debug_assert_eq!(file.no(), 1);
        log.files.sync_dir_if_needed()?;

        let horizon = Lsn::new(1, PAGE_SIZE as u32);
        log.bind_first_buffer(horizon, None, 0, Lsn::ZERO)?;
        log.inflight.reset(horizon);
        log.flushed.store(horizon.raw(), Ordering::Release);
        log.sent_to_disk.store(horizon.raw(), Ordering::Release);
        Ok(log)
    }

    /// Opens an existing log, validating pages and truncating any torn
    /// tail. Returns the log plus what recovery found and cut.
    pub fn open(config: LogConfig) -> Result<(Log, RecoveryInfo)> {
        let (log, existing) = Self::init(config)?;
        let Some((min_file, max_file)) = existing else {
            bail!(
                "log directory '{}' holds no log files; use create",
                log.config.dir.display()
            );
        };

        let info = recovery::recover(&log.files, log.layout, min_file, max_file)?;
        let horizon = info.horizon;

        log.bind_first_buffer(
            horizon,
            info.partial_page.as_deref(),
            info.partial_page_generation,
            info.last_record_lsn,
        )?;
        log.inflight.reset(horizon);
        log.flushed.store(horizon.raw(), Ordering::Release);
        log.sent_to_disk.store(horizon.raw(), Ordering::Release);
        log.last_record_lsn
            .store(info.last_record_lsn.raw(), Ordering::Release);
        log.flush_inner.lock().set_sync_from(horizon.file_no());
        debug!(horizon = %horizon, truncated = info.bytes_truncated, "log opened");
        Ok((log, info))
    }

    fn init(config: LogConfig) -> Result<(Log, Option<(u32, u32)>)> {
        ensure!(
            config.file_max_size >= MIN_FILE_MAX_SIZE,
            "file max size {} below the minimum {}",
            config.file_max_size,
            MIN_FILE_MAX_SIZE
        );
        ensure!(
            config.file_max_size % PAGE_SIZE as u32 == 0,
            "file max size {} is not a multiple of the page size",
            config.file_max_size
        );

        let mut header_flags = 0;
        if config.use_crc {
            header_flags |= HEADER_FLAG_CRC;
        }
        if config.use_sector_protection {
            header_flags |= HEADER_FLAG_PROTECTION;
        }
        let (files, existing) = FilePool::open(
            &config.dir,
            config.server_id,
            header_flags,
            config.sync_directory,
        )?;

        let layout = PageLayout::new(config.use_crc, config.use_sector_protection);
        let cache = PageCache::new(config.cache_pages)?;
        let file_max_size = AtomicU32::new(config.file_max_size);

        let log = Log {
            config,
            layout,
            file_max_size,
            files,
            buffers: BufferPool::new(),
            cache,
            inflight: Inflight::new(),
            flush_inner: Mutex::new(FlushInner::new()),
            flushed: AtomicU64::new(0),
            sent_to_disk: AtomicU64::new(0),
            last_record_lsn: AtomicU64::new(0),
            last_file_written: AtomicU32::new(0),
            short_ids: ShortIdPool::new(),
            read_only: AtomicBool::new(false),
        };
        Ok((log, existing))
    }

    /// Binds buffer 0 at the horizon, seeding it with the recovered
    /// partial page when the horizon is mid-page.
    fn bind_first_buffer(
        &self,
        horizon: Lsn,
        partial_page: Option<&[u8]>,
        partial_generation: u8,
        sealed_last_record: Lsn,
    ) -> Result<()> {
        let config_cap = self.current_file_max_size();
        // A pre-existing file may be longer than a newly lowered cap; its
        // effective cap is wherever its content already reaches.
        let horizon_page_end = horizon.offset().div_ceil(PAGE_SIZE as u32) * PAGE_SIZE as u32;
        let file_cap = config_cap.max(horizon_page_end);

        let slot = self.buffers.slot(0);
        let mut state = slot.state.lock();

        if horizon.offset() >= file_cap {
            // The last file is exactly full: seal it and roll.
            let old = self.files.get(horizon.file_no())?;
            old.seal_max_lsn(sealed_last_record)?;
            let file = self.files.create_next()?;
            let start = PAGE_SIZE as u32;
            let end = (start + BUFFER_CAPACITY as u32).min(config_cap);
            state.bind(file.no(), start, end, config_cap);
            state.active = true;
            unsafe { slot.data.zero(0, (end - start) as usize) };
        } else {
            let start = horizon.page_offset();
            let end = (start + BUFFER_CAPACITY as u32).min(file_cap);
            state.bind(horizon.file_no(), start, end, file_cap);
            state.active = true;
            unsafe { slot.data.zero(0, (end - start) as usize) };

            if let Some(partial) = partial_page {
                let fill = horizon.offset() - start;
                debug_assert!(fill > 0 && (fill as usize) < PAGE_SIZE);
                unsafe { slot.data.copy_in(0, &partial[..fill as usize]) };
                state.fill = fill;
                state.written_to = fill;
                state.page_generations[0] = partial_generation;
            }
        }
        self.buffers.publish_active(0);
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Current end-of-log write position.
    pub fn horizon(&self) -> Lsn {
        let (_, guard) = self.buffers.lock_log();
        guard.horizon()
    }

    /// End of the longest prefix of fully copied-in reservations; the
    /// horizon scanners may trust.
    pub fn placed_horizon(&self) -> Lsn {
        self.inflight.placed()
    }

    /// Durability floor: every byte at or below has been fsynced.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn::from_raw(self.flushed.load(Ordering::Acquire))
    }

    pub fn sent_to_disk_lsn(&self) -> Lsn {
        Lsn::from_raw(self.sent_to_disk.load(Ordering::Acquire))
    }

    /// LSN of the most recently reserved record.
    pub fn last_record_lsn(&self) -> Lsn {
        Lsn::from_raw(self.last_record_lsn.load(Ordering::Acquire))
    }

    /// Address of the first chunk the oldest live file can hold; the
    /// natural start position for a full scan.
    pub fn first_lsn(&self) -> Lsn {
        Lsn::new(
            self.files.min_file(),
            (PAGE_SIZE + self.layout.header_size()) as u32,
        )
    }

    /// Sealed max-LSN of a log file's header (`Lsn::ZERO` while active).
    pub fn sealed_max_lsn(&self, file_no: u32) -> Result<Lsn> {
        self.files.read_max_lsn(file_no)
    }

    /// Live log file range `(oldest, newest)`.
    pub fn file_range(&self) -> (u32, u32) {
        (self.files.min_file(), self.files.max_file())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn poison(&self) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            error!("log write failed; log is now read-only");
        }
    }

    pub(crate) fn current_file_max_size(&self) -> u32 {
        self.file_max_size.load(Ordering::Acquire)
    }

    /// Changes the file size cap. Takes effect at the next rollover; the
    /// active file keeps the cap it was bound under.
    pub fn set_file_max_size(&self, bytes: u32) -> Result<()> {
        ensure!(
            bytes >= MIN_FILE_MAX_SIZE,
            "file max size {bytes} below the minimum {MIN_FILE_MAX_SIZE}"
        );
        ensure!(
            bytes % PAGE_SIZE as u32 == 0,
            "file max size {bytes} is not a multiple of the page size"
        );
        self.file_max_size.store(bytes, Ordering::Release);
        Ok(())
    }

    // ========================================================================
    // Short transaction ids
    // ========================================================================

    /// Claims a short id for the transaction `long_id`. The id returns to
    /// the pool when the guard drops.
    pub fn assign_short_id(&self, long_id: u64) -> Result<ShortIdGuard<'_>> {
        let id = self.short_ids.assign(long_id)?;
        Ok(ShortIdGuard { log: self, id })
    }

    /// Head of `short_trid`'s undo chain (the LSN of its latest undo
    /// record), or `Lsn::ZERO`.
    pub fn undo_chain_head(&self, short_trid: u16) -> Lsn {
        self.short_ids.undo_chain_head(short_trid)
    }

    /// Short ids currently claimed.
    pub fn short_ids_in_use(&self) -> usize {
        self.short_ids.assigned_count()
    }

    pub(crate) fn set_undo_chain_head(&self, short_trid: u16, lsn: Lsn) {
        self.short_ids.set_undo_chain_head(short_trid, lsn);
    }

    pub(crate) fn clear_undo_chain(&self, short_trid: u16) {
        self.short_ids.set_undo_chain_head(short_trid, Lsn::ZERO);
    }

    /// Writes the once-per-transaction record mapping `short_trid` to its
    /// full transaction id, if not already written.
    pub(crate) fn ensure_long_id_logged(&self, short_trid: u16) -> Result<()> {
        if short_trid == 0 {
            return Ok(());
        }
        if self.short_ids.mark_long_id_logged(short_trid) {
            let long_id = self.short_ids.long_id(short_trid);
            self.write(
                RecordType::LongTransactionId,
                short_trid,
                &[&long_id.to_be_bytes()],
            )?;
        }
        Ok(())
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Appends a record and returns its LSN.
    ///
    /// `parts` concatenate to the record's logical payload. Pseudo-fixed
    /// types expect their LSN back-references as the leading 8-byte
    /// big-endian fields; they are stored compressed and re-expanded on
    /// read, so the payload round-trips byte-exact.
    pub fn write(&self, record_type: RecordType, short_trid: u16, parts: &[&[u8]]) -> Result<Lsn> {
        ensure!(!self.is_read_only(), "log is read-only after a write failure");
        ensure!(
            parts.len() <= MAX_RECORD_PARTS,
            "record of {} parts exceeds the {MAX_RECORD_PARTS}-part cap",
            parts.len()
        );
        let descriptor = record_type.descriptor();
        let total = record::check_parts(record_type, parts)?;

        let mut ctx = WriteHookContext { short_trid };
        if let Some(hook) = descriptor.pre_write {
            hook(self, &mut ctx)?;
        }

        let result = match descriptor.class {
            RecordClass::Fixed { .. } | RecordClass::PseudoFixed { .. } => {
                self.write_page_bounded(record_type, short_trid, parts)
            }
            RecordClass::Variable => self.write_variable(record_type, short_trid, parts, total),
        };

        let lsn = match result {
            Ok(lsn) => lsn,
            Err(err) => {
                self.poison();
                return Err(err.wrap_err(format!("writing {record_type:?} record")));
            }
        };

        if let Some(hook) = descriptor.in_write {
            hook(self, lsn, &ctx)?;
        }
        Ok(lsn)
    }

    /// Fixed and pseudo-fixed records: one chunk, never split by a page
    /// boundary.
    fn write_page_bounded(
        &self,
        record_type: RecordType,
        short_trid: u16,
        parts: &[&[u8]],
    ) -> Result<Lsn> {
        let descriptor = record_type.descriptor();
        let refs = descriptor.lsn_refs as usize;
        let tail_len = match descriptor.class {
            RecordClass::Fixed { payload_len } | RecordClass::PseudoFixed { payload_len } => {
                payload_len as usize
            }
            RecordClass::Variable => unreachable!("page-bounded write of a variable type"),
        };

        let mut placer = Placer::begin(self);

        // The compressed refs depend on the record's own LSN, which can
        // move while we make room; settle both together.
        let mut ref_buf = [0u8; 2 * MAX_COMPRESSED_LSN_SIZE];
        let (lsn, ref_bytes) = loop {
            let lsn = placer.position();
            let mut ref_bytes = 0;
            for i in 0..refs {
                let target = read_ref_from_parts(parts, i)?;
                ref_bytes += encode_compressed_lsn(lsn, target, &mut ref_buf[ref_bytes..]);
            }
            let chunk_size = 3 + ref_bytes + tail_len;
            debug_assert!(chunk_size <= self.layout.payload_size());
            if placer.make_room(chunk_size)? {
                break (lsn, ref_bytes);
            }
            // The chunk moved to a fresh page (or buffer/file); re-encode
            // against the new address.
        };

        let mut head = [0u8; 3];
        head[0] = CHUNK_FIXED | record_type.bits();
        head[1..3].copy_from_slice(&short_trid.to_le_bytes());
        placer.put_bytes(&head);
        placer.put_bytes(&ref_buf[..ref_bytes]);
        placer.reserve_payload(refs * 8, tail_len);
        placer.note_record(lsn);

        let reservation = placer.finish(lsn);
        self.copy_and_complete(&reservation, parts);
        Ok(lsn)
    }

    /// Variable-length records: single chunk, single group, or multiple
    /// groups closed by a directory-bearing head chunk.
    fn write_variable(
        &self,
        record_type: RecordType,
        short_trid: u16,
        parts: &[&[u8]],
        total: u64,
    ) -> Result<Lsn> {
        let mut head_buf = [0u8; MAX_RECORD_HEAD_SIZE];
        let head_max = 3 + varlen_len(total) + MAX_VARLEN_SIZE;

        let mut placer = Placer::begin(self);

        // Single chunk: head plus the whole payload inside one page.
        let inline_size = 3 + 2 * varlen_len(total) + total as usize;
        if inline_size <= self.layout.payload_size() {
            placer.make_room(inline_size)?;
            let lsn = placer.position();
            let n = encode_record_head(record_type.bits(), short_trid, total, total, &mut head_buf);
            placer.put_bytes(&head_buf[..n]);
            placer.reserve_payload(0, total as usize);
            placer.note_record(lsn);
            let reservation = placer.finish(lsn);
            self.copy_and_complete(&reservation, parts);
            return Ok(lsn);
        }

        // Single group: the head chunk starts here and the data runs
        // through continuation chunks, possibly extending into the next
        // buffer when this one is under half full.
        placer.make_room(head_max + 1)?;
        if total as usize <= placer.single_group_capacity(head_max) {
            let lsn = placer.position();
            let n = encode_record_head(record_type.bits(), short_trid, total, 0, &mut head_buf);
            placer.put_bytes(&head_buf[..n]);
            placer.place_group_data(
                GroupSource::Parts { rec_start: 0 },
                total as usize,
                PlaceMode::AfterHead,
            )?;
            placer.note_record(lsn);
            let reservation = placer.finish(lsn);
            self.copy_and_complete(&reservation, parts);
            return Ok(lsn);
        }

        // Multi-group: fill buffer after buffer with independently
        // reserved groups, then write the head chunk with the directory.
        let mut groups: SmallVec<[GroupEntry; 4]> = SmallVec::new();
        let mut rec_pos = 0usize;
        let mut current = Some(placer);
        while rec_pos < total as usize {
            let mut placer = match current.take() {
                Some(placer) => placer,
                None => {
                    let mut placer = Placer::begin(self);
                    placer.make_room(MAX_LENGTH_CHUNK_HEADER + 2)?;
                    placer
                }
            };
            let start = placer.position();
            let remaining = total as usize - rec_pos;
            let placed = placer.place_group_data(
                GroupSource::Parts { rec_start: rec_pos },
                remaining,
                PlaceMode::OneBinding,
            )?;
            ensure!(placed > 0, "group reservation made no progress");
            groups.push(GroupEntry {
                start,
                chunk_count: placer.chunk_count,
            });
            rec_pos += placed;
            let reservation = placer.finish(start);
            self.copy_and_complete(&reservation, parts);
        }

        let mut directory = Vec::with_capacity(chunk::directory_size(groups.len()));
        chunk::encode_group_directory(&groups, &mut directory);

        let mut placer = Placer::begin(self);
        placer.make_room(head_max + 1)?;
        let lsn = placer.position();
        let n = encode_record_head(
            record_type.bits(),
            short_trid,
            total,
            directory.len() as u64,
            &mut head_buf,
        );
        placer.put_bytes(&head_buf[..n]);
        placer.place_group_data(
            GroupSource::Inline(&directory),
            directory.len(),
            PlaceMode::AfterHead,
        )?;
        placer.note_record(lsn);

        // Chunks of this record living in earlier files must keep those
        // files alive until this record is purged.
        for group in &groups {
            if group.start.file_no() < lsn.file_no() {
                self.files.request_seal_raise(group.start.file_no(), lsn);
            }
        }

        let reservation = placer.finish(lsn);
        self.copy_and_complete(&reservation, parts);
        Ok(lsn)
    }

    /// Copies payload into the reserved ranges (no lock held) and retires
    /// the reservation.
    fn copy_and_complete(&self, reservation: &Reservation, parts: &[&[u8]]) {
        for seg in &reservation.segs {
            let slot = self.buffers.slot(seg.buffer);
            copy_from_parts(parts, seg.rec_start, seg.len, |piece_off, piece| {
                // SAFETY: the range was reserved for this writer alone.
                unsafe { slot.data.copy_in(seg.data_off + piece_off, piece) };
            });
        }
        for &id in &reservation.touched {
            self.buffers.writer_done(id);
        }
        self.inflight.complete(reservation.token);
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Decodes the record header at `lsn`.
    pub fn read_header(&self, lsn: Lsn) -> Result<RecordHeader> {
        scan::read_header_at(self, self.layout, lsn, self.placed_horizon())
    }

    /// Reads up to `buf.len()` bytes of the record at `lsn` starting at
    /// payload offset `offset`. Returns the bytes copied (short only at
    /// record end). For repeated partial reads keep a [`RecordReader`].
    pub fn read(&self, lsn: Lsn, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut reader = RecordReader::open(self, lsn)?;
        reader.seek(offset)?;
        reader.read(self, buf)
    }

    /// Opens a forward scanner at `start_lsn`.
    ///
    /// With `fixed_horizon` the scan ends at today's placed horizon;
    /// otherwise the cursor chases the horizon as it advances.
    pub fn open_scanner(&self, start_lsn: Lsn, fixed_horizon: bool) -> Result<ScanCursor> {
        scan::open_scanner(self, start_lsn, fixed_horizon)
    }

    /// Advances a scanner to its next record header, or `None` at the end
    /// of the scan.
    pub fn next_record_header(&self, cursor: &mut ScanCursor) -> Result<Option<RecordHeader>> {
        cursor.next_record_header(self)
    }

    /// Writes a buffer's unwritten pages to its file (no fsync). Shared by
    /// rotation (recycling the successor) and the flusher. The caller
    /// holds the buffer's state lock with writers drained.
    pub(crate) fn write_buffer_pages(
        &self,
        id: BufferId,
        state: &mut BufferState,
        up_to: u32,
    ) -> Result<()> {
        debug_assert_eq!(state.writers, 0);
        if !state.bound || state.written_to >= up_to {
            return Ok(());
        }

        // Cross-file barrier: before the first write to a new file, the
        // previous file is fsynced, so the on-disk log is always a prefix
        // (recovery never finds file N+1 content ahead of a hole in N).
        let prev = self.last_file_written.swap(state.file_no, Ordering::AcqRel);
        if prev != 0 && prev < state.file_no && prev >= self.files.min_file() {
            self.files.get(prev)?.sync()?;
        }

        let file = self.files.get(state.file_no)?;
        let slot = self.buffers.slot(id);
        let mut scratch = [0u8; PAGE_SIZE];

        let first_page = (state.written_to as usize) / PAGE_SIZE;
        let last_byte = up_to as usize;
        let mut page = first_page;
        while page * PAGE_SIZE < last_byte {
            let rel = page * PAGE_SIZE;
            // SAFETY: writers are drained; bytes beyond `fill` are zero.
            unsafe { slot.data.copy_out(rel, &mut scratch) };

            let valid = (last_byte - rel).min(PAGE_SIZE);
            let full = valid == PAGE_SIZE;
            let generation = state.page_generations[page].wrapping_add(1);
            state.page_generations[page] = generation;
            page::finalize_page(&mut scratch, self.layout, full, generation);

            let abs = state.start_offset as u64 + rel as u64;
            let page_no = (abs / PAGE_SIZE as u64) as u32;
            self.cache
                .write_through(PageKey::new(state.file_no, page_no), &scratch);
            file.write_at(abs, &scratch)?;
            page += 1;
        }
        state.written_to = up_to;

        // A successor that carried this binding's trailing page now has
        // its carried prefix on disk: credit its written_to and hand over
        // the page's current write generation so the successor's rewrite
        // is distinguishable from this image. Locking id+1 while holding
        // id follows the cyclic order.
        let next_id = self.buffers.next_id(id);
        let mut next = self.buffers.slot(next_id).state.lock();
        if next.bound && next.overlay == Some(id) && next.file_no == state.file_no {
            let covered = (state.start_offset + up_to).saturating_sub(next.start_offset);
            if covered > 0 {
                next.written_to = next.written_to.max(covered.min(next.fill));
                let shared_slot = state.page_slot(next.start_offset - state.start_offset);
                next.page_generations[0] = state.page_generations[shared_slot];
                // The ordering obligation is fulfilled; a later rebinding
                // of this slot must not re-trigger the credit.
                next.overlay = None;
            }
        }
        Ok(())
    }

    /// Rotates the log to the successor buffer: recycles the successor's
    /// previous binding if it still holds data, seals and rolls the file
    /// when the current one is exhausted, and carries a partial trailing
    /// page into the successor (the "overlay") so exactly one buffer owns
    /// the live image of every page.
    ///
    /// The caller holds the log lock (`guard` over buffer `id`) and passes
    /// `own_writers`, the number of writer counts it itself holds on `id`,
    /// so the drain wait excludes the caller. `segs` are the caller's
    /// pending payload reservations: the ones inside the carried page are
    /// retargeted to the successor. Lock order: only `id + 1` is acquired
    /// while `id` is held, never the other direction around the cycle.
    pub(crate) fn rotate_binding<'a>(
        &'a self,
        id: BufferId,
        mut guard: MutexGuard<'a, BufferState>,
        own_writers: u32,
        segs: Option<&mut SmallVec<[CopySeg; 8]>>,
    ) -> Result<(BufferId, MutexGuard<'a, BufferState>)> {
        let next_id = self.buffers.next_id(id);
        let next_slot = self.buffers.slot(next_id);
        let mut next = next_slot.state.lock();

        if next.bound {
            // Recycle the oldest binding: wait out its writers and push
            // its unwritten bytes to disk. Its range precedes every other
            // live binding, so writing it here keeps disk images ordered.
            self.buffers.wait_drained(next_id, &mut next);
            let up_to = next.fill;
            self.write_buffer_pages(next_id, &mut next, up_to)?;
            next.unbind();
        }

        // Other writers may still be copying into the page we are about to
        // carry; wait for everyone but the caller. New writers cannot
        // arrive: registering one requires the lock we hold.
        while guard.writers > own_writers {
            self.buffers.slot(id).drained.wait(&mut guard);
        }

        let horizon = guard.horizon_offset();
        if horizon == guard.file_cap {
            // File exhausted: seal its max-LSN and roll to a new one.
            let old_file = self.files.get(guard.file_no)?;
            old_file.seal_max_lsn(self.last_record_lsn())?;
            let file = self.files.create_next()?;
            debug!(file_no = file.no(), "log rolled to new file");

            let cap = self.current_file_max_size();
            let start = PAGE_SIZE as u32;
            let end = (start + BUFFER_CAPACITY as u32).min(cap);
            next.bind(file.no(), start, end, cap);
            unsafe { next_slot.data.zero(0, (end - start) as usize) };
        } else {
            // Bind at the horizon's page; a partial trailing page is
            // carried so the successor holds the page's live image.
            let page_start = horizon & !(PAGE_SIZE as u32 - 1);
            let end = (page_start + BUFFER_CAPACITY as u32).min(guard.file_cap);
            next.bind(guard.file_no, page_start, end, guard.file_cap);
            unsafe { next_slot.data.zero(0, (end - page_start) as usize) };

            let carry = horizon - page_start;
            if carry > 0 {
                let src_rel = (page_start - guard.start_offset) as usize;
                let mut partial = [0u8; PAGE_SIZE];
                // SAFETY: the predecessor's lock is held and every foreign
                // writer has drained; the caller's own uncopied ranges are
                // retargeted below.
                unsafe {
                    self.buffers
                        .slot(id)
                        .data
                        .copy_out(src_rel, &mut partial[..carry as usize]);
                    next_slot.data.copy_in(0, &partial[..carry as usize]);
                }
                next.fill = carry;
                next.written_to = carry.min(guard.written_to.saturating_sub(page_start - guard.start_offset));
                next.overlay = Some(id);
                next.page_generations[0] =
                    guard.page_generations[guard.page_slot(page_start - guard.start_offset)];

                if let Some(segs) = segs {
                    for seg in segs.iter_mut() {
                        if seg.buffer == id && seg.data_off >= src_rel {
                            seg.buffer = next_id;
                            seg.data_off -= src_rel;
                        }
                    }
                }
            }
        }

        next.active = true;
        guard.active = false;
        self.buffers.publish_active(next_id);
        drop(guard);
        Ok((next_id, next))
    }

    /// Graceful shutdown: flush everything and drop descriptors.
    pub fn shutdown(&self) -> Result<()> {
        if !self.is_read_only() {
            let horizon = self.placed_horizon();
            self.flush(horizon)?;
        }
        self.files.close_all();
        Ok(())
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        if self.is_read_only() {
            return;
        }
        if let Err(err) = self.shutdown() {
            error!("log shutdown failed: {err:#}");
        }
    }
}

impl PageSource for Log {
    /// Reads a log page, preferring the in-memory buffers (which hold the
    /// newest image) and falling back to the cache/file.
    ///
    /// A page that is partial on disk always has its live image in some
    /// buffer (the overlay chain carries it forward), but a rotation can
    /// move that image between slots while the lookup scans them; such a
    /// miss is transient and retried.
    fn read_log_page(&self, file_no: u32, page_no: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        debug_assert!(page_no > 0, "page 0 is the file header page");
        let page_offset = page_no * PAGE_SIZE as u32;

        let mut attempts = 0;
        loop {
            if self.read_page_from_buffers(file_no, page_offset, buf) {
                return Ok(());
            }

            let result = self
                .cache
                .read_through(PageKey::new(file_no, page_no), buf, |dst| {
                    let file = self.files.get(file_no)?;
                    ensure!(
                        file.read_page(page_no, dst)?,
                        "log page {page_no} of file {file_no} is beyond the end of the file"
                    );
                    let status = page::validate_and_repair(dst, page_no, file_no, self.layout)?;
                    ensure!(
                        status.full,
                        "log page {page_no} of file {file_no} is not finalized but no buffer holds it"
                    );
                    Ok(())
                });
            match result {
                Ok(()) => return Ok(()),
                Err(err) if attempts < 8 => {
                    attempts += 1;
                    let _ = err;
                    std::thread::yield_now();
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn file_end_offset(&self, file_no: u32) -> Result<u32> {
        let file = self.files.get(file_no)?;
        let len = file.len()?;
        let mut end = (len - len % PAGE_SIZE as u64) as u32;
        // A sealed file's tail may still live in unflushed buffers.
        for id in 0..BUFFER_COUNT {
            let state = self.buffers.slot(id).state.lock();
            if state.bound && state.file_no == file_no {
                end = end.max(state.horizon_offset() & !(PAGE_SIZE as u32 - 1));
            }
        }
        Ok(end)
    }
}

impl Log {
    /// Copies the newest buffered image of a page, if any binding covers
    /// it. With an overlay both the predecessor and the successor hold the
    /// page; the successor (the later start offset) has the newer image.
    fn read_page_from_buffers(&self, file_no: u32, page_offset: u32, buf: &mut [u8]) -> bool {
        let mut best: Option<(u32, BufferId)> = None;
        for id in 0..BUFFER_COUNT {
            let state = self.buffers.slot(id).state.lock();
            let covered = state.bound
                && state.file_no == file_no
                && page_offset >= state.start_offset
                && page_offset < state.horizon_offset();
            if covered && best.map_or(true, |(start, _)| state.start_offset > start) {
                best = Some((state.start_offset, id));
            }
        }
        let Some((_, id)) = best else {
            return false;
        };

        let slot = self.buffers.slot(id);
        let state = slot.state.lock();
        // Re-check under the lock; the binding may have rotated away.
        if state.bound
            && state.file_no == file_no
            && page_offset >= state.start_offset
            && page_offset < state.horizon_offset()
        {
            let rel = (page_offset - state.start_offset) as usize;
            // SAFETY: the state lock keeps the binding stable; racing
            // writer bytes lie beyond the placed horizon and are never
            // interpreted by readers.
            unsafe { slot.data.copy_out(rel, buf) };
            return true;
        }
        false
    }
}

/// RAII short-id claim; returns the id to the pool on drop.
pub struct ShortIdGuard<'a> {
    log: &'a Log,
    id: u16,
}

impl ShortIdGuard<'_> {
    pub fn id(&self) -> u16 {
        self.id
    }
}

impl Drop for ShortIdGuard<'_> {
    fn drop(&mut self) {
        self.log.short_ids.release(self.id);
    }
}

// ============================================================================
// Placement
// ============================================================================

/// Data source for continuation placement: scattered caller parts (copied
/// without the lock) or small owned bytes like a group directory (copied
/// inline under the lock).
enum GroupSource<'a> {
    Parts { rec_start: usize },
    Inline(&'a [u8]),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PlaceMode {
    /// Data continues a head chunk: the first bytes run to the end of the
    /// head chunk's page, then continuation chunks follow, rotating
    /// bindings until everything is placed.
    AfterHead,
    /// Standalone group: starts with a tagged chunk at the cursor and
    /// stops at the end of the current binding.
    OneBinding,
}

/// Lock-holding placement cursor. Owns the active buffer's guard from
/// `begin` to `finish`, laying down page and chunk headers as it advances
/// the horizon, rotating buffers and rolling files when a binding runs
/// out.
struct Placer<'log> {
    log: &'log Log,
    id: BufferId,
    guard: Option<MutexGuard<'log, BufferState>>,
    segs: SmallVec<[CopySeg; 8]>,
    touched: SmallVec<[BufferId; 2]>,
    chunk_count: u16,
}

impl<'log> Placer<'log> {
    fn begin(log: &'log Log) -> Self {
        let (id, guard) = log.buffers.lock_log();
        Self {
            log,
            id,
            guard: Some(guard),
            segs: SmallVec::new(),
            touched: SmallVec::new(),
            chunk_count: 0,
        }
    }

    fn state(&self) -> &BufferState {
        self.guard.as_deref().expect("placer holds the log lock")
    }

    fn state_mut(&mut self) -> &mut BufferState {
        self.guard.as_deref_mut().expect("placer holds the log lock")
    }

    /// Current write position as an LSN. Only meaningful at a chunk
    /// boundary (after `make_room`).
    fn position(&self) -> Lsn {
        self.state().horizon()
    }

    /// Bytes left in the current page; 0 when positioned at an untouched
    /// page boundary.
    fn page_remaining(&self) -> usize {
        let within = (self.state().fill as usize) % PAGE_SIZE;
        if within == 0 {
            0
        } else {
            PAGE_SIZE - within
        }
    }

    /// Positions the cursor at a spot with at least `needed` contiguous
    /// bytes left in the current page, laying a page header, closing the
    /// page, rotating buffers, or rolling files as required.
    ///
    /// Returns `true` if the position did not move; `false` if the cursor
    /// advanced — callers that encoded position-dependent bytes must redo
    /// them.
    fn make_room(&mut self, needed: usize) -> Result<bool> {
        debug_assert!(needed <= self.log.layout.payload_size());
        let mut moved = false;
        loop {
            if self.state().remaining() == 0 {
                self.rotate()?;
                moved = true;
                continue;
            }
            let within = (self.state().fill as usize) % PAGE_SIZE;
            if within == 0 {
                self.lay_page_header();
                moved = true;
                continue;
            }
            debug_assert!(within >= self.log.layout.header_size());
            let room = PAGE_SIZE - within;
            if room < needed {
                // Close the page: leftover bytes are already zero, which
                // scanners read as the page-end marker.
                self.state_mut().fill += room as u32;
                moved = true;
                continue;
            }
            return Ok(!moved);
        }
    }

    fn lay_page_header(&mut self) {
        let layout = self.log.layout;
        let rel = self.state().fill as usize;
        debug_assert_eq!(rel % PAGE_SIZE, 0);
        let abs = self.state().start_offset as u64 + rel as u64;
        let page_no = (abs / PAGE_SIZE as u64) as u32;
        let file_no = self.state().file_no;

        let mut header = [0u8; 32];
        debug_assert!(layout.header_size() <= header.len());
        page::init_page(&mut header, page_no, file_no, layout);
        self.touch_current();
        // SAFETY: this page is beyond every previous reservation.
        unsafe {
            self.log
                .buffers
                .slot(self.id)
                .data
                .copy_in(rel, &header[..layout.header_size()]);
        }
        self.state_mut().fill += layout.header_size() as u32;
    }

    /// Ensures the current buffer's writer count covers this reservation.
    fn touch_current(&mut self) {
        if !self.touched.contains(&self.id) {
            self.state_mut().writers += 1;
            self.touched.push(self.id);
        }
    }

    /// Copies chunk-header bytes at the cursor, under the lock.
    fn put_bytes(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        debug_assert!((self.state().fill as usize % PAGE_SIZE) + bytes.len() <= PAGE_SIZE);
        self.touch_current();
        let rel = self.state().fill as usize;
        // SAFETY: range just reserved under the held lock.
        unsafe { self.log.buffers.slot(self.id).data.copy_in(rel, bytes) };
        self.state_mut().fill += bytes.len() as u32;
    }

    /// Reserves `len` payload bytes at the cursor for an unlocked copy of
    /// logical record bytes starting at `rec_start`.
    fn reserve_payload(&mut self, rec_start: usize, len: usize) {
        if len == 0 {
            return;
        }
        debug_assert!((self.state().fill as usize % PAGE_SIZE) + len <= PAGE_SIZE);
        self.touch_current();
        let data_off = self.state().fill as usize;
        self.segs.push(CopySeg {
            buffer: self.id,
            data_off,
            rec_start,
            len,
        });
        self.state_mut().fill += len as u32;
    }

    /// Payload capacity from the cursor to the end of this binding,
    /// conservatively discounting chunk-header overhead.
    fn binding_capacity(&self) -> usize {
        let payload = self.log.layout.payload_size();
        let header = self.log.layout.header_size();
        let state = self.state();
        let mut capacity = 0usize;
        let mut pos = state.fill as usize;
        let end = (state.end_offset - state.start_offset) as usize;
        while pos < end {
            let within = pos % PAGE_SIZE;
            let page_room = if within == 0 {
                payload
            } else {
                (PAGE_SIZE - within).min(PAGE_SIZE - header)
            };
            capacity += page_room.saturating_sub(PAGE_CAPACITY_SLACK);
            pos = (pos / PAGE_SIZE + 1) * PAGE_SIZE;
        }
        capacity
    }

    /// Group capacity for a single-group record whose head chunk sits at
    /// the cursor: the rest of this binding, extended by one full binding
    /// when this one is under half full and the file has room.
    fn single_group_capacity(&self, head_overhead: usize) -> usize {
        let mut capacity = self.binding_capacity().saturating_sub(head_overhead);
        let state = self.state();
        let under_half = state.remaining() < (BUFFER_CAPACITY / 2) as u32;
        if under_half && state.end_offset < state.file_cap {
            let next_start = state.end_offset;
            let next_end = (next_start + BUFFER_CAPACITY as u32).min(state.file_cap);
            let pages = ((next_end - next_start) as usize) / PAGE_SIZE;
            capacity +=
                pages * self.log.layout.payload_size().saturating_sub(PAGE_CAPACITY_SLACK);
        }
        capacity
    }

    /// Lays continuation chunks carrying up to `len` source bytes from the
    /// cursor onward. Returns the bytes placed (always `len` in
    /// `AfterHead` mode).
    fn place_group_data(
        &mut self,
        source: GroupSource<'_>,
        len: usize,
        mode: PlaceMode,
    ) -> Result<usize> {
        let mut placed = 0usize;

        if mode == PlaceMode::AfterHead {
            // The head chunk's own data runs to the end of its page (or to
            // the record end, whichever comes first); readers compute the
            // same bound.
            let head_tail = self.page_remaining().min(len);
            self.emit_group_bytes(&source, placed, head_tail);
            placed += head_tail;
        }

        while placed < len {
            if self.state().remaining() == 0 {
                match mode {
                    PlaceMode::AfterHead => {
                        self.rotate()?;
                        continue;
                    }
                    PlaceMode::OneBinding => break,
                }
            }
            if self.page_remaining() == 0 {
                self.lay_page_header();
            }
            let page_room = self.page_remaining();
            let rem = len - placed;

            if rem >= page_room + 1 {
                // Fill the page with a no-header chunk; at least two bytes
                // remain for the closing length-prefixed chunk.
                self.put_bytes(&[CHUNK_NOHEADER]);
                self.chunk_count += 1;
                self.emit_group_bytes(&source, placed, page_room - 1);
                placed += page_room - 1;
                continue;
            }

            // Closing (or binding-final) length-prefixed chunk.
            let overhead = 1 + varlen_len(page_room as u64);
            if page_room <= overhead + 1 {
                // Too tight for a useful chunk; spill to the next page.
                self.state_mut().fill += page_room as u32;
                continue;
            }
            let mut data_len = rem.min(page_room - overhead);
            if data_len < rem && rem - data_len == 1 {
                // Never leave a 1-byte final chunk; rebalance the split.
                data_len -= 1;
            }
            ensure!(data_len > 0, "no room to place chunk data");
            let mut header = [0u8; MAX_LENGTH_CHUNK_HEADER];
            let n = encode_length_chunk_header(data_len as u64, &mut header);
            self.put_bytes(&header[..n]);
            self.chunk_count += 1;
            self.emit_group_bytes(&source, placed, data_len);
            placed += data_len;
        }
        Ok(placed)
    }

    fn emit_group_bytes(&mut self, source: &GroupSource<'_>, src_off: usize, len: usize) {
        if len == 0 {
            return;
        }
        match source {
            GroupSource::Parts { rec_start } => {
                self.reserve_payload(rec_start + src_off, len);
            }
            GroupSource::Inline(bytes) => {
                self.put_bytes(&bytes[src_off..src_off + len]);
            }
        }
    }

    /// Tracks the record LSN (records only, not group reservations) and
    /// counts the head chunk.
    fn note_record(&mut self, lsn: Lsn) {
        self.log.last_record_lsn.store(lsn.raw(), Ordering::Release);
        self.chunk_count += 1;
    }

    /// Rotates this reservation into the successor buffer; reserved-but-
    /// uncopied payload segments in the carried partial page are retargeted
    /// to the successor, whose image of that page is now the live one.
    fn rotate(&mut self) -> Result<()> {
        let guard = self.guard.take().expect("placer holds the log lock");
        let own_writers = u32::from(self.touched.contains(&self.id));
        let (next_id, next_guard) =
            self.log
                .rotate_binding(self.id, guard, own_writers, Some(&mut self.segs))?;
        self.id = next_id;
        self.guard = Some(next_guard);
        Ok(())
    }

    /// Completes the reservation: registers it with the inflight queue and
    /// releases the log lock.
    fn finish(mut self, lsn: Lsn) -> Reservation {
        let end = self.state().horizon();
        let token = self.log.inflight.register(end);
        Reservation {
            lsn,
            end,
            segs: std::mem::take(&mut self.segs),
            touched: std::mem::take(&mut self.touched),
            chunk_count: self.chunk_count,
            token,
        }
    }
}

impl Drop for Placer<'_> {
    /// A placer abandoned mid-reservation (an error poisoned the write)
    /// must still release its writer counts, or flushes would wait on a
    /// drain that never comes. The reserved bytes stay zero; recovery
    /// truncates at the last complete record before them.
    fn drop(&mut self) {
        if self.touched.is_empty() {
            return;
        }
        let touched = std::mem::take(&mut self.touched);

        // Decrement the held buffer under its already-held lock, then
        // release the log lock before locking any other slot — taking an
        // earlier buffer's lock while holding a later one would run
        // against the cyclic lock order.
        let mut current_done = false;
        if let Some(guard) = self.guard.as_deref_mut() {
            if touched.contains(&self.id) {
                debug_assert!(guard.writers > 0);
                guard.writers -= 1;
                current_done = true;
            }
        }
        self.guard = None;
        if current_done {
            self.log.buffers.slot(self.id).drained.notify_all();
        }
        for id in touched {
            if !(current_done && id == self.id) {
                self.log.buffers.writer_done(id);
            }
        }
    }
}

/// Extracts the `i`-th leading 8-byte LSN back-reference from the parts.
fn read_ref_from_parts(parts: &[&[u8]], i: usize) -> Result<Lsn> {
    let mut bytes = [0u8; 8];
    let mut copied = 0usize;
    copy_from_parts(parts, i * 8, 8, |off, piece| {
        bytes[off..off + piece.len()].copy_from_slice(piece);
        copied += piece.len();
    });
    ensure!(copied == 8, "record too short for LSN reference {i}");
    Ok(Lsn::from_raw(u64::from_be_bytes(bytes)))
}

/// Walks `len` logical record bytes starting at `rec_off`, invoking `emit`
/// with `(offset_within_range, piece)` for each contiguous piece.
fn copy_from_parts(
    parts: &[&[u8]],
    rec_off: usize,
    len: usize,
    mut emit: impl FnMut(usize, &[u8]),
) {
    let mut skip = rec_off;
    let mut out = 0usize;
    for part in parts {
        if out == len {
            break;
        }
        if skip >= part.len() {
            skip -= part.len();
            continue;
        }
        let avail = &part[skip..];
        skip = 0;
        let take = avail.len().min(len - out);
        emit(out, &avail[..take]);
        out += take;
    }
    debug_assert_eq!(out, len, "record parts shorter than reserved payload");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_from_parts_crosses_boundaries() {
        let parts: &[&[u8]] = &[b"abc", b"", b"defgh", b"ij"];
        let mut collected = vec![0u8; 6];
        copy_from_parts(parts, 2, 6, |off, piece| {
            collected[off..off + piece.len()].copy_from_slice(piece);
        });
        assert_eq!(&collected, b"cdefgh");
    }

    #[test]
    fn read_ref_from_parts_spanning() {
        let lsn = Lsn::new(7, 0x1234);
        let raw = lsn.raw().to_be_bytes();
        let parts: &[&[u8]] = &[&raw[..3], &raw[3..], b"tail"];
        assert_eq!(read_ref_from_parts(parts, 0).unwrap(), lsn);
    }
}
