//! # Log File Pool
//!
//! The log is a directory of fixed-maximum-size files named
//! `translog.NNNNNN`, numbered monotonically from 1. The pool owns every
//! open descriptor, tracks the live file-number range, creates files at
//! rollover, and deletes them for the purger.
//!
//! ## File Layout
//!
//! Page 0 of every file is a header page; log pages follow from offset
//! [`PAGE_SIZE`]. The header occupies the first 64 bytes of page 0:
//!
//! ```text
//! Offset  Size  Field            Description
//! 0       12    magic            "TRANSLOGFILE"
//! 12      4     format_version   On-disk format revision
//! 16      4     server_version   Writing engine version
//! 20      4     server_id        Engine instance id
//! 24      4     page_size        Must match PAGE_SIZE
//! 28      4     sector_size      Must match SECTOR_SIZE
//! 32      4     file_no          This file's number
//! 36      4     flags            CRC / sector-protection bits
//! 40      8     created          Unix seconds at creation
//! 48      8     max_lsn          Highest LSN touching this file (sealed)
//! 56      8     reserved
//! ```
//!
//! `max_lsn` stays 0 while the file is active. It is sealed at rollover
//! and raised again if a later record's chunks prove a larger LSN touches
//! the file (records may span files); the purger trusts it to decide which
//! files are dead.
//!
//! ## Descriptor Sharing
//!
//! Open files are reference-counted (`Arc<LogFile>`) in a table behind a
//! `RwLock`: readers share, rollover and purge take the write lock. A
//! handle obtained from [`FilePool::get`] stays valid across a concurrent
//! purge; the unlink only drops the pool's reference.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{ensure, eyre, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{PAGE_SIZE, SECTOR_SIZE};
use crate::lsn::Lsn;
use crate::zerocopy_accessors;

pub const LOG_FILE_MAGIC: &[u8; 12] = b"TRANSLOGFILE";
pub const FORMAT_VERSION: u32 = 1;
pub const FILE_HEADER_SIZE: usize = 64;

const MAX_LSN_FIELD_OFFSET: u64 = 48;

pub const HEADER_FLAG_CRC: u32 = 0x1;
pub const HEADER_FLAG_PROTECTION: u32 = 0x2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LogFileHeader {
    magic: [u8; 12],
    format_version: U32,
    server_version: U32,
    server_id: U32,
    page_size: U32,
    sector_size: U32,
    file_no: U32,
    flags: U32,
    created: U64,
    max_lsn: U64,
    reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<LogFileHeader>() == FILE_HEADER_SIZE);

impl LogFileHeader {
    pub fn new(file_no: u32, server_id: u32, flags: u32) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            magic: *LOG_FILE_MAGIC,
            format_version: U32::new(FORMAT_VERSION),
            server_version: U32::new(1),
            server_id: U32::new(server_id),
            page_size: U32::new(PAGE_SIZE as u32),
            sector_size: U32::new(SECTOR_SIZE as u32),
            file_no: U32::new(file_no),
            flags: U32::new(flags),
            created: U64::new(created),
            max_lsn: U64::new(0),
            reserved: [0u8; 8],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for LogFileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );
        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre!("failed to parse LogFileHeader: {:?}", e))?;
        ensure!(&header.magic == LOG_FILE_MAGIC, "invalid log file magic");
        ensure!(
            header.format_version.get() == FORMAT_VERSION,
            "unsupported log format version: {} (expected {})",
            header.format_version.get(),
            FORMAT_VERSION
        );
        ensure!(
            header.page_size.get() == PAGE_SIZE as u32,
            "log written with page size {}, built for {}",
            header.page_size.get(),
            PAGE_SIZE
        );
        ensure!(
            header.sector_size.get() == SECTOR_SIZE as u32,
            "log written with sector size {}, built for {}",
            header.sector_size.get(),
            SECTOR_SIZE
        );
        Ok(header)
    }

    zerocopy_accessors! {
        format_version: u32,
        server_version: u32,
        server_id: u32,
        file_no: u32,
        flags: u32,
        created: u64,
        max_lsn: u64,
    }
}

/// One open log file.
pub struct LogFile {
    no: u32,
    path: PathBuf,
    file: File,
}

impl LogFile {
    pub fn no(&self) -> u32 {
        self.no
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, offset)
            .wrap_err_with(|| format!("failed to write {} bytes at {offset} of '{}'", data.len(), self.path.display()))
    }

    /// Reads one page; returns false if the file ends before the page does.
    pub fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<bool> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let offset = page_no as u64 * PAGE_SIZE as u64;
        let len = self.file.metadata()?.len();
        if offset + PAGE_SIZE as u64 > len {
            return Ok(false);
        }
        self.file
            .read_exact_at(buf, offset)
            .wrap_err_with(|| format!("failed to read page {page_no} of '{}'", self.path.display()))?;
        Ok(true)
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .wrap_err_with(|| format!("failed to truncate '{}' to {len}", self.path.display()))
    }

    pub fn read_header(&self) -> Result<LogFileHeader> {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        self.file
            .read_exact_at(&mut buf, 0)
            .wrap_err_with(|| format!("failed to read header of '{}'", self.path.display()))?;
        LogFileHeader::from_bytes(&buf).map(|header| *header)
    }

    /// Seals (or raises) the header's max-LSN field.
    pub fn seal_max_lsn(&self, max_lsn: Lsn) -> Result<()> {
        self.write_at(MAX_LSN_FIELD_OFFSET, &max_lsn.raw().to_le_bytes())?;
        self.sync()
    }
}

fn file_name(no: u32) -> String {
    format!("translog.{no:06}")
}

fn parse_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("translog.")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

struct PoolInner {
    open: HashMap<u32, Arc<LogFile>>,
    min_file: u32,
    max_file: u32,
    /// Sealed files whose max-LSN must be raised at the next flush because
    /// a later record's chunks span into them.
    pending_seals: HashMap<u32, Lsn>,
    /// Files queued for deferred unlink (PurgePolicy::AtNextFlush).
    pending_unlink: Vec<u32>,
}

pub struct FilePool {
    dir: PathBuf,
    server_id: u32,
    header_flags: u32,
    sync_directory: bool,
    inner: RwLock<PoolInner>,
    created_since_dir_sync: AtomicBool,
}

impl FilePool {
    /// Opens the pool over `dir`, creating the directory if needed, and
    /// returns the live file range found on disk (`None` for a fresh log).
    pub fn open<P: AsRef<Path>>(
        dir: P,
        server_id: u32,
        header_flags: u32,
        sync_directory: bool,
    ) -> Result<(Self, Option<(u32, u32)>)> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create log directory '{}'", dir.display()))?;

        let mut min_file = u32::MAX;
        let mut max_file = 0u32;
        for entry in fs::read_dir(&dir)
            .wrap_err_with(|| format!("failed to list log directory '{}'", dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(no) = parse_file_name(name) {
                min_file = min_file.min(no);
                max_file = max_file.max(no);
            }
        }

        let range = if max_file == 0 {
            None
        } else {
            ensure!(min_file >= 1, "log file numbers start at 1");
            Some((min_file, max_file))
        };

        let (min_file, max_file) = range.unwrap_or((1, 0));
        let pool = Self {
            dir,
            server_id,
            header_flags,
            sync_directory,
            inner: RwLock::new(PoolInner {
                open: HashMap::new(),
                min_file,
                max_file,
                pending_seals: HashMap::new(),
                pending_unlink: Vec::new(),
            }),
            created_since_dir_sync: AtomicBool::new(false),
        };
        Ok((pool, range))
    }

    pub fn min_file(&self) -> u32 {
        self.inner.read().min_file
    }

    pub fn max_file(&self) -> u32 {
        self.inner.read().max_file
    }

    /// Creates the next file in sequence with a synced header page.
    pub fn create_next(&self) -> Result<Arc<LogFile>> {
        let mut inner = self.inner.write();
        let no = inner.max_file + 1;
        let path = self.dir.join(file_name(no));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create log file '{}'", path.display()))?;

        let mut page = vec![0u8; PAGE_SIZE];
        let header = LogFileHeader::new(no, self.server_id, self.header_flags);
        page[..FILE_HEADER_SIZE].copy_from_slice(header.as_bytes());
        file.write_all_at(&page, 0)
            .wrap_err_with(|| format!("failed to write header page of '{}'", path.display()))?;
        file.sync_data()
            .wrap_err_with(|| format!("failed to sync new log file '{}'", path.display()))?;

        let log_file = Arc::new(LogFile { no, path, file });
        inner.open.insert(no, Arc::clone(&log_file));
        inner.max_file = no;
        self.created_since_dir_sync.store(true, Ordering::Release);
        debug!(file_no = no, "created log file");
        Ok(log_file)
    }

    /// Returns a shared handle, opening the file if necessary.
    pub fn get(&self, no: u32) -> Result<Arc<LogFile>> {
        if let Some(file) = self.inner.read().open.get(&no) {
            return Ok(Arc::clone(file));
        }

        let mut inner = self.inner.write();
        if let Some(file) = inner.open.get(&no) {
            return Ok(Arc::clone(file));
        }
        ensure!(
            no >= inner.min_file && no <= inner.max_file,
            "log file {no} is outside the live range {}..={}",
            inner.min_file,
            inner.max_file
        );
        let path = self.dir.join(file_name(no));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open log file '{}'", path.display()))?;
        let log_file = Arc::new(LogFile { no, path, file });

        let header = log_file.read_header()?;
        ensure!(
            header.file_no() == no,
            "log file '{}' claims number {}",
            log_file.path.display(),
            header.file_no()
        );

        inner.open.insert(no, Arc::clone(&log_file));
        Ok(log_file)
    }

    /// Sealed max-LSN of a file, straight from its header.
    pub fn read_max_lsn(&self, no: u32) -> Result<Lsn> {
        let file = self.get(no)?;
        Ok(Lsn::from_raw(file.read_header()?.max_lsn()))
    }

    /// Requests that `no`'s sealed max-LSN be raised to at least `lsn` at
    /// the next flush.
    pub fn request_seal_raise(&self, no: u32, lsn: Lsn) {
        let mut inner = self.inner.write();
        let entry = inner.pending_seals.entry(no).or_insert(Lsn::ZERO);
        if lsn > *entry {
            *entry = lsn;
        }
    }

    /// Applies pending max-LSN raises. Called by the flusher.
    pub fn apply_pending_seals(&self) -> Result<()> {
        let pending: Vec<(u32, Lsn)> = {
            let mut inner = self.inner.write();
            inner.pending_seals.drain().collect()
        };
        for (no, lsn) in pending {
            if no < self.min_file() {
                // Purged since the raise was requested.
                continue;
            }
            let file = self.get(no)?;
            let current = Lsn::from_raw(file.read_header()?.max_lsn());
            if lsn > current {
                file.seal_max_lsn(lsn)?;
                debug!(file_no = no, max_lsn = %lsn, "raised sealed max-LSN");
            }
        }
        Ok(())
    }

    /// Unlinks `no` immediately. The caller guarantees it is neither the
    /// active file nor needed by any reader.
    pub fn delete(&self, no: u32) -> Result<()> {
        let mut inner = self.inner.write();
        ensure!(
            no == inner.min_file,
            "purge must delete files in order: {no} is not the oldest ({})",
            inner.min_file
        );
        inner.open.remove(&no);
        inner.pending_seals.remove(&no);
        let path = self.dir.join(file_name(no));
        fs::remove_file(&path)
            .wrap_err_with(|| format!("failed to delete log file '{}'", path.display()))?;
        inner.min_file = no + 1;
        debug!(file_no = no, "deleted log file");
        Ok(())
    }

    /// Queues `no` for unlink at the next flush. Returns false if it was
    /// already queued.
    pub fn queue_unlink(&self, no: u32) -> bool {
        let mut inner = self.inner.write();
        if inner.pending_unlink.contains(&no) {
            return false;
        }
        inner.pending_unlink.push(no);
        true
    }

    /// Unlinks queued files. Called by the flusher.
    pub fn drain_unlinks(&self) -> Result<usize> {
        let queued: Vec<u32> = {
            let mut inner = self.inner.write();
            let mut queued = std::mem::take(&mut inner.pending_unlink);
            queued.sort_unstable();
            queued
        };
        let count = queued.len();
        for no in queued {
            self.delete(no)?;
        }
        Ok(count)
    }

    /// Fsyncs the directory if a file was created since the last call.
    /// Returns whether a sync happened.
    pub fn sync_dir_if_needed(&self) -> Result<bool> {
        if !self.sync_directory {
            return Ok(false);
        }
        if !self.created_since_dir_sync.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let dir = File::open(&self.dir)
            .wrap_err_with(|| format!("failed to open log directory '{}'", self.dir.display()))?;
        dir.sync_all()
            .wrap_err_with(|| format!("failed to sync log directory '{}'", self.dir.display()))?;
        Ok(true)
    }

    /// Drops descriptors for files outside the live range (after purge) and
    /// all cached descriptors at shutdown.
    pub fn close_all(&self) {
        self.inner.write().open.clear();
    }
}

impl std::fmt::Debug for FilePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("FilePool")
            .field("dir", &self.dir)
            .field("min_file", &inner.min_file)
            .field("max_file", &inner.max_file)
            .field("open", &inner.open.len())
            .finish()
    }
}
