//! # Page Format and Integrity
//!
//! Every log page begins with a 7-byte header, optionally followed by a
//! CRC32 slot and a sector-protection table. Chunks occupy the payload that
//! follows; a zero byte where a chunk tag is expected means the rest of the
//! page is empty.
//!
//! ## Page Layout
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  -----------------------------------------
//! 0       3     page_no      Page index within the file (header page = 0)
//! 3       3     file_no      Low 24 bits of the file number
//! 6       1     flags        HAS_CRC | HAS_PROTECTION | FULL
//! 7       4     crc32        Only when HAS_CRC; valid only when FULL
//! 7|11    16    sector table Only when HAS_PROTECTION
//! ...           payload      Chunks
//! ```
//!
//! Usable payload = `PAGE_SIZE − 7 − (crc ? 4 : 0) − (protection ? 16 : 0)`.
//!
//! ## Sector Protection
//!
//! A page is written to disk in [`SECTOR_SIZE`] units that the drive
//! persists independently; a crash mid-write can persist an arbitrary
//! prefix of sectors ("torn write"). To detect where a page stopped being
//! written, every disk image of a page carries a write-generation byte at
//! the start of each sector except sector 0 (which holds the header and is
//! assumed atomic). Slot 0 of the table holds the generation itself; slot
//! `i` holds the payload byte displaced from sector `i`'s first position.
//!
//! On read, the first sector whose leading byte disagrees with the
//! generation marks the torn point: content from there on is stale and is
//! zeroed, and the displaced bytes of all verified sectors are restored in
//! place. The generation increments on every disk write of the same page,
//! so a tail left over from the previous image of this very page is caught
//! too.
//!
//! ## CRC
//!
//! When enabled, a CRC32 over all post-header bytes is computed at
//! finalization time — the moment the page is completely filled — and
//! checked only for pages whose FULL flag is set. Partially filled pages
//! are rewritten on later flushes and rely on sector protection alone
//! until they fill.

use crc::{Crc, CRC_32_ISCSI};
use eyre::{bail, ensure, Result};

use crate::config::{PAGE_BASE_HEADER_SIZE, PAGE_CRC_SIZE, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::lsn::{load_u24_le, store_u24_le};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const PAGE_FLAG_CRC: u8 = 0x01;
pub const PAGE_FLAG_PROTECTION: u8 = 0x02;
pub const PAGE_FLAG_FULL: u8 = 0x04;

/// Per-log page geometry derived from the integrity options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    pub use_crc: bool,
    pub use_protection: bool,
}

impl PageLayout {
    pub fn new(use_crc: bool, use_protection: bool) -> Self {
        Self {
            use_crc,
            use_protection,
        }
    }

    #[inline]
    pub fn crc_offset(&self) -> usize {
        PAGE_BASE_HEADER_SIZE
    }

    #[inline]
    pub fn table_offset(&self) -> usize {
        PAGE_BASE_HEADER_SIZE + if self.use_crc { PAGE_CRC_SIZE } else { 0 }
    }

    /// Bytes occupied by the header, CRC slot, and sector table.
    #[inline]
    pub fn header_size(&self) -> usize {
        self.table_offset() + if self.use_protection { SECTORS_PER_PAGE } else { 0 }
    }

    /// Chunk-bearing bytes per page.
    #[inline]
    pub fn payload_size(&self) -> usize {
        PAGE_SIZE - self.header_size()
    }

    #[inline]
    fn base_flags(&self) -> u8 {
        let mut flags = 0;
        if self.use_crc {
            flags |= PAGE_FLAG_CRC;
        }
        if self.use_protection {
            flags |= PAGE_FLAG_PROTECTION;
        }
        flags
    }
}

/// Outcome of validating one on-disk page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStatus {
    /// The page was finalized (completely filled) when written.
    pub full: bool,
    /// Bytes from the start of the page verified intact. `PAGE_SIZE` unless
    /// a torn write was detected.
    pub verified_end: usize,
}

/// Writes a fresh in-buffer page header. `buf` only needs to cover the
/// header region; the CRC slot and sector table stay zero until the page
/// is finalized for a disk write.
pub fn init_page(buf: &mut [u8], page_no: u32, file_no: u32, layout: PageLayout) {
    debug_assert!(buf.len() >= layout.header_size());
    store_u24_le(&mut buf[0..3], page_no);
    store_u24_le(&mut buf[3..6], file_no & 0x00FF_FFFF);
    buf[6] = layout.base_flags();
    let header = layout.header_size();
    buf[PAGE_BASE_HEADER_SIZE..header].fill(0);
}

/// Prepares a page image for a disk write, in place. Callers pass a scratch
/// copy of the buffer page: protection displaces payload bytes, so the
/// in-buffer image must stay raw for later appends.
///
/// `generation` must differ between successive disk writes of the same
/// page; `full` marks the page as finalized and seals the CRC.
pub fn finalize_page(buf: &mut [u8], layout: PageLayout, full: bool, generation: u8) {
    debug_assert_eq!(buf.len(), PAGE_SIZE);
    if full {
        buf[6] |= PAGE_FLAG_FULL;
    }
    if layout.use_protection {
        let table = layout.table_offset();
        buf[table] = generation;
        for sector in 1..SECTORS_PER_PAGE {
            let pos = sector * SECTOR_SIZE;
            buf[table + sector] = buf[pos];
            buf[pos] = generation;
        }
    }
    if layout.use_crc && full {
        let crc = CRC32.checksum(&buf[layout.header_size()..]);
        let off = layout.crc_offset();
        buf[off..off + PAGE_CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
    }
}

/// Validates a page image read from disk and undoes sector protection in
/// place, restoring displaced payload bytes and zeroing any torn tail.
///
/// Errors mean the page cannot be trusted at all (header mismatch, CRC
/// failure, torn finalized page). A torn *partial* page is not an error:
/// the verified prefix is reported through [`PageStatus::verified_end`] and
/// the caller decides where to cut the log.
pub fn validate_and_repair(
    buf: &mut [u8],
    expect_page_no: u32,
    expect_file_no: u32,
    layout: PageLayout,
) -> Result<PageStatus> {
    ensure!(
        buf.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        buf.len(),
        PAGE_SIZE
    );

    let page_no = load_u24_le(&buf[0..3]);
    let file_no = load_u24_le(&buf[3..6]);
    ensure!(
        page_no == expect_page_no && file_no == (expect_file_no & 0x00FF_FFFF),
        "page header mismatch: found page {page_no} of file {file_no}, expected page {expect_page_no} of file {expect_file_no}"
    );

    let flags = buf[6];
    ensure!(
        (flags & PAGE_FLAG_CRC != 0) == layout.use_crc
            && (flags & PAGE_FLAG_PROTECTION != 0) == layout.use_protection,
        "page flags {flags:#04x} disagree with log configuration"
    );

    let full = flags & PAGE_FLAG_FULL != 0;

    // CRC covers the protected disk image, so it is checked before the
    // sector table is undone.
    if layout.use_crc && full {
        let off = layout.crc_offset();
        let stored = u32::from_le_bytes(buf[off..off + PAGE_CRC_SIZE].try_into().unwrap());
        let computed = CRC32.checksum(&buf[layout.header_size()..]);
        ensure!(
            stored == computed,
            "page {expect_page_no} of file {expect_file_no} failed CRC: stored {stored:#010x}, computed {computed:#010x}"
        );
    }

    let mut verified_end = PAGE_SIZE;
    if layout.use_protection {
        let table = layout.table_offset();
        let generation = buf[table];
        let mut torn_at = None;
        for sector in 1..SECTORS_PER_PAGE {
            let pos = sector * SECTOR_SIZE;
            if buf[pos] != generation {
                torn_at = Some(sector);
                break;
            }
            buf[pos] = buf[table + sector];
        }
        if let Some(sector) = torn_at {
            if full {
                bail!(
                    "finalized page {expect_page_no} of file {expect_file_no} torn at sector {sector}"
                );
            }
            verified_end = sector * SECTOR_SIZE;
            buf[verified_end..].fill(0);
        }
    }

    Ok(PageStatus { full, verified_end })
}
