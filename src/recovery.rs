//! # Recovery
//!
//! On open, the log's tail is untrusted: a crash may have torn the last
//! page mid-write, left a reserved-but-uncopied gap, or orphaned the
//! groups of a record whose head never landed. Recovery walks the last
//! file and cuts the log back to the last position provably containing
//! only complete records.
//!
//! ## Procedure
//!
//! 1. **Page pass** — validate pages of the last file forward from its
//!    first page: header fields must match the page's address, finalized
//!    pages must pass CRC and carry consistent sector generations. The
//!    pass stops at the first invalid page, at a partial (non-finalized)
//!    page — necessarily the last one written — or at end of file.
//!    Sector repair identifies the first torn sector of a partial page
//!    and discards everything after it.
//! 2. **Record pass** — scan chunks from the start of the file to the
//!    verified page extent, tracking the end of the last record that
//!    parses and reads completely (groups included). Standalone group
//!    chunks whose head never arrived are skipped and fall off the end.
//! 3. **Truncate** — the recovered horizon is the end of the last
//!    complete record. The horizon's page is rewritten with its tail
//!    zeroed, the file is cut to that page boundary, and everything is
//!    fsynced. Running recovery again over the result reproduces the
//!    same horizon.
//!
//! Earlier files are not scanned: the write path never writes a byte of
//! file N+1 before fsyncing all of file N (cross-file barrier), so
//! everything below the last file is a complete prefix. Records verified
//! by the record pass may still reference group chunks in earlier files;
//! reading them exercises those files' pages through the normal
//! validation path.

use eyre::{ensure, Result};
use tracing::{debug, warn};

use crate::config::PAGE_SIZE;
use crate::files::FilePool;
use crate::lsn::Lsn;
use crate::page::{self, PageLayout};
use crate::scan::{CachedPage, ChunkWalk, PageSource, RecordReader};

/// What recovery found and repaired.
#[derive(Debug, Clone)]
pub struct RecoveryInfo {
    /// Recovered end of log; writing resumes here.
    pub horizon: Lsn,
    /// LSN of the last complete record, `Lsn::ZERO` for an empty log.
    pub last_record_lsn: Lsn,
    /// Complete records found in the tail file.
    pub records_verified: u64,
    /// Pages that passed validation in the tail file.
    pub pages_validated: u32,
    /// Bytes discarded past the recovered horizon, trailing page filler
    /// included (a clean log still reports its last page's slack here).
    pub bytes_truncated: u64,
    /// Repaired image of the horizon's partial page, for reseeding the
    /// first buffer.
    pub(crate) partial_page: Option<Vec<u8>>,
    /// Disk-write generation of that page.
    pub(crate) partial_page_generation: u8,
}

/// Disk-only page source for recovery and post-crash verification.
struct RecoverySource<'a> {
    files: &'a FilePool,
    layout: PageLayout,
    /// Verified extent of the tail file's last (partial) page, if any:
    /// reads of that page come from the repaired image.
    tail_page: Option<(u32, u32, Vec<u8>)>,
}

impl PageSource for RecoverySource<'_> {
    fn read_log_page(&self, file_no: u32, page_no: u32, buf: &mut [u8]) -> Result<()> {
        if let Some((tail_file, tail_page_no, image)) = &self.tail_page {
            if *tail_file == file_no && *tail_page_no == page_no {
                buf.copy_from_slice(image);
                return Ok(());
            }
        }
        let file = self.files.get(file_no)?;
        ensure!(
            file.read_page(page_no, buf)?,
            "log page {page_no} of file {file_no} is beyond the end of the file"
        );
        let status = page::validate_and_repair(buf, page_no, file_no, self.layout)?;
        ensure!(
            status.full,
            "log page {page_no} of file {file_no} is not finalized"
        );
        Ok(())
    }

    fn file_end_offset(&self, file_no: u32) -> Result<u32> {
        let len = self.files.get(file_no)?.len()?;
        Ok((len - len % PAGE_SIZE as u64) as u32)
    }
}

/// Validates the tail file and truncates the torn tail. See the module
/// docs for the three passes.
pub(crate) fn recover(
    files: &FilePool,
    layout: PageLayout,
    min_file: u32,
    max_file: u32,
) -> Result<RecoveryInfo> {
    let tail = files.get(max_file)?;

    // Page pass.
    let mut pages_validated = 0u32;
    let mut content_end = PAGE_SIZE as u32; // exclusive, past the header page
    let mut partial: Option<(u32, Vec<u8>, u8)> = None; // (page_no, image, generation)
    let mut page_no = 1u32;
    let mut buf = vec![0u8; PAGE_SIZE];
    loop {
        if !tail.read_page(page_no, &mut buf)? {
            break;
        }
        match page::validate_and_repair(&mut buf, page_no, max_file, layout) {
            Ok(status) if status.full => {
                pages_validated += 1;
                content_end = (page_no + 1) * PAGE_SIZE as u32;
                page_no += 1;
            }
            Ok(status) => {
                // Partial page: the last one written. Its verified prefix
                // joins the content; anything after it is stale.
                pages_validated += 1;
                content_end = page_no * PAGE_SIZE as u32 + status.verified_end as u32;
                let generation = if layout.use_protection {
                    buf[layout.table_offset()]
                } else {
                    0
                };
                partial = Some((page_no, buf.clone(), generation));
                break;
            }
            Err(err) => {
                warn!(page_no, file_no = max_file, "invalid page stops recovery: {err:#}");
                content_end = page_no * PAGE_SIZE as u32;
                break;
            }
        }
    }

    // Record pass.
    let source = RecoverySource {
        files,
        layout,
        tail_page: partial
            .as_ref()
            .map(|(page_no, image, _)| (max_file, *page_no, image.clone())),
    };
    let content_horizon = Lsn::new(max_file, content_end);
    let scan_start = Lsn::new(max_file, (PAGE_SIZE + layout.header_size()) as u32);

    let mut last_record_lsn = Lsn::ZERO;
    let mut horizon = Lsn::new(max_file, PAGE_SIZE as u32);
    let mut records_verified = 0u64;

    if content_end > PAGE_SIZE as u32 {
        let mut page_cache = CachedPage::new();
        let mut walk = ChunkWalk::new(&source, layout, content_horizon, &mut page_cache);
        let mut pos = scan_start;
        loop {
            match walk.next_record(pos) {
                Ok(Some((header, next))) => {
                    if next > content_horizon {
                        // The record's chunks structurally fit the page but
                        // run past the verified extent (a torn tail can
                        // zero data without breaking the chunk framing).
                        warn!(lsn = %header.lsn, "record extends past the verified extent");
                        break;
                    }
                    // The header parsed; make sure the payload is fully
                    // reachable (multi-group bodies may span files).
                    match RecordReader::open_with(&source, layout, header.lsn, content_horizon) {
                        Ok(_) => {
                            last_record_lsn = header.lsn;
                            horizon = next;
                            records_verified += 1;
                            pos = next;
                        }
                        Err(err) => {
                            warn!(lsn = %header.lsn, "last record does not read fully: {err:#}");
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(pos = %pos, "malformed chunk stops recovery: {err:#}");
                    break;
                }
            }
        }
    }

    // A tail file holding no complete record of its own still follows
    // sealed predecessors; carry their last record LSN forward.
    if last_record_lsn.is_zero() && max_file > min_file {
        last_record_lsn = files.read_max_lsn(max_file - 1)?;
    }

    // Truncate pass.
    let bytes_truncated = (content_end - horizon.offset()) as u64;
    let within = horizon.within_page();
    let mut partial_page = None;
    let mut partial_page_generation = 0u8;
    if within != 0 {
        let matches_horizon = partial
            .as_ref()
            .is_some_and(|(page_no, _, _)| *page_no == horizon.page_no());
        let (image, generation) = if matches_horizon {
            let (_, image, generation) = partial.take().expect("checked above");
            (image, generation)
        } else {
            // The horizon ends inside a page that validated as full (a
            // record boundary mid-page followed by garbage); reload its
            // repaired image for the rewrite.
            let mut image = vec![0u8; PAGE_SIZE];
            source.read_log_page(max_file, horizon.page_no(), &mut image)?;
            let generation = if layout.use_protection {
                image[layout.table_offset()]
            } else {
                0
            };
            (image, generation)
        };

        let mut repaired = image;
        repaired[within..].fill(0);
        // A reloaded full page stops being full once its tail is cut.
        repaired[6] &= !page::PAGE_FLAG_FULL;

        // Rewrite the horizon's page with its tail cleared so the on-disk
        // state matches what the write path will append to.
        let mut disk_image = repaired.clone();
        let next_generation = generation.wrapping_add(1);
        page::finalize_page(&mut disk_image, layout, false, next_generation);
        tail.write_at(horizon.page_offset() as u64, &disk_image)?;

        partial_page = Some(repaired);
        partial_page_generation = next_generation;
    }
    tail.set_len(horizon.page_offset() as u64 + if within != 0 { PAGE_SIZE as u64 } else { 0 })?;
    tail.sync()?;

    if bytes_truncated > 0 {
        debug!(
            horizon = %horizon,
            bytes_truncated,
            "recovery truncated torn tail"
        );
    }

    Ok(RecoveryInfo {
        horizon,
        last_record_lsn,
        records_verified,
        pages_validated,
        bytes_truncated,
        partial_page,
        partial_page_generation,
    })
}
