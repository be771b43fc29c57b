//! # Scanner and Record Reader
//!
//! Forward iteration over the log by address, shared by recovery and by
//! callers replaying records. Both work through [`PageSource`], so the
//! same chunk-walking code runs against a live [`Log`](crate::Log)
//! (buffers + cache + files) and against recovery's disk-only view.
//!
//! ## Chunk Walking
//!
//! A position always points at a chunk tag inside a page's payload. The
//! walker classifies the tag:
//!
//! - record-head and fixed chunks start records and are decoded into
//!   [`RecordHeader`]s;
//! - no-header and length chunks found standalone belong to a group of a
//!   multi-group record whose head comes later — the scanner steps over
//!   them silently;
//! - a zero byte ends the page; the walk resumes on the next page (or the
//!   next file, for positions past a sealed file's last page).
//!
//! A record is surfaced only if its head chunk lies below the scan
//! horizon. Because the placed horizon trails every incomplete
//! reservation, a surfaced record is always fully readable.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::chunk::{classify_chunk, decode_varlen, ChunkKind};
use crate::config::PAGE_SIZE;
use crate::log::Log;
use crate::lsn::{decode_compressed_lsn, Lsn};
use crate::page::PageLayout;
use crate::record::{RecordBody, RecordClass, RecordHeader, RecordType};

/// Where the scanner gets page images from.
pub(crate) trait PageSource {
    /// Copies page `page_no` of `file_no` into `buf` (repaired, raw form).
    fn read_log_page(&self, file_no: u32, page_no: u32, buf: &mut [u8]) -> Result<()>;
    /// Exclusive end offset of a sealed file's pages.
    fn file_end_offset(&self, file_no: u32) -> Result<u32>;
}

/// One page of cursor-local cache.
pub(crate) struct CachedPage {
    key: Option<(u32, u32)>,
    buf: Box<[u8]>,
}

impl CachedPage {
    pub(crate) fn new() -> Self {
        Self {
            key: None,
            buf: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        }
    }

    fn load(&mut self, source: &dyn PageSource, file_no: u32, page_no: u32) -> Result<&[u8]> {
        if self.key != Some((file_no, page_no)) {
            source.read_log_page(file_no, page_no, &mut self.buf)?;
            self.key = Some((file_no, page_no));
        }
        Ok(&self.buf)
    }

    /// Drops the cached page (live scanners must re-read buffer pages that
    /// may have grown).
    fn invalidate(&mut self) {
        self.key = None;
    }
}

/// Chunk walker over a page source.
pub(crate) struct ChunkWalk<'a> {
    source: &'a dyn PageSource,
    layout: PageLayout,
    end: Lsn,
    page: &'a mut CachedPage,
}

impl<'a> ChunkWalk<'a> {
    pub(crate) fn new(
        source: &'a dyn PageSource,
        layout: PageLayout,
        end: Lsn,
        page: &'a mut CachedPage,
    ) -> Self {
        Self {
            source,
            layout,
            end,
            page,
        }
    }

    fn page_bytes(&mut self, pos: Lsn) -> Result<&[u8]> {
        self.page.load(self.source, pos.file_no(), pos.page_no())
    }

    /// Moves a position at (or past) a page boundary to the next page's
    /// first payload byte, hopping to the next file when a sealed file
    /// ends.
    fn normalize(&mut self, pos: Lsn) -> Result<Lsn> {
        let within = pos.within_page();
        if within >= self.layout.header_size() {
            return Ok(pos);
        }
        ensure!(within == 0, "position {pos} inside a page header");
        let mut pos = pos;
        if pos.file_no() < self.end.file_no() {
            let file_end = self.source.file_end_offset(pos.file_no())?;
            if pos.offset() >= file_end {
                pos = Lsn::new(pos.file_no() + 1, PAGE_SIZE as u32);
            }
        }
        ensure!(
            pos.offset() >= PAGE_SIZE as u32,
            "position {pos} on the file header page"
        );
        Ok(Lsn::new(
            pos.file_no(),
            pos.offset() + self.layout.header_size() as u32,
        ))
    }

    /// Finds the next record at or after `pos`, returning its header and
    /// the position following its locally stored chunks.
    pub(crate) fn next_record(&mut self, mut pos: Lsn) -> Result<Option<(RecordHeader, Lsn)>> {
        loop {
            pos = self.normalize(pos)?;
            if pos >= self.end {
                return Ok(None);
            }
            let within = pos.within_page();
            let bytes = self.page_bytes(pos)?;
            match classify_chunk(bytes[within]) {
                ChunkKind::PageEnd => {
                    pos = Lsn::new(pos.file_no(), pos.page_offset() + PAGE_SIZE as u32);
                }
                ChunkKind::RecordHead(_) | ChunkKind::Fixed(_) => {
                    return self.parse_record(pos).map(Some);
                }
                ChunkKind::NoHeader => {
                    // Group data of a record headed later; skip the page.
                    pos = Lsn::new(pos.file_no(), pos.page_offset() + PAGE_SIZE as u32);
                }
                ChunkKind::Length => {
                    let (len, consumed) = decode_varlen(&bytes[within + 1..])?;
                    let chunk = 1 + consumed + len as usize;
                    ensure!(
                        within + chunk <= PAGE_SIZE,
                        "length chunk at {pos} overruns its page"
                    );
                    pos = Lsn::new(pos.file_no(), pos.offset() + chunk as u32);
                }
            }
        }
    }

    /// Decodes the record whose head or fixed chunk is at `lsn`. Returns
    /// the header and the position after the record's local chunks.
    pub(crate) fn parse_record(&mut self, lsn: Lsn) -> Result<(RecordHeader, Lsn)> {
        ensure!(
            lsn.within_page() >= self.layout.header_size() && lsn.page_no() > 0,
            "{lsn} cannot address a chunk"
        );
        let within = lsn.within_page();
        ensure!(
            within + 3 <= PAGE_SIZE,
            "truncated chunk header at {lsn}"
        );
        let bytes = self.page_bytes(lsn)?.to_vec();
        let tag = bytes[within];

        match classify_chunk(tag) {
            ChunkKind::Fixed(bits) => {
                let Some(record_type) = RecordType::from_bits(bits) else {
                    bail!("unknown record type {bits} at {lsn}");
                };
                let descriptor = record_type.descriptor();
                let (tail_len, refs) = match descriptor.class {
                    RecordClass::Fixed { payload_len }
                    | RecordClass::PseudoFixed { payload_len } => {
                        (payload_len as u32, descriptor.lsn_refs as usize)
                    }
                    RecordClass::Variable => {
                        bail!("variable type {record_type:?} in a fixed chunk at {lsn}")
                    }
                };
                let short_trid = u16::from_le_bytes([bytes[within + 1], bytes[within + 2]]);

                let mut cursor = within + 3;
                let mut lsn_refs: SmallVec<[Lsn; 2]> = SmallVec::new();
                for _ in 0..refs {
                    ensure!(cursor < PAGE_SIZE, "refs of record at {lsn} overrun the page");
                    let (referenced, consumed) = decode_compressed_lsn(lsn, &bytes[cursor..])?;
                    lsn_refs.push(referenced);
                    cursor += consumed;
                }
                let tail_start = Lsn::new(lsn.file_no(), lsn.page_offset() + cursor as u32);
                ensure!(
                    cursor + tail_len as usize <= PAGE_SIZE,
                    "fixed record at {lsn} overruns its page"
                );
                let next = Lsn::new(tail_start.file_no(), tail_start.offset() + tail_len);
                let header = RecordHeader {
                    lsn,
                    record_type,
                    short_trid,
                    record_length: refs as u64 * 8 + tail_len as u64,
                    lsn_refs,
                    body: RecordBody::Fixed {
                        tail_start,
                        tail_len,
                    },
                };
                Ok((header, next))
            }
            ChunkKind::RecordHead(bits) => {
                let Some(record_type) = RecordType::from_bits(bits) else {
                    bail!("unknown record type {bits} at {lsn}");
                };
                ensure!(
                    matches!(record_type.descriptor().class, RecordClass::Variable),
                    "fixed type {record_type:?} in a record-head chunk at {lsn}"
                );
                let short_trid = u16::from_le_bytes([bytes[within + 1], bytes[within + 2]]);
                let mut cursor = within + 3;
                let (total, consumed) = decode_varlen(&bytes[cursor..])?;
                cursor += consumed;
                ensure!(cursor < PAGE_SIZE, "head chunk at {lsn} overruns the page");
                let (chunk_len, consumed) = decode_varlen(&bytes[cursor..])?;
                cursor += consumed;
                ensure!(cursor <= PAGE_SIZE, "head chunk at {lsn} overruns the page");

                let data_start = Lsn::new(lsn.file_no(), lsn.page_offset() + cursor as u32);
                let (body, next) = if chunk_len == total {
                    ensure!(
                        cursor + total as usize <= PAGE_SIZE,
                        "inline record at {lsn} overruns its page"
                    );
                    (
                        RecordBody::Inline { data_start },
                        Lsn::new(data_start.file_no(), data_start.offset() + total as u32),
                    )
                } else if chunk_len == 0 {
                    let next = self.walk_continuation(data_start, total, &mut |_, _| {})?;
                    (RecordBody::SingleGroup { data_start }, next)
                } else {
                    // Group directory follows instead of data.
                    let mut extents: Vec<(Lsn, u32)> = Vec::new();
                    let next = self.walk_continuation(data_start, chunk_len, &mut |at, len| {
                        extents.push((at, len));
                    })?;
                    let mut directory = Vec::with_capacity(chunk_len as usize);
                    for (at, len) in extents {
                        let within = at.within_page();
                        let page = self.page_bytes(at)?;
                        directory.extend_from_slice(&page[within..within + len as usize]);
                    }
                    let groups = crate::chunk::decode_group_directory(&directory)?;
                    (RecordBody::MultiGroup { groups }, next)
                };

                let header = RecordHeader {
                    lsn,
                    record_type,
                    short_trid,
                    record_length: total,
                    lsn_refs: SmallVec::new(),
                    body,
                };
                Ok((header, next))
            }
            _ => bail!("{lsn} does not address a record"),
        }
    }

    /// Walks the continuation of a head chunk: data to the end of the head
    /// page, then no-header/length chunks until `total` bytes are
    /// accounted for. Emits `(position, length)` payload extents and
    /// returns the position after the final chunk. Continuations never
    /// cross files.
    pub(crate) fn walk_continuation(
        &mut self,
        data_start: Lsn,
        total: u64,
        sink: &mut dyn FnMut(Lsn, u32),
    ) -> Result<Lsn> {
        let file_no = data_start.file_no();
        let mut consumed: u64 = 0;
        let mut pos = data_start;

        // The head chunk's own data runs to its page end (or record end).
        let in_page = (PAGE_SIZE - pos.within_page()) as u64;
        let head_data = total.min(in_page);
        if head_data > 0 {
            sink(pos, head_data as u32);
            consumed += head_data;
            pos = Lsn::new(file_no, pos.offset() + head_data as u32);
        }

        while consumed < total {
            let within = pos.within_page();
            if within == 0 {
                pos = Lsn::new(file_no, pos.offset() + self.layout.header_size() as u32);
                continue;
            }
            ensure!(
                pos < self.end,
                "record continuation at {pos} crosses the scan horizon {}",
                self.end
            );
            let bytes = self.page_bytes(pos)?;
            match classify_chunk(bytes[within]) {
                ChunkKind::PageEnd => {
                    pos = Lsn::new(file_no, pos.page_offset() + PAGE_SIZE as u32);
                }
                ChunkKind::NoHeader => {
                    let data = (PAGE_SIZE - within - 1) as u64;
                    ensure!(
                        consumed + data <= total,
                        "continuation at {pos} overruns the record length"
                    );
                    sink(Lsn::new(file_no, pos.offset() + 1), data as u32);
                    consumed += data;
                    pos = Lsn::new(file_no, pos.page_offset() + PAGE_SIZE as u32);
                }
                ChunkKind::Length => {
                    let (len, n) = decode_varlen(&bytes[within + 1..])?;
                    ensure!(
                        within + 1 + n + len as usize <= PAGE_SIZE,
                        "length chunk at {pos} overruns its page"
                    );
                    ensure!(
                        consumed + len <= total,
                        "continuation at {pos} overruns the record length"
                    );
                    sink(Lsn::new(file_no, pos.offset() + 1 + n as u32), len as u32);
                    consumed += len;
                    pos = Lsn::new(file_no, pos.offset() + (1 + n + len as usize) as u32);
                }
                _ => bail!("unexpected record chunk inside a continuation at {pos}"),
            }
        }
        Ok(pos)
    }

    /// Collects the payload extents of one group (`chunk_count` chunks
    /// starting at `start`). Returns the bytes the group carries.
    pub(crate) fn walk_group(
        &mut self,
        start: Lsn,
        chunk_count: u16,
        sink: &mut dyn FnMut(Lsn, u32),
    ) -> Result<u64> {
        let file_no = start.file_no();
        let mut pos = start;
        let mut bytes_seen: u64 = 0;
        let mut chunks_left = chunk_count;

        while chunks_left > 0 {
            let within = pos.within_page();
            if within == 0 {
                pos = Lsn::new(file_no, pos.offset() + self.layout.header_size() as u32);
                continue;
            }
            ensure!(
                pos < self.end,
                "group chunk at {pos} crosses the scan horizon {}",
                self.end
            );
            let bytes = self.page_bytes(pos)?;
            match classify_chunk(bytes[within]) {
                ChunkKind::PageEnd => {
                    pos = Lsn::new(file_no, pos.page_offset() + PAGE_SIZE as u32);
                }
                ChunkKind::NoHeader => {
                    let data = (PAGE_SIZE - within - 1) as u32;
                    sink(Lsn::new(file_no, pos.offset() + 1), data);
                    bytes_seen += data as u64;
                    chunks_left -= 1;
                    pos = Lsn::new(file_no, pos.page_offset() + PAGE_SIZE as u32);
                }
                ChunkKind::Length => {
                    let (len, n) = decode_varlen(&bytes[within + 1..])?;
                    ensure!(
                        within + 1 + n + len as usize <= PAGE_SIZE,
                        "length chunk at {pos} overruns its page"
                    );
                    sink(Lsn::new(file_no, pos.offset() + 1 + n as u32), len as u32);
                    bytes_seen += len;
                    chunks_left -= 1;
                    pos = Lsn::new(file_no, pos.offset() + (1 + n + len as usize) as u32);
                }
                _ => bail!("record chunk interrupts a group at {pos}"),
            }
        }
        Ok(bytes_seen)
    }
}

/// Decodes the record header at `lsn` against `source`.
pub(crate) fn read_header_at(
    source: &dyn PageSource,
    layout: PageLayout,
    lsn: Lsn,
    horizon: Lsn,
) -> Result<RecordHeader> {
    ensure!(
        lsn < horizon,
        "{lsn} is at or beyond the readable horizon {horizon}"
    );
    let mut page = CachedPage::new();
    let mut walk = ChunkWalk::new(source, layout, horizon, &mut page);
    let (header, _) = walk.parse_record(lsn)?;
    Ok(header)
}

// ============================================================================
// Record reader
// ============================================================================

/// Positioned reader over one record's payload, for repeated partial
/// reads. Positions are logical payload offsets: pseudo-fixed refs read
/// back as their expanded 8-byte form.
pub struct RecordReader {
    header: RecordHeader,
    /// Expanded refs synthesized ahead of the on-disk tail.
    prefix: SmallVec<[u8; 16]>,
    /// On-disk payload extents, in record order; none crosses a page.
    extents: Vec<(Lsn, u32)>,
    pos: u64,
    page: CachedPage,
}

impl RecordReader {
    pub fn open(log: &Log, lsn: Lsn) -> Result<Self> {
        Self::open_with(log, log.layout, lsn, log.placed_horizon())
    }

    pub(crate) fn open_with(
        source: &dyn PageSource,
        layout: PageLayout,
        lsn: Lsn,
        horizon: Lsn,
    ) -> Result<Self> {
        let mut page = CachedPage::new();
        let mut walk = ChunkWalk::new(source, layout, horizon, &mut page);
        let (header, _) = walk.parse_record(lsn)?;

        let mut prefix: SmallVec<[u8; 16]> = SmallVec::new();
        let mut extents: Vec<(Lsn, u32)> = Vec::new();
        match &header.body {
            RecordBody::Fixed {
                tail_start,
                tail_len,
            } => {
                for referenced in &header.lsn_refs {
                    prefix.extend_from_slice(&referenced.raw().to_be_bytes());
                }
                if *tail_len > 0 {
                    extents.push((*tail_start, *tail_len));
                }
            }
            RecordBody::Inline { data_start } => {
                extents.push((*data_start, header.record_length as u32));
            }
            RecordBody::SingleGroup { data_start } => {
                walk.walk_continuation(*data_start, header.record_length, &mut |at, len| {
                    extents.push((at, len));
                })?;
            }
            RecordBody::MultiGroup { groups } => {
                let mut gathered: u64 = 0;
                for group in groups {
                    gathered += walk.walk_group(group.start, group.chunk_count, &mut |at, len| {
                        extents.push((at, len));
                    })?;
                }
                ensure!(
                    gathered == header.record_length,
                    "groups of record {lsn} carry {gathered} bytes, header says {}",
                    header.record_length
                );
            }
        }

        Ok(Self {
            header,
            prefix,
            extents,
            pos: 0,
            page,
        })
    }

    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    /// Logical payload length.
    pub fn len(&self) -> u64 {
        self.header.record_length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Repositions the reader at a payload offset.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        ensure!(
            offset <= self.len(),
            "seek to {offset} beyond the record length {}",
            self.len()
        );
        self.pos = offset;
        Ok(())
    }

    /// Copies payload into `buf`; returns bytes read (short at the end).
    pub fn read(&mut self, log: &Log, buf: &mut [u8]) -> Result<usize> {
        self.read_with(log, buf)
    }

    pub(crate) fn read_with(&mut self, source: &dyn PageSource, buf: &mut [u8]) -> Result<usize> {
        let mut out = 0usize;
        while out < buf.len() && self.pos < self.len() {
            let pos = self.pos;
            if (pos as usize) < self.prefix.len() {
                let avail = &self.prefix[pos as usize..];
                let take = avail.len().min(buf.len() - out);
                buf[out..out + take].copy_from_slice(&avail[..take]);
                out += take;
                self.pos += take as u64;
                continue;
            }

            // Locate the extent containing `pos`.
            let mut rel = pos - self.prefix.len() as u64;
            let mut found = None;
            for &(at, len) in &self.extents {
                if rel < len as u64 {
                    found = Some((at, len));
                    break;
                }
                rel -= len as u64;
            }
            let Some((at, len)) = found else {
                break;
            };

            let within = at.within_page() + rel as usize;
            let take = ((len as u64 - rel) as usize).min(buf.len() - out);
            let bytes = self.page.load(source, at.file_no(), at.page_no())?;
            buf[out..out + take].copy_from_slice(&bytes[within..within + take]);
            out += take;
            self.pos += take as u64;
        }
        Ok(out)
    }
}

// ============================================================================
// Scanner
// ============================================================================

/// Forward scan cursor. Obtain with [`Log::open_scanner`]; advance with
/// [`Log::next_record_header`].
pub struct ScanCursor {
    pos: Lsn,
    fixed_end: Option<Lsn>,
    layout: PageLayout,
    page: CachedPage,
}

pub(crate) fn open_scanner(log: &Log, start_lsn: Lsn, fixed_horizon: bool) -> Result<ScanCursor> {
    let horizon = log.placed_horizon();
    ensure!(
        start_lsn <= horizon,
        "scan start {start_lsn} is beyond the placed horizon {horizon}"
    );
    ensure!(
        start_lsn.page_no() > 0 && start_lsn.within_page() >= log.layout.header_size(),
        "scan start {start_lsn} cannot address a chunk"
    );
    Ok(ScanCursor {
        pos: start_lsn,
        fixed_end: fixed_horizon.then_some(horizon),
        layout: log.layout,
        page: CachedPage::new(),
    })
}

impl ScanCursor {
    /// Next record at or after the cursor, or `None` at the horizon.
    pub fn next_record_header(&mut self, log: &Log) -> Result<Option<RecordHeader>> {
        let end = match self.fixed_end {
            Some(end) => end,
            None => {
                // The horizon moves; pages cached from buffers may have
                // grown since the last call.
                self.page.invalidate();
                log.placed_horizon()
            }
        };
        self.next_with(log, end)
    }

    pub(crate) fn next_with(
        &mut self,
        source: &dyn PageSource,
        end: Lsn,
    ) -> Result<Option<RecordHeader>> {
        let mut walk = ChunkWalk::new(source, self.layout, end, &mut self.page);
        match walk.next_record(self.pos)? {
            Some((header, next)) => {
                self.pos = next;
                Ok(Some(header))
            }
            None => Ok(None),
        }
    }

    /// Position of the next chunk the cursor will examine.
    pub fn position(&self) -> Lsn {
        self.pos
    }
}
