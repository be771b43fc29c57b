//! # Chunks and Length Encoding
//!
//! A record reaches the log as one or more chunks. The top 2 bits of a
//! chunk's first byte select its kind; a first byte of `0x00` (which would
//! be a record-head chunk of reserved type 0) terminates the chunk sequence
//! of a page.
//!
//! ```text
//! Bits     Kind        Layout
//! ----     ---------   ---------------------------------------------------
//! 00       RecordHead  tag+type:1  trid:2  varlen total  varlen C  ...
//! 01       Fixed       tag+type:1  trid:2  [compressed LSNs]  fixed payload
//! 10       NoHeader    tag:1  payload to end of page
//! 11       Length      tag:1  varlen len  payload
//! ```
//!
//! The record-head `C` field disambiguates the three physical layouts:
//! `C == total` means the whole record follows inline (single chunk);
//! `C == 0` means the data fills this page and continues through NoHeader
//! and Length chunks (single group); any other value is the byte length of
//! a group directory that follows instead of data (multi-group), laid out
//! with the same continuation rules when it spans pages.
//!
//! ## Length Encoding
//!
//! Lengths below 250 take one byte. Larger lengths use an escape prefix:
//!
//! ```text
//! Marker   Total bytes   Range
//! < 250    1             0..=249
//! 250      3             16-bit big-endian
//! 251      4             24-bit big-endian
//! 252      5             32-bit big-endian
//! 253-255  —             reserved, rejected on decode
//! ```

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::lsn::Lsn;

pub const CHUNK_KIND_MASK: u8 = 0xC0;
pub const CHUNK_RECORD_HEAD: u8 = 0x00;
pub const CHUNK_FIXED: u8 = 0x40;
pub const CHUNK_NOHEADER: u8 = 0x80;
pub const CHUNK_LENGTH: u8 = 0xC0;

/// Record type bits carried in the low 6 bits of head/fixed chunk tags.
pub const CHUNK_TYPE_BITS: u8 = 0x3F;

/// Worst-case record-head chunk header: tag, trid, two 5-byte lengths.
pub const MAX_RECORD_HEAD_SIZE: usize = 1 + 2 + 2 * MAX_VARLEN_SIZE;

/// Worst-case Length chunk header: tag plus a 5-byte length.
pub const MAX_LENGTH_CHUNK_HEADER: usize = 1 + MAX_VARLEN_SIZE;

/// Classified first byte of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// `0x00`: no more chunks on this page.
    PageEnd,
    /// Head chunk of a variable-length record; payload is the type bits.
    RecordHead(u8),
    /// Fixed or pseudo-fixed record chunk; payload is the type bits.
    Fixed(u8),
    /// Continuation filling the rest of the page.
    NoHeader,
    /// Length-prefixed continuation.
    Length,
}

#[inline]
pub fn classify_chunk(tag: u8) -> ChunkKind {
    if tag == 0 {
        return ChunkKind::PageEnd;
    }
    match tag & CHUNK_KIND_MASK {
        CHUNK_RECORD_HEAD => ChunkKind::RecordHead(tag & CHUNK_TYPE_BITS),
        CHUNK_FIXED => ChunkKind::Fixed(tag & CHUNK_TYPE_BITS),
        CHUNK_NOHEADER => ChunkKind::NoHeader,
        _ => ChunkKind::Length,
    }
}

// ============================================================================
// Length encoding
// ============================================================================

pub const MAX_VARLEN_SIZE: usize = 5;

const ESCAPE_U16: u8 = 250;
const ESCAPE_U24: u8 = 251;
const ESCAPE_U32: u8 = 252;

/// Bytes [`encode_varlen`] emits for `value`.
#[inline]
pub fn varlen_len(value: u64) -> usize {
    if value < 250 {
        1
    } else if value <= u16::MAX as u64 {
        3
    } else if value <= 0xFF_FFFF {
        4
    } else {
        5
    }
}

/// Encodes `value` into `buf`, returning bytes written. Values above
/// `u32::MAX` never occur (record lengths are capped) and are a caller bug.
pub fn encode_varlen(value: u64, buf: &mut [u8]) -> usize {
    debug_assert!(value <= u32::MAX as u64, "length {value} exceeds encoding");
    if value < 250 {
        buf[0] = value as u8;
        1
    } else if value <= u16::MAX as u64 {
        buf[0] = ESCAPE_U16;
        buf[1..3].copy_from_slice(&(value as u16).to_be_bytes());
        3
    } else if value <= 0xFF_FFFF {
        buf[0] = ESCAPE_U24;
        buf[1] = (value >> 16) as u8;
        buf[2] = (value >> 8) as u8;
        buf[3] = value as u8;
        4
    } else {
        buf[0] = ESCAPE_U32;
        buf[1..5].copy_from_slice(&(value as u32).to_be_bytes());
        5
    }
}

/// Decodes a length, returning `(value, bytes_consumed)`.
pub fn decode_varlen(buf: &[u8]) -> Result<(u64, usize)> {
    ensure!(!buf.is_empty(), "empty buffer for length decode");
    let marker = buf[0];
    match marker {
        0..=249 => Ok((marker as u64, 1)),
        ESCAPE_U16 => {
            ensure!(buf.len() >= 3, "truncated 16-bit length");
            Ok((u16::from_be_bytes([buf[1], buf[2]]) as u64, 3))
        }
        ESCAPE_U24 => {
            ensure!(buf.len() >= 4, "truncated 24-bit length");
            Ok((
                (buf[1] as u64) << 16 | (buf[2] as u64) << 8 | buf[3] as u64,
                4,
            ))
        }
        ESCAPE_U32 => {
            ensure!(buf.len() >= 5, "truncated 32-bit length");
            Ok((
                u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as u64,
                5,
            ))
        }
        _ => bail!("reserved length marker {marker}"),
    }
}

// ============================================================================
// Group directory
// ============================================================================

/// One group of a multi-group record: where its first chunk starts and how
/// many chunks it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupEntry {
    pub start: Lsn,
    pub chunk_count: u16,
}

const GROUP_ENTRY_SIZE: usize = 10;

/// Encoded size of a directory over `groups` groups.
#[inline]
pub fn directory_size(groups: usize) -> usize {
    varlen_len(groups as u64) + groups * GROUP_ENTRY_SIZE
}

/// Appends the group directory to `out`.
pub fn encode_group_directory(groups: &[GroupEntry], out: &mut Vec<u8>) {
    let mut len_buf = [0u8; MAX_VARLEN_SIZE];
    let n = encode_varlen(groups.len() as u64, &mut len_buf);
    out.extend_from_slice(&len_buf[..n]);
    for group in groups {
        out.extend_from_slice(&group.start.raw().to_be_bytes());
        out.extend_from_slice(&group.chunk_count.to_be_bytes());
    }
}

/// Decodes a directory from exactly `buf`.
pub fn decode_group_directory(buf: &[u8]) -> Result<SmallVec<[GroupEntry; 4]>> {
    let (count, mut pos) = decode_varlen(buf)?;
    ensure!(count > 0, "empty group directory");
    ensure!(
        buf.len() == pos + count as usize * GROUP_ENTRY_SIZE,
        "group directory length mismatch: {} bytes for {count} groups",
        buf.len()
    );
    let mut groups = SmallVec::new();
    for _ in 0..count {
        let raw = u64::from_be_bytes(buf[pos..pos + 8].try_into().unwrap());
        let chunk_count = u16::from_be_bytes(buf[pos + 8..pos + 10].try_into().unwrap());
        ensure!(chunk_count > 0, "group with zero chunks");
        groups.push(GroupEntry {
            start: Lsn::from_raw(raw),
            chunk_count,
        });
        pos += GROUP_ENTRY_SIZE;
    }
    Ok(groups)
}

// ============================================================================
// Chunk header builders
// ============================================================================

/// Builds a record-head chunk header into `buf`, returning its length.
pub fn encode_record_head(
    type_bits: u8,
    short_trid: u16,
    total_len: u64,
    chunk_len_field: u64,
    buf: &mut [u8],
) -> usize {
    debug_assert!(type_bits != 0 && type_bits <= CHUNK_TYPE_BITS);
    buf[0] = CHUNK_RECORD_HEAD | type_bits;
    buf[1..3].copy_from_slice(&short_trid.to_le_bytes());
    let mut pos = 3;
    pos += encode_varlen(total_len, &mut buf[pos..]);
    pos += encode_varlen(chunk_len_field, &mut buf[pos..]);
    pos
}

/// Builds a Length chunk header into `buf`, returning its length.
pub fn encode_length_chunk_header(data_len: u64, buf: &mut [u8]) -> usize {
    buf[0] = CHUNK_LENGTH;
    1 + encode_varlen(data_len, &mut buf[1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varlen_boundaries() {
        let cases: &[(u64, usize)] = &[
            (0, 1),
            (249, 1),
            (250, 3),
            (u16::MAX as u64, 3),
            (u16::MAX as u64 + 1, 4),
            (0xFF_FFFF, 4),
            (0x100_0000, 5),
            (u32::MAX as u64, 5),
        ];
        let mut buf = [0u8; MAX_VARLEN_SIZE];
        for &(value, expect) in cases {
            assert_eq!(varlen_len(value), expect, "varlen_len({value})");
            let written = encode_varlen(value, &mut buf);
            assert_eq!(written, expect, "encode_varlen({value})");
            let (decoded, consumed) = decode_varlen(&buf).unwrap();
            assert_eq!((decoded, consumed), (value, expect));
        }
    }

    #[test]
    fn varlen_rejects_reserved_markers() {
        for marker in 253..=255u8 {
            assert!(decode_varlen(&[marker, 0, 0, 0, 0]).is_err());
        }
    }

    #[test]
    fn varlen_rejects_truncation() {
        assert!(decode_varlen(&[]).is_err());
        assert!(decode_varlen(&[250, 1]).is_err());
        assert!(decode_varlen(&[251, 1, 2]).is_err());
        assert!(decode_varlen(&[252, 1, 2, 3]).is_err());
    }

    #[test]
    fn chunk_classification() {
        assert_eq!(classify_chunk(0x00), ChunkKind::PageEnd);
        assert_eq!(classify_chunk(0x07), ChunkKind::RecordHead(7));
        assert_eq!(classify_chunk(0x40 | 22), ChunkKind::Fixed(22));
        assert_eq!(classify_chunk(0x80), ChunkKind::NoHeader);
        assert_eq!(classify_chunk(0xC0), ChunkKind::Length);
    }

    #[test]
    fn record_head_roundtrip() {
        let mut buf = [0u8; MAX_RECORD_HEAD_SIZE];
        let written = encode_record_head(9, 0x0102, 70_000, 0, &mut buf);
        assert_eq!(classify_chunk(buf[0]), ChunkKind::RecordHead(9));
        assert_eq!(u16::from_le_bytes([buf[1], buf[2]]), 0x0102);
        let (total, n1) = decode_varlen(&buf[3..]).unwrap();
        let (chunk_len, n2) = decode_varlen(&buf[3 + n1..]).unwrap();
        assert_eq!(total, 70_000);
        assert_eq!(chunk_len, 0);
        assert_eq!(written, 3 + n1 + n2);
    }

    #[test]
    fn group_directory_roundtrip() {
        let groups = vec![
            GroupEntry {
                start: Lsn::new(1, 0x2007),
                chunk_count: 33,
            },
            GroupEntry {
                start: Lsn::new(2, 0x4000 + 27),
                chunk_count: 1,
            },
        ];
        let mut encoded = Vec::new();
        encode_group_directory(&groups, &mut encoded);
        assert_eq!(encoded.len(), directory_size(groups.len()));
        let decoded = decode_group_directory(&encoded).unwrap();
        assert_eq!(decoded.as_slice(), groups.as_slice());
    }

    #[test]
    fn group_directory_rejects_bad_input() {
        assert!(decode_group_directory(&[]).is_err());
        assert!(decode_group_directory(&[0]).is_err());
        // Count says 2 groups but only one entry present.
        let groups = vec![GroupEntry {
            start: Lsn::new(1, 0x2007),
            chunk_count: 3,
        }];
        let mut encoded = Vec::new();
        encode_group_directory(&groups, &mut encoded);
        encoded[0] = 2;
        assert!(decode_group_directory(&encoded).is_err());
    }
}
