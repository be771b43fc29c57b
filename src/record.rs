//! # Record Types and Dispatch
//!
//! Every log record carries one of thirty types. A type fixes the record's
//! physical class, how many compressed-LSN back-references lead its
//! payload, and which hooks run around the write:
//!
//! - **Fixed**: payload length is a constant of the type; the whole record
//!   is one chunk that never crosses a page boundary.
//! - **PseudoFixed**: like Fixed, but the payload starts with 1–2 LSN
//!   back-references (8-byte big-endian in the logical record) that are
//!   stored compressed relative to the record's own LSN, so the on-disk
//!   length varies while staying page-bounded.
//! - **Variable**: caller-defined payload of any length up to
//!   [`MAX_RECORD_LENGTH`](crate::config::MAX_RECORD_LENGTH), chunked
//!   across pages, buffers, and files as needed.
//!
//! ## Hooks
//!
//! Hooks live in one static descriptor table indexed by type — plain `fn`
//! pointers, no virtual dispatch. `pre_write` runs before space is
//! reserved and may write prerequisite records (the first record of a
//! transaction is preceded by a [`RecordType::LongTransactionId`] mapping
//! its short id to the full id). `in_write` runs once the LSN is assigned
//! and before the write returns; the undo record types use it to advance
//! the per-transaction undo chain head kept in the short-id slot.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::chunk::GroupEntry;
use crate::log::Log;
use crate::lsn::Lsn;

/// All record types. Discriminants are the on-disk type bits (low 6 bits of
/// head/fixed chunk tags); 0 is reserved as the page-end marker.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    RedoInsertRowHead = 1,
    RedoInsertRowTail = 2,
    RedoNewRowHead = 3,
    RedoNewRowTail = 4,
    RedoInsertRowBlobs = 5,
    RedoPurgeRowHead = 6,
    RedoPurgeRowTail = 7,
    RedoFreeBlocks = 8,
    RedoFreeHeadOrTail = 9,
    RedoDeleteRow = 10,
    RedoUpdateRowHead = 11,
    RedoIndex = 12,
    RedoIndexNewPage = 13,
    RedoIndexFreePage = 14,
    RedoBitmapNewPage = 15,
    UndoRowInsert = 16,
    UndoRowDelete = 17,
    UndoRowUpdate = 18,
    UndoKeyInsert = 19,
    UndoKeyDelete = 20,
    UndoBulkInsert = 21,
    ClrEnd = 22,
    Commit = 23,
    CommitWithUndoPurge = 24,
    Checkpoint = 25,
    FileId = 26,
    LongTransactionId = 27,
    IncompleteLog = 28,
    RedoDropTable = 29,
    RedoRenameTable = 30,
}

pub const RECORD_TYPE_COUNT: usize = 30;

/// All types, indexed by `bits - 1`.
static ALL_TYPES: [RecordType; RECORD_TYPE_COUNT] = [
    RecordType::RedoInsertRowHead,
    RecordType::RedoInsertRowTail,
    RecordType::RedoNewRowHead,
    RecordType::RedoNewRowTail,
    RecordType::RedoInsertRowBlobs,
    RecordType::RedoPurgeRowHead,
    RecordType::RedoPurgeRowTail,
    RecordType::RedoFreeBlocks,
    RecordType::RedoFreeHeadOrTail,
    RecordType::RedoDeleteRow,
    RecordType::RedoUpdateRowHead,
    RecordType::RedoIndex,
    RecordType::RedoIndexNewPage,
    RecordType::RedoIndexFreePage,
    RecordType::RedoBitmapNewPage,
    RecordType::UndoRowInsert,
    RecordType::UndoRowDelete,
    RecordType::UndoRowUpdate,
    RecordType::UndoKeyInsert,
    RecordType::UndoKeyDelete,
    RecordType::UndoBulkInsert,
    RecordType::ClrEnd,
    RecordType::Commit,
    RecordType::CommitWithUndoPurge,
    RecordType::Checkpoint,
    RecordType::FileId,
    RecordType::LongTransactionId,
    RecordType::IncompleteLog,
    RecordType::RedoDropTable,
    RecordType::RedoRenameTable,
];

impl RecordType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits == 0 {
            return None;
        }
        ALL_TYPES.get(bits as usize - 1).copied()
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn descriptor(self) -> &'static RecordDescriptor {
        &DESCRIPTORS[self as usize - 1]
    }
}

/// Physical class of a record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    /// Constant payload length, single page-bounded chunk.
    Fixed { payload_len: u16 },
    /// Leading compressed-LSN refs plus a constant tail.
    PseudoFixed { payload_len: u16 },
    /// Arbitrary-length payload, chunked.
    Variable,
}

pub type PreWriteHook = fn(&Log, &mut WriteHookContext) -> Result<()>;
pub type InWriteHook = fn(&Log, Lsn, &WriteHookContext) -> Result<()>;

/// Static per-type behavior.
pub struct RecordDescriptor {
    pub class: RecordClass,
    /// Leading LSN back-references (0..=2); nonzero only for PseudoFixed.
    pub lsn_refs: u8,
    pub pre_write: Option<PreWriteHook>,
    pub in_write: Option<InWriteHook>,
}

impl RecordDescriptor {
    /// Logical payload length of a fixed-class record: absolute refs plus
    /// the fixed tail. `None` for variable records.
    pub fn logical_fixed_len(&self) -> Option<usize> {
        match self.class {
            RecordClass::Fixed { payload_len } => Some(payload_len as usize),
            RecordClass::PseudoFixed { payload_len } => {
                Some(self.lsn_refs as usize * 8 + payload_len as usize)
            }
            RecordClass::Variable => None,
        }
    }
}

/// Mutable state threaded through the write hooks.
pub struct WriteHookContext {
    pub short_trid: u16,
}

fn pre_write_undo(log: &Log, ctx: &mut WriteHookContext) -> Result<()> {
    log.ensure_long_id_logged(ctx.short_trid)
}

fn in_write_undo(log: &Log, lsn: Lsn, ctx: &WriteHookContext) -> Result<()> {
    log.set_undo_chain_head(ctx.short_trid, lsn);
    Ok(())
}

fn in_write_commit(log: &Log, _lsn: Lsn, ctx: &WriteHookContext) -> Result<()> {
    log.clear_undo_chain(ctx.short_trid);
    Ok(())
}

const fn plain(class: RecordClass) -> RecordDescriptor {
    RecordDescriptor {
        class,
        lsn_refs: 0,
        pre_write: None,
        in_write: None,
    }
}

const fn undo(class: RecordClass, lsn_refs: u8) -> RecordDescriptor {
    RecordDescriptor {
        class,
        lsn_refs,
        pre_write: Some(pre_write_undo),
        in_write: Some(in_write_undo),
    }
}

/// Descriptor table indexed by `type as usize - 1`.
static DESCRIPTORS: [RecordDescriptor; RECORD_TYPE_COUNT] = [
    /* RedoInsertRowHead */ plain(RecordClass::Variable),
    /* RedoInsertRowTail */ plain(RecordClass::Variable),
    /* RedoNewRowHead */ plain(RecordClass::Variable),
    /* RedoNewRowTail */ plain(RecordClass::Variable),
    /* RedoInsertRowBlobs */ plain(RecordClass::Variable),
    /* RedoPurgeRowHead */ plain(RecordClass::Fixed { payload_len: 8 }),
    /* RedoPurgeRowTail */ plain(RecordClass::Fixed { payload_len: 8 }),
    /* RedoFreeBlocks */ plain(RecordClass::Variable),
    /* RedoFreeHeadOrTail */ plain(RecordClass::Fixed { payload_len: 8 }),
    /* RedoDeleteRow */ plain(RecordClass::Fixed { payload_len: 8 }),
    /* RedoUpdateRowHead */ plain(RecordClass::Variable),
    /* RedoIndex */ plain(RecordClass::Variable),
    /* RedoIndexNewPage */ plain(RecordClass::Variable),
    /* RedoIndexFreePage */ plain(RecordClass::Fixed { payload_len: 8 }),
    /* RedoBitmapNewPage */ plain(RecordClass::Fixed { payload_len: 8 }),
    /* UndoRowInsert */ undo(RecordClass::PseudoFixed { payload_len: 8 }, 1),
    /* UndoRowDelete */ undo(RecordClass::Variable, 0),
    /* UndoRowUpdate */ undo(RecordClass::Variable, 0),
    /* UndoKeyInsert */ undo(RecordClass::Variable, 0),
    /* UndoKeyDelete */ undo(RecordClass::Variable, 0),
    /* UndoBulkInsert */ undo(RecordClass::PseudoFixed { payload_len: 8 }, 1),
    /* ClrEnd */ undo(RecordClass::PseudoFixed { payload_len: 6 }, 2),
    /* Commit */
    RecordDescriptor {
        class: RecordClass::Fixed { payload_len: 4 },
        lsn_refs: 0,
        pre_write: None,
        in_write: Some(in_write_commit),
    },
    /* CommitWithUndoPurge */
    RecordDescriptor {
        class: RecordClass::PseudoFixed { payload_len: 4 },
        lsn_refs: 1,
        pre_write: None,
        in_write: Some(in_write_commit),
    },
    /* Checkpoint */ plain(RecordClass::Variable),
    /* FileId */ plain(RecordClass::Variable),
    /* LongTransactionId */ plain(RecordClass::Variable),
    /* IncompleteLog */ plain(RecordClass::Fixed { payload_len: 2 }),
    /* RedoDropTable */ plain(RecordClass::Variable),
    /* RedoRenameTable */ plain(RecordClass::Variable),
];

/// How a record's payload is reached on disk; resolved by header parsing.
#[derive(Debug, Clone)]
pub(crate) enum RecordBody {
    /// Fixed/pseudo-fixed chunk: the compressed refs were decoded into
    /// the header; the fixed tail sits at `tail_start`.
    Fixed { tail_start: Lsn, tail_len: u32 },
    /// Payload sits wholly inside the head chunk's page.
    Inline { data_start: Lsn },
    /// Payload fills the head chunk's page and continues through
    /// no-header/length chunks on the following pages.
    SingleGroup { data_start: Lsn },
    /// Payload lives in previously written groups listed in the directory.
    MultiGroup { groups: SmallVec<[GroupEntry; 4]> },
}

/// Decoded record header, as returned by [`Log::read_header`] and the
/// scanner.
#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub lsn: Lsn,
    pub record_type: RecordType,
    pub short_trid: u16,
    /// Logical payload length: for pseudo-fixed records this counts the
    /// expanded 8-byte refs, not their compressed on-disk form.
    pub record_length: u64,
    /// Decoded back-references, in payload order.
    pub lsn_refs: SmallVec<[Lsn; 2]>,
    pub(crate) body: RecordBody,
}

/// Validates caller parts against the type's class; returns the logical
/// payload length.
pub(crate) fn check_parts(record_type: RecordType, parts: &[&[u8]]) -> Result<u64> {
    let descriptor = record_type.descriptor();
    let total: u64 = parts.iter().map(|p| p.len() as u64).sum();
    if let Some(expected) = descriptor.logical_fixed_len() {
        ensure!(
            total == expected as u64,
            "{record_type:?} payload must be exactly {expected} bytes, got {total}"
        );
    } else {
        ensure!(total > 0, "{record_type:?} payload must not be empty");
        ensure!(
            total <= crate::config::MAX_RECORD_LENGTH,
            "{record_type:?} payload of {total} bytes exceeds the record cap"
        );
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bits_roundtrip() {
        for bits in 1..=RECORD_TYPE_COUNT as u8 {
            let record_type = RecordType::from_bits(bits).unwrap();
            assert_eq!(record_type.bits(), bits);
        }
        assert!(RecordType::from_bits(0).is_none());
        assert!(RecordType::from_bits(31).is_none());
        assert!(RecordType::from_bits(0x3F).is_none());
    }

    #[test]
    fn descriptors_match_classes() {
        assert_eq!(
            RecordType::RedoDeleteRow.descriptor().logical_fixed_len(),
            Some(8)
        );
        // Pseudo-fixed logical length counts expanded refs.
        assert_eq!(
            RecordType::UndoRowInsert.descriptor().logical_fixed_len(),
            Some(8 + 8)
        );
        assert_eq!(
            RecordType::ClrEnd.descriptor().logical_fixed_len(),
            Some(16 + 6)
        );
        assert_eq!(
            RecordType::Checkpoint.descriptor().logical_fixed_len(),
            None
        );
    }

    #[test]
    fn undo_types_carry_hooks() {
        let descriptor = RecordType::UndoRowInsert.descriptor();
        assert!(descriptor.pre_write.is_some());
        assert!(descriptor.in_write.is_some());
        assert_eq!(descriptor.lsn_refs, 1);

        let commit = RecordType::Commit.descriptor();
        assert!(commit.pre_write.is_none());
        assert!(commit.in_write.is_some());
    }

    #[test]
    fn check_parts_enforces_fixed_lengths() {
        let ok = check_parts(RecordType::RedoDeleteRow, &[&[0u8; 8]]);
        assert_eq!(ok.unwrap(), 8);

        let split = check_parts(RecordType::RedoDeleteRow, &[&[0u8; 3], &[0u8; 5]]);
        assert_eq!(split.unwrap(), 8);

        assert!(check_parts(RecordType::RedoDeleteRow, &[&[0u8; 7]]).is_err());
        assert!(check_parts(RecordType::Checkpoint, &[]).is_err());
        assert!(check_parts(RecordType::Checkpoint, &[b"state"]).is_ok());
    }
}
