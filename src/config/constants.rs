//! # Log Constants
//!
//! All compile-time tunables for the log, grouped by functional area.
//! Interdependent values are co-located and their relationships enforced
//! through compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (8192 bytes)
//!       │
//!       ├─> SECTOR_SIZE (512, disk atomic write unit)
//!       │     PAGE_SIZE must be a multiple of SECTOR_SIZE
//!       │
//!       ├─> SECTORS_PER_PAGE (derived: PAGE_SIZE / SECTOR_SIZE)
//!       │     One write-generation byte per sector when protection is on
//!       │
//!       ├─> PAGE_BASE_HEADER_SIZE (7 bytes: page_no:3 + file_no:3 + flags:1)
//!       │
//!       └─> BUFFER_CAPACITY (must be a multiple of PAGE_SIZE)
//!             Buffers bind to page-aligned file ranges
//!
//! BUFFER_COUNT (5)
//!       │
//!       └─> Cyclic rotation order; buffer i may lock buffer i+1 mod N
//!           while holding i, never the reverse. At least 3 buffers are
//!           required so the active buffer, its successor, and a buffer
//!           being flushed are always distinct.
//!
//! DEFAULT_FILE_MAX_SIZE / MIN_FILE_MAX_SIZE
//!       │
//!       └─> Multiples of PAGE_SIZE; MIN must hold the header page plus
//!           at least two full buffer bindings so rotation inside one
//!           file is always possible.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `PAGE_SIZE % SECTOR_SIZE == 0` (sector table indexes whole sectors)
//! 2. `BUFFER_CAPACITY % PAGE_SIZE == 0` (buffer ranges are page-aligned)
//! 3. `BUFFER_COUNT >= 3` (rotation + flush never alias)
//! 4. `MIN_FILE_MAX_SIZE >= PAGE_SIZE + 2 * BUFFER_CAPACITY`
//! 5. `MAX_RECORD_LENGTH < 2^32` (lengths travel in u32 file offsets)

// ============================================================================
// PAGE GEOMETRY
// ============================================================================

/// Size of one log page in bytes.
pub const PAGE_SIZE: usize = 8192;

/// Disk sector size assumed for torn-write detection.
pub const SECTOR_SIZE: usize = 512;

/// Sectors per page; one write-generation byte each when protection is on.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Fixed page header prefix: 3-byte page number, 3-byte file number, 1 flag
/// byte. CRC and the sector table follow when the respective flags are set.
pub const PAGE_BASE_HEADER_SIZE: usize = 7;

/// Bytes of the optional page CRC32.
pub const PAGE_CRC_SIZE: usize = 4;

const _: () = assert!(PAGE_SIZE % SECTOR_SIZE == 0);
const _: () = assert!(SECTORS_PER_PAGE <= 255, "sector table slots are bytes");

// ============================================================================
// BUFFER POOL GEOMETRY
// ============================================================================

/// Number of in-memory write buffers in the cyclic pool.
pub const BUFFER_COUNT: usize = 5;

/// Pages per buffer.
pub const BUFFER_PAGES: usize = 32;

/// Bytes per buffer.
pub const BUFFER_CAPACITY: usize = BUFFER_PAGES * PAGE_SIZE;

const _: () = assert!(BUFFER_COUNT >= 3, "rotation needs active + next + flushing");
const _: () = assert!(BUFFER_CAPACITY % PAGE_SIZE == 0);

// ============================================================================
// FILE GEOMETRY
// ============================================================================

/// Default cap on one log file (64 MiB).
pub const DEFAULT_FILE_MAX_SIZE: u32 = 64 * 1024 * 1024;

/// Smallest permitted file cap.
pub const MIN_FILE_MAX_SIZE: u32 = (PAGE_SIZE + 2 * BUFFER_CAPACITY) as u32;

const _: () = assert!(DEFAULT_FILE_MAX_SIZE % PAGE_SIZE as u32 == 0);
const _: () = assert!(MIN_FILE_MAX_SIZE % PAGE_SIZE as u32 == 0);
const _: () = assert!(MIN_FILE_MAX_SIZE >= PAGE_SIZE as u32 + 2 * BUFFER_CAPACITY as u32);

// ============================================================================
// RECORDS
// ============================================================================

/// Hard cap on a single record's total length.
pub const MAX_RECORD_LENGTH: u64 = u32::MAX as u64;

/// Upper bound on caller-supplied parts per record (hooks may add more).
pub const MAX_RECORD_PARTS: usize = 16;

// ============================================================================
// READ-SIDE PAGE CACHE
// ============================================================================

/// Default page-cache capacity in pages.
pub const DEFAULT_CACHE_PAGES: usize = 64;

/// Lock shards in the page cache. The log is scanned mostly sequentially,
/// so far fewer shards are needed than a random-access data-page cache.
pub const CACHE_SHARD_COUNT: usize = 8;

const _: () = assert!(DEFAULT_CACHE_PAGES >= CACHE_SHARD_COUNT);

// ============================================================================
// SHORT TRANSACTION IDS
// ============================================================================

/// Number of concurrently assignable 2-byte transaction ids. Id 0 is
/// reserved as "none", so valid ids are 1..=SHORT_ID_COUNT.
pub const SHORT_ID_COUNT: usize = 4096;

const _: () = assert!(SHORT_ID_COUNT <= u16::MAX as usize);
const _: () = assert!(SHORT_ID_COUNT % 64 == 0, "id bitmap uses u64 words");
