//! # translog - Transactional Write-Ahead Log
//!
//! `translog` is the write-ahead logging subsystem of an embedded
//! transactional storage engine: it durably records redo/undo records
//! before the data pages they describe are flushed, enabling atomic
//! multi-page updates and crash recovery.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │        Log (write / read / flush / purge)     │
//! ├───────────────┬───────────────┬───────────────┤
//! │ Record types  │  Writer +     │  Scanner /    │
//! │ + hooks       │  Flusher      │  Recovery     │
//! ├───────────────┴───────┬───────┴───────────────┤
//! │  Buffer Pool (5 rotating write buffers)       │
//! ├───────────────────────┼───────────────────────┤
//! │  Record Encoder       │  Page Cache (SIEVE)   │
//! │  (chunks, LSN codec)  │                       │
//! ├───────────────────────┴───────────────────────┤
//! │  Page Format (CRC32 + sector protection)      │
//! ├───────────────────────────────────────────────┤
//! │  File Pool (translog.NNNNNN, max-LSN seals)   │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Multiple OS threads write concurrently against one [`Log`]. There is
//! no log-wide mutex: reserving space locks only the buffer at the
//! horizon, and payload copies run with no lock at all into disjoint
//! reserved ranges. All waits are brief and structurally bounded
//! (blocking mutexes and condvars, no async).
//!
//! ## Durability
//!
//! [`Log::write`] returns once the record is placed in buffers;
//! [`Log::flush`] makes everything up to a target LSN durable. Three
//! watermarks order the states:
//! `flushed ≤ sent_to_disk ≤ in_buffers_only ≤ horizon`.
//!
//! ## Quick Start
//!
//! ```ignore
//! use translog::{Log, LogConfig, RecordType};
//!
//! let log = Log::create(LogConfig::new("./log"))?;
//! let trid = log.assign_short_id(4242)?;
//!
//! let lsn = log.write(RecordType::RedoInsertRowHead, trid.id(), &[b"row"])?;
//! log.flush(lsn)?;
//!
//! let header = log.read_header(lsn)?;
//! assert_eq!(header.record_length, 3);
//! ```
//!
//! ## Crash Safety
//!
//! Every page carries its address, an optional CRC32, and optional
//! per-sector write generations that pinpoint torn writes. On reopen,
//! recovery validates pages forward, finds the last fully readable
//! record, and truncates the tail — verified records are never dropped,
//! unverified tail bytes always are.

#[macro_use]
mod macros;

pub mod config;

// On-disk format layers, public for tooling and fuzzing.
pub mod chunk;
pub mod lsn;
pub mod page;
pub mod record;

mod buffer;
mod cache;
mod files;
mod flush;
mod log;
mod purge;
mod recovery;
mod scan;
mod short_id;

pub use config::{LogConfig, PurgePolicy};
pub use files::{LogFileHeader, FILE_HEADER_SIZE, FORMAT_VERSION, LOG_FILE_MAGIC};
pub use log::{Log, ShortIdGuard};
pub use lsn::Lsn;
pub use purge::PurgeReport;
pub use record::{RecordHeader, RecordType};
pub use recovery::RecoveryInfo;
pub use scan::{RecordReader, ScanCursor};
