//! # Recovery Tests
//!
//! Crash simulation: write, flush, drop the log, damage the files the way
//! a torn write would, and reopen. Recovery must keep every verified
//! record, cut everything after the damage, and reach the same horizon
//! when run twice over identical files.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tempfile::tempdir;
use translog::config::{MIN_FILE_MAX_SIZE, PAGE_SIZE, SECTOR_SIZE, SECTORS_PER_PAGE};
use translog::{Log, LogConfig, Lsn, RecordType};

fn test_config(dir: &Path) -> LogConfig {
    LogConfig::new(dir).file_max_size(MIN_FILE_MAX_SIZE)
}

fn pattern(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

fn last_log_file(dir: &Path) -> PathBuf {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("translog."))
        })
        .collect();
    files.sort();
    files.pop().expect("log directory holds at least one file")
}

/// Writes `count` records and returns their (lsn, payload) pairs, flushed.
fn seed_log(log: &Log, count: usize, size: usize) -> Vec<(Lsn, Vec<u8>)> {
    let mut written = Vec::new();
    for i in 0..count {
        let payload = pattern(size, 100 + i as u64);
        let lsn = log
            .write(RecordType::RedoInsertRowHead, 0, &[&payload])
            .unwrap();
        written.push((lsn, payload));
    }
    log.flush(log.placed_horizon()).unwrap();
    written
}

fn scan_lsns(log: &Log) -> Vec<Lsn> {
    let mut cursor = log.open_scanner(log.first_lsn(), true).unwrap();
    let mut lsns = Vec::new();
    while let Some(header) = log.next_record_header(&mut cursor).unwrap() {
        lsns.push(header.lsn);
    }
    lsns
}

mod clean_reopen {
    use super::*;

    #[test]
    fn reopen_preserves_all_records() {
        let dir = tempdir().unwrap();
        let written = {
            let log = Log::create(test_config(dir.path())).unwrap();
            seed_log(&log, 20, 700)
        };

        let (log, info) = Log::open(test_config(dir.path())).unwrap();
        assert_eq!(info.last_record_lsn, written.last().unwrap().0);
        assert_eq!(info.records_verified, written.len() as u64);

        let lsns = scan_lsns(&log);
        assert_eq!(lsns.len(), written.len());
        for ((lsn, payload), scanned) in written.iter().zip(&lsns) {
            assert_eq!(lsn, scanned);
            let mut buf = vec![0u8; payload.len()];
            assert_eq!(log.read(*lsn, 0, &mut buf).unwrap(), payload.len());
            assert_eq!(&buf, payload);
        }

        // The reopened log accepts writes right where it left off.
        let more = pattern(123, 999);
        let lsn = log.write(RecordType::RedoIndex, 0, &[&more]).unwrap();
        assert!(lsn > *lsns.last().unwrap());
    }

    #[test]
    fn open_of_missing_log_fails_cleanly() {
        let dir = tempdir().unwrap();
        assert!(Log::open(test_config(dir.path())).is_err());
    }
}

mod torn_tails {
    use super::*;

    #[test]
    fn truncated_file_recovers_to_last_whole_record() {
        let dir = tempdir().unwrap();
        let written = {
            let log = Log::create(test_config(dir.path())).unwrap();
            seed_log(&log, 30, 900)
        };

        // Simulated crash: the tail of the last file never hit the disk.
        let path = last_log_file(dir.path());
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        let cut = len - (PAGE_SIZE as u64 / 2) - 37;
        file.set_len(cut).unwrap();
        drop(file);

        let (log, info) = Log::open(test_config(dir.path())).unwrap();
        assert!(info.horizon.offset() as u64 <= cut);
        assert!(info.records_verified > 0);

        // Every surviving record reads back whole; none past the horizon.
        let lsns = scan_lsns(&log);
        assert!(!lsns.is_empty());
        assert!(lsns.len() < written.len(), "the cut lost the tail records");
        for (i, lsn) in lsns.iter().enumerate() {
            assert_eq!(*lsn, written[i].0);
            let mut buf = vec![0u8; written[i].1.len()];
            assert_eq!(log.read(*lsn, 0, &mut buf).unwrap(), buf.len());
            assert_eq!(&buf, &written[i].1);
        }
    }

    #[test]
    fn torn_sectors_keep_verified_prefix() {
        let dir = tempdir().unwrap();
        let written = {
            let log = Log::create(test_config(dir.path())).unwrap();
            // Small records so several fit in each page; the log's last
            // page stays partial.
            seed_log(&log, 40, 300)
        };

        // Tear the last (partial) page: stale generation bytes from some
        // sector onward, as if only a prefix of sectors persisted.
        let path = last_log_file(dir.path());
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        let last_page_at = len - PAGE_SIZE as u64;
        use std::os::unix::fs::FileExt;
        let mut page = vec![0u8; PAGE_SIZE];
        file.read_exact_at(&mut page, last_page_at).unwrap();
        for sector in SECTORS_PER_PAGE / 2..SECTORS_PER_PAGE {
            page[sector * SECTOR_SIZE] = page[sector * SECTOR_SIZE].wrapping_add(1);
            // Stale sector bodies too.
            for b in &mut page[sector * SECTOR_SIZE + 1..(sector + 1) * SECTOR_SIZE] {
                *b = 0xEE;
            }
        }
        file.write_all_at(&page, last_page_at).unwrap();
        drop(file);

        let (log, info) = Log::open(test_config(dir.path())).unwrap();
        assert!(info.bytes_truncated > 0, "the torn tail must be cut");

        let lsns = scan_lsns(&log);
        assert!(!lsns.is_empty());
        assert!(lsns.len() < written.len());
        // Chunks fully inside verified sectors survive with content intact.
        for (i, lsn) in lsns.iter().enumerate() {
            assert_eq!(*lsn, written[i].0);
            let mut buf = vec![0u8; written[i].1.len()];
            assert_eq!(log.read(*lsn, 0, &mut buf).unwrap(), buf.len());
            assert_eq!(&buf, &written[i].1);
        }
    }

    #[test]
    fn recovery_is_idempotent() {
        let dir = tempdir().unwrap();
        {
            let log = Log::create(test_config(dir.path())).unwrap();
            seed_log(&log, 25, 500);
        }

        // Damage once.
        let path = last_log_file(dir.path());
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 1000).unwrap();
        drop(file);

        let (first_horizon, first_records) = {
            let (_log, info) = Log::open(test_config(dir.path())).unwrap();
            (info.horizon, info.records_verified)
        };
        let (_log, info) = Log::open(test_config(dir.path())).unwrap();
        assert_eq!(info.horizon, first_horizon);
        assert_eq!(info.records_verified, first_records);
    }
}

mod write_failures {
    use super::*;

    #[test]
    fn io_failure_flips_log_read_only() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("log");
        let log = Log::create(test_config(&log_dir)).unwrap();

        let early = pattern(2000, 1);
        let early_lsn = log.write(RecordType::RedoIndex, 0, &[&early]).unwrap();

        // Pull the directory out from under the log; the next rollover
        // cannot create its file.
        std::fs::remove_dir_all(&log_dir).unwrap();

        // Push enough bytes through to force a rollover.
        let chunk = pattern(200_000, 2);
        let mut failed = false;
        for _ in 0..8 {
            if log.write(RecordType::RedoFreeBlocks, 0, &[&chunk]).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed, "rollover into a missing directory must fail");
        assert!(log.is_read_only());

        // No further writes; existing data still readable from buffers.
        assert!(log.write(RecordType::RedoIndex, 0, &[&early]).is_err());
        let mut buf = vec![0u8; early.len()];
        assert_eq!(log.read(early_lsn, 0, &mut buf).unwrap(), early.len());
        assert_eq!(buf, early);
        assert!(log.flush(log.placed_horizon()).is_err());
    }
}
