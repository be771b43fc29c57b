//! # Concurrency Tests
//!
//! Many threads write records of mixed sizes against one log while a
//! scanner thread reads live. Reservation order defines LSN order, the
//! placed horizon hides incomplete reservations from scanners, and a
//! final flush + scan must recover every record byte-exact and in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::tempdir;
use translog::config::{BUFFER_CAPACITY, MIN_FILE_MAX_SIZE, PAGE_SIZE};
use translog::{Log, LogConfig, Lsn, RecordType};

fn test_config(dir: &std::path::Path) -> LogConfig {
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

/// Record sizes cycled per thread: inline, page-spanning, and one
/// buffer-crossing size that forces rotation under contention.
fn size_for(thread: usize, i: usize) -> usize {
    match (thread + i) % 5 {
        0 => 16,
        1 => 300,
        2 => PAGE_SIZE + 77,
        3 => 3 * PAGE_SIZE,
        _ => BUFFER_CAPACITY / 2 + 1234,
    }
}

#[test]
fn concurrent_writers_recover_in_lsn_order() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 30;

    let dir = tempdir().unwrap();
    let log = Arc::new(Log::create(test_config(dir.path())).unwrap());

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let log = Arc::clone(&log);
        handles.push(std::thread::spawn(move || {
            let mut written: Vec<(Lsn, u64, usize)> = Vec::new();
            for i in 0..PER_THREAD {
                let seed = (t * 10_000 + i) as u64;
                let payload = pattern(size_for(t, i), seed);
                let lsn = log
                    .write(RecordType::RedoInsertRowHead, 0, &[&payload])
                    .unwrap();
                if let Some(&(prev, _, _)) = written.last() {
                    assert!(prev < lsn, "per-thread LSNs must be monotonic");
                }
                written.push((lsn, seed, payload.len()));
            }
            written
        }));
    }

    let mut all: Vec<(Lsn, u64, usize)> = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    all.sort_by_key(|&(lsn, _, _)| lsn);

    log.flush(log.placed_horizon()).unwrap();

    // A full fixed-horizon scan yields exactly the written records, in
    // LSN order, with exact content.
    let mut cursor = log.open_scanner(log.first_lsn(), true).unwrap();
    let mut scanned = 0usize;
    while let Some(header) = log.next_record_header(&mut cursor).unwrap() {
        let &(lsn, seed, len) = &all[scanned];
        assert_eq!(header.lsn, lsn, "record {scanned} out of order");
        assert_eq!(header.record_length, len as u64);
        let mut buf = vec![0u8; len];
        assert_eq!(log.read(lsn, 0, &mut buf).unwrap(), len);
        assert_eq!(buf, pattern(len, seed), "content of record {scanned}");
        scanned += 1;
    }
    assert_eq!(scanned, THREADS * PER_THREAD);
}

#[test]
fn live_scanner_never_sees_partial_records() {
    const WRITERS: usize = 4;
    const PER_THREAD: usize = 40;

    let dir = tempdir().unwrap();
    let log = Arc::new(Log::create(test_config(dir.path())).unwrap());
    let done = Arc::new(AtomicBool::new(false));

    // The scanner hammers the log while writers are mid-flight. The
    // placed horizon must hide every reservation whose copy is still
    // running: each surfaced header must parse and read fully.
    let scanner = {
        let log = Arc::clone(&log);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let mut max_seen = 0usize;
            while !done.load(Ordering::Acquire) {
                let mut cursor = log.open_scanner(log.first_lsn(), true).unwrap();
                let mut seen = 0usize;
                while let Some(header) = log.next_record_header(&mut cursor).unwrap() {
                    let mut buf = vec![0u8; header.record_length as usize];
                    let n = log.read(header.lsn, 0, &mut buf).unwrap();
                    assert_eq!(n, buf.len(), "visible record must read fully");
                    seen += 1;
                }
                assert!(seen >= max_seen, "scan went backwards");
                max_seen = seen;
            }
            max_seen
        })
    };

    let mut handles = Vec::new();
    for t in 0..WRITERS {
        let log = Arc::clone(&log);
        handles.push(std::thread::spawn(move || {
            for i in 0..PER_THREAD {
                let payload = pattern(size_for(t, i), (t * 777 + i) as u64);
                log.write(RecordType::RedoUpdateRowHead, 0, &[&payload])
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    done.store(true, Ordering::Release);
    scanner.join().unwrap();

    // Everything lands eventually.
    let mut cursor = log.open_scanner(log.first_lsn(), true).unwrap();
    let mut total = 0;
    while log.next_record_header(&mut cursor).unwrap().is_some() {
        total += 1;
    }
    assert_eq!(total, WRITERS * PER_THREAD);
}

#[test]
fn concurrent_short_id_transactions() {
    const THREADS: usize = 6;

    let dir = tempdir().unwrap();
    let log = Arc::new(Log::create(test_config(dir.path())).unwrap());

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let log = Arc::clone(&log);
        handles.push(std::thread::spawn(move || {
            for i in 0..20u64 {
                let trid = log.assign_short_id(t as u64 * 1000 + i).unwrap();
                let head = log.undo_chain_head(trid.id());
                let tail = pattern(8, i);
                let lsn = log
                    .write(
                        RecordType::UndoRowInsert,
                        trid.id(),
                        &[&head.raw().to_be_bytes(), &tail],
                    )
                    .unwrap();
                assert_eq!(log.undo_chain_head(trid.id()), lsn);
                log.write(RecordType::Commit, trid.id(), &[&[0u8; 4]])
                    .unwrap();
                assert!(log.undo_chain_head(trid.id()).is_zero());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    log.flush(log.placed_horizon()).unwrap();

    // Per transaction: one long-id record, one undo, one commit.
    let mut cursor = log.open_scanner(log.first_lsn(), true).unwrap();
    let (mut long_ids, mut undos, mut commits) = (0, 0, 0);
    while let Some(header) = log.next_record_header(&mut cursor).unwrap() {
        match header.record_type {
            RecordType::LongTransactionId => long_ids += 1,
            RecordType::UndoRowInsert => undos += 1,
            RecordType::Commit => commits += 1,
            other => panic!("unexpected record type {other:?}"),
        }
    }
    assert_eq!(undos, THREADS * 20);
    assert_eq!(commits, THREADS * 20);
    assert_eq!(long_ids, THREADS * 20, "one injected mapping per assignment");
}
