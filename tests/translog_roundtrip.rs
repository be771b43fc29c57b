//! # Record Round-Trip Tests
//!
//! Every written record must read back byte-exact, at any sub-range,
//! whichever physical layout the encoder picked: single chunk, single
//! group (page-spanning continuation), or multi-group with a directory.

use tempfile::tempdir;
use translog::config::{BUFFER_CAPACITY, MIN_FILE_MAX_SIZE, PAGE_SIZE};
use translog::{Log, LogConfig, RecordReader, RecordType};

fn test_config(dir: &std::path::Path) -> LogConfig {
    LogConfig::new(dir).file_max_size(MIN_FILE_MAX_SIZE)
}

/// Deterministic pseudo-random payload.
fn pattern(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

fn read_all(log: &Log, lsn: translog::Lsn, len: usize) -> Vec<u8> {
    let mut reader = RecordReader::open(log, lsn).unwrap();
    let mut out = vec![0u8; len];
    let mut got = 0;
    while got < len {
        let n = reader.read(log, &mut out[got..]).unwrap();
        assert!(n > 0, "reader stalled at {got}/{len}");
        got += n;
    }
    out
}

mod scenario_a {
    use super::*;

    #[test]
    fn small_fixed_then_page_spanning_record() {
        let dir = tempdir().unwrap();
        let log = Log::create(test_config(dir.path())).unwrap();

        let small = pattern(10, 1);
        let l1 = log.write(RecordType::RedoFreeBlocks, 0, &[&small]).unwrap();

        let big = pattern(3 * PAGE_SIZE, 2);
        let l2 = log.write(RecordType::RedoInsertRowHead, 0, &[&big]).unwrap();
        assert!(l1 < l2);

        assert_eq!(log.read_header(l1).unwrap().record_length, 10);
        assert_eq!(log.read_header(l2).unwrap().record_length, 3 * PAGE_SIZE as u64);

        // The big record must span at least 3 pages.
        assert!(log.horizon().page_no() >= l2.page_no() + 3);

        let mut cursor = log.open_scanner(log.first_lsn(), true).unwrap();
        let first = log.next_record_header(&mut cursor).unwrap().unwrap();
        let second = log.next_record_header(&mut cursor).unwrap().unwrap();
        assert_eq!(first.lsn, l1);
        assert_eq!(second.lsn, l2);
        assert!(log.next_record_header(&mut cursor).unwrap().is_none());

        assert_eq!(read_all(&log, l1, 10), small);
        assert_eq!(read_all(&log, l2, big.len()), big);
    }
}

mod layouts {
    use super::*;

    #[test]
    fn single_chunk_roundtrip() {
        let dir = tempdir().unwrap();
        let log = Log::create(test_config(dir.path())).unwrap();

        let payload = pattern(100, 3);
        let lsn = log.write(RecordType::RedoIndex, 0, &[&payload]).unwrap();
        assert_eq!(read_all(&log, lsn, 100), payload);
    }

    #[test]
    fn single_group_roundtrip() {
        let dir = tempdir().unwrap();
        let log = Log::create(test_config(dir.path())).unwrap();

        // Larger than a page, far smaller than a buffer: one group.
        let payload = pattern(5 * PAGE_SIZE + 137, 4);
        let lsn = log
            .write(RecordType::RedoInsertRowBlobs, 0, &[&payload])
            .unwrap();
        assert_eq!(read_all(&log, lsn, payload.len()), payload);
    }

    #[test]
    fn multi_group_roundtrip() {
        let dir = tempdir().unwrap();
        let log = Log::create(test_config(dir.path())).unwrap();

        // Larger than two buffers: forced into several groups, and the
        // head chunk follows the last group.
        let payload = pattern(2 * BUFFER_CAPACITY + 4321, 5);
        let lsn = log
            .write(RecordType::RedoFreeBlocks, 0, &[&payload])
            .unwrap();
        assert_eq!(
            log.read_header(lsn).unwrap().record_length,
            payload.len() as u64
        );
        assert_eq!(read_all(&log, lsn, payload.len()), payload);
    }

    #[test]
    fn sub_range_reads_match_every_layout() {
        let dir = tempdir().unwrap();
        let log = Log::create(test_config(dir.path())).unwrap();

        let sizes = [
            64,                        // single chunk
            3 * PAGE_SIZE,             // single group
            2 * BUFFER_CAPACITY + 99,  // multi-group
        ];
        for (i, &size) in sizes.iter().enumerate() {
            let payload = pattern(size, 10 + i as u64);
            let lsn = log
                .write(RecordType::RedoUpdateRowHead, 0, &[&payload])
                .unwrap();

            // Head, middle, tail, and a tiny unaligned window.
            let ranges = [
                (0u64, 17usize),
                (size as u64 / 2, 1000.min(size / 2)),
                (size as u64 - 5, 5),
                (1, 3),
            ];
            for (offset, len) in ranges {
                let mut buf = vec![0u8; len];
                let n = log.read(lsn, offset, &mut buf).unwrap();
                assert_eq!(n, len);
                assert_eq!(
                    buf,
                    &payload[offset as usize..offset as usize + len],
                    "range {offset}+{len} of {size}-byte record"
                );
            }

            // Reading past the end is short, not an error.
            let mut buf = vec![0u8; 64];
            let n = log.read(lsn, size as u64 - 10, &mut buf).unwrap();
            assert_eq!(n, 10);
        }
    }

    #[test]
    fn parts_concatenate() {
        let dir = tempdir().unwrap();
        let log = Log::create(test_config(dir.path())).unwrap();

        let payload = pattern(40_000, 6);
        let (a, rest) = payload.split_at(7);
        let (b, c) = rest.split_at(25_000);
        let lsn = log
            .write(RecordType::RedoIndexNewPage, 0, &[a, b, c])
            .unwrap();
        assert_eq!(read_all(&log, lsn, payload.len()), payload);
    }
}

mod durability_watermarks {
    use super::*;

    #[test]
    fn flush_orders_watermarks() {
        let dir = tempdir().unwrap();
        let log = Log::create(test_config(dir.path())).unwrap();

        let payload = pattern(1000, 7);
        let lsn = log.write(RecordType::RedoIndex, 0, &[&payload]).unwrap();

        let placed = log.placed_horizon();
        assert!(placed > lsn, "record must be placed before write returns");
        assert!(log.flushed_lsn() <= log.sent_to_disk_lsn());
        assert!(log.sent_to_disk_lsn() <= placed);

        log.flush(placed).unwrap();
        assert!(log.flushed_lsn() >= placed);
        assert!(log.flushed_lsn() <= log.sent_to_disk_lsn());
        assert!(log.placed_horizon() <= log.horizon());
    }

    #[test]
    fn flush_beyond_placed_horizon_is_rejected() {
        let dir = tempdir().unwrap();
        let log = Log::create(test_config(dir.path())).unwrap();

        let far = translog::Lsn::new(99, PAGE_SIZE as u32 * 2);
        assert!(log.flush(far).is_err());
    }
}

mod transactions {
    use super::*;
    use translog::Lsn;

    #[test]
    fn undo_chain_links_through_hooks() {
        let dir = tempdir().unwrap();
        let log = Log::create(test_config(dir.path())).unwrap();

        let trid = log.assign_short_id(777).unwrap();
        assert!(log.undo_chain_head(trid.id()).is_zero());

        // First undo record: the pre-write hook injects the long-id
        // mapping record ahead of it.
        let ref0 = log.undo_chain_head(trid.id());
        let tail = pattern(8, 8);
        let u1 = log
            .write(
                RecordType::UndoRowInsert,
                trid.id(),
                &[&ref0.raw().to_be_bytes(), &tail],
            )
            .unwrap();
        assert_eq!(log.undo_chain_head(trid.id()), u1);

        let ref1 = log.undo_chain_head(trid.id());
        let u2 = log
            .write(
                RecordType::UndoRowInsert,
                trid.id(),
                &[&ref1.raw().to_be_bytes(), &tail],
            )
            .unwrap();
        assert_eq!(log.undo_chain_head(trid.id()), u2);

        // Back-references decode to the chain.
        let h2 = log.read_header(u2).unwrap();
        assert_eq!(h2.lsn_refs.as_slice(), &[u1]);
        assert_eq!(h2.record_length, 16);
        let h1 = log.read_header(u1).unwrap();
        assert_eq!(h1.lsn_refs.as_slice(), &[Lsn::ZERO]);

        // Pseudo-fixed payloads round-trip with expanded refs.
        let logical = read_all(&log, u2, 16);
        assert_eq!(&logical[..8], &u1.raw().to_be_bytes());
        assert_eq!(&logical[8..], &tail[..]);

        // Commit clears the chain.
        log.write(RecordType::Commit, trid.id(), &[&[0u8; 4]]).unwrap();
        assert!(log.undo_chain_head(trid.id()).is_zero());

        // Exactly one long-id record was injected, before the first undo.
        let mut cursor = log.open_scanner(log.first_lsn(), true).unwrap();
        let mut long_ids = 0;
        let mut first_kind = None;
        while let Some(header) = log.next_record_header(&mut cursor).unwrap() {
            if first_kind.is_none() {
                first_kind = Some(header.record_type);
            }
            if header.record_type == RecordType::LongTransactionId {
                long_ids += 1;
            }
        }
        assert_eq!(long_ids, 1);
        assert_eq!(first_kind, Some(RecordType::LongTransactionId));
    }

    #[test]
    fn short_ids_recycle_on_drop() {
        let dir = tempdir().unwrap();
        let log = Log::create(test_config(dir.path())).unwrap();

        let first = {
            let guard = log.assign_short_id(1).unwrap();
            assert_eq!(log.short_ids_in_use(), 1);
            guard.id()
        };
        assert_eq!(log.short_ids_in_use(), 0);
        let second = log.assign_short_id(2).unwrap();
        assert_eq!(second.id(), first, "dropped id is reused");
    }

    #[test]
    fn fixed_record_length_is_enforced() {
        let dir = tempdir().unwrap();
        let log = Log::create(test_config(dir.path())).unwrap();

        assert!(log
            .write(RecordType::RedoDeleteRow, 0, &[&[0u8; 7]])
            .is_err());
        assert!(log
            .write(RecordType::RedoDeleteRow, 0, &[&[0u8; 8]])
            .is_ok());
    }
}
