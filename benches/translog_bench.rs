//! Write, flush, and scan throughput benchmarks for the log.
//!
//! Record sizes cover the three physical layouts: inline single chunks,
//! page-spanning single groups, and buffer-crossing multi-group records.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;
use translog::config::{BUFFER_CAPACITY, PAGE_SIZE};
use translog::{Log, LogConfig, RecordType};

fn bench_log(dir: &std::path::Path) -> Log {
    Log::create(LogConfig::new(dir).sector_protection(true).crc(true)).unwrap()
}

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("translog_write");
    group.sample_size(10);

    let sizes: &[(usize, &str)] = &[
        (64, "inline_64b"),
        (4 * 1024, "inline_4k"),
        (4 * PAGE_SIZE, "single_group_32k"),
        (BUFFER_CAPACITY + 4096, "multi_group_260k"),
    ];

    for &(size, name) in sizes {
        let dir = tempdir().unwrap();
        let log = bench_log(dir.path());
        let payload = vec![0xA5u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("write", name), &payload, |b, payload| {
            b.iter(|| {
                let lsn = log
                    .write(RecordType::RedoInsertRowHead, 0, &[black_box(payload)])
                    .unwrap();
                black_box(lsn)
            });
        });
    }
    group.finish();
}

fn bench_write_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("translog_write_flush");
    group.sample_size(20);

    let dir = tempdir().unwrap();
    let log = bench_log(dir.path());
    let payload = vec![0x5Au8; 4096];

    group.throughput(Throughput::Bytes(4096));
    group.bench_function("write_then_flush_4k", |b| {
        b.iter(|| {
            let lsn = log
                .write(RecordType::RedoUpdateRowHead, 0, &[black_box(&payload)])
                .unwrap();
            log.flush(lsn).unwrap();
        });
    });
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("translog_scan");

    let dir = tempdir().unwrap();
    let log = bench_log(dir.path());
    for i in 0..1000u32 {
        let payload = vec![(i % 251) as u8; 512];
        log.write(RecordType::RedoIndex, 0, &[&payload]).unwrap();
    }
    log.flush(log.placed_horizon()).unwrap();

    group.bench_function("scan_1000_records", |b| {
        b.iter(|| {
            let mut cursor = log.open_scanner(log.first_lsn(), true).unwrap();
            let mut count = 0;
            while let Some(header) = log.next_record_header(&mut cursor).unwrap() {
                black_box(header.lsn);
                count += 1;
            }
            assert_eq!(count, 1000);
        });
    });

    group.bench_function("read_header_random", |b| {
        let mut cursor = log.open_scanner(log.first_lsn(), true).unwrap();
        let mut lsns = Vec::new();
        while let Some(header) = log.next_record_header(&mut cursor).unwrap() {
            lsns.push(header.lsn);
        }
        let mut i = 0;
        b.iter(|| {
            // Stride through the records to defeat the cursor cache.
            i = (i + 379) % lsns.len();
            black_box(log.read_header(lsns[i]).unwrap())
        });
    });
    group.finish();
}

criterion_group!(benches, bench_write, bench_write_flush, bench_scan);
criterion_main!(benches);
