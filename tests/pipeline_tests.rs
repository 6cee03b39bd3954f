//! End-to-end copies through the real asynchronous backends

use slotcopy::config::{BackendKind, CopyJobConfig};
use slotcopy::core::{PipelinedCopier, PollStrategy};
use slotcopy::fs::check_io_uring_support;
use slotcopy::sweep::{run_sweep, SweepConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

fn make_source(dir: &Path, len: usize) -> (PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| ((i * 7 + i / 251) % 256) as u8).collect();
    let path = dir.join("source.bin");
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

fn config(src: &Path, dst: &Path, backend: BackendKind, block_size: usize, slots: usize) -> CopyJobConfig {
    let mut config = CopyJobConfig::new(src, dst);
    config.block_size = block_size;
    config.slots = slots;
    config.settings.backend = backend;
    config
}

fn backends() -> Vec<BackendKind> {
    let mut kinds = vec![BackendKind::Aio];
    if check_io_uring_support().is_usable() {
        kinds.push(BackendKind::Uring);
    }
    kinds
}

#[test]
fn copies_across_block_and_slot_grid() {
    let dir = TempDir::new().unwrap();
    let (src, data) = make_source(dir.path(), 300_001);
    let dst = dir.path().join("dest.bin");

    for backend in backends() {
        for (block_size, slots) in [(512, 1), (4096, 3), (65_536, 8), (1 << 20, 64)] {
            let report = PipelinedCopier::new(config(&src, &dst, backend, block_size, slots))
                .execute()
                .unwrap();
            assert_eq!(std::fs::read(&dst).unwrap(), data, "{:?} {} x {}", backend, slots, block_size);
            assert_eq!(report.bytes_copied, data.len() as u64);
            assert!(report.stats.max_in_flight <= slots);
        }
    }
}

#[test]
fn busy_polling_copies_identically() {
    let dir = TempDir::new().unwrap();
    let (src, data) = make_source(dir.path(), 123_457);
    let dst = dir.path().join("dest.bin");

    for backend in backends() {
        let mut config = config(&src, &dst, backend, 8192, 6);
        config.settings.poll = PollStrategy::BusyPoll {
            interval: Duration::from_micros(50),
        };
        let report = PipelinedCopier::new(config).execute().unwrap();
        assert_eq!(report.poll, "busy-poll");
        assert_eq!(std::fs::read(&dst).unwrap(), data);
    }
}

#[test]
fn size_aware_mode_skips_tail_reads() {
    let dir = TempDir::new().unwrap();
    let (src, data) = make_source(dir.path(), 10 * 4096);
    let dst = dir.path().join("dest.bin");

    let unaware = PipelinedCopier::new(config(&src, &dst, BackendKind::Aio, 4096, 4))
        .execute()
        .unwrap();
    assert_eq!(unaware.stats.reads_issued, 10 + 4);
    assert_eq!(unaware.stats.eof_reads, 4);

    let mut aware_config = config(&src, &dst, BackendKind::Aio, 4096, 4);
    aware_config.settings.size_aware = true;
    let aware = PipelinedCopier::new(aware_config).execute().unwrap();
    assert_eq!(aware.stats.reads_issued, 10);
    assert_eq!(aware.stats.eof_reads, 0);
    assert_eq!(std::fs::read(&dst).unwrap(), data);
}

#[test]
fn source_smaller_than_one_block() {
    let dir = TempDir::new().unwrap();
    let (src, data) = make_source(dir.path(), 10);
    let dst = dir.path().join("dest.bin");

    let report = PipelinedCopier::new(config(&src, &dst, BackendKind::Aio, 64 * 1024, 4))
        .execute()
        .unwrap();
    assert_eq!(report.stats.writes_issued, 1);
    assert_eq!(std::fs::read(&dst).unwrap(), data);
}

#[test]
fn auto_backend_always_copies() {
    let dir = TempDir::new().unwrap();
    let (src, data) = make_source(dir.path(), 50_000);
    let dst = dir.path().join("dest.bin");

    let report = PipelinedCopier::new(config(&src, &dst, BackendKind::Auto, 4096, 8))
        .execute()
        .unwrap();
    assert!(report.backend == "posix-aio" || report.backend == "io_uring");
    assert_eq!(std::fs::read(&dst).unwrap(), data);
}

#[test]
fn sweep_writes_csv_table() {
    let dir = TempDir::new().unwrap();
    let (src, _) = make_source(dir.path(), 64 * 1024);
    let dst = dir.path().join("dest.bin");

    let mut sweep = SweepConfig::new(&src, &dst, 4);
    sweep.multiples = 3;
    sweep.op_counts = vec![1, 2, 8];
    sweep.settings.backend = BackendKind::Aio;

    let result = run_sweep(&sweep).unwrap();
    let csv = dir.path().join("execution_times.csv");
    result.save_csv(&csv).unwrap();

    let text = std::fs::read_to_string(&csv).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "BlockSize(KB), 1 Op, 2 Ops, 8 Ops");
    assert_eq!(lines.len(), 4);
    for (line, kb) in lines[1..].iter().zip([4, 8, 12]) {
        let cells: Vec<&str> = line.split(", ").collect();
        assert_eq!(cells[0], kb.to_string());
        assert_eq!(cells.len(), 4);
        for cell in &cells[1..] {
            assert!(cell.parse::<f64>().unwrap() >= 0.0);
        }
    }
}
