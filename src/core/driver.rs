//! Pipeline driver
//!
//! The control loop of a copy. Every slot starts with a read; after that,
//! each finished read turns into a write of the bytes it produced at the same
//! offset, each finished write turns into a read of the next unclaimed block,
//! and a zero-byte read (or an exhausted write) retires the slot for good.
//! The job ends when no active slot remains.

use crate::core::{CompletionPoller, SlotPhase, SlotPool};
use crate::error::{PipelineError, Result};
use crate::fs::IoBackend;
use crate::progress::ProgressReporter;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use tracing::{debug, info, trace};

/// Counters collected while a job runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// Reads submitted, including the final zero-byte ones
    pub reads_issued: u64,
    /// Writes submitted
    pub writes_issued: u64,
    /// Reads that returned end-of-file
    pub eof_reads: u64,
    /// Bytes returned by reads
    pub bytes_read: u64,
    /// Bytes acknowledged by writes
    pub bytes_written: u64,
    /// Loop iterations
    pub iterations: u64,
    /// Polls that timed out without a completion
    pub idle_polls: u64,
    /// Highest number of operations in flight at once
    pub max_in_flight: usize,
}

/// State of one copy from a source descriptor to a destination descriptor
#[derive(Debug, Clone)]
pub struct CopyJob {
    source: RawFd,
    destination: RawFd,
    block_size: usize,
    slots: usize,
    next_read_offset: u64,
    active: usize,
    size_hint: Option<u64>,
    stats: JobStats,
}

impl CopyJob {
    /// Create a job copying `source` to `destination` with `slots` slots
    pub fn new(source: RawFd, destination: RawFd, block_size: usize, slots: usize) -> Self {
        Self {
            source,
            destination,
            block_size,
            slots,
            next_read_offset: 0,
            active: slots,
            size_hint: None,
            stats: JobStats::default(),
        }
    }

    /// Stop issuing reads once the cursor passes a known source size.
    ///
    /// Only changes when tail slots retire; the copied bytes are the same.
    pub fn with_size_hint(mut self, size: Option<u64>) -> Self {
        self.size_hint = size;
        self
    }

    /// Offset the next read will be issued at
    pub fn next_read_offset(&self) -> u64 {
        self.next_read_offset
    }

    /// Slots that have not retired
    pub fn active_slots(&self) -> usize {
        self.active
    }

    /// Block size in bytes
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of slots the job runs with
    pub fn slot_count(&self) -> usize {
        self.slots
    }

    /// Known source size, if reads are gated on it
    pub fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }

    /// Counters so far
    pub fn stats(&self) -> &JobStats {
        &self.stats
    }

    /// Whether the job has finished
    pub fn is_done(&self) -> bool {
        self.active == 0
    }

    fn more_data_may_remain(&self) -> bool {
        self.size_hint
            .map_or(true, |size| self.next_read_offset < size)
    }

    fn claim_next_block(&mut self) -> u64 {
        let offset = self.next_read_offset;
        self.next_read_offset += self.block_size as u64;
        offset
    }
}

/// Runs a [`CopyJob`] over a [`SlotPool`] until every slot has retired
pub struct PipelineDriver<'a> {
    poller: &'a CompletionPoller,
    progress: Option<&'a ProgressReporter>,
}

impl<'a> PipelineDriver<'a> {
    /// Create a driver that waits through `poller`
    pub fn new(poller: &'a CompletionPoller) -> Self {
        Self {
            poller,
            progress: None,
        }
    }

    /// Report written bytes to `progress`
    pub fn with_progress(mut self, progress: &'a ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Drive `job` to completion. Any error is fatal to the job.
    pub fn run<B: IoBackend>(&self, job: &mut CopyJob, pool: &mut SlotPool<B>) -> Result<()> {
        if pool.len() != job.slots || pool.block_size() != job.block_size {
            return Err(PipelineError::config(format!(
                "job wants {} slots of {} bytes, pool has {} slots of {} bytes",
                job.slots,
                job.block_size,
                pool.len(),
                pool.block_size()
            )));
        }

        info!(
            slots = job.slots,
            block_size = job.block_size,
            backend = pool.backend_name(),
            strategy = self.poller.effective_strategy(pool).name(),
            size_aware = job.size_hint.is_some(),
            "starting pipelined copy"
        );

        self.prime(job, pool)?;

        while job.active > 0 {
            if pool.in_flight() == 0 {
                return Err(PipelineError::Stalled { active: job.active });
            }

            let ready = self.poller.poll(pool)?;
            job.stats.iterations += 1;

            if ready.is_empty() {
                job.stats.idle_polls += 1;
                debug!(
                    active = job.active,
                    in_flight = pool.in_flight(),
                    next_read_offset = job.next_read_offset,
                    "no completions within poll timeout"
                );
                continue;
            }

            // Resolve every finished read before any finished write so a slot
            // that just turned into a writer is not handled twice.
            let (reads, writes): (Vec<usize>, Vec<usize>) = ready
                .into_iter()
                .partition(|&index| pool.slot(index).phase() == SlotPhase::Reading);

            for index in reads {
                self.on_read_complete(job, pool, index)?;
            }
            for index in writes {
                self.on_write_complete(job, pool, index)?;
            }

            job.stats.max_in_flight = job.stats.max_in_flight.max(pool.in_flight());
        }

        info!(
            bytes = job.stats.bytes_written,
            reads = job.stats.reads_issued,
            writes = job.stats.writes_issued,
            "pipelined copy finished"
        );
        Ok(())
    }

    fn prime<B: IoBackend>(&self, job: &mut CopyJob, pool: &mut SlotPool<B>) -> Result<()> {
        for index in 0..job.slots {
            self.issue_read(job, pool, index)?;
        }
        job.stats.max_in_flight = pool.in_flight();
        Ok(())
    }

    fn issue_read<B: IoBackend>(
        &self,
        job: &mut CopyJob,
        pool: &mut SlotPool<B>,
        index: usize,
    ) -> Result<()> {
        let offset = job.claim_next_block();
        pool.begin_read(index, job.source, offset, job.block_size)?;
        job.stats.reads_issued += 1;
        Ok(())
    }

    fn on_read_complete<B: IoBackend>(
        &self,
        job: &mut CopyJob,
        pool: &mut SlotPool<B>,
        index: usize,
    ) -> Result<()> {
        let bytes_read = pool.finish(index)?;

        if bytes_read > 0 {
            job.stats.bytes_read += bytes_read as u64;
            let offset = pool.slot(index).offset();
            pool.begin_write(index, job.destination, offset, bytes_read)?;
            job.stats.writes_issued += 1;
        } else {
            job.stats.eof_reads += 1;
            self.retire(job, pool, index)?;
        }
        Ok(())
    }

    fn on_write_complete<B: IoBackend>(
        &self,
        job: &mut CopyJob,
        pool: &mut SlotPool<B>,
        index: usize,
    ) -> Result<()> {
        let requested = pool.slot(index).requested();
        let bytes_written = pool.finish(index)?;

        if bytes_written > 0 && bytes_written < requested {
            return Err(PipelineError::ShortWrite {
                slot: index,
                offset: pool.slot(index).offset(),
                requested,
                written: bytes_written,
            });
        }

        job.stats.bytes_written += bytes_written as u64;
        if let Some(progress) = self.progress {
            progress.increment_bytes(bytes_written as u64);
        }

        if bytes_written > 0 && job.more_data_may_remain() {
            self.issue_read(job, pool, index)
        } else {
            self.retire(job, pool, index)
        }
    }

    fn retire<B: IoBackend>(
        &self,
        job: &mut CopyJob,
        pool: &mut SlotPool<B>,
        index: usize,
    ) -> Result<()> {
        pool.retire(index)?;
        job.active -= 1;
        trace!(slot = index, active = job.active, "slot retired from job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OpKind, PollStrategy};
    use crate::fs::{MemoryBackend, OpRecord};
    use proptest::prelude::*;
    use std::time::Duration;

    const SRC: RawFd = 3;
    const DST: RawFd = 4;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    struct Outcome {
        job: CopyJob,
        pool: SlotPool<MemoryBackend>,
    }

    impl Outcome {
        fn output(&self) -> &[u8] {
            self.pool.backend().file(DST).unwrap()
        }

        fn history(&self) -> &[OpRecord] {
            self.pool.backend().history()
        }

        fn count(&self, kind: OpKind) -> usize {
            self.history().iter().filter(|op| op.kind == kind).count()
        }
    }

    fn run_copy(
        data: &[u8],
        block: usize,
        slots: usize,
        seed: u64,
        size_aware: bool,
    ) -> Result<Outcome> {
        let backend = MemoryBackend::new(slots, seed)
            .with_file(SRC, data.to_vec())
            .with_file(DST, Vec::new());
        run_with(backend, data.len(), block, slots, size_aware)
    }

    fn run_with(
        backend: MemoryBackend,
        len: usize,
        block: usize,
        slots: usize,
        size_aware: bool,
    ) -> Result<Outcome> {
        let mut pool = SlotPool::new(backend, block, slots)?;
        let mut job = CopyJob::new(SRC, DST, block, slots)
            .with_size_hint(size_aware.then_some(len as u64));
        let poller = CompletionPoller::default();
        PipelineDriver::new(&poller).run(&mut job, &mut pool)?;
        Ok(Outcome { job, pool })
    }

    #[test]
    fn test_empty_source() {
        let outcome = run_copy(&[], 16, 4, 1, false).unwrap();
        assert!(outcome.output().is_empty());
        assert_eq!(outcome.job.slot_count(), 4);
        assert_eq!(outcome.job.block_size(), 16);
        assert_eq!(outcome.count(OpKind::Read), 4);
        assert_eq!(outcome.count(OpKind::Write), 0);
        assert_eq!(outcome.job.stats().eof_reads, 4);
        assert!(outcome.job.is_done());
        assert!(outcome
            .pool
            .slots()
            .iter()
            .all(|slot| slot.phase() == SlotPhase::Retired));
    }

    #[test]
    fn test_single_block_with_four_slots_size_aware() {
        let data = pattern(64);
        let outcome = run_copy(&data, 64, 4, 3, true).unwrap();
        assert_eq!(outcome.output(), &data[..]);

        let history = outcome.history();
        // Slot 0 reads and writes the only block, then retires.
        let slot0: Vec<_> = history.iter().filter(|op| op.slot == 0).collect();
        assert_eq!(slot0.len(), 2);
        assert_eq!(slot0[0].kind, OpKind::Read);
        assert_eq!(slot0[1].kind, OpKind::Write);
        assert_eq!(slot0[1].len, 64);
        // Slots 1-3 read past the end and retire without writing.
        for slot in 1..4 {
            let ops: Vec<_> = history.iter().filter(|op| op.slot == slot).collect();
            assert_eq!(ops.len(), 1);
            assert_eq!(ops[0].kind, OpKind::Read);
            assert_eq!(ops[0].offset, slot as u64 * 64);
        }
        assert_eq!(outcome.job.stats().eof_reads, 3);
    }

    #[test]
    fn test_single_block_with_four_slots_size_unaware() {
        let data = pattern(64);
        let outcome = run_copy(&data, 64, 4, 3, false).unwrap();
        assert_eq!(outcome.output(), &data[..]);
        assert_eq!(outcome.count(OpKind::Write), 1);
        // Every slot, including the one that copied data, ends on an EOF read.
        assert_eq!(outcome.job.stats().eof_reads, 4);
        assert_eq!(outcome.job.next_read_offset(), 5 * 64);
    }

    #[test]
    fn test_ten_blocks_two_slots() {
        let block = 32;
        let data = pattern(10 * block);
        for size_aware in [false, true] {
            let outcome = run_copy(&data, block, 2, 11, size_aware).unwrap();
            assert_eq!(outcome.output(), &data[..]);
            assert_eq!(outcome.count(OpKind::Write), 10);
            let data_reads = outcome
                .history()
                .iter()
                .filter(|op| op.kind == OpKind::Read && op.offset < data.len() as u64)
                .count();
            assert_eq!(data_reads, 10);
            assert_eq!(outcome.job.stats().bytes_written, data.len() as u64);
        }
    }

    #[test]
    fn test_single_slot_is_sequential() {
        let data = pattern(100);
        let outcome = run_copy(&data, 16, 1, 5, false).unwrap();
        assert_eq!(outcome.output(), &data[..]);

        let kinds: Vec<OpKind> = outcome.history().iter().map(|op| op.kind).collect();
        for pair in kinds.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(kinds.first(), Some(&OpKind::Read));
        assert_eq!(kinds.last(), Some(&OpKind::Read));
        assert_eq!(outcome.pool.backend().max_in_flight(), 1);
    }

    #[test]
    fn test_final_cursor_values() {
        let block = 10;
        let data = pattern(95); // K = 10 blocks
        let unaware = run_copy(&data, block, 3, 2, false).unwrap();
        assert_eq!(unaware.job.next_read_offset(), (10 + 3) * 10);

        let aware = run_copy(&data, block, 3, 2, true).unwrap();
        assert_eq!(aware.job.next_read_offset(), 10 * 10);

        let few_blocks = run_copy(&pattern(15), block, 4, 2, true).unwrap();
        assert_eq!(few_blocks.job.next_read_offset(), 4 * 10);
    }

    #[test]
    fn test_no_overlapping_regions_and_bounded_concurrency() {
        let data = pattern(4096);
        let outcome = run_copy(&data, 64, 8, 77, false).unwrap();
        assert_eq!(outcome.output(), &data[..]);
        assert_eq!(outcome.pool.backend().overlaps(), 0);
        assert!(outcome.pool.backend().max_in_flight() <= 8);
        assert!(outcome.job.stats().max_in_flight <= 8);
    }

    #[test]
    fn test_writes_use_offset_recorded_at_read_time() {
        let data = pattern(1000);
        let outcome = run_copy(&data, 50, 6, 123, false).unwrap();
        let history = outcome.history();
        for (i, op) in history.iter().enumerate() {
            if op.kind != OpKind::Write {
                continue;
            }
            let read = history[..i]
                .iter()
                .rev()
                .find(|prev| prev.slot == op.slot)
                .unwrap();
            assert_eq!(read.kind, OpKind::Read);
            assert_eq!(read.offset, op.offset);
        }
    }

    #[test]
    fn test_busy_poll_copies_identically() {
        let data = pattern(777);
        let backend = MemoryBackend::new(3, 19)
            .with_file(SRC, data.clone())
            .with_file(DST, Vec::new())
            .without_event_wait();
        let mut pool = SlotPool::new(backend, 40, 3).unwrap();
        let mut job = CopyJob::new(SRC, DST, 40, 3);
        let poller = CompletionPoller::new(
            PollStrategy::BusyPoll {
                interval: Duration::ZERO,
            },
            Duration::from_millis(50),
        );
        PipelineDriver::new(&poller).run(&mut job, &mut pool).unwrap();
        assert_eq!(pool.backend().file(DST).unwrap(), &data[..]);
    }

    #[test]
    fn test_read_failure_aborts_job() {
        let data = pattern(256);
        let backend = MemoryBackend::new(2, 4)
            .with_file(SRC, data)
            .with_file(DST, Vec::new())
            .fail_read_at(64);
        let err = run_with(backend, 256, 32, 2, false).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::Completion {
                op: OpKind::Read,
                offset: 64,
                ..
            }
        ));
    }

    #[test]
    fn test_write_failure_aborts_job() {
        let backend = MemoryBackend::new(2, 4)
            .with_file(SRC, pattern(256))
            .with_file(DST, Vec::new())
            .fail_write_at(96);
        let err = run_with(backend, 256, 32, 2, false).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::Completion {
                op: OpKind::Write,
                offset: 96,
                ..
            }
        ));
    }

    #[test]
    fn test_submission_failure_aborts_job() {
        let backend = MemoryBackend::new(4, 4)
            .with_file(SRC, pattern(256))
            .with_file(DST, Vec::new())
            .reject_submissions_after(6);
        let err = run_with(backend, 256, 16, 4, false).err().unwrap();
        assert!(matches!(err, PipelineError::Submit { .. }));
    }

    #[test]
    fn test_short_write_is_fatal() {
        let backend = MemoryBackend::new(2, 4)
            .with_file(SRC, pattern(128))
            .with_file(DST, Vec::new())
            .short_write_at(32);
        let err = run_with(backend, 128, 32, 2, false).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::ShortWrite {
                offset: 32,
                requested: 32,
                written: 16,
                ..
            }
        ));
    }

    #[test]
    fn test_mismatched_pool_is_rejected() {
        let backend = MemoryBackend::new(2, 1).with_file(SRC, Vec::new());
        let mut pool = SlotPool::new(backend, 16, 2).unwrap();
        let mut job = CopyJob::new(SRC, DST, 32, 2);
        let poller = CompletionPoller::default();
        assert!(matches!(
            PipelineDriver::new(&poller).run(&mut job, &mut pool),
            Err(PipelineError::ConfigError(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_copy_is_complete_and_ordered(
            len in 0usize..2048,
            block in 1usize..200,
            slots in 1usize..=16,
            seed in any::<u64>(),
            size_aware in any::<bool>(),
        ) {
            let data = pattern(len);
            let outcome = run_copy(&data, block, slots, seed, size_aware).unwrap();

            prop_assert_eq!(outcome.output(), &data[..]);
            prop_assert!(outcome.job.is_done());
            prop_assert_eq!(outcome.pool.backend().overlaps(), 0);
            prop_assert!(outcome.pool.backend().max_in_flight() <= slots);

            let cursor = outcome.job.next_read_offset();
            let blocks = ((len + block - 1) / block) as u64;
            prop_assert_eq!(cursor % block as u64, 0);
            prop_assert!(cursor >= blocks * block as u64);
            let expected = if size_aware {
                blocks.max(slots as u64)
            } else {
                blocks + slots as u64
            };
            prop_assert_eq!(cursor, expected * block as u64);
        }
    }
}
