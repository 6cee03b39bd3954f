//! Deterministic in-process backend
//!
//! Files are byte vectors keyed by a caller-chosen descriptor number.
//! Every submitted operation is assigned a pseudo-random latency measured in
//! poll ticks, so completions arrive out of submission order in a way that is
//! reproducible from the seed. Faults can be injected per offset.

use crate::core::OpKind;
use crate::fs::backend::IoBackend;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// One operation as observed by the backend, in submission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    /// Slot that issued the operation
    pub slot: usize,
    /// Read or write
    pub kind: OpKind,
    /// File offset
    pub offset: u64,
    /// Requested length
    pub len: usize,
}

struct PendingOp {
    kind: OpKind,
    fd: RawFd,
    offset: u64,
    buf: *mut u8,
    len: usize,
    ticks_left: u32,
    result: Option<io::Result<usize>>,
}

/// In-memory [`IoBackend`] with reproducible out-of-order completions
pub struct MemoryBackend {
    files: HashMap<RawFd, Vec<u8>>,
    ops: Vec<Option<PendingOp>>,
    rng: StdRng,
    min_latency: u32,
    max_latency: u32,
    event_wait: bool,
    submissions_left: Option<usize>,
    failing_reads: HashSet<u64>,
    failing_writes: HashSet<u64>,
    short_writes: HashSet<u64>,
    history: Vec<OpRecord>,
    max_in_flight: usize,
    overlaps: usize,
}

impl MemoryBackend {
    /// Create a backend with `slots` control blocks and the given seed
    pub fn new(slots: usize, seed: u64) -> Self {
        Self {
            files: HashMap::new(),
            ops: (0..slots).map(|_| None).collect(),
            rng: StdRng::seed_from_u64(seed),
            min_latency: 0,
            max_latency: 4,
            event_wait: true,
            submissions_left: None,
            failing_reads: HashSet::new(),
            failing_writes: HashSet::new(),
            short_writes: HashSet::new(),
            history: Vec::new(),
            max_in_flight: 0,
            overlaps: 0,
        }
    }

    /// Register a file under descriptor `fd`
    pub fn with_file(mut self, fd: RawFd, contents: Vec<u8>) -> Self {
        self.files.insert(fd, contents);
        self
    }

    /// Upper bound on poll ticks before an operation completes
    pub fn with_max_latency(mut self, ticks: u32) -> Self {
        self.max_latency = ticks;
        self
    }

    /// Lower bound on poll ticks before an operation completes
    pub fn with_min_latency(mut self, ticks: u32) -> Self {
        self.min_latency = ticks;
        self
    }

    /// Report no event wait, forcing the poller onto busy polling
    pub fn without_event_wait(mut self) -> Self {
        self.event_wait = false;
        self
    }

    /// Accept only `count` more submissions, then fail with `EAGAIN`
    pub fn reject_submissions_after(mut self, count: usize) -> Self {
        self.submissions_left = Some(count);
        self
    }

    /// Fail the read issued at `offset` with `EIO`
    pub fn fail_read_at(mut self, offset: u64) -> Self {
        self.failing_reads.insert(offset);
        self
    }

    /// Fail the write issued at `offset` with `EIO`
    pub fn fail_write_at(mut self, offset: u64) -> Self {
        self.failing_writes.insert(offset);
        self
    }

    /// Make the write at `offset` transfer only half of its bytes
    pub fn short_write_at(mut self, offset: u64) -> Self {
        self.short_writes.insert(offset);
        self
    }

    /// Current contents of the file registered under `fd`
    pub fn file(&self, fd: RawFd) -> Option<&[u8]> {
        self.files.get(&fd).map(Vec::as_slice)
    }

    /// Every submitted operation in submission order
    pub fn history(&self) -> &[OpRecord] {
        &self.history
    }

    /// Highest number of simultaneously outstanding operations seen
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Number of submissions whose buffer overlapped an outstanding one
    pub fn overlaps(&self) -> usize {
        self.overlaps
    }

    fn next_latency(&mut self) -> u32 {
        let max = self.max_latency.max(self.min_latency);
        self.rng.gen_range(self.min_latency..=max)
    }

    fn submit(
        &mut self,
        slot: usize,
        kind: OpKind,
        fd: RawFd,
        offset: u64,
        buf: *mut u8,
        len: usize,
    ) -> io::Result<()> {
        if self.ops[slot].is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("slot {} already has an operation in flight", slot),
            ));
        }
        if let Some(left) = self.submissions_left.as_mut() {
            if *left == 0 {
                return Err(io::Error::from_raw_os_error(libc::EAGAIN));
            }
            *left -= 1;
        }
        if !self.files.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        let start = buf as usize;
        let end = start + len;
        let overlapping = self.ops.iter().flatten().any(|op| {
            let other = op.buf as usize;
            start < other + op.len && other < end
        });
        if overlapping {
            self.overlaps += 1;
        }

        let ticks_left = self.next_latency();
        self.ops[slot] = Some(PendingOp {
            kind,
            fd,
            offset,
            buf,
            len,
            ticks_left,
            result: None,
        });
        self.history.push(OpRecord {
            slot,
            kind,
            offset,
            len,
        });
        let in_flight = self.ops.iter().flatten().count();
        self.max_in_flight = self.max_in_flight.max(in_flight);
        Ok(())
    }

    /// Advance the operation on `slot` by one tick, executing it when due.
    fn tick(&mut self, slot: usize) -> bool {
        let due = match self.ops[slot].as_mut() {
            None => return false,
            Some(op) if op.result.is_some() => return true,
            Some(op) if op.ticks_left > 0 => {
                op.ticks_left -= 1;
                false
            }
            Some(_) => true,
        };
        if due {
            self.execute(slot);
        }
        due
    }

    fn execute(&mut self, slot: usize) {
        let Some(op) = self.ops[slot].as_ref() else {
            return;
        };
        let (kind, fd, offset, buf, len) = (op.kind, op.fd, op.offset, op.buf, op.len);

        let result = match kind {
            OpKind::Read if self.failing_reads.contains(&offset) => {
                Err(io::Error::from_raw_os_error(libc::EIO))
            }
            OpKind::Write if self.failing_writes.contains(&offset) => {
                Err(io::Error::from_raw_os_error(libc::EIO))
            }
            OpKind::Read => {
                let data = &self.files[&fd];
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let count = len.min(data.len() - start);
                // SAFETY: the submitter guarantees `buf` is valid for `len`
                // bytes until the result is taken; `count <= len`.
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr().add(start), buf, count) };
                Ok(count)
            }
            OpKind::Write => {
                let count = if self.short_writes.contains(&offset) {
                    len / 2
                } else {
                    len
                };
                match self.files.get_mut(&fd) {
                    Some(data) => {
                        let start = offset as usize;
                        if data.len() < start + count {
                            data.resize(start + count, 0);
                        }
                        // SAFETY: as above, `buf` is valid for reads of `len` bytes.
                        unsafe {
                            std::ptr::copy_nonoverlapping(buf, data.as_mut_ptr().add(start), count)
                        };
                        Ok(count)
                    }
                    None => Err(io::Error::from_raw_os_error(libc::EBADF)),
                }
            }
        };

        if let Some(op) = self.ops[slot].as_mut() {
            op.result = Some(result);
        }
    }
}

impl IoBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capacity(&self) -> usize {
        self.ops.len()
    }

    unsafe fn submit_read(
        &mut self,
        slot: usize,
        fd: RawFd,
        offset: u64,
        buf: *mut u8,
        len: usize,
    ) -> io::Result<()> {
        self.submit(slot, OpKind::Read, fd, offset, buf, len)
    }

    unsafe fn submit_write(
        &mut self,
        slot: usize,
        fd: RawFd,
        offset: u64,
        buf: *const u8,
        len: usize,
    ) -> io::Result<()> {
        self.submit(slot, OpKind::Write, fd, offset, buf as *mut u8, len)
    }

    fn is_complete(&mut self, slot: usize) -> bool {
        self.tick(slot)
    }

    fn supports_event_wait(&self) -> bool {
        self.event_wait
    }

    fn wait_any(&mut self, pending: &[usize], _timeout: Duration) -> io::Result<()> {
        if !pending.iter().any(|&slot| self.ops[slot].is_some()) {
            return Ok(());
        }
        loop {
            let mut any = false;
            for &slot in pending {
                any |= self.tick(slot);
            }
            if any {
                return Ok(());
            }
        }
    }

    fn take_result(&mut self, slot: usize) -> io::Result<usize> {
        match self.ops[slot].as_mut().and_then(|op| op.result.take()) {
            Some(result) => {
                self.ops[slot] = None;
                result
            }
            None => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("no completed operation on slot {}", slot),
            )),
        }
    }
}
