//! Slot pool and arena
//!
//! # Safety model
//!
//! The kernel writes into slot regions behind the compiler's back. The arena
//! therefore never hands out `&[u8]`/`&mut [u8]` to its storage once I/O has
//! started: the base pointer is taken once at allocation time and every
//! submission receives `base + index * block_size`. A region is only given to
//! the backend while its slot has no other operation in flight, and the
//! backend is dropped (waiting for in-flight operations) before the arena.

use crate::error::{PipelineError, Result};
use crate::fs::IoBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::os::unix::io::RawFd;

/// Maximum number of slots a pool may have
pub const MAX_SLOTS: usize = 64;

/// Largest block a single read or write may request
///
/// Linux caps one `pread`/`pwrite` (and the async variants) at
/// `MAX_RW_COUNT` bytes. A larger block would come back short in the middle
/// of the file.
pub const MAX_BLOCK_SIZE: usize = 0x7fff_f000;

/// Kind of asynchronous operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// Read from the source into a slot region
    Read,
    /// Write a slot region to the destination
    Write,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Phase of a slot
///
/// Slots start `Idle`, alternate `Reading`/`Writing`, and end `Retired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotPhase {
    /// Nothing issued yet
    Idle,
    /// A read was issued
    Reading,
    /// A write was issued
    Writing,
    /// No further work
    Retired,
}

impl SlotPhase {
    /// Whether an operation of this phase can be in flight
    pub fn is_active(self) -> bool {
        matches!(self, Self::Reading | Self::Writing)
    }

    /// The operation kind a slot in this phase has issued
    pub fn op_kind(self) -> Option<OpKind> {
        match self {
            Self::Reading => Some(OpKind::Read),
            Self::Writing => Some(OpKind::Write),
            Self::Idle | Self::Retired => None,
        }
    }
}

/// One contiguous allocation split into equal, disjoint regions
pub struct Arena {
    /// Owns the allocation. Not dereferenced after construction.
    _storage: Box<[u8]>,
    base: *mut u8,
    block_size: usize,
    regions: usize,
}

impl Arena {
    /// Allocate `regions` regions of `block_size` bytes each
    pub fn new(block_size: usize, regions: usize) -> Result<Self> {
        let bytes = block_size
            .checked_mul(regions)
            .ok_or(PipelineError::ArenaAllocation { bytes: usize::MAX })?;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(bytes)
            .map_err(|_| PipelineError::ArenaAllocation { bytes })?;
        storage.resize(bytes, 0u8);
        let mut storage = storage.into_boxed_slice();

        // No I/O can be in flight yet, so borrowing the storage here is sound.
        let base = storage.as_mut_ptr();

        Ok(Self {
            _storage: storage,
            base,
            block_size,
            regions,
        })
    }

    /// Byte range of region `index` within the arena
    pub fn region(&self, index: usize) -> Range<usize> {
        let start = index * self.block_size;
        start..start + self.block_size
    }

    /// Size of each region
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of regions
    pub fn regions(&self) -> usize {
        self.regions
    }

    /// Total size in bytes
    pub fn len(&self) -> usize {
        self.block_size * self.regions
    }

    /// Whether the arena has no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn region_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.regions);
        // SAFETY: index < regions, so the offset stays inside the allocation.
        unsafe { self.base.add(index * self.block_size) }
    }
}

/// One lane of the pool
#[derive(Debug, Clone)]
pub struct Slot {
    index: usize,
    phase: SlotPhase,
    region: Range<usize>,
    offset: u64,
    requested: usize,
    transferred: Option<usize>,
}

impl Slot {
    /// Slot index
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current phase
    pub fn phase(&self) -> SlotPhase {
        self.phase
    }

    /// Arena range this slot owns
    pub fn region(&self) -> Range<usize> {
        self.region.clone()
    }

    /// File offset of the current (or last) operation
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes requested by the current (or last) operation
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Bytes transferred, once the current operation has been finished
    pub fn transferred(&self) -> Option<usize> {
        self.transferred
    }

    /// Whether an operation was issued and its result not yet retrieved
    pub fn is_outstanding(&self) -> bool {
        self.phase.is_active() && self.transferred.is_none()
    }
}

/// Fixed-capacity pool of slots sharing one arena
pub struct SlotPool<B: IoBackend> {
    slots: Vec<Slot>,
    // Declared before `arena`: dropping the backend waits for in-flight
    // operations, and fields drop in declaration order.
    backend: B,
    arena: Arena,
}

impl<B: IoBackend> SlotPool<B> {
    /// Create a pool of `count` slots with `block_size` bytes each
    pub fn new(backend: B, block_size: usize, count: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(PipelineError::config("block size must be greater than zero"));
        }
        if block_size > MAX_BLOCK_SIZE {
            return Err(PipelineError::config(format!(
                "block size {} exceeds the {} byte per-operation limit",
                block_size, MAX_BLOCK_SIZE
            )));
        }
        if count == 0 || count > MAX_SLOTS {
            return Err(PipelineError::config(format!(
                "slot count must be between 1 and {}, got {}",
                MAX_SLOTS, count
            )));
        }
        if count > backend.capacity() {
            return Err(PipelineError::config(format!(
                "{} backend has {} control blocks, {} slots requested",
                backend.name(),
                backend.capacity(),
                count
            )));
        }

        let arena = Arena::new(block_size, count)?;
        let slots = (0..count)
            .map(|index| Slot {
                index,
                phase: SlotPhase::Idle,
                region: arena.region(index),
                offset: 0,
                requested: 0,
                transferred: None,
            })
            .collect();

        Ok(Self {
            slots,
            backend,
            arena,
        })
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Size of each slot's region
    pub fn block_size(&self) -> usize {
        self.arena.block_size()
    }

    /// Name of the backend in use
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Borrow the backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Slot `index`
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    /// All slots
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Arena segment owned by slot `index`
    pub fn acquire_region(&self, index: usize) -> Range<usize> {
        self.arena.region(index)
    }

    /// Indices of slots with an operation in flight, ascending
    pub fn outstanding(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|slot| slot.is_outstanding())
            .map(Slot::index)
            .collect()
    }

    /// Number of operations in flight
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_outstanding()).count()
    }

    /// Issue a read of `length` bytes at `offset` into slot `index`'s region
    pub fn begin_read(&mut self, index: usize, source: RawFd, offset: u64, length: usize) -> Result<()> {
        self.check_transition(index, SlotPhase::Reading)?;
        let length = self.check_length(length)?;
        let buf = self.arena.region_ptr(index);

        // SAFETY: the transition check guarantees nothing is in flight on this
        // region, and the backend is dropped before the arena.
        unsafe { self.backend.submit_read(index, source, offset, buf, length) }
            .map_err(|e| PipelineError::submit(index, OpKind::Read, offset, e))?;

        self.issued(index, SlotPhase::Reading, offset, length);
        Ok(())
    }

    /// Issue a write of `length` bytes from slot `index`'s region at `offset`
    pub fn begin_write(
        &mut self,
        index: usize,
        destination: RawFd,
        offset: u64,
        length: usize,
    ) -> Result<()> {
        self.check_transition(index, SlotPhase::Writing)?;
        let length = self.check_length(length)?;
        let buf = self.arena.region_ptr(index) as *const u8;

        // SAFETY: as in begin_read.
        unsafe { self.backend.submit_write(index, destination, offset, buf, length) }
            .map_err(|e| PipelineError::submit(index, OpKind::Write, offset, e))?;

        self.issued(index, SlotPhase::Writing, offset, length);
        Ok(())
    }

    /// Retrieve the byte count of slot `index`'s completed operation
    pub fn finish(&mut self, index: usize) -> Result<usize> {
        let slot = self.get(index)?;
        let op = match (slot.phase.op_kind(), slot.transferred) {
            (Some(op), None) => op,
            _ => {
                return Err(PipelineError::NotOutstanding {
                    slot: index,
                    phase: slot.phase,
                })
            }
        };
        let offset = slot.offset;

        let transferred = self
            .backend
            .take_result(index)
            .map_err(|e| PipelineError::completion(index, op, offset, e))?;

        self.slots[index].transferred = Some(transferred);
        tracing::trace!(slot = index, %op, offset, transferred, "operation finished");
        Ok(transferred)
    }

    /// Permanently remove slot `index` from further work
    pub fn retire(&mut self, index: usize) -> Result<()> {
        self.check_transition(index, SlotPhase::Retired)?;
        self.slots[index].phase = SlotPhase::Retired;
        tracing::trace!(slot = index, "slot retired");
        Ok(())
    }

    /// Non-blocking completion test for slot `index`
    pub(crate) fn poll_slot(&mut self, index: usize) -> bool {
        self.slots[index].is_outstanding() && self.backend.is_complete(index)
    }

    pub(crate) fn supports_event_wait(&self) -> bool {
        self.backend.supports_event_wait()
    }

    pub(crate) fn wait_any(&mut self, pending: &[usize], timeout: std::time::Duration) -> Result<()> {
        self.backend
            .wait_any(pending, timeout)
            .map_err(PipelineError::Wait)
    }

    fn get(&self, index: usize) -> Result<&Slot> {
        self.slots.get(index).ok_or(PipelineError::InvalidSlot {
            index,
            len: self.slots.len(),
        })
    }

    fn check_length(&self, length: usize) -> Result<usize> {
        if length > self.arena.block_size() {
            return Err(PipelineError::config(format!(
                "operation of {} bytes exceeds the {} byte slot region",
                length,
                self.arena.block_size()
            )));
        }
        Ok(length)
    }

    fn check_transition(&self, index: usize, to: SlotPhase) -> Result<()> {
        let slot = self.get(index)?;
        let finished = slot.transferred.is_some();
        let legal = match (slot.phase, to) {
            (SlotPhase::Idle, SlotPhase::Reading) => true,
            (SlotPhase::Reading, SlotPhase::Writing)
            | (SlotPhase::Writing, SlotPhase::Reading)
            | (SlotPhase::Reading, SlotPhase::Retired)
            | (SlotPhase::Writing, SlotPhase::Retired) => finished,
            _ => false,
        };

        if legal {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition {
                slot: index,
                from: slot.phase,
                to,
            })
        }
    }

    fn issued(&mut self, index: usize, phase: SlotPhase, offset: u64, length: usize) {
        let slot = &mut self.slots[index];
        slot.phase = phase;
        slot.offset = offset;
        slot.requested = length;
        slot.transferred = None;
        tracing::trace!(slot = index, ?phase, offset, length, "operation issued");
    }
}
