//! Error types for slotcopy
//!
//! Every failure in the copy pipeline is fatal to the job: submission
//! failures, completion failures and setup failures all surface as a
//! [`PipelineError`] and the driver stops issuing work immediately.

use crate::core::{OpKind, SlotPhase};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for slotcopy operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// I/O error while opening or inspecting a file
    #[error("I/O error at '{path}': {source}")]
    Io {
        /// File the operation was applied to
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Source and destination resolve to the same file
    #[error("Source and destination are the same: {0}")]
    SameSourceAndDestination(PathBuf),

    /// The slot arena could not be allocated
    #[error("Failed to allocate a {bytes} byte slot arena")]
    ArenaAllocation {
        /// Requested arena size
        bytes: usize,
    },

    /// The operating system refused a new asynchronous operation
    #[error("Failed to submit {op} on slot {slot} at offset {offset}: {source}")]
    Submit {
        /// Slot the operation was issued on
        slot: usize,
        /// Read or write
        op: OpKind,
        /// File offset of the operation
        offset: u64,
        /// Error returned by the submission call
        #[source]
        source: std::io::Error,
    },

    /// An issued operation reported an error when its result was retrieved
    #[error("{op} on slot {slot} at offset {offset} failed: {source}")]
    Completion {
        /// Slot the operation was issued on
        slot: usize,
        /// Read or write
        op: OpKind,
        /// File offset of the operation
        offset: u64,
        /// Error carried by the completion
        #[source]
        source: std::io::Error,
    },

    /// A write transferred some, but not all, of the requested bytes
    #[error("Short write on slot {slot} at offset {offset}: wrote {written} of {requested} bytes")]
    ShortWrite {
        /// Slot the write was issued on
        slot: usize,
        /// File offset of the write
        offset: u64,
        /// Bytes handed to the write
        requested: usize,
        /// Bytes the write reported
        written: usize,
    },

    /// The destination received fewer (or more) bytes than the source held
    #[error("Incomplete copy of '{path}': copied {copied} of {expected} bytes")]
    IncompleteCopy {
        /// Source file
        path: PathBuf,
        /// Source size when it was opened
        expected: u64,
        /// Bytes written to the destination
        copied: u64,
    },

    /// Waiting for completions failed
    #[error("Waiting for I/O completions failed: {0}")]
    Wait(#[source] std::io::Error),

    /// A slot was asked to move to a phase it cannot reach from its current one
    #[error("Invalid transition on slot {slot}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Slot index
        slot: usize,
        /// Current phase
        from: SlotPhase,
        /// Requested phase
        to: SlotPhase,
    },

    /// A result was requested from a slot with no completed operation
    #[error("Slot {slot} has no completed operation (phase {phase:?})")]
    NotOutstanding {
        /// Slot index
        slot: usize,
        /// Phase the slot was in
        phase: SlotPhase,
    },

    /// Slot index outside the pool
    #[error("Slot index {index} out of range (pool has {len} slots)")]
    InvalidSlot {
        /// Requested index
        index: usize,
        /// Pool size
        len: usize,
    },

    /// Active slots remain but nothing is in flight
    #[error("Pipeline stalled: {active} active slots with no operation in flight")]
    Stalled {
        /// Slots not yet retired
        active: usize,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Unsupported operation on this platform
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Report serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PipelineError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a submission failure
    pub fn submit(slot: usize, op: OpKind, offset: u64, source: std::io::Error) -> Self {
        Self::Submit {
            slot,
            op,
            offset,
            source,
        }
    }

    /// Create a completion failure
    pub fn completion(slot: usize, op: OpKind, offset: u64, source: std::io::Error) -> Self {
        Self::Completion {
            slot,
            op,
            offset,
            source,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Check if this error happened before any I/O was issued
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::SameSourceAndDestination(_)
                | Self::ArenaAllocation { .. }
                | Self::ConfigError(_)
                | Self::UnsupportedOperation(_)
        )
    }

    /// Get the slot associated with this error, if any
    pub fn slot(&self) -> Option<usize> {
        match self {
            Self::Submit { slot, .. }
            | Self::Completion { slot, .. }
            | Self::ShortWrite { slot, .. }
            | Self::InvalidTransition { slot, .. }
            | Self::NotOutstanding { slot, .. } => Some(*slot),
            Self::InvalidSlot { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Get the path associated with this error, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Io { path, .. }
            | Self::IncompleteCopy { path, .. }
            | Self::SameSourceAndDestination(path) => Some(path),
            _ => None,
        }
    }
}

/// Result type alias for slotcopy operations
pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| PipelineError::io(path, e))
    }
}
