//! # slotcopy - Pipelined Asynchronous File Copy
//!
//! slotcopy copies a file through a fixed ring of slots. Each slot owns a
//! private region of one shared buffer and cycles through read, write and
//! read again, so up to N block transfers are in flight at any moment and
//! completions may arrive in any order.
//!
//! ## Components
//!
//! - **Slot Pool** ([`core::SlotPool`]): N slots over one arena, with the
//!   per-slot phase machine `Idle -> Reading <-> Writing -> Retired`
//! - **Completion Poller** ([`core::CompletionPoller`]): event wait or busy
//!   polling, bounded by a timeout
//! - **Pipeline Driver** ([`core::PipelineDriver`]): turns completed reads
//!   into writes and completed writes into reads of the next block
//! - **Backends** ([`fs`]): POSIX AIO, Linux io_uring, and an in-memory
//!   backend with reproducible out-of-order completions
//!
//! ## Quick Start
//!
//! ```no_run
//! use slotcopy::core::copy_file;
//!
//! // 8 slots of 64 KiB
//! let report = copy_file("/data/input.bin", "/data/output.bin", 64 * 1024, 8).unwrap();
//! report.print_summary();
//! ```
//!
//! ## Advanced Usage
//!
//! ```no_run
//! use slotcopy::config::{BackendKind, CopyJobConfig};
//! use slotcopy::core::{PipelinedCopier, PollStrategy};
//! use slotcopy::progress::ProgressReporter;
//! use std::time::Duration;
//!
//! let mut config = CopyJobConfig::new("/data/input.bin", "/data/output.bin");
//! config.block_size = 1024 * 1024;
//! config.slots = 16;
//! config.settings.backend = BackendKind::Aio;
//! config.settings.poll = PollStrategy::BusyPoll { interval: Duration::from_micros(200) };
//!
//! let report = PipelinedCopier::new(config)
//!     .with_progress(ProgressReporter::new())
//!     .execute()
//!     .unwrap();
//! println!("{} bytes in {:?}", report.bytes_copied, report.duration);
//! ```
//!
//! ## Driving a Pool Directly
//!
//! ```
//! use slotcopy::core::{CompletionPoller, CopyJob, PipelineDriver, SlotPool};
//! use slotcopy::fs::MemoryBackend;
//!
//! let data = b"hello, pipelined world".to_vec();
//! let backend = MemoryBackend::new(4, 7)
//!     .with_file(3, data.clone())
//!     .with_file(4, Vec::new());
//! let mut pool = SlotPool::new(backend, 5, 4).unwrap();
//! let mut job = CopyJob::new(3, 4, 5, 4);
//!
//! let poller = CompletionPoller::default();
//! PipelineDriver::new(&poller).run(&mut job, &mut pool).unwrap();
//! assert_eq!(pool.backend().file(4).unwrap(), &data[..]);
//! ```

#![cfg(unix)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod error;
pub mod fs;
pub mod progress;
pub mod sweep;

// Re-export commonly used types
pub use config::{BackendKind, CopyJobConfig};
pub use core::{copy_file, CopyReport, PipelinedCopier};
pub use error::{PipelineError, Result};
pub use progress::ProgressReporter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use slotcopy::prelude::*;
    //! ```

    pub use crate::config::{BackendKind, CopyJobConfig, PipelineSettings};
    pub use crate::core::{
        copy_file, CompletionPoller, CopyJob, CopyReport, PipelineDriver, PipelinedCopier,
        PollStrategy, SlotPool,
    };
    pub use crate::error::{PipelineError, Result};
    pub use crate::fs::{open_backend, IoBackend, MemoryBackend, PosixAioBackend};
    pub use crate::progress::ProgressReporter;
    pub use crate::sweep::{run_sweep, SweepConfig, SweepResult};
}
