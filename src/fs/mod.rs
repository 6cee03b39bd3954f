//! Asynchronous I/O backends
//!
//! The pipeline submits positioned reads and writes through [`IoBackend`].
//! POSIX AIO works on every Unix; io_uring is used on Linux when the kernel
//! allows it; the in-memory backend gives tests reproducible out-of-order
//! completions.

mod aio;
mod backend;
mod memory;
pub mod uring;

pub use aio::PosixAioBackend;
pub use backend::{open_backend, IoBackend};
pub use memory::{MemoryBackend, OpRecord};
pub use uring::{check_io_uring_support, print_io_uring_status, IoUringStatus};
#[cfg(all(target_os = "linux", feature = "io_uring"))]
pub use uring::IoUringBackend;
