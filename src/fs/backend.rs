//! Asynchronous I/O backend abstraction
//!
//! A backend owns one control block per slot and knows how to submit
//! positional reads and writes, test for completion, wait for any of a set
//! of operations, and hand back results. The slot pool drives it; nothing
//! else touches the control blocks.

use crate::config::BackendKind;
use crate::error::{PipelineError, Result};
use crate::fs::aio::PosixAioBackend;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Submission and completion interface to the operating system's async I/O
///
/// At most one operation is in flight per slot. Results are retrieved with
/// [`take_result`](IoBackend::take_result) exactly once per operation.
pub trait IoBackend {
    /// Human-readable backend name
    fn name(&self) -> &'static str;

    /// Number of slots this backend has control blocks for
    fn capacity(&self) -> usize;

    /// Submit a positional read of `len` bytes from `fd` at `offset` into `buf`.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for writes of `len` bytes and must not be read or
    /// written by anyone else until the result has been taken or the backend
    /// has been dropped.
    unsafe fn submit_read(
        &mut self,
        slot: usize,
        fd: RawFd,
        offset: u64,
        buf: *mut u8,
        len: usize,
    ) -> io::Result<()>;

    /// Submit a positional write of `len` bytes from `buf` to `fd` at `offset`.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for reads of `len` bytes and must not be written
    /// by anyone else until the result has been taken or the backend has
    /// been dropped.
    unsafe fn submit_write(
        &mut self,
        slot: usize,
        fd: RawFd,
        offset: u64,
        buf: *const u8,
        len: usize,
    ) -> io::Result<()>;

    /// Non-blocking test: has the operation on `slot` finished?
    ///
    /// A finished operation may still have failed; the failure surfaces from
    /// [`take_result`](IoBackend::take_result).
    fn is_complete(&mut self, slot: usize) -> bool;

    /// Whether [`wait_any`](IoBackend::wait_any) blocks on a kernel primitive
    fn supports_event_wait(&self) -> bool {
        false
    }

    /// Block until any operation in `pending` finishes or `timeout` elapses.
    ///
    /// Returning because the timeout elapsed is not an error.
    fn wait_any(&mut self, pending: &[usize], timeout: Duration) -> io::Result<()>;

    /// Retrieve the byte count of the finished operation on `slot`.
    fn take_result(&mut self, slot: usize) -> io::Result<usize>;
}

impl<B: IoBackend + ?Sized> IoBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn capacity(&self) -> usize {
        (**self).capacity()
    }

    unsafe fn submit_read(
        &mut self,
        slot: usize,
        fd: RawFd,
        offset: u64,
        buf: *mut u8,
        len: usize,
    ) -> io::Result<()> {
        (**self).submit_read(slot, fd, offset, buf, len)
    }

    unsafe fn submit_write(
        &mut self,
        slot: usize,
        fd: RawFd,
        offset: u64,
        buf: *const u8,
        len: usize,
    ) -> io::Result<()> {
        (**self).submit_write(slot, fd, offset, buf, len)
    }

    fn is_complete(&mut self, slot: usize) -> bool {
        (**self).is_complete(slot)
    }

    fn supports_event_wait(&self) -> bool {
        (**self).supports_event_wait()
    }

    fn wait_any(&mut self, pending: &[usize], timeout: Duration) -> io::Result<()> {
        (**self).wait_any(pending, timeout)
    }

    fn take_result(&mut self, slot: usize) -> io::Result<usize> {
        (**self).take_result(slot)
    }
}

/// Open the backend selected by `kind` with control blocks for `slots` slots.
///
/// [`BackendKind::Auto`] prefers io_uring and falls back to POSIX AIO when
/// the ring cannot be created.
pub fn open_backend(kind: BackendKind, slots: usize) -> Result<Box<dyn IoBackend>> {
    match kind {
        BackendKind::Aio => Ok(Box::new(PosixAioBackend::new(slots))),
        BackendKind::Uring => open_uring(slots),
        BackendKind::Auto => match open_uring(slots) {
            Ok(backend) => Ok(backend),
            Err(e) => {
                tracing::debug!("io_uring unavailable ({}), using POSIX AIO", e);
                Ok(Box::new(PosixAioBackend::new(slots)))
            }
        },
    }
}

#[cfg(all(target_os = "linux", feature = "io_uring"))]
fn open_uring(slots: usize) -> Result<Box<dyn IoBackend>> {
    use crate::fs::uring::{check_io_uring_support, IoUringBackend};

    let status = check_io_uring_support();
    if !status.is_usable() {
        return Err(PipelineError::UnsupportedOperation(format!(
            "io_uring not available: {:?}",
            status
        )));
    }

    let backend = IoUringBackend::new(slots).map_err(|e| {
        PipelineError::UnsupportedOperation(format!("failed to create io_uring: {}", e))
    })?;
    Ok(Box::new(backend))
}

#[cfg(not(all(target_os = "linux", feature = "io_uring")))]
fn open_uring(_slots: usize) -> Result<Box<dyn IoBackend>> {
    Err(PipelineError::UnsupportedOperation(
        "io_uring is only available on Linux with the io_uring feature enabled".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aio_backend_always_opens() {
        let backend = open_backend(BackendKind::Aio, 4).unwrap();
        assert_eq!(backend.name(), "posix-aio");
        assert_eq!(backend.capacity(), 4);
    }

    #[test]
    fn test_auto_backend_opens_something() {
        let backend = open_backend(BackendKind::Auto, 2).unwrap();
        assert!(matches!(backend.name(), "posix-aio" | "io_uring"));
        assert_eq!(backend.capacity(), 2);
    }
}
