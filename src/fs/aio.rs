//! POSIX AIO backend
//!
//! Uses `aio_read`/`aio_write` for submission, `aio_error` as the
//! non-blocking completion test and `aio_suspend` as the event wait.
//! One `aiocb` per slot lives in a boxed slice that is never reallocated,
//! so the kernel (or the libc helper threads) always sees a stable address.

use crate::fs::backend::IoBackend;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Asynchronous I/O through the POSIX `aio_*` interface
pub struct PosixAioBackend {
    blocks: Box<[libc::aiocb]>,
    in_flight: Vec<bool>,
}

impl PosixAioBackend {
    /// Create a backend with one control block per slot
    pub fn new(slots: usize) -> Self {
        let blocks = (0..slots)
            // SAFETY: aiocb is a plain C struct for which all-zero is a valid value.
            .map(|_| unsafe { std::mem::zeroed::<libc::aiocb>() })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            blocks,
            in_flight: vec![false; slots],
        }
    }

    /// Number of operations currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.iter().filter(|&&busy| busy).count()
    }

    fn prepare(
        &mut self,
        slot: usize,
        fd: RawFd,
        offset: u64,
        buf: *mut libc::c_void,
        len: usize,
    ) -> io::Result<&mut libc::aiocb> {
        if self.in_flight[slot] {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("slot {} already has an operation in flight", slot),
            ));
        }
        let offset = libc::off_t::try_from(offset).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "file offset out of range")
        })?;

        let cb = &mut self.blocks[slot];
        // SAFETY: see `new`; the previous operation on this block was reaped.
        *cb = unsafe { std::mem::zeroed() };
        cb.aio_fildes = fd;
        cb.aio_offset = offset;
        cb.aio_buf = buf;
        cb.aio_nbytes = len;
        cb.aio_sigevent.sigev_notify = libc::SIGEV_NONE;
        Ok(cb)
    }

    fn status(&self, slot: usize) -> libc::c_int {
        // SAFETY: the control block was submitted and has not been reaped yet.
        unsafe { libc::aio_error(&self.blocks[slot]) }
    }
}

impl IoBackend for PosixAioBackend {
    fn name(&self) -> &'static str {
        "posix-aio"
    }

    fn capacity(&self) -> usize {
        self.blocks.len()
    }

    unsafe fn submit_read(
        &mut self,
        slot: usize,
        fd: RawFd,
        offset: u64,
        buf: *mut u8,
        len: usize,
    ) -> io::Result<()> {
        let cb = self.prepare(slot, fd, offset, buf.cast(), len)?;
        if libc::aio_read(cb) == -1 {
            return Err(io::Error::last_os_error());
        }
        self.in_flight[slot] = true;
        Ok(())
    }

    unsafe fn submit_write(
        &mut self,
        slot: usize,
        fd: RawFd,
        offset: u64,
        buf: *const u8,
        len: usize,
    ) -> io::Result<()> {
        let cb = self.prepare(slot, fd, offset, buf as *mut libc::c_void, len)?;
        if libc::aio_write(cb) == -1 {
            return Err(io::Error::last_os_error());
        }
        self.in_flight[slot] = true;
        Ok(())
    }

    fn is_complete(&mut self, slot: usize) -> bool {
        self.in_flight[slot] && self.status(slot) != libc::EINPROGRESS
    }

    fn supports_event_wait(&self) -> bool {
        true
    }

    fn wait_any(&mut self, pending: &[usize], timeout: Duration) -> io::Result<()> {
        let list: Vec<*const libc::aiocb> = pending
            .iter()
            .filter(|&&slot| self.in_flight[slot])
            .map(|&slot| &self.blocks[slot] as *const libc::aiocb)
            .collect();
        if list.is_empty() {
            return Ok(());
        }

        // SAFETY: timespec is a plain C struct.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = timeout.as_secs() as libc::time_t;
        ts.tv_nsec = timeout.subsec_nanos() as _;

        // SAFETY: every pointer in `list` refers to a submitted control block
        // owned by `self.blocks`, which outlives the call.
        let rc = unsafe { libc::aio_suspend(list.as_ptr(), list.len() as libc::c_int, &ts) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(()),
                _ => Err(err),
            };
        }
        Ok(())
    }

    fn take_result(&mut self, slot: usize) -> io::Result<usize> {
        if !self.in_flight[slot] {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("no operation in flight on slot {}", slot),
            ));
        }

        let status = self.status(slot);
        if status == libc::EINPROGRESS {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("operation on slot {} still in progress", slot),
            ));
        }

        // SAFETY: the operation has finished; aio_return reaps it exactly once.
        let ret = unsafe { libc::aio_return(&mut self.blocks[slot]) };
        self.in_flight[slot] = false;

        if ret < 0 {
            return Err(if status > 0 {
                io::Error::from_raw_os_error(status)
            } else {
                io::Error::last_os_error()
            });
        }
        Ok(ret as usize)
    }
}

impl Drop for PosixAioBackend {
    fn drop(&mut self) {
        // Buffers handed to aio_read/aio_write must stay alive until the
        // operations finish, so reap everything still outstanding.
        for slot in 0..self.blocks.len() {
            if !self.in_flight[slot] {
                continue;
            }
            while self.status(slot) == libc::EINPROGRESS {
                let list = [&self.blocks[slot] as *const libc::aiocb];
                // SAFETY: the block is submitted and owned by self.
                unsafe {
                    libc::aio_suspend(list.as_ptr(), 1, std::ptr::null());
                }
            }
            // SAFETY: finished and not yet reaped.
            unsafe {
                libc::aio_return(&mut self.blocks[slot]);
            }
            self.in_flight[slot] = false;
        }
    }
}
