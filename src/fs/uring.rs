//! io_uring backend for Linux
//!
//! io_uring (Linux 5.1+) lets the driver submit reads and writes without a
//! syscall per completion test. Completions are reaped from the completion
//! queue into a per-slot table; the event wait uses `io_uring_enter` with an
//! explicit timeout (Linux 5.11+, `IORING_FEAT_EXT_ARG`). On older kernels
//! the backend still works but reports no event wait, so the poller falls
//! back to busy polling.

#[cfg(all(target_os = "linux", feature = "io_uring"))]
use crate::fs::backend::IoBackend;

/// Minimum kernel version required for io_uring (5.1.0)
pub const MIN_KERNEL_VERSION: (u32, u32, u32) = (5, 1, 0);

/// Kernel version that added timed waits on the completion queue (5.11)
pub const EXT_ARG_KERNEL_VERSION: (u32, u32, u32) = (5, 11, 0);

/// io_uring availability status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoUringStatus {
    /// io_uring is available, including timed completion waits
    Available,
    /// io_uring is available but only supports busy polling (kernel 5.1-5.10)
    LimitedFeatures,
    /// Kernel version is too old
    KernelTooOld,
    /// Not on Linux, or built without the io_uring feature
    NotLinux,
    /// io_uring probe failed (e.g. blocked by seccomp)
    ProbeFailed,
}

impl IoUringStatus {
    /// Check if io_uring can be used
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Available | Self::LimitedFeatures)
    }
}

/// Parsed kernel version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Patch level
    pub patch: u32,
}

impl KernelVersion {
    /// Parse kernel version from uname release string
    pub fn parse(release: &str) -> Option<Self> {
        let mut parts = release.split(|c: char| c == '.' || c == '-');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Some(Self { major, minor, patch })
    }

    /// Check if this version meets minimum requirements
    pub fn meets_minimum(&self, min: (u32, u32, u32)) -> bool {
        (self.major, self.minor, self.patch) >= min
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Get current kernel version (Linux only)
#[cfg(target_os = "linux")]
pub fn get_kernel_version() -> Option<KernelVersion> {
    // Format: "Linux version X.Y.Z-..."
    if let Ok(version_str) = std::fs::read_to_string("/proc/version") {
        if let Some(release) = version_str.split_whitespace().nth(2) {
            if let Some(version) = KernelVersion::parse(release) {
                return Some(version);
            }
        }
    }

    let output = std::process::Command::new("uname").arg("-r").output().ok()?;
    let release = String::from_utf8(output.stdout).ok()?;
    KernelVersion::parse(release.trim())
}

/// Kernel version of the running system
#[cfg(not(target_os = "linux"))]
pub fn get_kernel_version() -> Option<KernelVersion> {
    None
}

/// Check io_uring availability with detailed status
#[cfg(all(target_os = "linux", feature = "io_uring"))]
pub fn check_io_uring_support() -> IoUringStatus {
    let kernel_version = match get_kernel_version() {
        Some(v) => v,
        None => return IoUringStatus::ProbeFailed,
    };

    if !kernel_version.meets_minimum(MIN_KERNEL_VERSION) {
        return IoUringStatus::KernelTooOld;
    }

    // Creating a ring is the only reliable check: containers often block it.
    match io_uring::IoUring::new(8) {
        Ok(ring) if ring.params().is_feature_ext_arg() => IoUringStatus::Available,
        Ok(_) => IoUringStatus::LimitedFeatures,
        Err(_) => IoUringStatus::ProbeFailed,
    }
}

/// Check io_uring availability with detailed status
#[cfg(not(all(target_os = "linux", feature = "io_uring")))]
pub fn check_io_uring_support() -> IoUringStatus {
    IoUringStatus::NotLinux
}

/// io_uring backend: one submission per slot, completions keyed by slot index
#[cfg(all(target_os = "linux", feature = "io_uring"))]
pub struct IoUringBackend {
    ring: io_uring::IoUring,
    /// Reaped but not yet taken results, indexed by slot
    results: Vec<Option<i32>>,
    in_flight: Vec<bool>,
    /// Submitted operations whose CQE has not been reaped
    unreaped: usize,
    ext_arg: bool,
}

#[cfg(all(target_os = "linux", feature = "io_uring"))]
impl IoUringBackend {
    /// Create a ring with room for one operation per slot
    pub fn new(slots: usize) -> std::io::Result<Self> {
        let entries = u32::try_from(slots.max(1)).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "too many slots for io_uring")
        })?;
        let ring = io_uring::IoUring::new(entries)?;
        let ext_arg = ring.params().is_feature_ext_arg();

        Ok(Self {
            ring,
            results: vec![None; slots],
            in_flight: vec![false; slots],
            unreaped: 0,
            ext_arg,
        })
    }

    fn push(&mut self, slot: usize, entry: io_uring::squeue::Entry) -> std::io::Result<()> {
        if self.in_flight[slot] {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("slot {} already has an operation in flight", slot),
            ));
        }

        // SAFETY: the caller of submit_read/submit_write guarantees the
        // buffer referenced by `entry` outlives the operation.
        unsafe { self.ring.submission().push(&entry) }.map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::Other, "io_uring submission queue full")
        })?;
        // Counted before submitting: a queued entry that fails to submit now
        // is still submitted, and waited for, on drop.
        self.results[slot] = None;
        self.unreaped += 1;

        loop {
            match self.ring.submit() {
                Ok(_) => break,
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }

        self.in_flight[slot] = true;
        Ok(())
    }

    fn reap(&mut self) {
        for cqe in self.ring.completion() {
            let slot = cqe.user_data() as usize;
            self.results[slot] = Some(cqe.result());
            self.unreaped -= 1;
        }
    }

    fn length(len: usize) -> std::io::Result<u32> {
        u32::try_from(len).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "block too large for io_uring")
        })
    }
}

#[cfg(all(target_os = "linux", feature = "io_uring"))]
impl IoBackend for IoUringBackend {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn capacity(&self) -> usize {
        self.in_flight.len()
    }

    unsafe fn submit_read(
        &mut self,
        slot: usize,
        fd: std::os::unix::io::RawFd,
        offset: u64,
        buf: *mut u8,
        len: usize,
    ) -> std::io::Result<()> {
        use io_uring::{opcode, types};

        let entry = opcode::Read::new(types::Fd(fd), buf, Self::length(len)?)
            .offset(offset)
            .build()
            .user_data(slot as u64);
        self.push(slot, entry)
    }

    unsafe fn submit_write(
        &mut self,
        slot: usize,
        fd: std::os::unix::io::RawFd,
        offset: u64,
        buf: *const u8,
        len: usize,
    ) -> std::io::Result<()> {
        use io_uring::{opcode, types};

        let entry = opcode::Write::new(types::Fd(fd), buf, Self::length(len)?)
            .offset(offset)
            .build()
            .user_data(slot as u64);
        self.push(slot, entry)
    }

    fn is_complete(&mut self, slot: usize) -> bool {
        self.reap();
        self.in_flight[slot] && self.results[slot].is_some()
    }

    fn supports_event_wait(&self) -> bool {
        self.ext_arg
    }

    fn wait_any(&mut self, pending: &[usize], timeout: std::time::Duration) -> std::io::Result<()> {
        use io_uring::types;

        self.reap();
        if pending.iter().any(|&slot| self.results[slot].is_some()) || self.unreaped == 0 {
            return Ok(());
        }

        if !self.ext_arg {
            std::thread::sleep(timeout);
            return Ok(());
        }

        let ts = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&ts);
        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => Ok(()),
            Err(ref e) if matches!(e.raw_os_error(), Some(libc::ETIME) | Some(libc::EINTR)) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn take_result(&mut self, slot: usize) -> std::io::Result<usize> {
        self.reap();
        if !self.in_flight[slot] {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("no operation in flight on slot {}", slot),
            ));
        }

        let result = self.results[slot].take().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!("operation on slot {} still in progress", slot),
            )
        })?;
        self.in_flight[slot] = false;

        if result < 0 {
            return Err(std::io::Error::from_raw_os_error(-result));
        }
        Ok(result as usize)
    }
}

#[cfg(all(target_os = "linux", feature = "io_uring"))]
impl Drop for IoUringBackend {
    fn drop(&mut self) {
        // The kernel may still be writing into slot buffers.
        while self.unreaped > 0 {
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(_) => std::process::abort(),
            }
            self.reap();
        }
    }
}

/// Print io_uring status information
pub fn print_io_uring_status() {
    let status = check_io_uring_support();

    println!("io_uring Status:");

    if let Some(version) = get_kernel_version() {
        println!("  Kernel Version: {}", version);
        println!(
            "  Minimum Required: {}.{}.{}",
            MIN_KERNEL_VERSION.0, MIN_KERNEL_VERSION.1, MIN_KERNEL_VERSION.2
        );
        println!(
            "  Timed waits from: {}.{}.{}",
            EXT_ARG_KERNEL_VERSION.0, EXT_ARG_KERNEL_VERSION.1, EXT_ARG_KERNEL_VERSION.2
        );
    }

    println!("  Status: {:?}", status);
    println!("  Usable: {}", status.is_usable());
}
