//! File-level copier
//!
//! Opens the source and destination, builds a slot pool over the selected
//! backend and times one pipelined copy from the first read to the last
//! retirement.

use crate::config::CopyJobConfig;
use crate::core::{CompletionPoller, CopyJob, JobStats, PipelineDriver, SlotPool};
use crate::error::{IoResultExt, PipelineError, Result};
use crate::fs::open_backend;
use crate::progress::ProgressReporter;
use console::style;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Permission bits for a newly created destination
const DESTINATION_MODE: u32 = 0o644;

/// Outcome of one pipelined copy
#[derive(Debug, Clone, Serialize)]
pub struct CopyReport {
    /// Source file
    pub source: PathBuf,
    /// Destination file
    pub destination: PathBuf,
    /// Source size when it was opened
    pub source_size: u64,
    /// Bytes acknowledged by writes
    pub bytes_copied: u64,
    /// Time from the first read to the last retirement
    pub duration: Duration,
    /// Average throughput in bytes/second
    pub throughput: f64,
    /// Bytes per slot
    pub block_size: usize,
    /// Number of slots
    pub slots: usize,
    /// Backend that carried the I/O
    pub backend: String,
    /// Polling strategy actually used
    pub poll: String,
    /// Driver counters
    pub stats: JobStats,
}

impl CopyReport {
    /// Print the timing line and a short summary to stdout
    pub fn print_summary(&self) {
        println!(
            "{}",
            style(format!(
                "Copying was completed in {:.6} seconds",
                self.duration.as_secs_f64()
            ))
            .green()
        );
        println!("Bytes copied:    {}", humansize::format_size(self.bytes_copied, humansize::BINARY));
        println!(
            "Slots:           {} x {}",
            self.slots,
            humansize::format_size(self.block_size as u64, humansize::BINARY)
        );
        println!("Backend:         {} ({})", self.backend, self.poll);
        println!("Throughput:      {}/s", humansize::format_size(self.throughput as u64, humansize::BINARY));
        println!(
            "Operations:      {} reads, {} writes, {} idle polls",
            self.stats.reads_issued, self.stats.writes_issued, self.stats.idle_polls
        );
    }

    /// Render the report as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Copies one file through a slot pool
pub struct PipelinedCopier {
    config: CopyJobConfig,
    progress: Option<ProgressReporter>,
}

impl PipelinedCopier {
    /// Create a copier for `config`
    pub fn new(config: CopyJobConfig) -> Self {
        Self {
            config,
            progress: None,
        }
    }

    /// Set progress reporter
    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Job configuration
    pub fn config(&self) -> &CopyJobConfig {
        &self.config
    }

    /// Execute the copy
    pub fn execute(&self) -> Result<CopyReport> {
        let config = &self.config;
        config.validate()?;
        let settings = &config.settings;

        let source = File::open(&config.source).with_path(&config.source)?;
        let metadata = source.metadata().with_path(&config.source)?;
        if metadata.is_dir() {
            return Err(PipelineError::config(format!(
                "{} is a directory",
                config.source.display()
            )));
        }
        check_distinct(&metadata, &config.source, &config.destination)?;

        let destination = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(DESTINATION_MODE)
            .open(&config.destination)
            .with_path(&config.destination)?;

        let source_size = metadata.len();
        debug!(
            source = %config.source.display(),
            destination = %config.destination.display(),
            source_size,
            "files opened"
        );

        if let Some(progress) = &self.progress {
            progress.set_total_bytes(source_size);
            progress.set_status(&format!("Copying {}", config.source.display()));
        }

        let backend = open_backend(settings.backend, config.slots)?;
        let mut pool = SlotPool::new(backend, config.block_size, config.slots)?;
        let mut job = CopyJob::new(
            source.as_raw_fd(),
            destination.as_raw_fd(),
            config.block_size,
            config.slots,
        )
        .with_size_hint(settings.size_aware.then_some(source_size));
        let poller = CompletionPoller::new(settings.poll, settings.poll_timeout);

        let mut driver = PipelineDriver::new(&poller);
        if let Some(progress) = &self.progress {
            driver = driver.with_progress(progress);
        }

        let start = Instant::now();
        if let Err(e) = driver.run(&mut job, &mut pool) {
            if let Some(progress) = &self.progress {
                progress.finish_error(&e.to_string());
            }
            return Err(e);
        }
        if settings.fsync {
            destination.sync_all().with_path(&config.destination)?;
        }
        let duration = start.elapsed();

        let stats = job.stats().clone();
        if let Err(e) = check_complete(&config.source, source_size, stats.bytes_written) {
            if let Some(progress) = &self.progress {
                progress.finish_error(&e.to_string());
            }
            return Err(e);
        }
        if let Some(progress) = &self.progress {
            progress.finish_success("Copy complete");
        }

        let secs = duration.as_secs_f64();
        Ok(CopyReport {
            source: config.source.clone(),
            destination: config.destination.clone(),
            source_size,
            bytes_copied: stats.bytes_written,
            duration,
            throughput: if secs > 0.0 {
                stats.bytes_written as f64 / secs
            } else {
                0.0
            },
            block_size: config.block_size,
            slots: config.slots,
            backend: pool.backend_name().to_string(),
            poll: poller.effective_strategy(&pool).name().to_string(),
            stats,
        })
    }
}

/// Copy `source` to `destination` with `slots` slots of `block_size` bytes
/// and default settings
pub fn copy_file(
    source: impl AsRef<Path>,
    destination: impl AsRef<Path>,
    block_size: usize,
    slots: usize,
) -> Result<CopyReport> {
    let config = CopyJobConfig {
        block_size,
        slots,
        ..CopyJobConfig::new(source.as_ref(), destination.as_ref())
    };
    PipelinedCopier::new(config).execute()
}

/// Refuse to copy a file onto itself; truncating the destination would
/// destroy the source first.
fn check_distinct(source: &std::fs::Metadata, source_path: &Path, destination: &Path) -> Result<()> {
    match std::fs::metadata(destination) {
        Ok(dest) if dest.dev() == source.dev() && dest.ino() == source.ino() => Err(
            PipelineError::SameSourceAndDestination(source_path.to_path_buf()),
        ),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(destination, e)),
    }
}

/// A destination that did not receive exactly the bytes the source held at
/// open time is a failed copy, whether a read came back short or the source
/// changed underneath the job.
fn check_complete(source: &Path, expected: u64, copied: u64) -> Result<()> {
    if copied == expected {
        return Ok(());
    }
    Err(PipelineError::IncompleteCopy {
        path: source.to_path_buf(),
        expected,
        copied,
    })
}
