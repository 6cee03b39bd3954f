//! Configuration settings for slotcopy
//!
//! Defines the CLI arguments, the job configuration they resolve to, and the
//! defaults for a pipelined copy.

use crate::core::{PollStrategy, DEFAULT_POLL_TIMEOUT, MAX_BLOCK_SIZE, MAX_SLOTS};
use crate::error::{PipelineError, Result};
use crate::sweep::DEFAULT_OPERATION_COUNTS;
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default size of each slot's buffer
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default number of slots
pub const DEFAULT_SLOTS: usize = 8;

/// slotcopy - pipelined asynchronous file copy
#[derive(Parser, Debug, Clone)]
#[command(name = "slotcopy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Copy a file through a ring of concurrent asynchronous read/write slots")]
#[command(long_about = r#"
slotcopy copies one file by keeping several fixed-size blocks in flight at
once. Each slot reads a block, writes it back at the same offset, then claims
the next unread block, until the source is exhausted.

Examples:
  slotcopy in.bin out.bin                        # 8 slots of 64 KiB
  slotcopy in.bin out.bin -b 1M -n 16            # 16 slots of 1 MiB
  slotcopy in.bin out.bin --block-size-kb 128    # block size in KB
  slotcopy in.bin out.bin --backend aio --poll busy
  slotcopy bench in.bin out.bin --block-size-kb 64
  slotcopy backends
"#)]
pub struct CliArgs {
    /// Source file
    #[arg(value_name = "SOURCE")]
    pub source: Option<PathBuf>,

    /// Destination file (created or truncated)
    #[arg(value_name = "DESTINATION")]
    pub destination: Option<PathBuf>,

    /// Block size per slot (e.g., 64K, 1M)
    #[arg(short = 'b', long, default_value = "64K", value_name = "SIZE")]
    pub block_size: String,

    /// Block size per slot in kilobytes (overrides --block-size)
    #[arg(long, value_name = "KB", conflicts_with = "block_size")]
    pub block_size_kb: Option<u64>,

    /// Number of concurrent operations (slots), 1 to 64
    #[arg(short = 'n', long, default_value_t = DEFAULT_SLOTS, value_name = "NUM")]
    pub ops: usize,

    /// Asynchronous I/O backend
    #[arg(long, value_enum, default_value = "auto", global = true)]
    pub backend: BackendKind,

    /// How to wait for completions
    #[arg(long, value_enum, default_value = "event", global = true)]
    pub poll: PollMode,

    /// Sleep between busy-poll passes (e.g., 1ms, 200us)
    #[arg(long, default_value = "1ms", value_name = "DURATION", global = true)]
    pub poll_interval: String,

    /// Upper bound on a single wait for completions
    #[arg(long, default_value = "100ms", value_name = "DURATION", global = true)]
    pub poll_timeout: String,

    /// Stop issuing reads past the source size known at open time
    #[arg(long, global = true)]
    pub size_aware: bool,

    /// Flush the destination to stable storage before reporting completion
    #[arg(long, global = true)]
    pub fsync: bool,

    /// Show a progress bar
    #[arg(short = 'p', long)]
    pub progress: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Output format for reports
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub output_format: OutputFormat,

    /// Log line format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Time copies across block sizes and slot counts and write a CSV table
    Bench {
        /// Source file
        #[arg(value_name = "SOURCE")]
        source: PathBuf,

        /// Scratch destination file, overwritten by every run
        #[arg(value_name = "DESTINATION")]
        destination: PathBuf,

        /// Base block size in kilobytes
        #[arg(long, default_value_t = 64, value_name = "KB")]
        block_size_kb: u64,

        /// Slot counts to measure
        #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_OPERATION_COUNTS, value_name = "LIST")]
        ops: Vec<usize>,

        /// Block sizes measured are 1..=MULTIPLES times the base
        #[arg(long, default_value_t = 8, value_name = "NUM")]
        multiples: usize,

        /// CSV output path
        #[arg(long, default_value = "execution_times.csv", value_name = "PATH")]
        csv: PathBuf,
    },

    /// Report which asynchronous I/O backends this host supports
    Backends,
}

/// Asynchronous I/O backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// io_uring when usable, POSIX AIO otherwise
    #[default]
    Auto,
    /// POSIX asynchronous I/O (aio_read/aio_write)
    Aio,
    /// Linux io_uring
    Uring,
}

/// Completion waiting mode on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollMode {
    /// Block on the backend's completion wait
    #[default]
    Event,
    /// Test every slot and sleep between passes
    Busy,
}

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON
    Json,
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Settings shared by every copy in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Asynchronous I/O backend
    pub backend: BackendKind,
    /// How to wait for completions
    pub poll: PollStrategy,
    /// Upper bound on a single wait
    pub poll_timeout: Duration,
    /// Gate reads on the source size known at open time
    pub size_aware: bool,
    /// fsync the destination before reporting completion
    pub fsync: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            poll: PollStrategy::EventWait,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            size_aware: false,
            fsync: false,
        }
    }
}

impl PipelineSettings {
    /// Resolve the settings from parsed arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        let poll = match args.poll {
            PollMode::Event => PollStrategy::EventWait,
            PollMode::Busy => PollStrategy::BusyPoll {
                interval: parse_duration(&args.poll_interval)
                    .map_err(|e| PipelineError::config(format!("Invalid poll interval: {}", e)))?,
            },
        };
        let poll_timeout = parse_duration(&args.poll_timeout)
            .map_err(|e| PipelineError::config(format!("Invalid poll timeout: {}", e)))?;

        Ok(Self {
            backend: args.backend,
            poll,
            poll_timeout,
            size_aware: args.size_aware,
            fsync: args.fsync,
        })
    }

    /// Check the settings for values the poller cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout.is_zero() {
            return Err(PipelineError::config("poll timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Everything needed to copy one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyJobConfig {
    /// Source file
    pub source: PathBuf,
    /// Destination file
    pub destination: PathBuf,
    /// Bytes per slot
    pub block_size: usize,
    /// Number of slots
    pub slots: usize,
    /// Shared pipeline settings
    #[serde(flatten)]
    pub settings: PipelineSettings,
}

impl Default for CopyJobConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            destination: PathBuf::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            slots: DEFAULT_SLOTS,
            settings: PipelineSettings::default(),
        }
    }
}

impl CopyJobConfig {
    /// Create a config for `source` to `destination` with default settings
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    /// Create config from CLI arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        let source = args
            .source
            .clone()
            .ok_or_else(|| PipelineError::config("Source path is required"))?;
        let destination = args
            .destination
            .clone()
            .ok_or_else(|| PipelineError::config("Destination path is required"))?;

        let block_size = match args.block_size_kb {
            Some(kb) => kb.saturating_mul(1024),
            None => parse_size(&args.block_size)
                .map_err(|e| PipelineError::config(format!("Invalid block size: {}", e)))?,
        };
        let block_size = usize::try_from(block_size)
            .map_err(|_| PipelineError::config(format!("Block size {} is too large", block_size)))?;

        let config = Self {
            source,
            destination,
            block_size,
            slots: args.ops,
            settings: PipelineSettings::from_cli(args)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check paths and geometry
    pub fn validate(&self) -> Result<()> {
        if self.source.as_os_str().is_empty() {
            return Err(PipelineError::config("Source path is required"));
        }
        if self.destination.as_os_str().is_empty() {
            return Err(PipelineError::config("Destination path is required"));
        }
        if self.block_size == 0 {
            return Err(PipelineError::config("block size must be greater than zero"));
        }
        if self.block_size > MAX_BLOCK_SIZE {
            return Err(PipelineError::config(format!(
                "block size {} exceeds the {} byte per-operation limit",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }
        if self.slots == 0 || self.slots > MAX_SLOTS {
            return Err(PipelineError::config(format!(
                "number of operations must be between 1 and {}, got {}",
                MAX_SLOTS, self.slots
            )));
        }
        self.settings.validate()
    }
}

/// Parse human-readable size (e.g., "1M", "64K", "1.5G")
pub fn parse_size(size: &str) -> std::result::Result<u64, String> {
    let size = size.trim().to_uppercase();

    if size.is_empty() {
        return Err("Empty size string".to_string());
    }

    let (num_str, multiplier) = if size.ends_with("GB") || size.ends_with('G') {
        (size.trim_end_matches(|c| c == 'G' || c == 'B'), 1024u64 * 1024 * 1024)
    } else if size.ends_with("MB") || size.ends_with('M') {
        (size.trim_end_matches(|c| c == 'M' || c == 'B'), 1024u64 * 1024)
    } else if size.ends_with("KB") || size.ends_with('K') {
        (size.trim_end_matches(|c| c == 'K' || c == 'B'), 1024u64)
    } else if size.ends_with('B') {
        (size.trim_end_matches('B'), 1u64)
    } else {
        (size.as_str(), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: {}", num_str))?;
    if num < 0.0 {
        return Err(format!("Negative size: {}", num_str));
    }

    Ok((num * multiplier as f64) as u64)
}

/// Parse human-readable duration (e.g., "1ms", "250us", "2s")
pub fn parse_duration(duration: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(duration.trim()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("1KB").unwrap(), 1024);
        assert_eq!(parse_size("1m").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("1.5M").unwrap(), 1536 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("-4K").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1ms").unwrap(), Duration::from_millis(1));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_defaults_from_cli() {
        let args = CliArgs::parse_from(["slotcopy", "a.bin", "b.bin"]);
        let config = CopyJobConfig::from_cli(&args).unwrap();
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.slots, DEFAULT_SLOTS);
        assert_eq!(config.settings, PipelineSettings::default());
    }

    #[test]
    fn test_block_size_in_kb() {
        let args = CliArgs::parse_from(["slotcopy", "a", "b", "--block-size-kb", "128", "-n", "4"]);
        let config = CopyJobConfig::from_cli(&args).unwrap();
        assert_eq!(config.block_size, 128 * 1024);
        assert_eq!(config.slots, 4);
    }

    #[test]
    fn test_busy_poll_settings() {
        let args = CliArgs::parse_from([
            "slotcopy",
            "a",
            "b",
            "--poll",
            "busy",
            "--poll-interval",
            "500us",
            "--backend",
            "aio",
        ]);
        let config = CopyJobConfig::from_cli(&args).unwrap();
        assert_eq!(config.settings.backend, BackendKind::Aio);
        assert_eq!(
            config.settings.poll,
            PollStrategy::BusyPoll {
                interval: Duration::from_micros(500)
            }
        );
    }

    #[test]
    fn test_rejects_bad_geometry() {
        for ops in ["0", "65"] {
            let args = CliArgs::parse_from(["slotcopy", "a", "b", "-n", ops]);
            assert!(CopyJobConfig::from_cli(&args).is_err());
        }
        let args = CliArgs::parse_from(["slotcopy", "a", "b", "-b", "0"]);
        assert!(CopyJobConfig::from_cli(&args).is_err());
        let args = CliArgs::parse_from(["slotcopy", "a", "b", "-b", "2G"]);
        assert!(matches!(
            CopyJobConfig::from_cli(&args),
            Err(PipelineError::ConfigError(_))
        ));
        let args = CliArgs::parse_from(["slotcopy", "a"]);
        assert!(CopyJobConfig::from_cli(&args).is_err());
        let args = CliArgs::parse_from(["slotcopy", "a", "b", "--poll-timeout", "0s"]);
        assert!(CopyJobConfig::from_cli(&args).is_err());
    }

    #[test]
    fn test_block_size_limit() {
        let mut config = CopyJobConfig::new("a", "b");
        config.block_size = MAX_BLOCK_SIZE;
        assert!(config.validate().is_ok());
        config.block_size = MAX_BLOCK_SIZE + 8192;
        assert!(matches!(config.validate(), Err(PipelineError::ConfigError(_))));
    }

    #[test]
    fn test_bench_subcommand() {
        let args = CliArgs::parse_from(["slotcopy", "bench", "in", "out", "--ops", "1,4", "--multiples", "2"]);
        match args.command {
            Some(Commands::Bench {
                ops,
                multiples,
                block_size_kb,
                csv,
                ..
            }) => {
                assert_eq!(ops, vec![1, 4]);
                assert_eq!(multiples, 2);
                assert_eq!(block_size_kb, 64);
                assert_eq!(csv, PathBuf::from("execution_times.csv"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_config_serializes() {
        let config = CopyJobConfig::new("in", "out");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"backend\":\"auto\""));
        let back: CopyJobConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
