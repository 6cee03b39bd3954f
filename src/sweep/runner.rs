//! Sweep runner and result table

use crate::config::{CopyJobConfig, PipelineSettings};
use crate::core::{PipelinedCopier, MAX_BLOCK_SIZE, MAX_SLOTS};
use crate::error::{IoResultExt, PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Slot counts measured when none are given
pub const DEFAULT_OPERATION_COUNTS: [usize; 8] = [1, 2, 4, 8, 12, 16, 32, 64];

/// Block size multiples measured when none are given
pub const DEFAULT_MULTIPLES: usize = 8;

/// Grid to measure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Source file copied by every run
    pub source: PathBuf,
    /// Scratch destination, truncated by every run
    pub destination: PathBuf,
    /// Base block size in KB
    pub base_block_kb: u64,
    /// Block sizes are `base * 1 ..= base * multiples`
    pub multiples: usize,
    /// Slot counts, one column each
    pub op_counts: Vec<usize>,
    /// Settings shared by every run
    pub settings: PipelineSettings,
}

impl SweepConfig {
    /// Create a sweep with the default grid
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, base_block_kb: u64) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            base_block_kb,
            multiples: DEFAULT_MULTIPLES,
            op_counts: DEFAULT_OPERATION_COUNTS.to_vec(),
            settings: PipelineSettings::default(),
        }
    }

    /// Block sizes measured, in KB
    pub fn block_sizes_kb(&self) -> Vec<u64> {
        (1..=self.multiples as u64)
            .map(|m| self.base_block_kb * m)
            .collect()
    }

    /// Check the grid
    pub fn validate(&self) -> Result<()> {
        if self.base_block_kb == 0 {
            return Err(PipelineError::config("base block size must be greater than zero"));
        }
        if self.multiples == 0 {
            return Err(PipelineError::config("at least one block size multiple is required"));
        }
        if self.op_counts.is_empty() {
            return Err(PipelineError::config("at least one operation count is required"));
        }
        let largest = self
            .base_block_kb
            .checked_mul(self.multiples as u64)
            .and_then(|kb| kb.checked_mul(1024));
        if !matches!(largest, Some(bytes) if bytes <= MAX_BLOCK_SIZE as u64) {
            return Err(PipelineError::config(format!(
                "largest block of {} x {} KB exceeds the {} byte per-operation limit",
                self.multiples, self.base_block_kb, MAX_BLOCK_SIZE
            )));
        }
        if let Some(&bad) = self.op_counts.iter().find(|&&n| n == 0 || n > MAX_SLOTS) {
            return Err(PipelineError::config(format!(
                "operation count {} outside 1..={}",
                bad, MAX_SLOTS
            )));
        }
        self.settings.validate()
    }
}

/// Measured seconds per block size (rows) and slot count (columns)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResult {
    /// Row labels in KB
    pub block_sizes_kb: Vec<u64>,
    /// Column labels
    pub op_counts: Vec<usize>,
    /// `seconds[row][column]`
    pub seconds: Vec<Vec<f64>>,
}

impl SweepResult {
    /// Header line, e.g. `BlockSize(KB), 1 Op, 2 Ops`
    pub fn csv_header(&self) -> String {
        let mut header = String::from("BlockSize(KB)");
        for &ops in &self.op_counts {
            header.push_str(&format!(", {} {}", ops, if ops == 1 { "Op" } else { "Ops" }));
        }
        header
    }

    /// Write the table as CSV, six decimal places per cell
    pub fn write_csv<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        writeln!(out, "{}", self.csv_header())?;
        for (kb, row) in self.block_sizes_kb.iter().zip(&self.seconds) {
            write!(out, "{}", kb)?;
            for secs in row {
                write!(out, ", {:.6}", secs)?;
            }
            writeln!(out)?;
        }
        out.flush()
    }

    /// Write the CSV table to `path`
    pub fn save_csv(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_path(path)?;
        self.write_csv(BufWriter::new(file)).with_path(path)
    }

    /// Print one line per measurement
    pub fn print_table(&self) {
        for (kb, row) in self.block_sizes_kb.iter().zip(&self.seconds) {
            for (ops, secs) in self.op_counts.iter().zip(row) {
                println!("{} operations with {} KB block size: {:.6} seconds", ops, kb, secs);
            }
        }
    }
}

/// Run every cell of the grid, in row order
pub fn run_sweep(config: &SweepConfig) -> Result<SweepResult> {
    config.validate()?;

    let block_sizes_kb = config.block_sizes_kb();
    let mut seconds = Vec::with_capacity(block_sizes_kb.len());

    for &kb in &block_sizes_kb {
        let block_size = usize::try_from(kb.saturating_mul(1024))
            .map_err(|_| PipelineError::config(format!("block size of {} KB is too large", kb)))?;

        let mut row = Vec::with_capacity(config.op_counts.len());
        for &ops in &config.op_counts {
            let job = CopyJobConfig {
                source: config.source.clone(),
                destination: config.destination.clone(),
                block_size,
                slots: ops,
                settings: config.settings.clone(),
            };
            let report = PipelinedCopier::new(job).execute()?;
            let secs = report.duration.as_secs_f64();
            info!(block_kb = kb, ops, secs, backend = %report.backend, "sweep cell measured");
            row.push(secs);
        }
        seconds.push(row);
    }

    Ok(SweepResult {
        block_sizes_kb,
        op_counts: config.op_counts.clone(),
        seconds,
    })
}
