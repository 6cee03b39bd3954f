//! Benchmark sweep module
//!
//! Times pipelined copies across a grid of block sizes and slot counts and
//! writes the results as a CSV table.

mod runner;

pub use runner::*;
