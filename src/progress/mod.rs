//! Progress reporting module
//!
//! Provides a terminal progress bar for a running copy.

mod reporter;

pub use reporter::*;
