//! Configuration module for slotcopy
//!
//! Provides CLI arguments and the resolved job configuration.

mod settings;

pub use settings::*;
