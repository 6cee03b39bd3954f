//! Core copy engine module
//!
//! Slot pool, completion poller and the pipeline driver that ties them
//! together, plus the file-level copier built on top.

mod copier;
mod driver;
mod poller;
mod slots;

pub use copier::*;
pub use driver::*;
pub use poller::*;
pub use slots::*;
