//! Shared pieces of the readout card utilities.

pub mod logging;
pub mod program;

pub use program::{execute, is_interrupted, CommonOptions};
