//! Shared utilities for the agent crate.
//!
//! # Modules
//!
//! - [`fs`]: Atomic JSON file persistence

pub mod fs;

pub use fs::{read_json, remove_if_exists, write_json_atomic};
