//! Common utilities for the USB interception filter
//!
//! This crate provides functionality shared by the filter core and its
//! tests: error handling, logging setup, bus identity string helpers and
//! test builders.

pub mod error;
pub mod ids;
pub mod logging;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::{init_test_logging, setup_logging};
