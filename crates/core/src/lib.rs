//! Core utilities shared by every crate of the frame relay.
//!
//! This crate provides:
//! - The top-level error type
//! - Logging initialization
//! - A wall-clock frame counter for the run summary
//! - Command-line and environment configuration

mod clock;
mod config;
mod error;
mod logging;

pub use clock::RunClock;
pub use config::{DEFAULT_REPORT_FILE, RING_DEPTH, RelayConfig};
pub use error::{Error, Result};
pub use logging::init_logging;
