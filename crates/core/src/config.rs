//! Runtime configuration from the command line and `RELAY_*` environment variables.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};

/// Number of shared slots in the relay ring.
pub const RING_DEPTH: usize = 3;

/// File the aggregate latency line is written to on shutdown.
pub const DEFAULT_REPORT_FILE: &str = "relay_latency.txt";

/// Largest surface edge accepted by the relay.
const MAX_EXTENT: u32 = 16384;

/// Relay settings.
#[derive(Debug, Clone, Parser)]
#[command(name = "frame-relay", version, about)]
pub struct RelayConfig {
    /// Width of the shared surfaces and the window.
    ///
    /// Environment variable: `RELAY_WIDTH`.
    #[arg(long, env = "RELAY_WIDTH", default_value_t = 1920)]
    pub width: u32,

    /// Height of the shared surfaces and the window.
    ///
    /// Environment variable: `RELAY_HEIGHT`.
    #[arg(long, env = "RELAY_HEIGHT", default_value_t = 1080)]
    pub height: u32,

    /// Index of the adapter that renders frames.
    ///
    /// Environment variable: `RELAY_PRODUCER_ADAPTER`.
    #[arg(long, env = "RELAY_PRODUCER_ADAPTER", default_value_t = 1)]
    pub producer_adapter: usize,

    /// Index of the adapter that copies and presents frames.
    ///
    /// Environment variable: `RELAY_CONSUMER_ADAPTER`.
    #[arg(long, env = "RELAY_CONSUMER_ADAPTER", default_value_t = 0)]
    pub consumer_adapter: usize,

    /// Path of the aggregate latency report.
    ///
    /// Environment variable: `RELAY_REPORT`.
    #[arg(long, env = "RELAY_REPORT", default_value = DEFAULT_REPORT_FILE)]
    pub report: PathBuf,

    /// Stop after relaying this many frames.
    ///
    /// Environment variable: `RELAY_MAX_FRAMES`.
    #[arg(long, env = "RELAY_MAX_FRAMES")]
    pub max_frames: Option<u64>,

    /// Enable the Khronos validation layer.
    ///
    /// Environment variable: `RELAY_VALIDATION`.
    #[arg(
        long,
        env = "RELAY_VALIDATION",
        default_value_t = cfg!(debug_assertions),
        action = clap::ArgAction::Set
    )]
    pub validation: bool,
}

impl RelayConfig {
    /// Parses the process arguments and validates the result.
    pub fn load() -> Result<Self> {
        Self::parse().validated()
    }

    /// Parses an explicit argument list. The first item is the binary name.
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(args)
            .map_err(|e| Error::Config(e.to_string()))?
            .validated()
    }

    fn validated(self) -> Result<Self> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "surface extent must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width > MAX_EXTENT || self.height > MAX_EXTENT {
            return Err(Error::Config(format!(
                "surface extent {}x{} exceeds {MAX_EXTENT}",
                self.width, self.height
            )));
        }
        if self.max_frames == Some(0) {
            return Err(Error::Config("max-frames must be at least 1".to_string()));
        }
        Ok(self)
    }

    /// Whether both roles were assigned to the same adapter.
    pub fn single_adapter(&self) -> bool {
        self.producer_adapter == self.consumer_adapter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::from_args(["frame-relay"]).unwrap();
        assert_eq!(config.width, 1920);
        assert_eq!(config.height, 1080);
        assert_eq!(config.producer_adapter, 1);
        assert_eq!(config.consumer_adapter, 0);
        assert_eq!(config.report, PathBuf::from(DEFAULT_REPORT_FILE));
        assert!(config.max_frames.is_none());
        assert_eq!(config.validation, cfg!(debug_assertions));
        assert!(!config.single_adapter());
    }

    #[test]
    fn test_overrides() {
        let config = RelayConfig::from_args([
            "frame-relay",
            "--width",
            "7680",
            "--height",
            "3744",
            "--producer-adapter",
            "0",
            "--max-frames",
            "120",
            "--validation",
            "false",
        ])
        .unwrap();
        assert_eq!(config.width, 7680);
        assert_eq!(config.height, 3744);
        assert!(config.single_adapter());
        assert_eq!(config.max_frames, Some(120));
        assert!(!config.validation);
    }

    #[test]
    fn test_zero_extent_rejected() {
        let result = RelayConfig::from_args(["frame-relay", "--width", "0"]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_oversized_extent_rejected() {
        let result = RelayConfig::from_args(["frame-relay", "--height", "20000"]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_frame_limit_rejected() {
        let result = RelayConfig::from_args(["frame-relay", "--max-frames", "0"]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_ring_depth() {
        assert_eq!(RING_DEPTH, 3);
    }
}
