//! Relay error types.
//!
//! Every GPU failure carries the operation that failed and the source
//! location that issued it, captured with `#[track_caller]`. Setup and
//! steady-state failures are kept apart so the fatal handler can say which
//! phase broke.

use std::panic::Location;

use relay_rhi::RhiError;
use thiserror::Error;

use crate::fence::{FenceRole, FenceValue};
use crate::ring::SlotState;

/// Relay error type.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Creating a device, queue, resource, fence or handle failed.
    #[error("setup failed: {operation} at {location}: {source}")]
    Setup {
        operation: &'static str,
        location: &'static Location<'static>,
        #[source]
        source: RhiError,
    },

    /// A submission, signal, wait, acquire or present failed after setup.
    #[error("{operation} failed at {location}: {source}")]
    Frame {
        operation: &'static str,
        location: &'static Location<'static>,
        #[source]
        source: RhiError,
    },

    /// A slot was used from the wrong state.
    #[error("slot {slot} is {actual:?}, expected {expected:?}")]
    SlotState {
        slot: usize,
        actual: SlotState,
        expected: SlotState,
    },

    /// A fence value did not move forward.
    #[error("{role} fence value {value} does not advance past {last}")]
    FenceRegression { role: FenceRole, value: u64, last: u64 },

    /// The backend reported a completed value beyond anything signaled.
    #[error("{role} fence reports {completed} but only {signaled} was signaled")]
    FenceOverrun {
        role: FenceRole,
        completed: u64,
        signaled: u64,
    },

    /// A host wait returned before its value was observed complete.
    #[error("host wait for {value} returned but the value is not complete")]
    WaitUnsatisfied { value: FenceValue },

    /// Timestamps cannot be converted without a tick frequency.
    #[error("timestamp frequency must be non-zero")]
    InvalidFrequency,

    /// The ring needs at least one slot.
    #[error("ring depth must be at least 1")]
    InvalidRingDepth,

    /// Shutdown found slots that never returned to `Free`.
    #[error("drain incomplete: slot(s) {busy:?} still in use")]
    DrainIncomplete { busy: Vec<usize> },

    /// Writing the latency report failed.
    #[error("report I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the failure happened before the first frame.
    pub fn is_setup(&self) -> bool {
        matches!(self, RelayError::Setup { .. })
    }
}

/// Result type alias for relay operations.
pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// Tags RHI failures with the failing operation and the caller's location.
pub trait RhiResultExt<T> {
    /// Marks a failure as a setup-time failure.
    #[track_caller]
    fn during_setup(self, operation: &'static str) -> RelayResult<T>;

    /// Marks a failure as a steady-state failure.
    #[track_caller]
    fn during_frame(self, operation: &'static str) -> RelayResult<T>;
}

impl<T, E: Into<RhiError>> RhiResultExt<T> for Result<T, E> {
    #[track_caller]
    fn during_setup(self, operation: &'static str) -> RelayResult<T> {
        let location = Location::caller();
        self.map_err(|e| RelayError::Setup {
            operation,
            location,
            source: e.into(),
        })
    }

    #[track_caller]
    fn during_frame(self, operation: &'static str) -> RelayResult<T> {
        let location = Location::caller();
        self.map_err(|e| RelayError::Frame {
            operation,
            location,
            source: e.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn test_setup_error_names_operation_and_location() {
        let result: Result<(), vk::Result> = Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        let err = result.during_setup("create shared fence").unwrap_err();

        assert!(err.is_setup());
        let message = err.to_string();
        assert!(message.contains("create shared fence"));
        assert!(message.contains(file!()));
    }

    #[test]
    fn test_frame_error_is_not_setup() {
        let result: Result<(), RhiError> = Err(RhiError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        let err = result.during_frame("submit transfer").unwrap_err();

        assert!(!err.is_setup());
        match err {
            RelayError::Frame {
                operation,
                location,
                ..
            } => {
                assert_eq!(operation, "submit transfer");
                assert_eq!(location.file(), file!());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
