//! The GPU seam of the relay.
//!
//! [`RelayBackend`] is everything the [`Coordinator`](crate::Coordinator)
//! needs from the two devices. The Vulkan implementation lives in
//! [`crate::vulkan`]. The `mock` feature adds a simulated backend for tests.

use crate::error::RelayResult;
use crate::fence::{FenceRole, FenceValue};
use crate::ring::RetiredFrame;

/// Index of an acquired presentation image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PresentTarget(pub u32);

/// Start and end ticks recorded around one cross-device copy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimestampPair {
    /// Tick written before the copy.
    pub start: u64,
    /// Tick written after the copy.
    pub end: u64,
}

/// Producer work for one frame.
#[derive(Clone, Copy, Debug)]
pub struct RenderSubmit {
    /// Ring slot written.
    pub slot: usize,
    /// Frame number, used for the animated clear color.
    pub frame: u64,
    /// The slot has never been written; its resources need their initial transition.
    pub first_use: bool,
    /// Present fence value the producer must wait for on the GPU before writing.
    pub wait_present: Option<FenceValue>,
    /// Render fence value to signal once the slot is written.
    pub signal_render: FenceValue,
}

/// Consumer work for one frame.
#[derive(Clone, Copy, Debug)]
pub struct TransferSubmit {
    /// Ring slot copied from.
    pub slot: usize,
    /// Frame number being copied.
    pub frame: u64,
    /// Presentation image copied into.
    pub target: PresentTarget,
    /// Render fence value the consumer must wait for on the GPU before copying.
    pub wait_render: FenceValue,
    /// Present fence value to signal once the copy and timestamp resolve finish.
    pub signal_present: FenceValue,
}

/// Device operations driven by the coordinator.
///
/// Implementations own every GPU object. Only [`RelayBackend::wait_for_value`]
/// may block the calling thread.
pub trait RelayBackend {
    /// Number of shared slots the backend allocated.
    fn ring_depth(&self) -> usize;

    /// Timestamp ticks per second of the consumer queue.
    fn timestamp_frequency(&self) -> u64;

    /// Acquires the next presentation image for the frame using `slot`.
    fn acquire_target(&mut self, slot: usize) -> RelayResult<PresentTarget>;

    /// Records and submits producer work, signaling the render fence.
    fn submit_render(&mut self, submit: &RenderSubmit) -> RelayResult<()>;

    /// Records and submits the timed copy, signaling the present fence.
    fn submit_transfer(&mut self, submit: &TransferSubmit) -> RelayResult<()>;

    /// Presents `target` once the copy into it finished.
    fn present(&mut self, target: PresentTarget) -> RelayResult<()>;

    /// Latest completed value of a fence. Never blocks.
    fn completed_value(&self, role: FenceRole) -> RelayResult<u64>;

    /// Blocks until `value` completes on its fence.
    fn wait_for_value(&mut self, value: FenceValue) -> RelayResult<()>;

    /// Reads the copy timestamps of a retired frame.
    fn read_timestamps(&self, frame: &RetiredFrame) -> RelayResult<TimestampPair>;

    /// Releases every GPU object. Called once, after the drain.
    fn release(self) -> RelayResult<()>
    where
        Self: Sized;
}
