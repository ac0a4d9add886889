//! Cross-device frame relay.
//!
//! This crate relays frames from a producer device to a consumer device:
//! - The shared surface ring and its slot state machine
//! - Host bookkeeping for the render and present fences
//! - The per-frame coordinator with frame pacing and the drain barrier
//! - Copy latency sampling and the aggregate report
//!
//! The coordinator talks to the GPUs through [`RelayBackend`]. The Vulkan
//! backend lives in [`vulkan`]. With the `mock` feature, `mock` simulates
//! both devices on a virtual clock for tests.

pub mod backend;
pub mod coordinator;
pub mod error;
pub mod fence;
pub mod latency;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod ring;
pub mod vulkan;

pub use backend::{PresentTarget, RelayBackend, RenderSubmit, TimestampPair, TransferSubmit};
pub use coordinator::{Coordinator, RunSummary};
pub use error::{RelayError, RelayResult, RhiResultExt};
pub use fence::{FenceRole, FenceTimeline, FenceValue};
pub use latency::{FrameRecord, LatencySampler, LatencyStats, report_line, write_report};
pub use ring::{SharedRing, SlotState};
pub use vulkan::VulkanRelay;
