//! Thin Vulkan layer for relaying frames between two devices.
//!
//! This crate provides a safe abstraction over Vulkan using the `ash` crate,
//! shaped around relaying frames between two devices. It handles:
//! - Instance creation and adapter capability queries
//! - Logical devices with external memory and semaphore support
//! - Exporting and importing OS handles between devices
//! - Timeline semaphores and timestamp queries
//! - Command recording, readback buffers and the presentation swapchain

mod error;

pub mod buffer;
pub mod command;
pub mod device;
pub mod external;
pub mod image;
pub mod instance;
pub mod physical_device;
pub mod query;
pub mod shared;
pub mod swapchain;
pub mod sync;

pub use error::{RhiError, RhiResult};

pub use ash::vk;
