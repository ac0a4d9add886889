//! Failures raised by the Vulkan layer.

use thiserror::Error;

/// Anything the device, resource or presentation wrappers can fail with.
#[derive(Error, Debug)]
pub enum RhiError {
    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] ash::vk::Result),

    #[error("vulkan loader unavailable: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error("gpu allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// No adapter matches the selection, or the match lacks a required feature.
    #[error("no usable adapter: {0}")]
    NoSuitableGpu(String),

    /// Exporting or importing a shared OS handle failed.
    #[error("shared handle: {0}")]
    ExternalHandle(String),

    #[error("no memory type fits: {0}")]
    NoMemoryType(String),

    #[error("surface: {0}")]
    Surface(String),

    #[error("swapchain: {0}")]
    Swapchain(String),

    /// A caller asked for something outside the resource's bounds or state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type RhiResult<T> = std::result::Result<T, RhiError>;
