//! Host-visible buffers for reading GPU results back on the CPU.
//!
//! Memory comes from gpu-allocator with [`MemoryLocation::GpuToCpu`], which
//! is persistently mapped. Reads go through `bytemuck` so the mapped bytes
//! are reinterpreted without unsafe casts.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_rhi::buffer::ReadbackBuffer;
//! use relay_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>) -> Result<(), relay_rhi::RhiError> {
//! let readback = ReadbackBuffer::new(device, "timestamps", 6 * 8)?;
//! // ... GPU copies query results into readback.handle() ...
//! let ticks: Vec<u64> = readback.read(0, 2)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// A GPU-to-CPU buffer written by transfer commands and read by the host.
pub struct ReadbackBuffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    name: &'static str,
}

impl ReadbackBuffer {
    /// Creates a mapped readback buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero, or buffer creation, allocation or
    /// binding fails.
    pub fn new(device: Arc<Device>, name: &'static str, size: vk::DeviceSize) -> RhiResult<Self> {
        if size == 0 {
            return Err(RhiError::InvalidRequest(
                "Buffer size must be greater than 0".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.handle().create_buffer(&buffer_info, None)? };

        let mut readback = Self {
            device,
            buffer,
            allocation: None,
            size,
            name,
        };

        let requirements = unsafe {
            readback
                .device
                .handle()
                .get_buffer_memory_requirements(buffer)
        };
        let allocation = readback
            .device
            .allocator()
            .lock()
            .map_err(|_| RhiError::InvalidRequest("allocator lock poisoned".to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuToCpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?;

        unsafe {
            readback.device.handle().bind_buffer_memory(
                buffer,
                allocation.memory(),
                allocation.offset(),
            )?;
        }
        readback.allocation = Some(allocation);

        debug!(
            "Created readback buffer '{}' on {}: {} bytes",
            name,
            readback.device.label(),
            size
        );
        Ok(readback)
    }

    /// Copies `count` values of `T` starting at byte `offset` out of the mapping.
    ///
    /// The caller must have observed completion of the GPU work that wrote
    /// the range, together with a transfer-to-host memory barrier.
    pub fn read<T: Pod>(&self, offset: vk::DeviceSize, count: usize) -> RhiResult<Vec<T>> {
        let bytes = self.mapped()?;
        let start = offset as usize;
        let end = start + count * std::mem::size_of::<T>();
        let range = bytes.get(start..end).ok_or_else(|| {
            RhiError::InvalidRequest(format!(
                "read of {}..{} outside readback buffer '{}' ({} bytes)",
                start, end, self.name, self.size
            ))
        })?;

        Ok(range
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    fn mapped(&self) -> RhiResult<&[u8]> {
        self.allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_slice())
            .ok_or_else(|| {
                RhiError::InvalidRequest(format!("readback buffer '{}' is not mapped", self.name))
            })
    }

    /// Returns the Vulkan buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }
}

impl Drop for ReadbackBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            match self.device.allocator().lock() {
                Ok(mut allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        tracing::error!("Failed to free readback buffer '{}': {:?}", self.name, e);
                    }
                }
                Err(_) => tracing::error!("Allocator lock poisoned freeing '{}'", self.name),
            }
        }
        unsafe {
            self.device.handle().destroy_buffer(self.buffer, None);
        }
        debug!("Destroyed readback buffer '{}'", self.name);
    }
}
