//! Resources shared between two devices.
//!
//! [`SharedResourceBuilder`] creates a resource on its owning device,
//! exports it as an OS handle, imports it on the peer and closes the handle.
//! The owner and peer views are always returned together as a
//! [`SharedPair`], so neither side can exist without the other.
//!
//! Two kinds of shared resources exist:
//! - a [`TimelineSemaphore`] counter, used as a cross-device fence
//! - a [`SharedBufferRing`], one memory object split into equally sized
//!   linear slots that both devices bind at the same offsets
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_rhi::device::Device;
//! use relay_rhi::shared::{SharedResourceBuilder, SurfaceLayout};
//!
//! # fn example(producer: Arc<Device>, consumer: Arc<Device>) -> Result<(), relay_rhi::RhiError> {
//! let builder = SharedResourceBuilder::new(&producer, &consumer);
//! let fence = builder.timeline(0)?;
//! let ring = builder.surface_ring(SurfaceLayout::new(1920, 1080, 3))?;
//! assert_eq!(ring.owner.len(), ring.peer.len());
//! # drop(fence);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::external::{MEMORY_HANDLE_TYPE, import_memory};
use crate::sync::TimelineSemaphore;

/// Bytes per texel of the shared surfaces, any 8-bit RGBA or BGRA format.
pub const BYTES_PER_PIXEL: u64 = 4;

/// Row pitch alignment of the linear surfaces.
pub const ROW_PITCH_ALIGNMENT: u64 = 256;

/// Alignment of every slot inside the shared memory object.
pub const PLACEMENT_ALIGNMENT: u64 = 64 * 1024;

/// Rounds `value` up to a multiple of `alignment` (a power of two).
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Owner-side and peer-side views of one shared resource.
#[derive(Debug)]
pub struct SharedPair<T> {
    /// View on the device that created and exported the resource.
    pub owner: T,
    /// View on the device that imported it.
    pub peer: T,
}

/// Byte layout of a ring of linear RGBA8 surfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceLayout {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes between the starts of consecutive rows.
    pub row_pitch: u64,
    /// Distance between the starts of consecutive slots.
    pub slot_size: u64,
    /// Number of slots.
    pub slot_count: usize,
}

impl SurfaceLayout {
    /// Computes the layout of `slot_count` surfaces of `width` x `height`.
    pub fn new(width: u32, height: u32, slot_count: usize) -> Self {
        let row_pitch = align_up(u64::from(width) * BYTES_PER_PIXEL, ROW_PITCH_ALIGNMENT);
        let slot_size = align_up(row_pitch * u64::from(height), PLACEMENT_ALIGNMENT);
        Self {
            width,
            height,
            row_pitch,
            slot_size,
            slot_count,
        }
    }

    /// Bytes actually covered by one surface.
    #[inline]
    pub fn surface_bytes(&self) -> u64 {
        self.row_pitch * u64::from(self.height)
    }

    /// Size of the whole shared memory object.
    #[inline]
    pub fn total_size(&self) -> u64 {
        self.slot_size * self.slot_count as u64
    }

    /// Offset of slot `index` inside the memory object.
    #[inline]
    pub fn slot_offset(&self, index: usize) -> u64 {
        self.slot_size * index as u64
    }

    /// Row length in texels, as expected by buffer/image copies.
    #[inline]
    pub fn row_length_texels(&self) -> u32 {
        (self.row_pitch / BYTES_PER_PIXEL) as u32
    }

    /// Full extent of one surface.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

/// One device's view of the shared surface memory.
///
/// Each slot is a linear buffer bound at [`SurfaceLayout::slot_offset`].
/// Dropping the ring destroys the buffers before freeing the memory.
pub struct SharedBufferRing {
    device: Arc<Device>,
    memory: vk::DeviceMemory,
    buffers: Vec<vk::Buffer>,
    layout: SurfaceLayout,
}

impl SharedBufferRing {
    fn empty(device: Arc<Device>, layout: SurfaceLayout) -> Self {
        Self {
            device,
            memory: vk::DeviceMemory::null(),
            buffers: Vec::with_capacity(layout.slot_count),
            layout,
        }
    }

    /// Creates the slot buffers and returns the merged memory requirements.
    fn create_buffers(&mut self) -> RhiResult<vk::MemoryRequirements> {
        let mut external_info =
            vk::ExternalMemoryBufferCreateInfo::default().handle_types(MEMORY_HANDLE_TYPE);
        let create_info = vk::BufferCreateInfo::default()
            .size(self.layout.surface_bytes())
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .push_next(&mut external_info);

        let mut merged = vk::MemoryRequirements {
            size: 0,
            alignment: 1,
            memory_type_bits: u32::MAX,
        };
        for _ in 0..self.layout.slot_count {
            let buffer = unsafe { self.device.handle().create_buffer(&create_info, None)? };
            self.buffers.push(buffer);

            let requirements = unsafe { self.device.handle().get_buffer_memory_requirements(buffer) };
            merged.size = merged.size.max(requirements.size);
            merged.alignment = merged.alignment.max(requirements.alignment);
            merged.memory_type_bits &= requirements.memory_type_bits;
        }

        if merged.size > self.layout.slot_size || self.layout.slot_size % merged.alignment != 0 {
            return Err(RhiError::NoMemoryType(format!(
                "{}: slot of {} bytes cannot hold a buffer needing {} bytes aligned to {}",
                self.device.label(),
                self.layout.slot_size,
                merged.size,
                merged.alignment
            )));
        }
        Ok(merged)
    }

    fn memory_type(&self, requirements: &vk::MemoryRequirements) -> RhiResult<u32> {
        self.device
            .find_memory_type(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .or_else(|_| {
                self.device
                    .find_memory_type(requirements.memory_type_bits, vk::MemoryPropertyFlags::empty())
            })
    }

    fn bind(&self) -> RhiResult<()> {
        for (index, &buffer) in self.buffers.iter().enumerate() {
            unsafe {
                self.device.handle().bind_buffer_memory(
                    buffer,
                    self.memory,
                    self.layout.slot_offset(index),
                )?;
            }
        }
        Ok(())
    }

    /// Buffer of slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[inline]
    pub fn slot(&self, index: usize) -> vk::Buffer {
        self.buffers[index]
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the ring has no slots.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Byte layout shared by both views.
    #[inline]
    pub fn layout(&self) -> &SurfaceLayout {
        &self.layout
    }
}

impl Drop for SharedBufferRing {
    fn drop(&mut self) {
        unsafe {
            for &buffer in &self.buffers {
                self.device.handle().destroy_buffer(buffer, None);
            }
            self.device.handle().free_memory(self.memory, None);
        }
        debug!(
            "Released shared surface ring on {} ({} slot(s))",
            self.device.label(),
            self.buffers.len()
        );
    }
}

/// Builds resources owned by one device and opened on another.
pub struct SharedResourceBuilder<'a> {
    owner: &'a Arc<Device>,
    peer: &'a Arc<Device>,
}

impl<'a> SharedResourceBuilder<'a> {
    /// Resources are created on `owner` and imported on `peer`.
    pub fn new(owner: &'a Arc<Device>, peer: &'a Arc<Device>) -> Self {
        Self { owner, peer }
    }

    /// Creates a shareable timeline semaphore starting at `initial_value`.
    pub fn timeline(&self, initial_value: u64) -> RhiResult<SharedPair<TimelineSemaphore>> {
        let owner = TimelineSemaphore::new_exportable(self.owner.clone(), initial_value)?;
        let handle = owner.export()?;
        let peer = TimelineSemaphore::import(self.peer.clone(), handle)?;

        info!(
            "Shared timeline created on {} and opened on {}",
            self.owner.label(),
            self.peer.label()
        );
        Ok(SharedPair { owner, peer })
    }

    /// Allocates one exportable memory object for `layout` and binds a
    /// buffer per slot on both devices.
    pub fn surface_ring(&self, layout: SurfaceLayout) -> RhiResult<SharedPair<SharedBufferRing>> {
        if layout.slot_count == 0 {
            return Err(RhiError::InvalidRequest(
                "shared surface ring needs at least one slot".to_string(),
            ));
        }

        let mut owner = SharedBufferRing::empty(self.owner.clone(), layout);
        let requirements = owner.create_buffers()?;
        let memory_type = owner.memory_type(&requirements)?;

        let mut export_info =
            vk::ExportMemoryAllocateInfo::default().handle_types(MEMORY_HANDLE_TYPE);
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(layout.total_size())
            .memory_type_index(memory_type)
            .push_next(&mut export_info);
        owner.memory = unsafe { self.owner.handle().allocate_memory(&allocate_info, None)? };
        owner.bind()?;

        let handle = self.owner.external().export_memory(owner.memory)?;

        let mut peer = SharedBufferRing::empty(self.peer.clone(), layout);
        let peer_requirements = peer.create_buffers()?;
        let peer_memory_type = peer.memory_type(&peer_requirements)?;
        peer.memory = import_memory(
            self.peer.handle(),
            handle,
            layout.total_size(),
            peer_memory_type,
        )?;
        peer.bind()?;

        info!(
            "Shared surface ring: {} slot(s) of {}x{}, row pitch {} B, slot size {} B, total {} B",
            layout.slot_count,
            layout.width,
            layout.height,
            layout.row_pitch,
            layout.slot_size,
            layout.total_size()
        );
        Ok(SharedPair { owner, peer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(65537, PLACEMENT_ALIGNMENT), 131072);
    }

    #[test]
    fn test_layout_full_hd() {
        let layout = SurfaceLayout::new(1920, 1080, 3);
        assert_eq!(layout.row_pitch, 7680);
        assert_eq!(layout.surface_bytes(), 7680 * 1080);
        assert_eq!(layout.slot_size % PLACEMENT_ALIGNMENT, 0);
        assert!(layout.slot_size >= layout.surface_bytes());
        assert_eq!(layout.total_size(), layout.slot_size * 3);
        assert_eq!(layout.slot_offset(2), layout.slot_size * 2);
        assert_eq!(layout.row_length_texels(), 1920);
    }

    #[test]
    fn test_layout_pads_odd_widths() {
        let layout = SurfaceLayout::new(100, 10, 3);
        assert_eq!(layout.row_pitch, 512);
        assert_eq!(layout.row_length_texels(), 128);
        assert_eq!(layout.slot_size, PLACEMENT_ALIGNMENT);
    }

    #[test]
    fn test_slots_never_overlap() {
        let layout = SurfaceLayout::new(7680, 3744, 3);
        for index in 1..layout.slot_count {
            let previous_end = layout.slot_offset(index - 1) + layout.surface_bytes();
            assert!(previous_end <= layout.slot_offset(index));
        }
    }
}
