//! Consumer-side recording: the timed copy from a shared slot into the back buffer.

use std::sync::Arc;

use ash::vk;
use relay_rhi::command::{CommandBuffer, CommandPool};
use relay_rhi::device::Device;
use relay_rhi::image::COLOR_LAYERS;
use relay_rhi::query::TimestampQueryPool;
use relay_rhi::shared::SurfaceLayout;
use relay_rhi::sync::Semaphore;
use relay_rhi::RhiResult;

/// Per-slot consumer resources.
pub(crate) struct ConsumerSlot {
    pool: CommandPool,
    commands: CommandBuffer,
    /// Signaled by the acquire of the image this slot's frame is copied into.
    image_acquired: Semaphore,
}

impl ConsumerSlot {
    pub(crate) fn new(device: &Arc<Device>, index: usize) -> RhiResult<Self> {
        let pool = CommandPool::new(
            device.clone(),
            device.graphics_family(),
            format!("consumer slot {index}"),
        )?;
        let commands = CommandBuffer::new(device.clone(), &pool)?;
        let image_acquired = Semaphore::new(device.clone())?;
        Ok(Self {
            pool,
            commands,
            image_acquired,
        })
    }

    #[inline]
    pub(crate) fn command_buffer(&self) -> vk::CommandBuffer {
        self.commands.handle()
    }

    #[inline]
    pub(crate) fn image_acquired(&self) -> vk::Semaphore {
        self.image_acquired.handle()
    }

    /// Records the copy of `shared` into `target` between two timestamps and
    /// resolves them into the slot's readback area.
    pub(crate) fn record(
        &self,
        family: u32,
        shared: vk::Buffer,
        layout: &SurfaceLayout,
        target: vk::Image,
        timestamps: &TimestampQueryPool,
        slot: u32,
    ) -> RhiResult<()> {
        self.pool.reset()?;
        let cmd = &self.commands;
        cmd.begin()?;

        let acquire = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_EXTERNAL)
            .dst_queue_family_index(family)
            .buffer(shared)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        cmd.pipeline_barrier(
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            &[acquire],
            &[],
        );
        cmd.transition_image(
            target,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(layout.row_length_texels())
            .buffer_image_height(0)
            .image_subresource(COLOR_LAYERS)
            .image_extent(vk::Extent3D {
                width: layout.width,
                height: layout.height,
                depth: 1,
            });

        timestamps.cmd_begin(cmd.handle(), slot)?;
        cmd.copy_buffer_to_image(
            shared,
            target,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
        timestamps.cmd_end(cmd.handle(), slot)?;

        cmd.transition_image(
            target,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        let release = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::empty())
            .src_queue_family_index(family)
            .dst_queue_family_index(vk::QUEUE_FAMILY_EXTERNAL)
            .buffer(shared)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        cmd.pipeline_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            &[release],
            &[],
        );

        timestamps.cmd_resolve(cmd.handle(), slot)?;
        cmd.end()
    }
}
