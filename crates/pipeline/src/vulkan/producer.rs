//! Producer-side recording: clear a local image and copy it into a shared slot.

use std::sync::Arc;

use ash::vk;
use relay_rhi::command::{CommandBuffer, CommandPool};
use relay_rhi::device::Device;
use relay_rhi::image::{COLOR_LAYERS, Image};
use relay_rhi::shared::SurfaceLayout;
use relay_rhi::RhiResult;

/// Blue channel of the clear color for `frame`.
///
/// Ramps from 0.01 to 1.0 in steps of 0.01, then wraps to 0.0.
pub(crate) fn clear_blue(frame: u64) -> f32 {
    ((frame + 1) % 101) as f32 / 100.0
}

/// Clear color for `frame`.
pub(crate) fn clear_color(frame: u64) -> vk::ClearColorValue {
    vk::ClearColorValue {
        float32: [0.0, 0.2, clear_blue(frame), 1.0],
    }
}

/// Per-slot producer resources.
pub(crate) struct ProducerSlot {
    pool: CommandPool,
    commands: CommandBuffer,
    image: Image,
}

impl ProducerSlot {
    pub(crate) fn new(
        device: &Arc<Device>,
        index: usize,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> RhiResult<Self> {
        let pool = CommandPool::new(
            device.clone(),
            device.graphics_family(),
            format!("producer slot {index}"),
        )?;
        let commands = CommandBuffer::new(device.clone(), &pool)?;
        let image = Image::render_target(device.clone(), "producer slot image", extent, format)?;
        Ok(Self {
            pool,
            commands,
            image,
        })
    }

    #[inline]
    pub(crate) fn command_buffer(&self) -> vk::CommandBuffer {
        self.commands.handle()
    }

    /// Records the frame into `shared`, which is bound to this slot's memory.
    ///
    /// On reuse the buffer is acquired back from the external queue family
    /// before it is overwritten; after the copy it is released to it.
    pub(crate) fn record(
        &self,
        family: u32,
        shared: vk::Buffer,
        layout: &SurfaceLayout,
        frame: u64,
        first_use: bool,
    ) -> RhiResult<()> {
        // The slot is Free: its previous present value retired, which implies
        // the previous submission from this pool completed.
        self.pool.reset()?;
        let cmd = &self.commands;
        cmd.begin()?;

        let image = self.image.handle();
        let old_layout = if first_use {
            vk::ImageLayout::UNDEFINED
        } else {
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        };
        cmd.transition_image(image, old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        cmd.clear_color_image(
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear_color(frame),
        );
        cmd.transition_image(
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );

        if !first_use {
            let acquire = vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
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
        }

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
        cmd.copy_image_to_buffer(
            image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            shared,
            &[region],
        );

        let release = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
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

        cmd.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blue_ramp_wraps_after_one() {
        assert!((clear_blue(0) - 0.01).abs() < 1e-6);
        assert!((clear_blue(98) - 0.99).abs() < 1e-6);
        assert_eq!(clear_blue(99), 1.0);
        assert_eq!(clear_blue(100), 0.0);
        assert!((clear_blue(101) - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_clear_color_channels() {
        let color = clear_color(49);
        let rgba = unsafe { color.float32 };
        assert_eq!(rgba[0], 0.0);
        assert_eq!(rgba[1], 0.2);
        assert!((rgba[2] - 0.5).abs() < 1e-6);
        assert_eq!(rgba[3], 1.0);
    }
}
