//! The Vulkan implementation of [`RelayBackend`].
//!
//! One instance, two logical devices. The producer clears a local image per
//! slot and copies it into the shared surface ring; the consumer copies the
//! slot into an acquired swapchain image between two timestamps and
//! presents. Two shared timeline semaphores order the devices:
//!
//! - the render fence is owned by the producer and opened on the consumer
//! - the present fence is owned by the consumer and opened on the producer
//!
//! # Resource Destruction Order
//!
//! 1. Wait for both devices to go idle
//! 2. Destroy per-slot resources, semaphores, the query pool and the swapchain
//! 3. Destroy the shared ring and fences, then both devices
//! 4. Destroy the surface
//! 5. Destroy the instance
//!
//! `ManuallyDrop` enforces this order.

mod consumer;
mod producer;

use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::vk;
use tracing::{error, info, trace, warn};

use relay_core::{RING_DEPTH, RelayConfig};
use relay_platform::{Surface, Window};
use relay_rhi::device::{Device, DeviceOptions};
use relay_rhi::instance::Instance;
use relay_rhi::physical_device::{enumerate_adapters, log_adapters, select_adapter};
use relay_rhi::query::TimestampQueryPool;
use relay_rhi::shared::{SharedBufferRing, SharedPair, SharedResourceBuilder, SurfaceLayout};
use relay_rhi::swapchain::Swapchain;
use relay_rhi::sync::{Semaphore, TimelineSemaphore};
use relay_rhi::{RhiError, RhiResult};

use crate::backend::{PresentTarget, RelayBackend, RenderSubmit, TimestampPair, TransferSubmit};
use crate::error::{RelayResult, RhiResultExt};
use crate::fence::{FenceRole, FenceValue};
use crate::ring::RetiredFrame;

use consumer::ConsumerSlot;
use producer::ProducerSlot;

/// Longest host wait on a fence value before the device is considered hung.
const HOST_WAIT_TIMEOUT_NS: u64 = 10_000_000_000;

/// Everything created on the two devices. Fields drop in declaration order.
struct RelayDevices {
    producer_slots: Vec<ProducerSlot>,
    consumer_slots: Vec<ConsumerSlot>,
    /// Signaled by the copy into swapchain image `i`, awaited by its present.
    copy_done: Vec<Semaphore>,
    timestamps: TimestampQueryPool,
    swapchain: Swapchain,
    surfaces: SharedPair<SharedBufferRing>,
    render_fence: SharedPair<TimelineSemaphore>,
    present_fence: SharedPair<TimelineSemaphore>,
    producer: Arc<Device>,
    consumer: Arc<Device>,
}

/// Relay backend driving two Vulkan devices.
pub struct VulkanRelay {
    gpu: ManuallyDrop<RelayDevices>,
    surface: ManuallyDrop<Surface>,
    instance: ManuallyDrop<Instance>,
    frequency: u64,
    suboptimal_reported: bool,
}

impl VulkanRelay {
    /// Creates the instance, both devices and every shared resource.
    ///
    /// # Errors
    ///
    /// Every failure is a [`RelayError::Setup`](crate::RelayError::Setup)
    /// naming the step that failed.
    pub fn new(window: &Window, config: &RelayConfig) -> RelayResult<Self> {
        info!(
            "Initializing Vulkan relay ({}x{}, ring depth {})",
            window.width(),
            window.height(),
            RING_DEPTH
        );

        let instance =
            Instance::new(c"frame-relay", config.validation).during_setup("create Vulkan instance")?;

        let surface = window
            .create_surface(instance.entry(), instance.handle())
            .map_err(|e| RhiError::Surface(e.to_string()))
            .during_setup("create presentation surface")?;

        let adapters = enumerate_adapters(&instance).during_setup("enumerate adapters")?;
        log_adapters(&adapters);

        let consumer_info = select_adapter(
            &adapters,
            config.consumer_adapter,
            "consumer",
            Some((surface.loader(), surface.handle())),
        )
        .during_setup("select consumer adapter")?;
        let producer_info = select_adapter(&adapters, config.producer_adapter, "producer", None)
            .during_setup("select producer adapter")?;

        if config.single_adapter() {
            info!("Producer and consumer share adapter [{}]", consumer_info.index);
        } else if !producer_info.shares_driver_with(&consumer_info) {
            warn!(
                "'{}' and '{}' use different drivers; opaque handle import may be rejected",
                producer_info.device_name(),
                consumer_info.device_name()
            );
        }

        let producer = Device::new(&instance, &producer_info, DeviceOptions::producer())
            .during_setup("create producer device")?;
        let consumer = Device::new(&instance, &consumer_info, DeviceOptions::consumer())
            .during_setup("create consumer device")?;

        let swapchain = Swapchain::new(
            &instance,
            consumer.clone(),
            surface.handle(),
            window.width(),
            window.height(),
            RING_DEPTH as u32,
        )
        .during_setup("create swapchain")?;

        let extent = swapchain.extent();
        if extent.width != window.width() || extent.height != window.height() {
            warn!(
                "Surface extent is {}x{}, relaying at that size instead of {}x{}",
                extent.width,
                extent.height,
                window.width(),
                window.height()
            );
        }
        let layout = SurfaceLayout::new(extent.width, extent.height, RING_DEPTH);

        let surfaces = SharedResourceBuilder::new(&producer, &consumer)
            .surface_ring(layout)
            .during_setup("create shared surface ring")?;
        let render_fence = SharedResourceBuilder::new(&producer, &consumer)
            .timeline(0)
            .during_setup("create shared render fence")?;
        let present_fence = SharedResourceBuilder::new(&consumer, &producer)
            .timeline(0)
            .during_setup("create shared present fence")?;

        let producer_slots = (0..RING_DEPTH)
            .map(|index| ProducerSlot::new(&producer, index, extent, swapchain.format()))
            .collect::<RhiResult<Vec<_>>>()
            .during_setup("create producer slot resources")?;
        let consumer_slots = (0..RING_DEPTH)
            .map(|index| ConsumerSlot::new(&consumer, index))
            .collect::<RhiResult<Vec<_>>>()
            .during_setup("create consumer slot resources")?;
        let copy_done = (0..swapchain.image_count())
            .map(|_| Semaphore::new(consumer.clone()))
            .collect::<RhiResult<Vec<_>>>()
            .during_setup("create present semaphores")?;

        let timestamps = TimestampQueryPool::new(consumer.clone(), RING_DEPTH as u32)
            .during_setup("create timestamp query pool")?;
        let frequency = consumer.timestamp_frequency();

        info!(
            "Vulkan relay initialized: {} swapchain images, timestamp frequency {} Hz",
            swapchain.image_count(),
            frequency
        );

        Ok(Self {
            gpu: ManuallyDrop::new(RelayDevices {
                producer_slots,
                consumer_slots,
                copy_done,
                timestamps,
                swapchain,
                surfaces,
                render_fence,
                present_fence,
                producer,
                consumer,
            }),
            surface: ManuallyDrop::new(surface),
            instance: ManuallyDrop::new(instance),
            frequency,
            suboptimal_reported: false,
        })
    }

    fn report_suboptimal(&mut self, operation: &str) {
        if !self.suboptimal_reported {
            warn!("Swapchain reported suboptimal on {}, continuing", operation);
            self.suboptimal_reported = true;
        }
    }

    fn fence_owner(&self, role: FenceRole) -> &TimelineSemaphore {
        match role {
            FenceRole::Render => &self.gpu.render_fence.owner,
            FenceRole::Present => &self.gpu.present_fence.owner,
        }
    }
}

impl RelayBackend for VulkanRelay {
    fn ring_depth(&self) -> usize {
        self.gpu.producer_slots.len()
    }

    fn timestamp_frequency(&self) -> u64 {
        self.frequency
    }

    fn acquire_target(&mut self, slot: usize) -> RelayResult<PresentTarget> {
        let semaphore = self.gpu.consumer_slots[slot].image_acquired();
        let (index, suboptimal) = self
            .gpu
            .swapchain
            .acquire_next_image(semaphore)
            .during_frame("acquire swapchain image")?;
        if suboptimal {
            self.report_suboptimal("acquire");
        }
        Ok(PresentTarget(index))
    }

    fn submit_render(&mut self, submit: &RenderSubmit) -> RelayResult<()> {
        let gpu = &self.gpu;
        let slot = &gpu.producer_slots[submit.slot];
        slot.record(
            gpu.producer.graphics_family(),
            gpu.surfaces.owner.slot(submit.slot),
            gpu.surfaces.owner.layout(),
            submit.frame,
            submit.first_use,
        )
        .during_frame("record producer work")?;

        // The first use of a slot has no previous copy to wait for.
        let waits = usize::from(submit.wait_present.is_some());
        let wait_semaphores = [gpu.present_fence.peer.handle()];
        let wait_values = [submit.wait_present.map_or(0, |value| value.get())];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];

        let signal_semaphores = [gpu.render_fence.owner.handle()];
        let signal_values = [submit.signal_render.get()];
        let command_buffers = [slot.command_buffer()];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values[..waits])
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores[..waits])
            .wait_dst_stage_mask(&wait_stages[..waits])
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        // SAFETY: the command buffer was just recorded, the awaited present
        // value was signaled by an earlier consumer submission, and no fence
        // is attached.
        unsafe { gpu.producer.submit_graphics(&[submit_info], vk::Fence::null()) }
            .during_frame("submit producer work")?;
        trace!(
            "frame {} rendered into slot {}, signals {}",
            submit.frame, submit.slot, submit.signal_render
        );
        Ok(())
    }

    fn submit_transfer(&mut self, submit: &TransferSubmit) -> RelayResult<()> {
        let gpu = &self.gpu;
        let slot = &gpu.consumer_slots[submit.slot];
        let image = submit.target.0 as usize;
        slot.record(
            gpu.consumer.graphics_family(),
            gpu.surfaces.peer.slot(submit.slot),
            gpu.surfaces.peer.layout(),
            gpu.swapchain.image(image),
            &gpu.timestamps,
            submit.slot as u32,
        )
        .during_frame("record consumer copy")?;

        let wait_semaphores = [gpu.render_fence.peer.handle(), slot.image_acquired()];
        let wait_values = [submit.wait_render.get(), 0];
        let wait_stages = [
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ];

        let signal_semaphores = [gpu.present_fence.owner.handle(), gpu.copy_done[image].handle()];
        let signal_values = [submit.signal_present.get(), 0];
        let command_buffers = [slot.command_buffer()];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        // SAFETY: the render value is signaled by the producer submission
        // issued just before, and the acquire semaphore by the acquire of
        // this frame.
        unsafe { gpu.consumer.submit_graphics(&[submit_info], vk::Fence::null()) }
            .during_frame("submit consumer copy")?;
        trace!(
            "frame {} copies slot {} into image {} after {}, signals {}",
            submit.frame, submit.slot, image, submit.wait_render, submit.signal_present
        );
        Ok(())
    }

    fn present(&mut self, target: PresentTarget) -> RelayResult<()> {
        let wait = self.gpu.copy_done[target.0 as usize].handle();
        let suboptimal = self
            .gpu
            .swapchain
            .present(target.0, wait)
            .during_frame("present")?;
        if suboptimal {
            self.report_suboptimal("present");
        }
        Ok(())
    }

    fn completed_value(&self, role: FenceRole) -> RelayResult<u64> {
        self.fence_owner(role)
            .completed_value()
            .during_frame("query fence value")
    }

    fn wait_for_value(&mut self, value: FenceValue) -> RelayResult<()> {
        let reached = self
            .fence_owner(value.role())
            .wait(value.get(), HOST_WAIT_TIMEOUT_NS)
            .during_frame("wait for fence value")?;
        if !reached {
            error!("Timed out waiting for {}", value);
            return Err::<(), _>(vk::Result::TIMEOUT).during_frame("wait for fence value");
        }
        Ok(())
    }

    fn read_timestamps(&self, frame: &RetiredFrame) -> RelayResult<TimestampPair> {
        let (start, end) = self
            .gpu
            .timestamps
            .read(frame.slot() as u32)
            .during_frame("read timestamps")?;
        Ok(TimestampPair { start, end })
    }

    fn release(self) -> RelayResult<()> {
        self.gpu
            .producer
            .wait_idle()
            .during_frame("wait for producer idle")?;
        self.gpu
            .consumer
            .wait_idle()
            .during_frame("wait for consumer idle")?;
        drop(self);
        Ok(())
    }
}

impl Drop for VulkanRelay {
    fn drop(&mut self) {
        for device in [&self.gpu.producer, &self.gpu.consumer] {
            if let Err(e) = device.wait_idle() {
                error!("Failed to wait for {} idle during drop: {:?}", device.label(), e);
            }
        }

        // SAFETY: each field is dropped exactly once, here, in dependency order.
        unsafe {
            ManuallyDrop::drop(&mut self.gpu);
            ManuallyDrop::drop(&mut self.surface);
            ManuallyDrop::drop(&mut self.instance);
        }

        info!("Vulkan relay destroyed");
    }
}
