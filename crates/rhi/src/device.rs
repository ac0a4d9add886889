//! Vulkan logical device and queue management.
//!
//! One [`Device`] is created per relay role. Each enables timeline
//! semaphores and the external memory/semaphore handle extensions so that
//! the ring memory and the fences can cross between devices. The presenting
//! device additionally enables the swapchain extension.
//!
//! # Example
//!
//! ```no_run
//! use relay_rhi::device::{Device, DeviceOptions};
//! use relay_rhi::instance::Instance;
//! use relay_rhi::physical_device::{enumerate_adapters, select_adapter};
//!
//! let instance = Instance::new(c"frame-relay", false)?;
//! let adapters = enumerate_adapters(&instance)?;
//! let producer = select_adapter(&adapters, 0, "producer", None)?;
//! let device = Device::new(&instance, &producer, DeviceOptions::producer())?;
//! println!("{} ready", device.label());
//! # Ok::<(), relay_rhi::RhiError>(())
//! ```

use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use tracing::{debug, error, info};

use crate::error::{RhiError, RhiResult};
use crate::external::{EXTERNAL_EXTENSIONS, ExternalLoaders};
use crate::instance::Instance;
use crate::physical_device::PhysicalDeviceInfo;

/// Role-specific device creation options.
#[derive(Clone, Copy, Debug)]
pub struct DeviceOptions {
    /// Name used in log messages.
    pub label: &'static str,
    /// Enable the swapchain extension and fetch a present queue.
    pub presents: bool,
}

impl DeviceOptions {
    /// Options for the rendering device.
    pub const fn producer() -> Self {
        Self {
            label: "producer",
            presents: false,
        }
    }

    /// Options for the copying and presenting device.
    pub const fn consumer() -> Self {
        Self {
            label: "consumer",
            presents: true,
        }
    }

    fn extensions(&self) -> Vec<&'static CStr> {
        let mut extensions = EXTERNAL_EXTENSIONS.to_vec();
        if self.presents {
            extensions.push(ash::khr::swapchain::NAME);
        }
        extensions
    }
}

/// Vulkan logical device wrapper.
///
/// # Thread Safety
///
/// The device is shared through `Arc`. The allocator is protected by a `Mutex`.
pub struct Device {
    device: ash::Device,
    adapter: PhysicalDeviceInfo,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    external: ExternalLoaders,
    graphics_queue: vk::Queue,
    present_queue: Option<vk::Queue>,
    label: &'static str,
}

impl Device {
    /// Creates a logical device on `adapter`.
    ///
    /// Enables timeline semaphores and the external handle extensions, plus
    /// the swapchain extension when `options.presents` is set. Initializes a
    /// gpu-allocator instance for device-local and readback allocations.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter has no graphics family, device
    /// creation fails or the allocator cannot be initialized.
    pub fn new(
        instance: &Instance,
        adapter: &PhysicalDeviceInfo,
        options: DeviceOptions,
    ) -> RhiResult<Arc<Self>> {
        let families = adapter.queue_families;
        let graphics_family = families.graphics_family.ok_or_else(|| {
            RhiError::NoSuitableGpu(format!("{} adapter has no graphics queue", options.label))
        })?;
        if options.presents && families.present_family.is_none() {
            return Err(RhiError::NoSuitableGpu(format!(
                "{} adapter cannot present",
                options.label
            )));
        }

        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let mut features_1_2 = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);

        let extensions = options.extensions();
        let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features_1_2);

        let device = unsafe {
            instance
                .handle()
                .create_device(adapter.device, &create_info, None)?
        };

        info!(
            "{} device created on '{}' with {} extension(s)",
            options.label,
            adapter.device_name(),
            extensions.len()
        );

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        debug!("{} graphics queue from family {}", options.label, graphics_family);

        let present_queue = families.present_family.filter(|_| options.presents).map(|family| {
            debug!("{} present queue from family {}", options.label, family);
            unsafe { device.get_device_queue(family, 0) }
        });

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: adapter.device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        let external = ExternalLoaders::new(instance.handle(), &device);

        Ok(Arc::new(Self {
            device,
            adapter: adapter.clone(),
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            external,
            graphics_queue,
            present_queue,
            label: options.label,
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Returns the adapter this device was created on.
    #[inline]
    pub fn adapter(&self) -> &PhysicalDeviceInfo {
        &self.adapter
    }

    /// Returns the physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.adapter.device
    }

    /// Role name used in logs.
    #[inline]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Returns the graphics queue handle.
    #[inline]
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Graphics queue family index.
    #[inline]
    pub fn graphics_family(&self) -> u32 {
        // Checked in `new`.
        self.adapter.queue_families.graphics_family.unwrap_or_default()
    }

    /// Returns the presentation queue, if this device presents.
    #[inline]
    pub fn present_queue(&self) -> Option<vk::Queue> {
        self.present_queue
    }

    /// Present queue family index, if this device presents.
    #[inline]
    pub fn present_family(&self) -> Option<u32> {
        self.present_queue
            .and(self.adapter.queue_families.present_family)
    }

    /// Returns a reference to the GPU memory allocator.
    #[inline]
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    #[inline]
    pub(crate) fn external(&self) -> &ExternalLoaders {
        &self.external
    }

    /// Timestamp ticks per second on the graphics queue.
    #[inline]
    pub fn timestamp_frequency(&self) -> u64 {
        self.adapter.timestamp_frequency()
    }

    /// Finds a memory type allowed by `type_bits` that has all of `flags`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::NoMemoryType`] if no such type exists.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> RhiResult<u32> {
        find_memory_type(&self.adapter.memory_properties, type_bits, flags).ok_or_else(|| {
            RhiError::NoMemoryType(format!(
                "{}: bits {:#x} with {:?}",
                self.label, type_bits, flags
            ))
        })
    }

    /// Waits for the device to become idle.
    pub fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    /// Submits command buffers to the graphics queue.
    ///
    /// # Safety
    ///
    /// The caller must ensure that all command buffers are recorded, that
    /// every referenced semaphore value will eventually be signaled, and that
    /// `fence` (if not null) is unsignaled and not in use.
    pub unsafe fn submit_graphics(
        &self,
        submit_infos: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> RhiResult<()> {
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, submit_infos, fence)?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for {} device idle during drop: {:?}", self.label, e);
            }

            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
        }
        info!("{} device destroyed", self.label);
    }
}

// Safety: ash::Device is Send+Sync, queues are plain handles and the
// allocator is behind a Mutex.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

/// Memory type lookup over raw memory properties.
pub(crate) fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..properties.memory_type_count).find(|&index| {
        type_bits & (1 << index) != 0
            && properties.memory_types[index as usize]
                .property_flags
                .contains(flags)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_enables_swapchain() {
        let extensions = DeviceOptions::consumer().extensions();
        assert!(extensions.contains(&ash::khr::swapchain::NAME));
        for required in EXTERNAL_EXTENSIONS {
            assert!(extensions.contains(required));
        }
    }

    #[test]
    fn test_producer_skips_swapchain() {
        let extensions = DeviceOptions::producer().extensions();
        assert!(!extensions.contains(&ash::khr::swapchain::NAME));
        assert_eq!(extensions.len(), EXTERNAL_EXTENSIONS.len());
    }

    #[test]
    fn test_find_memory_type() {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        properties.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        properties.memory_types[2].property_flags =
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;

        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert_eq!(find_memory_type(&properties, 0b111, local), Some(1));
        assert_eq!(find_memory_type(&properties, 0b101, local), Some(2));
        assert_eq!(find_memory_type(&properties, 0b001, local), None);
    }

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Device>();
    }
}
