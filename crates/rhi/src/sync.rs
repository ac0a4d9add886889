//! Synchronization primitives for Vulkan.
//!
//! This module provides:
//! - [`Semaphore`] - binary semaphore for swapchain acquire and present
//! - [`TimelineSemaphore`] - monotonically increasing 64-bit counter that can
//!   be shared between devices and waited on by the host
//!
//! # Overview
//!
//! Cross-device ordering in the relay is expressed entirely with timeline
//! semaphores. A queue signals a value when its work completes and another
//! queue, possibly on a different device, waits for that value before its
//! own work starts. The host only blocks through [`TimelineSemaphore::wait`],
//! which sleeps inside the driver instead of polling.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_rhi::device::Device;
//! use relay_rhi::sync::TimelineSemaphore;
//!
//! # fn example(device: Arc<Device>) -> Result<(), relay_rhi::RhiError> {
//! let timeline = TimelineSemaphore::new_exportable(device, 0)?;
//! // ... submit work signaling value 1 ...
//! timeline.wait(1, u64::MAX)?;
//! assert!(timeline.completed_value()? >= 1);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::RhiResult;
use crate::external::{ExternalHandle, SEMAPHORE_HANDLE_TYPE};

/// Binary semaphore.
///
/// Used only where the WSI requires binary semaphores: image acquisition
/// and presentation.
pub struct Semaphore {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates a new unsignaled binary semaphore.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };
        Ok(Self { device, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Timeline semaphore wrapper.
///
/// Created as an exportable owner ([`TimelineSemaphore::new_exportable`]) or
/// by importing a payload exported from another device
/// ([`TimelineSemaphore::import`]). Owner and importer reference the same
/// counter.
///
/// # Thread Safety
///
/// Counter queries and host waits are thread-safe. Queue submissions that
/// signal the semaphore follow the usual external queue synchronization.
pub struct TimelineSemaphore {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl TimelineSemaphore {
    /// Creates a timeline semaphore whose payload can be exported.
    pub fn new_exportable(device: Arc<Device>, initial_value: u64) -> RhiResult<Self> {
        Self::create(device, initial_value, true)
    }

    fn create(device: Arc<Device>, initial_value: u64, exportable: bool) -> RhiResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let mut export_info =
            vk::ExportSemaphoreCreateInfo::default().handle_types(SEMAPHORE_HANDLE_TYPE);

        let mut create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        if exportable {
            create_info = create_info.push_next(&mut export_info);
        }

        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };
        debug!(
            "Created {}timeline semaphore on {} (initial {})",
            if exportable { "exportable " } else { "" },
            device.label(),
            initial_value
        );

        Ok(Self {
            device,
            semaphore,
        })
    }

    /// Opens a timeline semaphore exported by another device.
    ///
    /// The handle is consumed; after this call the OS handle is either owned
    /// by the driver or closed.
    pub fn import(device: Arc<Device>, handle: ExternalHandle) -> RhiResult<Self> {
        let timeline = Self::create(device, 0, false)?;
        timeline
            .device
            .external()
            .import_semaphore(timeline.semaphore, handle)?;
        debug!("Imported timeline semaphore on {}", timeline.device.label());
        Ok(timeline)
    }

    /// Exports the payload as an OS handle.
    ///
    /// Exporting does not transfer ownership of the semaphore itself.
    pub fn export(&self) -> RhiResult<ExternalHandle> {
        self.device.external().export_semaphore(self.semaphore)
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Latest value the counter has reached. Never blocks.
    pub fn completed_value(&self) -> RhiResult<u64> {
        Ok(unsafe {
            self.device
                .handle()
                .get_semaphore_counter_value(self.semaphore)?
        })
    }

    /// Blocks the calling thread until the counter reaches `value`.
    ///
    /// Returns `false` if `timeout_ns` elapsed first.
    pub fn wait(&self, value: u64, timeout_ns: u64) -> RhiResult<bool> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        match unsafe { self.device.handle().wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
        debug!("Destroyed timeline semaphore on {}", self.device.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphores_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore>();
        assert_send_sync::<TimelineSemaphore>();
    }
}
