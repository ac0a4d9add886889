//! Opaque OS handles for sharing memory and semaphores between devices.
//!
//! On Unix the payload is an opaque file descriptor, on Windows an opaque
//! NT handle. Either way an [`ExternalHandle`] owns the OS object: dropping
//! it closes the descriptor or handle. A successful opaque-FD import hands
//! ownership to the driver, so the import helpers consume the handle and
//! only close it themselves when the import fails (Unix) or always (Windows,
//! where the driver duplicates the handle).

use std::fmt;

use ash::vk;

#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
#[cfg(windows)]
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};

use crate::error::{RhiError, RhiResult};

/// Handle type used for exported device memory.
#[cfg(unix)]
pub const MEMORY_HANDLE_TYPE: vk::ExternalMemoryHandleTypeFlags =
    vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD;
/// Handle type used for exported device memory.
#[cfg(windows)]
pub const MEMORY_HANDLE_TYPE: vk::ExternalMemoryHandleTypeFlags =
    vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32;

/// Handle type used for exported semaphores.
#[cfg(unix)]
pub const SEMAPHORE_HANDLE_TYPE: vk::ExternalSemaphoreHandleTypeFlags =
    vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD;
/// Handle type used for exported semaphores.
#[cfg(windows)]
pub const SEMAPHORE_HANDLE_TYPE: vk::ExternalSemaphoreHandleTypeFlags =
    vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_WIN32;

/// Device extensions needed to export and import memory and semaphores.
#[cfg(unix)]
pub const EXTERNAL_EXTENSIONS: &[&std::ffi::CStr] = &[
    ash::khr::external_memory_fd::NAME,
    ash::khr::external_semaphore_fd::NAME,
];
/// Device extensions needed to export and import memory and semaphores.
#[cfg(windows)]
pub const EXTERNAL_EXTENSIONS: &[&std::ffi::CStr] = &[
    ash::khr::external_memory_win32::NAME,
    ash::khr::external_semaphore_win32::NAME,
];

/// An owned OS handle exported from one device for import on another.
pub struct ExternalHandle {
    #[cfg(unix)]
    inner: OwnedFd,
    #[cfg(windows)]
    inner: OwnedHandle,
}

impl fmt::Debug for ExternalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(unix)]
        return f
            .debug_tuple("ExternalHandle")
            .field(&self.inner.as_raw_fd())
            .finish();
        #[cfg(windows)]
        return f
            .debug_tuple("ExternalHandle")
            .field(&self.inner.as_raw_handle())
            .finish();
    }
}

#[cfg(unix)]
impl ExternalHandle {
    /// Takes ownership of a descriptor returned by a `vkGet*FdKHR` call.
    ///
    /// # Safety
    ///
    /// `fd` must be an open descriptor owned by nobody else.
    pub(crate) unsafe fn from_raw(fd: i32) -> RhiResult<Self> {
        if fd < 0 {
            return Err(RhiError::ExternalHandle(format!(
                "driver returned invalid descriptor {fd}"
            )));
        }
        Ok(Self {
            inner: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Raw descriptor for an import call. Ownership is not transferred.
    pub(crate) fn raw(&self) -> i32 {
        self.inner.as_raw_fd()
    }

    /// Releases ownership after the driver accepted the descriptor.
    pub(crate) fn into_driver(self) {
        let _ = self.inner.into_raw_fd();
    }
}

#[cfg(windows)]
impl ExternalHandle {
    /// Takes ownership of a handle returned by a `vkGet*Win32HandleKHR` call.
    ///
    /// # Safety
    ///
    /// `handle` must be an open NT handle owned by nobody else.
    pub(crate) unsafe fn from_raw(handle: vk::HANDLE) -> RhiResult<Self> {
        if handle.is_null() {
            return Err(RhiError::ExternalHandle(
                "driver returned a null handle".to_string(),
            ));
        }
        Ok(Self {
            inner: unsafe { OwnedHandle::from_raw_handle(handle) },
        })
    }

    pub(crate) fn raw(&self) -> vk::HANDLE {
        self.inner.as_raw_handle()
    }

    /// NT handle imports duplicate the payload; the handle is simply closed.
    pub(crate) fn into_driver(self) {
        drop(self);
    }
}

/// Extension loaders for exporting and importing on one logical device.
pub(crate) struct ExternalLoaders {
    #[cfg(unix)]
    memory: ash::khr::external_memory_fd::Device,
    #[cfg(unix)]
    semaphore: ash::khr::external_semaphore_fd::Device,
    #[cfg(windows)]
    memory: ash::khr::external_memory_win32::Device,
    #[cfg(windows)]
    semaphore: ash::khr::external_semaphore_win32::Device,
}

impl ExternalLoaders {
    pub(crate) fn new(instance: &ash::Instance, device: &ash::Device) -> Self {
        Self {
            #[cfg(unix)]
            memory: ash::khr::external_memory_fd::Device::new(instance, device),
            #[cfg(unix)]
            semaphore: ash::khr::external_semaphore_fd::Device::new(instance, device),
            #[cfg(windows)]
            memory: ash::khr::external_memory_win32::Device::new(instance, device),
            #[cfg(windows)]
            semaphore: ash::khr::external_semaphore_win32::Device::new(instance, device),
        }
    }

    /// Exports an allocation created with [`vk::ExportMemoryAllocateInfo`].
    pub(crate) fn export_memory(&self, memory: vk::DeviceMemory) -> RhiResult<ExternalHandle> {
        #[cfg(unix)]
        {
            let info = vk::MemoryGetFdInfoKHR::default()
                .memory(memory)
                .handle_type(MEMORY_HANDLE_TYPE);
            let fd = unsafe { self.memory.get_memory_fd(&info)? };
            unsafe { ExternalHandle::from_raw(fd) }
        }
        #[cfg(windows)]
        {
            let info = vk::MemoryGetWin32HandleInfoKHR::default()
                .memory(memory)
                .handle_type(MEMORY_HANDLE_TYPE);
            let handle = unsafe { self.memory.get_memory_win32_handle(&info)? };
            unsafe { ExternalHandle::from_raw(handle) }
        }
    }

    /// Exports a semaphore created with [`vk::ExportSemaphoreCreateInfo`].
    pub(crate) fn export_semaphore(&self, semaphore: vk::Semaphore) -> RhiResult<ExternalHandle> {
        #[cfg(unix)]
        {
            let info = vk::SemaphoreGetFdInfoKHR::default()
                .semaphore(semaphore)
                .handle_type(SEMAPHORE_HANDLE_TYPE);
            let fd = unsafe { self.semaphore.get_semaphore_fd(&info)? };
            unsafe { ExternalHandle::from_raw(fd) }
        }
        #[cfg(windows)]
        {
            let info = vk::SemaphoreGetWin32HandleInfoKHR::default()
                .semaphore(semaphore)
                .handle_type(SEMAPHORE_HANDLE_TYPE);
            let handle = unsafe { self.semaphore.get_semaphore_win32_handle(&info)? };
            unsafe { ExternalHandle::from_raw(handle) }
        }
    }

    /// Replaces the payload of `semaphore` with the exported one.
    pub(crate) fn import_semaphore(
        &self,
        semaphore: vk::Semaphore,
        handle: ExternalHandle,
    ) -> RhiResult<()> {
        #[cfg(unix)]
        let result = {
            let info = vk::ImportSemaphoreFdInfoKHR::default()
                .semaphore(semaphore)
                .handle_type(SEMAPHORE_HANDLE_TYPE)
                .fd(handle.raw());
            unsafe { self.semaphore.import_semaphore_fd(&info) }
        };
        #[cfg(windows)]
        let result = {
            let info = vk::ImportSemaphoreWin32HandleInfoKHR::default()
                .semaphore(semaphore)
                .handle_type(SEMAPHORE_HANDLE_TYPE)
                .handle(handle.raw());
            unsafe { self.semaphore.import_semaphore_win32_handle(&info) }
        };

        result.map_err(|e| RhiError::ExternalHandle(format!("semaphore import failed: {e}")))?;
        handle.into_driver();
        Ok(())
    }
}

/// Allocates device memory backed by an imported handle.
///
/// The handle is consumed. On Unix the driver owns the descriptor after a
/// successful import; on failure it is closed here.
pub(crate) fn import_memory(
    device: &ash::Device,
    handle: ExternalHandle,
    size: vk::DeviceSize,
    memory_type_index: u32,
) -> RhiResult<vk::DeviceMemory> {
    #[cfg(unix)]
    let mut import_info = vk::ImportMemoryFdInfoKHR::default()
        .handle_type(MEMORY_HANDLE_TYPE)
        .fd(handle.raw());
    #[cfg(windows)]
    let mut import_info = vk::ImportMemoryWin32HandleInfoKHR::default()
        .handle_type(MEMORY_HANDLE_TYPE)
        .handle(handle.raw());

    let allocate_info = vk::MemoryAllocateInfo::default()
        .allocation_size(size)
        .memory_type_index(memory_type_index)
        .push_next(&mut import_info);

    let memory = unsafe { device.allocate_memory(&allocate_info, None) }
        .map_err(|e| RhiError::ExternalHandle(format!("memory import failed: {e}")))?;
    handle.into_driver();
    Ok(memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extensions_match_handle_types() {
        assert_eq!(EXTERNAL_EXTENSIONS.len(), 2);
        #[cfg(unix)]
        {
            assert_eq!(
                MEMORY_HANDLE_TYPE,
                vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD
            );
            assert!(EXTERNAL_EXTENSIONS.contains(&ash::khr::external_semaphore_fd::NAME));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_negative_descriptor_rejected() {
        let result = unsafe { ExternalHandle::from_raw(-1) };
        assert!(matches!(result, Err(RhiError::ExternalHandle(_))));
    }
}
