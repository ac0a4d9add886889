//! Adapter enumeration and capability checks.
//!
//! The relay pins each role to an adapter by index instead of scoring
//! devices. This module enumerates every adapter once, records what the
//! relay needs to know about it (queue families, timeline semaphore support,
//! exportable and importable memory and semaphores, timestamp support) and
//! validates a chosen adapter against those requirements.
//!
//! # Example
//!
//! ```no_run
//! use relay_rhi::instance::Instance;
//! use relay_rhi::physical_device::{enumerate_adapters, log_adapters};
//!
//! let instance = Instance::new(c"frame-relay", false)?;
//! let adapters = enumerate_adapters(&instance)?;
//! log_adapters(&adapters);
//! # Ok::<(), relay_rhi::RhiError>(())
//! ```


use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};
use crate::external::{EXTERNAL_EXTENSIONS, MEMORY_HANDLE_TYPE, SEMAPHORE_HANDLE_TYPE};
use crate::instance::Instance;

/// Queue family indices used by one relay device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Family supporting graphics (and therefore transfer and timestamps).
    pub graphics_family: Option<u32>,
    /// Family able to present to the window surface, if a surface was given.
    pub present_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Checks the families required for the given role.
    #[inline]
    pub fn is_complete(&self, needs_present: bool) -> bool {
        self.graphics_family.is_some() && (!needs_present || self.present_family.is_some())
    }

    /// Returns the distinct family indices, graphics first.
    ///
    /// Relay work is recorded on the graphics family only, so these are the
    /// only queues a device needs.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(2);
        for family in [self.graphics_family, self.present_family]
            .into_iter()
            .flatten()
        {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// What an adapter supports of the cross-device sharing path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SharingSupport {
    /// Timeline semaphores are available (core in Vulkan 1.2).
    pub timeline_semaphore: bool,
    /// The external memory and semaphore handle extensions are exposed.
    pub external_extensions: bool,
    /// Linear transfer buffers can be exported and imported.
    pub exportable_memory: bool,
    /// Timeline semaphores can be exported and imported.
    pub exportable_semaphore: bool,
}

impl SharingSupport {
    /// Whether every capability of the sharing path is present.
    pub fn is_complete(&self) -> bool {
        self.timeline_semaphore
            && self.external_extensions
            && self.exportable_memory
            && self.exportable_semaphore
    }

    /// First missing capability, for diagnostics.
    pub fn missing(&self) -> Option<&'static str> {
        if !self.timeline_semaphore {
            Some("timeline semaphores")
        } else if !self.external_extensions {
            Some("external memory/semaphore handle extensions")
        } else if !self.exportable_memory {
            Some("exportable buffer memory")
        } else if !self.exportable_semaphore {
            Some("exportable timeline semaphores")
        } else {
            None
        }
    }
}

/// Information about one adapter.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    /// Position in the loader's enumeration order.
    pub index: usize,
    /// Vulkan physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version, etc.).
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory properties (heap sizes, memory types).
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Queue family indices. `present_family` is only set by [`select_adapter`].
    pub queue_families: QueueFamilyIndices,
    /// Number of queue families exposed by the adapter.
    pub queue_family_count: u32,
    /// Timestamp valid bits of the graphics family. Zero means unsupported.
    pub timestamp_valid_bits: u32,
    /// Cross-device sharing capabilities.
    pub sharing: SharingSupport,
    /// Identifies the physical device across APIs and processes.
    pub device_uuid: [u8; vk::UUID_SIZE],
    /// Identifies the driver build; opaque handles only work between equal drivers.
    pub driver_uuid: [u8; vk::UUID_SIZE],
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("Unknown Device")
    }

    /// Returns a human-readable string for the device type.
    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    /// Returns the Vulkan API version supported by the device.
    pub fn api_version(&self) -> (u32, u32, u32) {
        let version = self.properties.api_version;
        (
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version),
        )
    }

    /// Returns the total device local memory in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }

    /// Timestamp ticks per second on the graphics queue.
    ///
    /// Vulkan reports nanoseconds per tick; the relay works in ticks per second.
    pub fn timestamp_frequency(&self) -> u64 {
        ticks_per_second(self.properties.limits.timestamp_period)
    }

    /// Whether opaque handles exported by `other` can be imported here.
    pub fn shares_driver_with(&self, other: &PhysicalDeviceInfo) -> bool {
        self.driver_uuid == other.driver_uuid
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (major, minor, patch) = self.api_version();
        f.debug_struct("PhysicalDeviceInfo")
            .field("index", &self.index)
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("api_version", &format!("{}.{}.{}", major, minor, patch))
            .field("queue_families", &self.queue_families)
            .field("sharing", &self.sharing)
            .finish()
    }
}

/// Converts a `timestampPeriod` (nanoseconds per tick) to ticks per second.
pub fn ticks_per_second(timestamp_period: f32) -> u64 {
    if timestamp_period <= 0.0 || !timestamp_period.is_finite() {
        return 0;
    }
    (1.0e9 / f64::from(timestamp_period)).round() as u64
}

/// Enumerates every adapter and records its relay-relevant capabilities.
///
/// Present support is not known yet at this point; it is resolved by
/// [`select_adapter`] once a surface exists.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] when no adapter exists.
pub fn enumerate_adapters(instance: &Instance) -> RhiResult<Vec<PhysicalDeviceInfo>> {
    let devices = instance.physical_devices()?;
    if devices.is_empty() {
        return Err(RhiError::NoSuitableGpu(
            "no Vulkan-capable adapters found".to_string(),
        ));
    }

    devices
        .into_iter()
        .enumerate()
        .map(|(index, device)| query_adapter(instance.handle(), index, device))
        .collect()
}

/// Logs every adapter together with its sharing capabilities.
pub fn log_adapters(adapters: &[PhysicalDeviceInfo]) {
    info!("Found {} adapter(s)", adapters.len());
    for adapter in adapters {
        let (major, minor, patch) = adapter.api_version();
        info!(
            "  [{}] '{}' ({}) - Vulkan {}.{}.{}, {} MiB local",
            adapter.index,
            adapter.device_name(),
            adapter.device_type_name(),
            major,
            minor,
            patch,
            adapter.device_local_memory() / (1024 * 1024)
        );
        match adapter.sharing.missing() {
            None => info!("      cross-device sharing: supported"),
            Some(missing) => info!("      cross-device sharing: unsupported ({missing})"),
        }
    }
}

/// Picks the adapter at `index` and checks it against the relay requirements.
///
/// When `surface` is given, the adapter must also be able to present to it and
/// `queue_families.present_family` is filled in.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] naming the `role` and the missing capability.
pub fn select_adapter(
    adapters: &[PhysicalDeviceInfo],
    index: usize,
    role: &str,
    surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
) -> RhiResult<PhysicalDeviceInfo> {
    let mut adapter = adapters.get(index).cloned().ok_or_else(|| {
        RhiError::NoSuitableGpu(format!(
            "{role} adapter index {index} out of range ({} adapter(s))",
            adapters.len()
        ))
    })?;

    if let Some(missing) = adapter.sharing.missing() {
        return Err(RhiError::NoSuitableGpu(format!(
            "{role} adapter '{}' lacks {missing}",
            adapter.device_name()
        )));
    }
    if adapter.timestamp_valid_bits == 0 {
        return Err(RhiError::NoSuitableGpu(format!(
            "{role} adapter '{}' has no timestamp support on its graphics queue",
            adapter.device_name()
        )));
    }

    if let Some((loader, surface)) = surface {
        adapter.queue_families.present_family =
            find_present_family(loader, &adapter, surface)?;
    }

    if !adapter.queue_families.is_complete(surface.is_some()) {
        return Err(RhiError::NoSuitableGpu(format!(
            "{role} adapter '{}' is missing required queue families ({:?})",
            adapter.device_name(),
            adapter.queue_families
        )));
    }

    info!(
        "Selected {} adapter [{}] '{}' ({})",
        role,
        adapter.index,
        adapter.device_name(),
        adapter.device_type_name()
    );
    Ok(adapter)
}

fn query_adapter(
    instance: &ash::Instance,
    index: usize,
    device: vk::PhysicalDevice,
) -> RhiResult<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    let queue_families = find_queue_families(&families);
    let timestamp_valid_bits = queue_families
        .graphics_family
        .map(|family| families[family as usize].timestamp_valid_bits)
        .unwrap_or(0);

    let mut id_properties = vk::PhysicalDeviceIDProperties::default();
    let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut id_properties);
    unsafe { instance.get_physical_device_properties2(device, &mut properties2) };
    let device_uuid = id_properties.device_uuid;
    let driver_uuid = id_properties.driver_uuid;

    let sharing = query_sharing_support(instance, device, &properties)?;

    let info = PhysicalDeviceInfo {
        index,
        device,
        properties,
        memory_properties,
        queue_families,
        queue_family_count: families.len() as u32,
        timestamp_valid_bits,
        sharing,
        device_uuid,
        driver_uuid,
    };
    debug!("Queried adapter {:?}", info);
    Ok(info)
}

fn query_sharing_support(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    properties: &vk::PhysicalDeviceProperties,
) -> RhiResult<SharingSupport> {
    if vk::api_version_minor(properties.api_version) < 2
        && vk::api_version_major(properties.api_version) == 1
    {
        return Ok(SharingSupport::default());
    }

    let mut features_1_2 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut features_1_2);
    unsafe { instance.get_physical_device_features2(device, &mut features) };
    let timeline_semaphore = features_1_2.timeline_semaphore == vk::TRUE;

    let available = unsafe { instance.enumerate_device_extension_properties(device)? };
    let external_extensions = EXTERNAL_EXTENSIONS.iter().all(|required| {
        available
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(*required))
    });

    let buffer_info = vk::PhysicalDeviceExternalBufferInfo::default()
        .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
        .handle_type(MEMORY_HANDLE_TYPE);
    let mut buffer_properties = vk::ExternalBufferProperties::default();
    unsafe {
        instance.get_physical_device_external_buffer_properties(
            device,
            &buffer_info,
            &mut buffer_properties,
        )
    };
    let exportable_memory = buffer_properties
        .external_memory_properties
        .external_memory_features
        .contains(
            vk::ExternalMemoryFeatureFlags::EXPORTABLE | vk::ExternalMemoryFeatureFlags::IMPORTABLE,
        );

    let mut timeline_type =
        vk::SemaphoreTypeCreateInfo::default().semaphore_type(vk::SemaphoreType::TIMELINE);
    let semaphore_info = vk::PhysicalDeviceExternalSemaphoreInfo::default()
        .handle_type(SEMAPHORE_HANDLE_TYPE)
        .push_next(&mut timeline_type);
    let mut semaphore_properties = vk::ExternalSemaphoreProperties::default();
    unsafe {
        instance.get_physical_device_external_semaphore_properties(
            device,
            &semaphore_info,
            &mut semaphore_properties,
        )
    };
    let exportable_semaphore = semaphore_properties.external_semaphore_features.contains(
        vk::ExternalSemaphoreFeatureFlags::EXPORTABLE | vk::ExternalSemaphoreFeatureFlags::IMPORTABLE,
    );

    Ok(SharingSupport {
        timeline_semaphore,
        external_extensions,
        exportable_memory,
        exportable_semaphore,
    })
}

/// Picks the first non-empty graphics family.
fn find_queue_families(families: &[vk::QueueFamilyProperties]) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        if family.queue_count == 0 {
            continue;
        }

        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics_family = Some(i);
            break;
        }
    }

    indices
}

/// Prefers presenting from the graphics family so copy and present share a queue.
fn find_present_family(
    loader: &ash::khr::surface::Instance,
    adapter: &PhysicalDeviceInfo,
    surface: vk::SurfaceKHR,
) -> RhiResult<Option<u32>> {
    let supports = |family: u32| unsafe {
        loader.get_physical_device_surface_support(adapter.device, family, surface)
    };

    if let Some(graphics) = adapter.queue_families.graphics_family
        && supports(graphics)?
    {
        return Ok(Some(graphics));
    }

    for family in 0..adapter.queue_family_count {
        if supports(family)? {
            return Ok(Some(family));
        }
    }

    warn!("Adapter '{}' cannot present to the surface", adapter.device_name());
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            timestamp_valid_bits: 64,
            ..Default::default()
        }
    }

    #[test]
    fn test_queue_family_indices_default() {
        let indices = QueueFamilyIndices::default();
        assert!(!indices.is_complete(false));
        assert!(!indices.is_complete(true));
        assert!(indices.unique_families().is_empty());
    }

    #[test]
    fn test_producer_needs_only_graphics() {
        let indices = QueueFamilyIndices {
            graphics_family: Some(0),
            ..Default::default()
        };
        assert!(indices.is_complete(false));
        assert!(!indices.is_complete(true));
    }

    #[test]
    fn test_unique_families_with_duplicates() {
        let shared = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: Some(0),
        };
        assert_eq!(shared.unique_families(), vec![0]);

        let split = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: Some(2),
        };
        assert_eq!(split.unique_families(), vec![0, 2]);
    }

    #[test]
    fn test_find_queue_families_ignores_transfer_only() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        let indices = find_queue_families(&families);
        assert_eq!(indices.graphics_family, Some(2));
        assert_eq!(indices.present_family, None);
        assert_eq!(indices.unique_families(), vec![2]);
    }

    #[test]
    fn test_find_queue_families_skips_empty() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(find_queue_families(&families).graphics_family, Some(1));
    }

    #[test]
    fn test_ticks_per_second() {
        assert_eq!(ticks_per_second(1.0), 1_000_000_000);
        assert_eq!(ticks_per_second(1000.0), 1_000_000);
        assert_eq!(ticks_per_second(0.0), 0);
        assert_eq!(ticks_per_second(f32::NAN), 0);
    }

    #[test]
    fn test_sharing_support_reports_first_missing() {
        let mut support = SharingSupport {
            timeline_semaphore: true,
            external_extensions: true,
            exportable_memory: false,
            exportable_semaphore: false,
        };
        assert!(!support.is_complete());
        assert_eq!(support.missing(), Some("exportable buffer memory"));

        support.exportable_memory = true;
        support.exportable_semaphore = true;
        assert!(support.is_complete());
        assert_eq!(support.missing(), None);
    }
}
