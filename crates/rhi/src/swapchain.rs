//! Swapchain management for the presenting device.
//!
//! The relay never renders into swapchain images directly: every frame is a
//! transfer copy into the acquired image followed by a present. Images are
//! therefore created with `TRANSFER_DST` usage and no image views. The
//! present mode is always FIFO, i.e. a vsync interval of one.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;
use crate::shared::BYTES_PER_PIXEL;

/// What the consumer surface offers for a copy-target swapchain.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    /// Surface capabilities (image counts, extents, usage, transforms)
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats
    pub formats: Vec<vk::SurfaceFormatKHR>,
}

impl SurfaceSupport {
    /// Queries the surface as seen from the consumer adapter.
    pub fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> RhiResult<Self> {
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
        };
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        };

        debug!(
            "Swapchain support: {} formats, image count {}-{}",
            formats.len(),
            capabilities.min_image_count,
            capabilities.max_image_count
        );

        Ok(Self {
            capabilities,
            formats,
        })
    }

    /// Whether the surface can be a copy destination with at least one format.
    #[inline]
    pub fn accepts_copies(&self) -> bool {
        !self.formats.is_empty()
            && self
                .capabilities
                .supported_usage_flags
                .contains(vk::ImageUsageFlags::TRANSFER_DST)
    }
}

/// FIFO swapchain the consumer copies relayed frames into.
///
/// # Thread Safety
///
/// Only the orchestration thread acquires and presents.
pub struct Swapchain {
    device: Arc<Device>,
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Creates a FIFO swapchain requesting `image_count` images.
    ///
    /// The driver may return more images than requested; never fewer than
    /// the surface minimum.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot present, the surface cannot be a
    /// copy destination, or swapchain creation fails.
    pub fn new(
        instance: &Instance,
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        image_count: u32,
    ) -> RhiResult<Self> {
        let present_family = device.present_family().ok_or_else(|| {
            RhiError::Swapchain(format!("{} device cannot present", device.label()))
        })?;
        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), device.handle());
        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());

        let support =
            SurfaceSupport::query(device.physical_device(), surface, &surface_loader)?;
        if !support.accepts_copies() {
            return Err(RhiError::Swapchain(
                "Surface has no formats or cannot be a transfer destination".to_string(),
            ));
        }

        let surface_format = choose_surface_format(&support.formats)?;
        let extent = choose_extent(&support.capabilities, width, height);
        let image_count = clamp_image_count(&support.capabilities, image_count);

        info!(
            "Creating swapchain: {}x{}, format {:?}, FIFO, {} images",
            extent.width, extent.height, surface_format.format, image_count
        );

        let graphics_family = device.graphics_family();
        let queue_family_indices = [graphics_family, present_family];
        let (sharing_mode, families) = if graphics_family != present_family {
            (vk::SharingMode::CONCURRENT, &queue_family_indices[..])
        } else {
            (vk::SharingMode::EXCLUSIVE, &[][..])
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(families)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None)? };
        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };
        info!("Swapchain created with {} images", images.len());

        Ok(Self {
            device,
            swapchain_loader,
            swapchain,
            images,
            format: surface_format.format,
            extent,
        })
    }

    /// Acquires the next presentable image, signaling `semaphore` when it is ready.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<(u32, bool), vk::Result> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    /// Queues `image_index` for presentation after `wait_semaphore`.
    ///
    /// Returns whether the swapchain is suboptimal.
    pub fn present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<bool, vk::Result> {
        let queue = self
            .device
            .present_queue()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.swapchain_loader.queue_present(queue, &present_info) }
    }

    /// Returns the swapchain image format.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Returns the swapchain extent.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Returns the number of swapchain images.
    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Returns the image at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn image(&self, index: usize) -> vk::Image {
        self.images[index]
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            self.swapchain_loader
                .destroy_swapchain(self.swapchain, None);
        }
        debug!("Swapchain destroyed");
    }
}

/// Surface formats whose texels are [`BYTES_PER_PIXEL`] wide, best first.
///
/// The shared slots are laid out for that texel size, so the relayed bytes
/// are copied into the back buffer without conversion.
const RELAY_FORMATS: [vk::Format; 4] = [
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_SRGB,
];

/// Picks the first offered format from [`RELAY_FORMATS`].
///
/// Any other format would overrun the slot buffers, so there is no fallback.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> RhiResult<vk::SurfaceFormatKHR> {
    for wanted in RELAY_FORMATS {
        if let Some(&format) = formats.iter().find(|f| f.format == wanted) {
            return Ok(format);
        }
    }

    let offered: Vec<vk::Format> = formats.iter().map(|f| f.format).collect();
    Err(RhiError::Swapchain(format!(
        "no {BYTES_PER_PIXEL}-byte surface format offered: {offered:?}"
    )))
}

/// Uses the surface's current extent when defined, otherwise clamps the request.
fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Clamps the requested image count to the surface limits. A maximum of zero means unbounded.
fn clamp_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn test_choose_surface_format_prefers_rgba() {
        let formats = [
            format(vk::Format::B8G8R8A8_SRGB),
            format(vk::Format::B8G8R8A8_UNORM),
            format(vk::Format::R8G8B8A8_UNORM),
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
    }

    #[test]
    fn test_choose_surface_format_accepts_bgra() {
        let formats = [
            format(vk::Format::B8G8R8A8_SRGB),
            format(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_UNORM
        );
    }

    #[test]
    fn test_choose_surface_format_accepts_srgb_only() {
        let formats = [format(vk::Format::B8G8R8A8_SRGB)];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn test_choose_surface_format_rejects_wide_texels() {
        let formats = [format(vk::Format::R16G16B16A16_SFLOAT)];
        assert!(matches!(
            choose_surface_format(&formats),
            Err(RhiError::Swapchain(_))
        ));
    }

    #[test]
    fn test_choose_surface_format_rejects_packed_formats() {
        let formats = [
            format(vk::Format::A2B10G10R10_UNORM_PACK32),
            format(vk::Format::R16G16B16A16_SFLOAT),
        ];
        assert!(choose_surface_format(&formats).is_err());
    }

    #[test]
    fn test_choose_extent_uses_current() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };
        let extent = choose_extent(&capabilities, 1920, 1080);
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn test_choose_extent_clamps_to_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2160,
            },
            ..Default::default()
        };
        let extent = choose_extent(&capabilities, 7680, 3744);
        assert_eq!((extent.width, extent.height), (4096, 2160));
    }

    #[test]
    fn test_clamp_image_count() {
        let mut capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(clamp_image_count(&capabilities, 3), 3);
        assert_eq!(clamp_image_count(&capabilities, 1), 2);

        capabilities.max_image_count = 2;
        assert_eq!(clamp_image_count(&capabilities, 3), 2);
    }

    #[test]
    fn test_support_requires_transfer_dst() {
        let support = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                ..Default::default()
            },
            formats: vec![format(vk::Format::R8G8B8A8_UNORM)],
        };
        assert!(!support.accepts_copies());
    }
}
