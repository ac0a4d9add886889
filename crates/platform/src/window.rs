//! The fixed-size presentation window and the Vulkan surface behind it.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window as WinitWindow, WindowAttributes};

use relay_core::{Error, Result};

/// Presentation surface owned by the consumer side.
///
/// Destroyed on drop. The instance it came from must still be alive, and the
/// swapchain built on it has to go first.
pub struct Surface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Raw handle, for swapchain creation.
    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Extension loader for present-support and capability queries.
    #[inline]
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // SAFETY: the handle was created by ash_window::create_surface from the
        // same instance as the loader, and is destroyed only here.
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
        tracing::debug!("Presentation surface destroyed");
    }
}

/// The presentation window.
///
/// The window has a fixed size matching the shared surfaces; the relay does
/// not recreate its swapchain.
pub struct Window {
    handle: Arc<WinitWindow>,
    width: u32,
    height: u32,
}

impl Window {
    /// Create a non-resizable window with the given dimensions and title.
    pub fn new(event_loop: &ActiveEventLoop, width: u32, height: u32, title: &str) -> Result<Self> {
        let attributes = WindowAttributes::default()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .with_resizable(false);

        let window = event_loop
            .create_window(attributes)
            .map_err(|e| Error::Window(e.to_string()))?;

        let size = window.inner_size();
        if size.width != width || size.height != height {
            tracing::warn!(
                "Window created at {}x{} instead of the requested {}x{}",
                size.width,
                size.height,
                width,
                height
            );
        }
        tracing::info!(width, height, title, "Relay window opened");

        Ok(Self {
            handle: Arc::new(window),
            width,
            height,
        })
    }

    /// Width requested for the window and the shared surfaces.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height requested for the window and the shared surfaces.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Schedule the next frame.
    pub fn request_redraw(&self) {
        self.handle.request_redraw();
    }

    /// Build the presentation surface the consumer swapchain targets.
    ///
    /// # Errors
    /// Returns [`Error::Window`] if the raw handles are unavailable or the
    /// surface cannot be created.
    pub fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> Result<Surface> {
        let display_handle = self
            .handle
            .display_handle()
            .map_err(|e| Error::Window(format!("no display handle: {e}")))?;

        let window_handle = self
            .handle
            .window_handle()
            .map_err(|e| Error::Window(format!("no window handle: {e}")))?;

        // SAFETY: entry and instance are valid, the handles come from a live
        // winit window, and the surface is destroyed in Surface::drop.
        let handle = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| Error::Window(format!("surface creation failed: {e}")))?
        };

        let loader = ash::khr::surface::Instance::new(entry, instance);

        tracing::info!("Presentation surface ready");

        Ok(Surface {
            handle,
            loader,
        })
    }
}
