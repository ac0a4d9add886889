//! Platform layer for the frame relay.
//!
//! This crate provides:
//! - The presentation window via winit
//! - Vulkan surface creation through raw window handles
//! - Stop-key input tracking

mod input;
mod window;

pub use input::{KeyCode, STOP_KEY, StopKeyWatch};
pub use window::{Surface, Window};

// Re-export winit types the application needs
pub use winit::event::WindowEvent;
pub use winit::event_loop::EventLoop;
