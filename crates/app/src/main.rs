//! Frame Relay - Main Entry Point
//!
//! Renders frames on one GPU, hands them to a second GPU through shared
//! memory and cross-device fences, and presents them there. Copy latency is
//! reported on exit.

use std::fmt;

use anyhow::Context;
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::PhysicalKey;
use winit::window::WindowId;

use relay_core::{RelayConfig, RunClock};
use relay_pipeline::{Coordinator, RelayError, RunSummary, VulkanRelay, write_report};
use relay_platform::{StopKeyWatch, Window};

const WINDOW_TITLE: &str = "Frame Relay";

struct App {
    config: RelayConfig,
    /// Dropped before the window its surface was created from.
    coordinator: Option<Coordinator<VulkanRelay>>,
    window: Option<Window>,
    keys: StopKeyWatch,
    clock: RunClock,
    visibility: Visibility,
}

/// Tracks whether the window can currently show relayed frames.
///
/// A minimized window reports a zero-sized client area. Frames are not
/// relayed then, and the swapchain created at the fixed size is kept for
/// when the window is restored.
#[derive(Debug, Default)]
struct Visibility {
    minimized: bool,
}

impl Visibility {
    /// Applies a resize event. Returns true when the minimized state changed.
    fn on_resized(&mut self, width: u32, height: u32) -> bool {
        let minimized = width == 0 || height == 0;
        let changed = minimized != self.minimized;
        self.minimized = minimized;
        changed
    }

    fn relaying(&self) -> bool {
        !self.minimized
    }
}

impl App {
    fn new(config: RelayConfig) -> Self {
        Self {
            config,
            coordinator: None,
            window: None,
            keys: StopKeyWatch::default(),
            clock: RunClock::start(),
            visibility: Visibility::default(),
        }
    }

    fn frame_limit_reached(&self) -> bool {
        match (self.config.max_frames, &self.coordinator) {
            (Some(limit), Some(coordinator)) => coordinator.frames_submitted() >= limit,
            _ => false,
        }
    }

    /// Drains the relay, writes the report and leaves the event loop.
    fn finish(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(coordinator) = self.coordinator.take() {
            let summary = coordinator.shutdown().unwrap_or_else(|e| fatal_relay(&e));
            self.log_summary(&summary);
            if let Err(e) = write_report(&self.config.report, summary.stats().as_ref()) {
                fatal_relay(&e);
            }
        }
        event_loop.exit();
    }

    fn log_summary(&self, summary: &RunSummary) {
        let elapsed = self.clock.elapsed();
        info!(
            "Relayed {} frame(s) in {:.2}s ({:.1} fps)",
            summary.frames,
            elapsed.as_secs_f64(),
            self.clock.frames_per_second()
        );
        match summary.stats() {
            Some(stats) => info!(
                "Copy latency over {} frame(s): mean {:.4} ms, min {:.4} ms, max {:.4} ms",
                stats.frames, stats.mean_ms, stats.min_ms, stats.max_ms
            ),
            None => info!("No frames retired, no copy latency recorded"),
        }
    }
}

/// Phase a fatal failure belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Setup,
    Relay,
}

fn diagnostic(stage: Stage, error: &dyn fmt::Display) -> String {
    match stage {
        Stage::Setup => format!("Fatal setup failure: {error}"),
        Stage::Relay => format!("Fatal relay failure: {error}"),
    }
}

/// The only exit path for failures: log the diagnostic, then abort.
///
/// This covers configuration validation, window and event loop creation,
/// GPU setup and every frame. Relay errors carry the failing operation and
/// its source location. Malformed arguments never get here: clap prints the
/// usage and exits with status 2 before logging starts.
fn fatal(stage: Stage, error: &dyn fmt::Display) -> ! {
    error!("{}", diagnostic(stage, error));
    std::process::abort();
}

fn fatal_relay(error: &RelayError) -> ! {
    let stage = if error.is_setup() {
        Stage::Setup
    } else {
        Stage::Relay
    };
    fatal(stage, error)
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match Window::new(
            event_loop,
            self.config.width,
            self.config.height,
            WINDOW_TITLE,
        ) {
            Ok(window) => window,
            Err(e) => fatal(Stage::Setup, &e),
        };

        let coordinator = VulkanRelay::new(&window, &self.config)
            .and_then(Coordinator::new)
            .unwrap_or_else(|e| fatal_relay(&e));

        info!("Initialization complete, entering relay loop");
        self.clock = RunClock::start();
        self.coordinator = Some(coordinator);
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                self.finish(event_loop);
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(key) = event.physical_key {
                    if event.state.is_pressed() {
                        self.keys.pressed(key);
                    } else {
                        self.keys.released(key);
                    }
                }
                if self.keys.take_stop() {
                    info!("Stop key pressed, shutting down");
                    self.finish(event_loop);
                }
            }
            WindowEvent::Resized(size) => {
                if self.visibility.on_resized(size.width, size.height) {
                    if self.visibility.relaying() {
                        info!("Window restored, resuming relay");
                    } else {
                        info!("Window minimized, pausing relay");
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                if !self.visibility.relaying() {
                    return;
                }
                if let Some(coordinator) = self.coordinator.as_mut() {
                    if let Err(e) = coordinator.run_frame() {
                        fatal_relay(&e);
                    }
                    self.clock.record_frame();
                }
                if self.frame_limit_reached() {
                    info!("Frame limit reached, shutting down");
                    self.finish(event_loop);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if !self.visibility.relaying() {
            event_loop.set_control_flow(ControlFlow::Wait);
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

fn run() -> anyhow::Result<()> {
    let config = RelayConfig::load().context("load configuration")?;
    info!("Starting frame relay with {:?}", config);

    let event_loop = EventLoop::new().context("create event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app).context("run event loop")?;

    Ok(())
}

fn main() {
    relay_core::init_logging();
    if let Err(e) = run() {
        fatal(Stage::Setup, &format!("{e:#}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimize_pauses_until_restored() {
        let mut visibility = Visibility::default();
        assert!(visibility.relaying());

        assert!(visibility.on_resized(0, 0));
        assert!(!visibility.relaying());
        assert!(!visibility.on_resized(1920, 0));

        assert!(visibility.on_resized(1920, 1080));
        assert!(visibility.relaying());
        assert!(!visibility.on_resized(1920, 1080));
    }

    #[test]
    fn test_config_failure_uses_setup_diagnostic() {
        let error = RelayConfig::from_args(["frame-relay", "--width", "0"])
            .context("load configuration")
            .unwrap_err();
        let message = diagnostic(Stage::Setup, &format!("{error:#}"));
        assert!(message.starts_with("Fatal setup failure: load configuration: "));
        assert!(message.contains("non-zero"));
    }

    #[test]
    fn test_relay_diagnostic() {
        assert_eq!(
            diagnostic(Stage::Relay, &"present"),
            "Fatal relay failure: present"
        );
    }
}
