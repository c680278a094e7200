// =============================================================================
// FRAME CYCLE - Vulkan acquire / render / present loop
// =============================================================================
//
// Draws a single triangle into a rotating set of swapchain images.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit App (window, resize, redraw)                             │
// │    └── FrameCycle (acquire → record → submit → present)         │
// │          ├── SurfaceSet (swapchain, views, framebuffers)        │
// │          ├── FrameSlot per image (fence, commands, semaphores)  │
// │          └── SemaphorePool (recycled acquire semaphores)        │
// │    └── VulkanContext (GpuContext over ash)                      │
// │          └── VulkanDevice (instance, surface, device, queue)    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Acquire swapchain image with a pooled semaphore
// 2. Wait for that image's previous submission, reset its command pool
// 3. Record clear + triangle draw
// 4. Submit, signalling the image's release semaphore and fence
// 5. Present; stale surfaces are rebuilt
//
// =============================================================================

mod backend;
mod config;
mod frame;

use anyhow::Result;
use ash::vk;
use backend::{GpuContext, VulkanContext, VulkanDevice};
use config::{Config, ConfigWatcher, CONFIG_PATH};
use frame::{FrameCycle, FrameStatus};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting frame cycle renderer");
    log::info!("Window: {}x{}", config.window.width, config.window.height);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging, optionally into the configured log file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};

    let mut builder = Builder::from_default_env();
    builder.filter_level(config.log_level());

    let mut file_error = None;
    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Frame Cycle Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => file_error = Some(e),
        }
    }

    builder.init();

    if let Some(e) = file_error {
        log::warn!("Could not open log file {}: {}. Logging to stderr.", config.debug.log_file, e);
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The frame cycle holds the
/// device, which holds the surface, so it has to go before the window.
pub struct App {
    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // HOT RELOAD
    // ─────────────────────────────────────────────────────────────────────────
    /// Written by the config watcher thread, read once per frame
    clear_color: Arc<Mutex<[f32; 4]>>,
    _config_watcher: Option<ConfigWatcher>,

    // ─────────────────────────────────────────────────────────────────────────
    // VULKAN
    // ─────────────────────────────────────────────────────────────────────────
    frame_cycle: Option<FrameCycle<VulkanContext>>,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Window>,
    /// Window has zero area, nothing can be presented
    is_minimized: bool,
}

impl App {
    pub fn new(config: Config) -> Self {
        let clear_color = Arc::new(Mutex::new(config.graphics.clear_color));

        let config_watcher = if config.debug.watch_config {
            ConfigWatcher::spawn(CONFIG_PATH, clear_color.clone())
                .map_err(|e| log::warn!("Config hot reload disabled: {:#}", e))
                .ok()
        } else {
            None
        };

        Self {
            config,
            clear_color,
            _config_watcher: config_watcher,
            frame_cycle: None,
            window: None,
            is_minimized: false,
        }
    }

    /// Device, pipeline, first surface set and frame slots
    fn init_vulkan(&self, window: &Window) -> Result<FrameCycle<VulkanContext>> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(&self.config.window.title, enable_validation, window)?;
        let context = VulkanContext::new(device, &self.config.graphics.shader_dir)?;

        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        let mut frame_cycle = FrameCycle::new(context, extent)?;
        frame_cycle.set_clear_color(*self.clear_color.lock());

        log::info!(
            "Vulkan initialized: {} swapchain images at {}x{}",
            frame_cycle.image_count(),
            frame_cycle.extent().width,
            frame_cycle.extent().height
        );
        Ok(frame_cycle)
    }

    fn render(&mut self, event_loop: &ActiveEventLoop) {
        if self.is_minimized {
            return;
        }
        let Some(frame_cycle) = self.frame_cycle.as_mut() else {
            return;
        };

        frame_cycle.set_clear_color(*self.clear_color.lock());
        match frame_cycle.render_frame() {
            Ok(FrameStatus::Presented) => {}
            Ok(status) => log::debug!("Frame {} not presented: {:?}", frame_cycle.frame_index(), status),
            Err(e) => {
                log::error!("Render error: {:#}", e);
                self.exit_if_lost(event_loop);
            }
        }
    }

    /// A frame cycle without a surface set can't render again, so stop
    /// instead of retrying every redraw.
    fn exit_if_lost(&self, event_loop: &ActiveEventLoop) {
        if self.frame_cycle.as_ref().is_some_and(FrameCycle::is_shut_down) {
            log::error!("Swapchain could not be rebuilt, exiting");
            event_loop.exit();
        }
    }

    fn exit(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(ref frame_cycle) = self.frame_cycle {
            if let Err(e) = frame_cycle.context().device_wait_idle() {
                log::error!("Failed to wait for device idle: {:#}", e);
            }
        }
        event_loop.exit();
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => w,
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match self.init_vulkan(&window) {
            Ok(frame_cycle) => self.frame_cycle = Some(frame_cycle),
            Err(e) => {
                log::error!("Failed to initialize Vulkan: {:#}", e);
                event_loop.exit();
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.exit(event_loop);
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                self.is_minimized = size.width == 0 || size.height == 0;
                if self.is_minimized {
                    return;
                }
                if let Some(frame_cycle) = self.frame_cycle.as_mut() {
                    let extent = vk::Extent2D {
                        width: size.width,
                        height: size.height,
                    };
                    if let Err(e) = frame_cycle.resize(extent) {
                        log::error!("Failed to resize surface set: {:#}", e);
                        self.exit_if_lost(event_loop);
                    }
                }
            }

            WindowEvent::RedrawRequested => self.render(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.exit(event_loop);
                }
            }

            _ => {}
        }
    }

    /// Keep redrawing continuously while there is something to draw into
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.is_minimized {
            return;
        }
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Frame cycle, pipeline, device and surface all go before the window
        if let Some(mut frame_cycle) = self.frame_cycle.take() {
            frame_cycle.shutdown();
        }
        self.window = None;

        log::info!("Cleanup complete");
    }
}
