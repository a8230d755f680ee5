// =============================================================================
// QC RENDERER - Minimal Vulkan mesh renderer
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, keyboard)                            │
// │    └── Engine (bootstrap + deletion queue)                      │
// │          └── Vulkan Device + Surface + Allocator                │
// │                └── Swapchain, depth, render pass, pipelines     │
// │                      └── FrameEngine (one frame in flight)      │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the previous frame's fence
// 2. Acquire swapchain image
// 3. Reset fence and command buffer
// 4. Record clear + mesh draw
// 5. Submit, present, advance frame counter
//
// =============================================================================

mod backend;
mod config;
mod engine;
mod mesh;
mod scene;

use anyhow::{Context, Result};
use ash::vk;
use config::Config;
use engine::{Engine, EngineSettings, WindowTarget};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::fs::OpenOptions;
use std::io::Write;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let (config, config_error) = Config::load();

    init_logging(&config);
    if let Some(e) = config_error {
        log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
    }
    log::info!("Starting QC renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        config.window.title
    );

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config);
    event_loop
        .run_app(&mut app)
        .context("Event loop terminated abnormally")?;

    // Tear down before reporting, so a failed run still releases the GPU
    app.engine.cleanup();

    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env};

    // RUST_LOG wins over the config file
    Builder::from_env(Env::default().default_filter_or(config.debug.log_level.as_str())).init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== QC Renderer Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    window: Option<Window>,
    // Declared after the window but cleaned up explicitly before it
    engine: Engine,
    quit_key: Option<KeyCode>,
    toggle_key: Option<KeyCode>,
    /// First fatal error, returned from main after the loop exits
    failure: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        let engine = Engine::new(EngineSettings::from_config(&config));
        let quit_key = config.quit_key();
        let toggle_key = config.toggle_pipeline_key();
        if quit_key.is_none() {
            log::warn!("Unknown quit key {:?}", config.controls.quit_key);
        }
        if toggle_key.is_none() {
            log::warn!(
                "Unknown pipeline toggle key {:?}",
                config.controls.toggle_pipeline_key
            );
        }

        Self {
            config,
            window: None,
            engine,
            quit_key,
            toggle_key,
            failure: None,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.engine.cleanup();
        self.failure.get_or_insert(error);
        event_loop.exit();
    }

    fn is_minimized(window: &Window) -> bool {
        let size = window.inner_size();
        size.width == 0 || size.height == 0 || window.is_minimized().unwrap_or(false)
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

        // Fixed size: the swapchain is never recreated
        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(false);

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => w,
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        let size = window.inner_size();
        let target = WindowTarget {
            display_handle: window.raw_display_handle(),
            window_handle: window.raw_window_handle(),
            extent: vk::Extent2D {
                width: size.width,
                height: size.height,
            },
        };
        self.window = Some(window);

        if let Err(e) = self.engine.init(&target) {
            self.fail(event_loop, anyhow::Error::new(e).context("Failed to initialize Vulkan"));
        }
    }

    /// Handle window events.
    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::RedrawRequested => {
                if !self.engine.is_ready() {
                    return;
                }
                let minimized = self.window.as_ref().map_or(true, Self::is_minimized);

                if let Err(e) = self.engine.draw(minimized) {
                    self.fail(event_loop, anyhow::Error::new(e).context("Frame failed"));
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() || event.repeat {
                    return;
                }
                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };

                if Some(key) == self.quit_key {
                    log::info!("{:?} pressed, exiting...", key);
                    event_loop.exit();
                } else if Some(key) == self.toggle_key {
                    self.engine.toggle_pipeline();
                }
            }

            _ => {}
        }
    }

    /// Called when the event loop is about to block waiting for events.
    /// Request continuous redraws; FIFO presentation paces them.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        log::info!(
            "Exiting after {} frames",
            self.engine.frame_number()
        );
        // GPU objects reference the surface, which must not outlive the window
        self.engine.cleanup();
    }
}
