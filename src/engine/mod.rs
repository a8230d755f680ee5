// Engine - bootstrap, frame dispatch and teardown
//
// `init` creates every GPU object in dependency order and registers its
// teardown with the deletion queue right after creation. `cleanup` waits for
// the GPU, drains the queue (newest first) and only then releases the device.

pub mod frame;
pub mod target;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::memory;
use crate::backend::pipeline::{self, PipelineBuilder};
use crate::backend::render_pass;
use crate::backend::shader::load_shader_module;
use crate::backend::swapchain::DepthAttachment;
use crate::backend::sync::{CommandContext, SyncSet};
use crate::backend::{DeletionQueue, EngineError, Gate, Swapchain, VulkanDevice};
use crate::config::Config;
use crate::mesh::{self, Mesh, Vertex};
use crate::scene::{MeshPushConstants, Scene};

use frame::{FrameEngine, FrameStatus};
use target::VulkanTarget;

/// What the engine needs to know about the window it renders into.
#[derive(Debug, Clone, Copy)]
pub struct WindowTarget {
    pub display_handle: RawDisplayHandle,
    pub window_handle: RawWindowHandle,
    pub extent: vk::Extent2D,
}

/// Engine settings, taken from the config once at construction.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub app_name: String,
    pub validation: bool,
    pub gate: Gate,
    pub frame_timeout: Duration,
    pub clear_depth: f32,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub alt_fragment_shader: PathBuf,
    pub mesh: Option<PathBuf>,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            app_name: config.window.title.clone(),
            validation: config.debug.validation_layers,
            gate: config.gate(),
            frame_timeout: config.frame_timeout(),
            clear_depth: config.graphics.clear_depth,
            vertex_shader: config.assets.vertex_shader.clone(),
            fragment_shader: config.assets.fragment_shader.clone(),
            alt_fragment_shader: config.assets.alt_fragment_shader.clone(),
            mesh: config.assets.mesh.clone(),
        }
    }
}

pub struct Engine {
    settings: EngineSettings,
    frames: Option<FrameEngine<VulkanTarget>>,
    scene: Option<Scene>,
    mesh: Mesh,
    deletion: DeletionQueue,
    // Last: released after the deletion queue has run
    device: Option<Arc<VulkanDevice>>,
    is_ready: bool,
}

impl Engine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            frames: None,
            scene: None,
            mesh: Mesh::default(),
            deletion: DeletionQueue::new(),
            device: None,
            is_ready: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    pub fn frame_number(&self) -> u64 {
        self.frames.as_ref().map_or(0, |f| f.frame_number())
    }

    /// Bring up the device and everything drawn with it. Calling this again
    /// once ready does nothing. On failure, whatever was created is torn down.
    pub fn init(&mut self, window: &WindowTarget) -> Result<(), EngineError> {
        if self.is_ready {
            return Ok(());
        }

        match self.init_vulkan(window) {
            Ok(()) => {
                self.is_ready = true;
                log::info!("Engine initialized");
                Ok(())
            }
            Err(e) => {
                log::error!("Engine init failed: {}", e);
                self.cleanup();
                Err(e)
            }
        }
    }

    fn init_vulkan(&mut self, window: &WindowTarget) -> Result<(), EngineError> {
        let settings = self.settings.clone();
        let gate = settings.gate;
        log::debug!("Fatal errors: {:?}", gate.policy());

        let device = VulkanDevice::new(
            &settings.app_name,
            settings.validation,
            window.display_handle,
            window.window_handle,
            gate,
        )?;
        self.device = Some(Arc::clone(&device));

        let swapchain = Swapchain::new(&device, window.extent)?;
        let extent = swapchain.extent;
        log::info!(
            "Swapchain: {} images, {}x{}",
            swapchain.image_count(),
            extent.width,
            extent.height
        );
        {
            let swapchain = swapchain.clone();
            self.defer("swapchain", &device, move |d| swapchain.destroy(d));
        }

        let depth = DepthAttachment::new(&device, extent)?;
        let depth_view = depth.view;
        self.defer("depth image", &device, move |d| depth.destroy(d));

        let commands = CommandContext::new(&device)?;
        self.defer("command pool", &device, move |d| commands.destroy(&d.device));

        let render_pass = render_pass::create_render_pass(&device, swapchain.format)?;
        self.defer("render pass", &device, move |d| unsafe {
            d.device.destroy_render_pass(render_pass, None)
        });

        let framebuffers = render_pass::create_framebuffers(
            &device,
            render_pass,
            &swapchain.image_views,
            depth_view,
            extent,
        )?;
        {
            let framebuffers = framebuffers.clone();
            self.defer("framebuffers", &device, move |d| {
                render_pass::destroy_framebuffers(d, &framebuffers)
            });
        }

        let sync = SyncSet::new(&device)?;
        self.defer("sync objects", &device, move |d| sync.destroy(&d.device));

        let layout = pipeline::create_pipeline_layout(&device, &[MeshPushConstants::range()])?;
        self.defer("pipeline layout", &device, move |d| unsafe {
            d.device.destroy_pipeline_layout(layout, None)
        });

        let pipelines = build_mesh_pipelines(&settings, &device, extent, layout, render_pass)?;
        for &pipeline in &pipelines {
            self.defer("pipeline", &device, move |d| unsafe {
                d.device.destroy_pipeline(pipeline, None)
            });
        }

        let mut mesh = load_mesh(settings.mesh.as_deref());
        let vertex_buffer =
            mesh::upload_mesh(&device, &mut mesh).map_err(|e| gate.fatal(e.into()))?;
        self.defer("vertex buffer", &device, move |d| {
            memory::destroy_buffer(d, vertex_buffer)
        });
        self.mesh = mesh;

        self.scene = Some(Scene::new(extent, layout, pipelines, settings.clear_depth));

        let target = VulkanTarget::new(
            Arc::clone(&device),
            swapchain,
            render_pass,
            framebuffers,
            sync,
            commands,
        );
        self.frames = Some(FrameEngine::new(target, settings.frame_timeout));

        Ok(())
    }

    /// Register `destroy` to run against the device at teardown.
    fn defer(
        &mut self,
        label: &'static str,
        device: &Arc<VulkanDevice>,
        destroy: impl FnOnce(&VulkanDevice) + 'static,
    ) {
        let device = Arc::clone(device);
        self.deletion.push(label, move || destroy(device.as_ref()));
    }

    /// Draw one frame. `minimized` skips all GPU work.
    pub fn draw(&mut self, minimized: bool) -> Result<FrameStatus, EngineError> {
        let (Some(frames), Some(scene)) = (self.frames.as_mut(), self.scene.as_ref()) else {
            return Err(EngineError::NotInitialized);
        };
        let mesh = &self.mesh;

        frames.draw_frame(minimized, |frame_number| scene.draw_packet(frame_number, mesh))
    }

    pub fn toggle_pipeline(&mut self) {
        if let Some(scene) = self.scene.as_mut() {
            scene.toggle_pipeline();
        }
    }

    /// Wait for the GPU, destroy everything in reverse creation order, then
    /// release the device. Does nothing if nothing was created.
    pub fn cleanup(&mut self) {
        if self.device.is_none() && self.deletion.is_empty() {
            return;
        }
        log::info!("Cleaning up Vulkan resources...");

        // Teardown waits only report: everything below must run regardless
        if let Some(frames) = self.frames.as_mut() {
            if !frames.wait_for_last_frame() {
                log::warn!("Last frame did not finish, tearing down anyway");
            }
        }
        if let Some(device) = &self.device {
            device.wait_idle();
        }

        self.frames = None;
        self.scene = None;
        self.deletion.flush();
        self.mesh = Mesh::default();
        self.device = None;
        self.is_ready = false;

        log::info!("Cleanup complete");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Build the primary mesh pipeline and the alternate-shaded variant from one
/// builder. Only the primary is required; the variant is dropped with a
/// warning if its shader or build fails.
fn build_mesh_pipelines(
    settings: &EngineSettings,
    device: &VulkanDevice,
    extent: vk::Extent2D,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
) -> Result<Vec<vk::Pipeline>, EngineError> {
    let gate = settings.gate;
    let destroy_module = |module: vk::ShaderModule| unsafe {
        device.device.destroy_shader_module(module, None)
    };

    let vert = load_shader_module(device, &settings.vertex_shader)
        .map_err(|e| gate.fatal(e.into()))?;
    let frag = match load_shader_module(device, &settings.fragment_shader) {
        Ok(module) => module,
        Err(e) => {
            destroy_module(vert);
            return Err(gate.fatal(e.into()));
        }
    };
    let alt_frag = match load_shader_module(device, &settings.alt_fragment_shader) {
        Ok(module) => Some(module),
        Err(e) => {
            log::warn!("Alternate fragment shader unavailable: {}", e);
            None
        }
    };

    let mut builder = PipelineBuilder::new(extent, layout);
    builder
        .set_vertex_input(Vertex::description())
        .add_shader_stage(vk::ShaderStageFlags::VERTEX, vert)
        .add_shader_stage(vk::ShaderStageFlags::FRAGMENT, frag);
    let primary = builder.build(device, render_pass);

    let alternate = match (&primary, alt_frag) {
        (Ok(_), Some(module)) => {
            builder
                .clear_shader_stages()
                .add_shader_stage(vk::ShaderStageFlags::VERTEX, vert)
                .add_shader_stage(vk::ShaderStageFlags::FRAGMENT, module);
            match builder.build(device, render_pass) {
                Ok(pipeline) => Some(pipeline),
                Err(e) => {
                    log::warn!("Alternate pipeline failed, keeping the primary only: {}", e);
                    None
                }
            }
        }
        _ => None,
    };

    // Modules are only needed while pipelines are created
    for module in [Some(vert), Some(frag), alt_frag].into_iter().flatten() {
        destroy_module(module);
    }

    let primary = primary.map_err(|e| gate.fatal(e.into()))?;
    log::info!(
        "Built {} mesh pipeline(s)",
        1 + usize::from(alternate.is_some())
    );

    Ok(std::iter::once(primary).chain(alternate).collect())
}

/// The configured OBJ, or the built-in triangle if there is none or it
/// cannot be imported.
fn load_mesh(path: Option<&std::path::Path>) -> Mesh {
    match path {
        Some(path) => Mesh::load_obj(path).unwrap_or_else(|e| {
            log::warn!("{}. Drawing the built-in triangle instead", e);
            Mesh::triangle()
        }),
        None => Mesh::triangle(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::new(EngineSettings::from_config(&Config::default()))
    }

    #[test]
    fn settings_follow_config() {
        let config = Config::parse("[graphics]\nframe_timeout_ms = 250\nclear_depth = 0.5").unwrap();
        let settings = EngineSettings::from_config(&config);
        assert_eq!(settings.frame_timeout, Duration::from_millis(250));
        assert_eq!(settings.clear_depth, 0.5);
        assert_eq!(settings.app_name, "QC Engine");
    }

    #[test]
    fn uninitialized_engine_refuses_to_draw() {
        let mut engine = engine();
        assert!(!engine.is_ready());
        assert!(matches!(engine.draw(false), Err(EngineError::NotInitialized)));
        assert_eq!(engine.frame_number(), 0);
    }

    #[test]
    fn cleanup_without_init_is_a_no_op() {
        let mut engine = engine();
        engine.toggle_pipeline();
        engine.cleanup();
        engine.cleanup();
        assert!(!engine.is_ready());
    }

    #[test]
    fn missing_mesh_file_falls_back_to_triangle() {
        let mesh = load_mesh(Some(std::path::Path::new("no/such/mesh.obj")));
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(load_mesh(None).vertex_count(), 3);
    }
}
