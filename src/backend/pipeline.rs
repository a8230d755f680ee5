// Graphics pipeline creation
//
// The graphics pipeline defines how vertices are processed and rasterized.
// `PipelineBuilder` holds every piece of fixed-function and shader state as
// a plain value. Fields are set independently, then `build` combines them
// into one immutable pipeline.
//
// Reuse contract: after a build, swapping the shader stages (and, if needed,
// the vertex input) and building again produces a sibling pipeline that
// shares all other state. Clone the builder to keep the original intact.

use ash::vk;
use std::ffi::CStr;
use thiserror::Error;

use super::check::EngineError;
use super::VulkanDevice;

/// Entry point every shader module is expected to export.
const SHADER_ENTRY: &CStr = c"main";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline has no shader stages")]
    NoShaderStages,

    #[error("pipeline layout is not set")]
    NoLayout,

    #[error("vkCreateGraphicsPipelines failed: {0}")]
    Vulkan(vk::Result),
}

/// Device-side pipeline creation, split out so the builder can be driven
/// without a GPU.
pub trait PipelineFactory {
    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> Result<vk::Pipeline, vk::Result>;
}

impl PipelineFactory for VulkanDevice {
    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> Result<vk::Pipeline, vk::Result> {
        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(info), None)
        }
        .map_err(|(_, e)| e)?;

        Ok(pipelines[0])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
}

/// Vertex buffer bindings and the attributes read from them.
#[derive(Debug, Clone, Default)]
pub struct VertexInputDescription {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
    pub flags: vk::PipelineVertexInputStateCreateFlags,
}

#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    pub shader_stages: Vec<ShaderStage>,
    pub vertex_input: VertexInputDescription,
    pub topology: vk::PrimitiveTopology,
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
    pub rasterizer: vk::PipelineRasterizationStateCreateInfo,
    pub multisampling: vk::PipelineMultisampleStateCreateInfo,
    pub color_blend_attachment: vk::PipelineColorBlendAttachmentState,
    pub depth_stencil: vk::PipelineDepthStencilStateCreateInfo,
    pub layout: vk::PipelineLayout,
}

impl PipelineBuilder {
    /// Builder covering `extent` with opaque, depth-tested, filled triangles
    /// and no shader stages yet.
    pub fn new(extent: vk::Extent2D, layout: vk::PipelineLayout) -> Self {
        Self {
            shader_stages: Vec::new(),
            vertex_input: VertexInputDescription::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            viewport: vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            scissor: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            rasterizer: rasterization_state(vk::PolygonMode::FILL),
            multisampling: multisampling_state(),
            color_blend_attachment: color_blend_attachment_state(),
            depth_stencil: depth_stencil_state(true, true, vk::CompareOp::LESS_OR_EQUAL),
            layout,
        }
    }

    pub fn add_shader_stage(
        &mut self,
        stage: vk::ShaderStageFlags,
        module: vk::ShaderModule,
    ) -> &mut Self {
        self.shader_stages.push(ShaderStage { stage, module });
        self
    }

    /// Partial reset between variant builds. Everything else is kept.
    pub fn clear_shader_stages(&mut self) -> &mut Self {
        self.shader_stages.clear();
        self
    }

    pub fn set_vertex_input(&mut self, vertex_input: VertexInputDescription) -> &mut Self {
        self.vertex_input = vertex_input;
        self
    }

    /// Assemble the configured state into a pipeline for subpass 0 of
    /// `render_pass`.
    ///
    /// Missing stages or layout are rejected before the device is involved.
    /// A device failure is logged and returned; the caller chooses between a
    /// fallback pipeline and giving up.
    pub fn build<F: PipelineFactory + ?Sized>(
        &self,
        factory: &F,
        render_pass: vk::RenderPass,
    ) -> Result<vk::Pipeline, PipelineError> {
        if self.shader_stages.is_empty() {
            log::error!("Refusing to build a pipeline without shader stages");
            return Err(PipelineError::NoShaderStages);
        }
        if self.layout == vk::PipelineLayout::null() {
            log::error!("Refusing to build a pipeline without a layout");
            return Err(PipelineError::NoLayout);
        }

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = self
            .shader_stages
            .iter()
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(s.stage)
                    .module(s.module)
                    .name(SHADER_ENTRY)
                    .build()
            })
            .collect();

        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .flags(self.vertex_input.flags)
            .vertex_binding_descriptions(&self.vertex_input.bindings)
            .vertex_attribute_descriptions(&self.vertex_input.attributes);

        let input_assembly = input_assembly_state(self.topology);

        // One viewport and one scissor, always
        let viewports = [self.viewport];
        let scissors = [self.scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewports)
            .scissors(&scissors);

        // Attachments must match the fragment shader outputs
        let color_blend_attachments = [self.color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&self.rasterizer)
            .multisample_state(&self.multisampling)
            .depth_stencil_state(&self.depth_stencil)
            .color_blend_state(&color_blending)
            .layout(self.layout)
            .render_pass(render_pass)
            .subpass(0)
            .base_pipeline_handle(vk::Pipeline::null())
            .build();

        match factory.create_graphics_pipeline(&pipeline_info) {
            Ok(pipeline) if pipeline != vk::Pipeline::null() => Ok(pipeline),
            Ok(_) => {
                log::error!("Failed to create pipeline: driver returned a null handle");
                Err(PipelineError::Vulkan(vk::Result::ERROR_UNKNOWN))
            }
            Err(e) => {
                log::error!("Failed to create pipeline: {}", e);
                Err(PipelineError::Vulkan(e))
            }
        }
    }
}

/// Layout with the given push constant ranges and no descriptor sets.
pub fn create_pipeline_layout(
    device: &VulkanDevice,
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout, EngineError> {
    let layout_info =
        vk::PipelineLayoutCreateInfo::builder().push_constant_ranges(push_constant_ranges);

    device.gate.check(
        unsafe { device.device.create_pipeline_layout(&layout_info, None) },
        "vkCreatePipelineLayout",
    )
}

pub fn input_assembly_state(
    topology: vk::PrimitiveTopology,
) -> vk::PipelineInputAssemblyStateCreateInfo {
    vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(topology)
        .primitive_restart_enable(false)
        .build()
}

/// No culling, clockwise front faces, 1px lines.
pub fn rasterization_state(polygon_mode: vk::PolygonMode) -> vk::PipelineRasterizationStateCreateInfo {
    vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(polygon_mode)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false)
        .build()
}

/// MSAA off.
pub fn multisampling_state() -> vk::PipelineMultisampleStateCreateInfo {
    vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .min_sample_shading(1.0)
        .alpha_to_coverage_enable(false)
        .alpha_to_one_enable(false)
        .build()
}

/// Write RGBA, no blending.
pub fn color_blend_attachment_state() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build()
}

pub fn depth_stencil_state(
    depth_test: bool,
    depth_write: bool,
    compare_op: vk::CompareOp,
) -> vk::PipelineDepthStencilStateCreateInfo {
    vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(depth_test)
        .depth_write_enable(depth_write)
        .depth_compare_op(if depth_test {
            compare_op
        } else {
            vk::CompareOp::ALWAYS
        })
        .depth_bounds_test_enable(false)
        .min_depth_bounds(0.0)
        .max_depth_bounds(1.0)
        .stencil_test_enable(false)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Seen {
        stage_count: u32,
        stage_modules: Vec<u64>,
        viewport_count: u32,
        scissor_count: u32,
        attribute_count: u32,
        subpass: u32,
        render_pass: u64,
        layout: u64,
    }

    /// Records what reached the device and hands out increasing handles.
    #[derive(Default)]
    struct FakeDevice {
        seen: RefCell<Vec<Seen>>,
        fail_with: Option<vk::Result>,
    }

    impl PipelineFactory for FakeDevice {
        fn create_graphics_pipeline(
            &self,
            info: &vk::GraphicsPipelineCreateInfo,
        ) -> Result<vk::Pipeline, vk::Result> {
            let seen = unsafe {
                let stages = std::slice::from_raw_parts(info.p_stages, info.stage_count as usize);
                Seen {
                    stage_count: info.stage_count,
                    stage_modules: stages.iter().map(|s| s.module.as_raw()).collect(),
                    viewport_count: (*info.p_viewport_state).viewport_count,
                    scissor_count: (*info.p_viewport_state).scissor_count,
                    attribute_count: (*info.p_vertex_input_state).vertex_attribute_description_count,
                    subpass: info.subpass,
                    render_pass: info.render_pass.as_raw(),
                    layout: info.layout.as_raw(),
                }
            };
            self.seen.borrow_mut().push(seen);

            match self.fail_with {
                Some(e) => Err(e),
                None => Ok(vk::Pipeline::from_raw(0x1000 + self.seen.borrow().len() as u64)),
            }
        }
    }

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 1700,
        height: 900,
    };

    fn layout() -> vk::PipelineLayout {
        vk::PipelineLayout::from_raw(0x77)
    }

    fn module(raw: u64) -> vk::ShaderModule {
        vk::ShaderModule::from_raw(raw)
    }

    fn builder_with_pair() -> PipelineBuilder {
        let mut builder = PipelineBuilder::new(EXTENT, layout());
        builder
            .add_shader_stage(vk::ShaderStageFlags::VERTEX, module(1))
            .add_shader_stage(vk::ShaderStageFlags::FRAGMENT, module(2));
        builder
    }

    #[test]
    fn vertex_fragment_pair_builds_non_null_pipeline() {
        let device = FakeDevice::default();
        let pass = vk::RenderPass::from_raw(0x55);

        let pipeline = builder_with_pair().build(&device, pass).unwrap();

        assert_ne!(pipeline, vk::Pipeline::null());
        let seen = device.seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].stage_count, 2);
        assert_eq!(seen[0].viewport_count, 1);
        assert_eq!(seen[0].scissor_count, 1);
        assert_eq!(seen[0].subpass, 0);
        assert_eq!(seen[0].render_pass, 0x55);
        assert_eq!(seen[0].layout, 0x77);
    }

    #[test]
    fn zero_stages_never_reach_the_device() {
        let device = FakeDevice::default();
        let builder = PipelineBuilder::new(EXTENT, layout());

        let err = builder.build(&device, vk::RenderPass::null()).unwrap_err();

        assert!(matches!(err, PipelineError::NoShaderStages));
        assert!(device.seen.borrow().is_empty());
    }

    #[test]
    fn missing_layout_is_rejected() {
        let device = FakeDevice::default();
        let mut builder = builder_with_pair();
        builder.layout = vk::PipelineLayout::null();

        let err = builder.build(&device, vk::RenderPass::null()).unwrap_err();
        assert!(matches!(err, PipelineError::NoLayout));
        assert!(device.seen.borrow().is_empty());
    }

    #[test]
    fn device_failure_is_returned_not_raised() {
        let device = FakeDevice {
            fail_with: Some(vk::Result::ERROR_INVALID_SHADER_NV),
            ..Default::default()
        };

        let err = builder_with_pair()
            .build(&device, vk::RenderPass::null())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Vulkan(vk::Result::ERROR_INVALID_SHADER_NV)
        ));
    }

    #[test]
    fn rebuild_after_swapping_stages_reuses_fixed_state() {
        let device = FakeDevice::default();
        let pass = vk::RenderPass::from_raw(0x55);
        let mut builder = builder_with_pair();
        builder.vertex_input.attributes.push(vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: 0,
        });

        let first = builder.build(&device, pass).unwrap();

        builder
            .clear_shader_stages()
            .add_shader_stage(vk::ShaderStageFlags::VERTEX, module(1))
            .add_shader_stage(vk::ShaderStageFlags::FRAGMENT, module(3));
        let second = builder.build(&device, pass).unwrap();

        assert_ne!(first, second);
        let seen = device.seen.borrow();
        assert_eq!(seen[0].stage_modules, vec![1, 2]);
        assert_eq!(seen[1].stage_modules, vec![1, 3]);
        assert_eq!(seen[0].attribute_count, 1);
        assert_eq!(seen[1].attribute_count, 1);
        assert_eq!(seen[0].layout, seen[1].layout);
    }

    #[test]
    fn cloned_builder_leaves_original_untouched() {
        let base = builder_with_pair();
        let mut variant = base.clone();
        variant.clear_shader_stages();
        variant.rasterizer = rasterization_state(vk::PolygonMode::LINE);

        assert_eq!(base.shader_stages.len(), 2);
        assert_eq!(base.rasterizer.polygon_mode, vk::PolygonMode::FILL);
        assert!(variant.shader_stages.is_empty());
    }

    #[test]
    fn defaults_cover_the_whole_extent() {
        let builder = PipelineBuilder::new(EXTENT, layout());
        assert_eq!(builder.viewport.width, 1700.0);
        assert_eq!(builder.viewport.height, 900.0);
        assert_eq!(builder.scissor.extent.width, 1700);
        assert_eq!(builder.depth_stencil.depth_test_enable, vk::TRUE);
        assert_eq!(
            builder.color_blend_attachment.color_write_mask,
            vk::ColorComponentFlags::RGBA
        );
    }

    #[test]
    fn input_assembly_never_restarts_primitives() {
        let state = input_assembly_state(vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(state.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(state.primitive_restart_enable, vk::FALSE);
    }

    #[test]
    fn disabled_depth_test_always_passes() {
        let state = depth_stencil_state(false, false, vk::CompareOp::LESS);
        assert_eq!(state.depth_compare_op, vk::CompareOp::ALWAYS);
        assert_eq!(state.depth_write_enable, vk::FALSE);
    }
}
