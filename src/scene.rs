// Scene policy
//
// Decides what a frame draws: the animated clear color, the mesh transform
// and which of the built pipelines is active. Everything here is a pure
// function of the frame number and the toggle state.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::engine::frame::DrawPacket;
use crate::mesh::Mesh;

/// Frames per radian of the clear-color flash.
pub const FLASH_PERIOD: f32 = 120.0;

/// Degrees the mesh turns per frame.
pub const DEGREES_PER_FRAME: f32 = 0.4;

/// Per-draw data pushed to the vertex stage.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshPushConstants {
    pub render_matrix: Mat4,
}

impl MeshPushConstants {
    /// The single range the mesh pipeline layout declares.
    pub fn range() -> vk::PushConstantRange {
        vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: std::mem::size_of::<Self>() as u32,
        }
    }
}

/// `|sin(frame / 120)|`, drives the blue channel of the clear color.
pub fn flash(frame_number: u64) -> f32 {
    (frame_number as f32 / FLASH_PERIOD).sin().abs()
}

pub fn clear_color(frame_number: u64) -> [f32; 4] {
    [0.0, 0.0, flash(frame_number), 1.0]
}

pub struct Scene {
    extent: vk::Extent2D,
    layout: vk::PipelineLayout,
    pipelines: Vec<vk::Pipeline>,
    selected: usize,
    clear_depth: f32,
}

impl Scene {
    /// `pipelines` must all be built against `layout`; the first is active.
    pub fn new(
        extent: vk::Extent2D,
        layout: vk::PipelineLayout,
        pipelines: Vec<vk::Pipeline>,
        clear_depth: f32,
    ) -> Self {
        Self {
            extent,
            layout,
            pipelines,
            selected: 0,
            clear_depth,
        }
    }

    /// Advance to the next pipeline, wrapping around.
    pub fn toggle_pipeline(&mut self) {
        if !self.pipelines.is_empty() {
            self.selected = (self.selected + 1) % self.pipelines.len();
            log::info!("Active pipeline: {}", self.selected);
        }
    }

    pub fn active_pipeline(&self) -> vk::Pipeline {
        self.pipelines
            .get(self.selected)
            .copied()
            .unwrap_or(vk::Pipeline::null())
    }

    /// Projection * view * model for the given frame.
    pub fn mesh_matrix(&self, frame_number: u64) -> Mat4 {
        let camera_position = Vec3::new(0.0, 0.0, -2.0);
        let view = Mat4::from_translation(camera_position);

        let aspect = self.extent.width as f32 / self.extent.height.max(1) as f32;
        let mut projection = Mat4::perspective_rh(70f32.to_radians(), aspect, 0.1, 200.0);
        // Vulkan clip space has Y pointing down
        projection.y_axis.y *= -1.0;

        let model = Mat4::from_rotation_y((frame_number as f32 * DEGREES_PER_FRAME).to_radians());

        projection * view * model
    }

    /// Everything the frame engine needs to record one frame.
    pub fn draw_packet(&self, frame_number: u64, mesh: &Mesh) -> DrawPacket {
        DrawPacket {
            clear_color: clear_color(frame_number),
            clear_depth: self.clear_depth,
            pipeline: self.active_pipeline(),
            layout: self.layout,
            vertex_buffer: mesh.vertex_buffer,
            vertex_count: mesh.vertex_count(),
            push_constants: MeshPushConstants {
                render_matrix: self.mesh_matrix(frame_number),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 1700,
        height: 900,
    };

    fn scene() -> Scene {
        Scene::new(
            EXTENT,
            vk::PipelineLayout::from_raw(9),
            vec![vk::Pipeline::from_raw(1), vk::Pipeline::from_raw(2)],
            1.0,
        )
    }

    #[test]
    fn flash_follows_abs_sine() {
        for frame in [0u64, 1, 60, 120, 377, 10_000] {
            let expected = (frame as f32 / 120.0).sin().abs();
            assert!((flash(frame) - expected).abs() < 1e-6);
            assert!((0.0..=1.0).contains(&flash(frame)));
        }
        assert_eq!(clear_color(0), [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn push_constants_are_one_matrix_for_the_vertex_stage() {
        let range = MeshPushConstants::range();
        assert_eq!(range.size, 64);
        assert_eq!(range.offset, 0);
        assert_eq!(range.stage_flags, vk::ShaderStageFlags::VERTEX);
    }

    #[test]
    fn toggle_cycles_through_pipelines() {
        let mut scene = scene();
        assert_eq!(scene.active_pipeline().as_raw(), 1);
        scene.toggle_pipeline();
        assert_eq!(scene.active_pipeline().as_raw(), 2);
        scene.toggle_pipeline();
        assert_eq!(scene.active_pipeline().as_raw(), 1);
    }

    #[test]
    fn toggle_without_pipelines_is_harmless() {
        let mut scene = Scene::new(EXTENT, vk::PipelineLayout::null(), Vec::new(), 1.0);
        scene.toggle_pipeline();
        assert_eq!(scene.active_pipeline(), vk::Pipeline::null());
    }

    #[test]
    fn mesh_rotates_with_frames() {
        let scene = scene();
        assert_ne!(scene.mesh_matrix(0), scene.mesh_matrix(100));
        // 900 frames at 0.4 degrees is a full turn
        let a = scene.mesh_matrix(0);
        let b = scene.mesh_matrix(900);
        assert!(a.abs_diff_eq(b, 1e-4));
    }

    #[test]
    fn origin_lands_in_front_of_the_camera() {
        let clip = scene().mesh_matrix(0) * glam::Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip / clip.w;
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        assert!((0.0..=1.0).contains(&ndc.z));
    }

    #[test]
    fn packet_carries_mesh_and_selection() {
        let mut mesh = Mesh::triangle();
        mesh.vertex_buffer = vk::Buffer::from_raw(5);
        let scene = scene();

        let packet = scene.draw_packet(7, &mesh);
        assert_eq!(packet.vertex_count, 3);
        assert_eq!(packet.vertex_buffer.as_raw(), 5);
        assert_eq!(packet.layout.as_raw(), 9);
        assert_eq!(packet.pipeline.as_raw(), 1);
        assert_eq!(packet.clear_depth, 1.0);
        assert_eq!(packet.push_constants.render_matrix, scene.mesh_matrix(7));
    }
}
