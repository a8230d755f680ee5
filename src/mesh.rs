// Mesh and vertex data
//
// The vertex layout here is the one every mesh pipeline consumes:
// one interleaved binding, position / normal / color as three floats each.
// Uploads go straight into host-visible memory. Vertex data is small and
// written once at startup, so there is no staging copy.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use gpu_allocator::MemoryLocation;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::backend::memory::{self, AllocatedBuffer, MemoryError};
use crate::backend::pipeline::VertexInputDescription;
use crate::backend::VulkanDevice;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("failed to import {path:?}: {source}")]
    Import {
        path: PathBuf,
        source: tobj::LoadError,
    },
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub color: Vec3,
}

impl Vertex {
    pub const STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;

    /// Binding 0, per-vertex; locations 0/1/2 = position/normal/color.
    pub fn description() -> VertexInputDescription {
        let binding = vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(Self::STRIDE)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build();

        let attribute = |location: u32, offset: usize| {
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(location)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset as u32)
                .build()
        };

        VertexInputDescription {
            bindings: vec![binding],
            attributes: vec![
                attribute(0, std::mem::offset_of!(Vertex, position)),
                attribute(1, std::mem::offset_of!(Vertex, normal)),
                attribute(2, std::mem::offset_of!(Vertex, color)),
            ],
            flags: vk::PipelineVertexInputStateCreateFlags::empty(),
        }
    }
}

/// CPU-side vertices plus the handle of their GPU copy.
///
/// The GPU buffer itself is owned by the engine's deletion queue; the mesh
/// only remembers the handle for binding.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub vertex_buffer: vk::Buffer,
}

impl Mesh {
    pub fn new(vertices: Vec<Vertex>) -> Self {
        Self {
            vertices,
            vertex_buffer: vk::Buffer::null(),
        }
    }

    /// A single green triangle.
    pub fn triangle() -> Self {
        let green = Vec3::new(0.0, 1.0, 0.0);
        let normal = Vec3::ZERO;
        Self::new(vec![
            Vertex {
                position: Vec3::new(1.0, 1.0, 0.0),
                normal,
                color: green,
            },
            Vertex {
                position: Vec3::new(-1.0, 1.0, 0.0),
                normal,
                color: green,
            },
            Vertex {
                position: Vec3::new(0.0, -1.0, 0.0),
                normal,
                color: green,
            },
        ])
    }

    /// Import an OBJ file as a flat triangle list.
    ///
    /// Vertex colors come from the file when present, otherwise the normal
    /// doubles as the color.
    pub fn load_obj(path: &Path) -> Result<Self, MeshError> {
        let options = tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        };

        let (models, _materials) =
            tobj::load_obj(path, &options).map_err(|source| MeshError::Import {
                path: path.to_path_buf(),
                source,
            })?;

        let mut vertices = Vec::new();
        for model in &models {
            let mesh = &model.mesh;
            let read3 = |data: &[f32], index: usize| -> Option<Vec3> {
                data.get(3 * index..3 * index + 3)
                    .map(|v| Vec3::new(v[0], v[1], v[2]))
            };

            for &index in &mesh.indices {
                let index = index as usize;
                let position = read3(&mesh.positions, index).unwrap_or(Vec3::ZERO);
                let normal = read3(&mesh.normals, index).unwrap_or(Vec3::ZERO);
                let color = read3(&mesh.vertex_color, index).unwrap_or(normal);
                vertices.push(Vertex {
                    position,
                    normal,
                    color,
                });
            }
        }

        log::info!(
            "Imported {:?}: {} models, {} vertices",
            path,
            models.len(),
            vertices.len()
        );
        Ok(Self::new(vertices))
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertices.len() as u32
    }

    /// Size of the GPU copy: vertex count times stride.
    pub fn byte_size(&self) -> vk::DeviceSize {
        self.vertices.len() as vk::DeviceSize * vk::DeviceSize::from(Vertex::STRIDE)
    }
}

/// Copy vertices into a mapped region sized exactly for them.
pub fn write_vertices(dst: &mut [u8], vertices: &[Vertex]) {
    dst.copy_from_slice(bytemuck::cast_slice(vertices));
}

/// Allocate a host-visible vertex buffer for `mesh`, fill it, and record its
/// handle on the mesh. The returned buffer must be handed to the deletion
/// queue by the caller.
pub fn upload_mesh(device: &VulkanDevice, mesh: &mut Mesh) -> Result<AllocatedBuffer, MemoryError> {
    let mut buffer = memory::create_buffer(
        device,
        "vertex buffer",
        mesh.byte_size(),
        vk::BufferUsageFlags::VERTEX_BUFFER,
        MemoryLocation::CpuToGpu,
    )?;

    if let Err(e) = buffer.write(device, |bytes| write_vertices(bytes, &mesh.vertices)) {
        memory::destroy_buffer(device, buffer);
        return Err(e);
    }

    mesh.vertex_buffer = buffer.buffer;
    log::debug!(
        "Uploaded mesh: {} vertices, {} bytes",
        mesh.vertex_count(),
        buffer.size()
    );
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn mesh_of(k: usize) -> Mesh {
        let vertices = (0..k)
            .map(|i| {
                let f = i as f32;
                Vertex {
                    position: Vec3::new(f, f + 0.5, -f),
                    normal: Vec3::new(0.0, 1.0, f * 0.25),
                    color: Vec3::new(f / 7.0, 0.5, 1.0),
                }
            })
            .collect();
        Mesh::new(vertices)
    }

    #[test]
    fn layout_is_nine_packed_floats() {
        assert_eq!(Vertex::STRIDE, 36);

        let desc = Vertex::description();
        assert_eq!(desc.bindings.len(), 1);
        assert_eq!(desc.bindings[0].stride, 36);
        assert_eq!(desc.bindings[0].input_rate, vk::VertexInputRate::VERTEX);

        let offsets: Vec<(u32, u32)> = desc
            .attributes
            .iter()
            .map(|a| (a.location, a.offset))
            .collect();
        assert_eq!(offsets, vec![(0, 0), (1, 12), (2, 24)]);
        assert!(desc
            .attributes
            .iter()
            .all(|a| a.format == vk::Format::R32G32B32_SFLOAT && a.binding == 0));
    }

    #[test]
    fn mapped_copy_is_byte_identical() {
        for k in [0, 1, 3, 10_000] {
            let mesh = mesh_of(k);
            // Allocations round up; the padding must stay untouched
            let mut mapping = vec![0xAAu8; k * 36 + 64];

            let mapped = memory::mapped_range(&mut mapping, mesh.byte_size()).unwrap();
            write_vertices(mapped, &mesh.vertices);

            let (copied, padding) = mapping.split_at(k * 36);
            assert_eq!(copied, bytemuck::cast_slice::<Vertex, u8>(&mesh.vertices));
            assert!(padding.iter().all(|&b| b == 0xAA));
            let back: Vec<Vertex> = copied
                .chunks_exact(36)
                .map(bytemuck::pod_read_unaligned)
                .collect();
            assert_eq!(back, mesh.vertices);
        }
    }

    #[test]
    fn empty_mesh_gets_the_empty_buffer() {
        let mesh = mesh_of(0);
        let buffer = AllocatedBuffer::empty();
        assert_eq!(buffer.size(), mesh.byte_size());
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.buffer, vk::Buffer::null());
    }

    #[test]
    fn empty_mesh_has_zero_size() {
        let mesh = Mesh::new(Vec::new());
        assert_eq!(mesh.byte_size(), 0);
        assert_eq!(mesh.vertex_count(), 0);
        assert_eq!(mesh.vertex_buffer, vk::Buffer::null());
    }

    #[test]
    fn triangle_is_three_green_vertices() {
        let mesh = Mesh::triangle();
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.byte_size(), 108);
        assert!(mesh
            .vertices
            .iter()
            .all(|v| v.color == Vec3::new(0.0, 1.0, 0.0)));
    }

    #[test]
    fn obj_import_uses_normals_as_color() {
        let path = std::env::temp_dir().join(format!("qc-renderer-{}-tri.obj", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "v 0 0 0\nv 1 0 0\nv 0 1 0\nvn 0 0 1\nf 1//1 2//1 3//1").unwrap();
        drop(file);

        let mesh = Mesh::load_obj(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.vertices[1].position, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(mesh.vertices[2].normal, Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(mesh.vertices[2].color, mesh.vertices[2].normal);
    }

    #[test]
    fn missing_obj_is_an_import_error() {
        let err = Mesh::load_obj(Path::new("no/such/model.obj")).unwrap_err();
        assert!(matches!(err, MeshError::Import { .. }));
    }
}
