//! Collaborator interfaces for geometry providers.
//!
//! Model loading, glyph layout and texture upload live in the embedding
//! application; the scene only needs buffer/image handles out of them.

use crate::device::{BufferId, ImageId, SamplerId, UniformBufferId};
use ash::vk;

/// Geometry for one mesh: vertex + index buffer and the index count to draw.
#[derive(Clone, Copy, Debug)]
pub struct VertexBufferRef {
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    pub index_count: u32,
}

/// Per-instance data bound at the instance-rate vertex binding.
#[derive(Clone, Copy, Debug)]
pub struct InstanceBufferRef {
    pub buffer: BufferId,
    pub instance_count: u32,
}

/// A combined image sampler source: image view + sampler pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Texture {
    pub image: ImageId,
    pub sampler: SamplerId,
}

/// A multi-mesh geometry source. Each returned entry becomes one draw; all
/// meshes of a model share the binding resources declared with it.
pub trait Model {
    fn vertex_buffers(&self) -> Vec<VertexBufferRef>;
}

/// A glyph atlas: one image per page plus the sampler used for all of them.
pub struct Font {
    images: Vec<ImageId>,
    sampler: SamplerId,
}

impl Font {
    pub fn new(images: Vec<ImageId>, sampler: SamplerId) -> Self {
        Self { images, sampler }
    }

    pub fn images(&self) -> &[ImageId] {
        &self.images
    }

    pub fn sampler(&self) -> SamplerId {
        self.sampler
    }
}

/// Lays out a string against a font and exposes the resulting geometry and
/// the MVP uniform buffer the vertex shader reads.
pub trait TextGeometry {
    /// Builds (or rebuilds) the glyph quads for the given output extent.
    fn build(&mut self, output_extent: vk::Extent2D, font: &Font, size: f32);
    fn ubo(&self) -> UniformBufferId;
    fn vertex_buffer(&self) -> VertexBufferRef;
}
