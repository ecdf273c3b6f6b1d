//! Vertex input templates.
//!
//! Renderers pick their vertex layout by enum instead of spelling out raw
//! attribute descriptions for the common cases. Each template maps to a
//! `#[repr(C)]` + `Pod` struct and the matching Vulkan input descriptions;
//! an instance template appends an instance-rate binding whose locations
//! continue after the vertex template's.

use std::mem::{offset_of, size_of};

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

/// Per-vertex layout selection.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum VertexTemplate {
    /// Caller supplies explicit binding/attribute descriptions.
    #[default]
    None,
    Position2d,
    Position2dTextured,
    Position2dTexturedMaterial,
    Full3dMaterial,
}

/// Per-instance layout selection.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum InstanceTemplate {
    #[default]
    None,
    /// One `u32` id per instance, bound at binding 1.
    SingleId,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct Vertex2d {
    pub position: Vec2,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct Vertex2dTextured {
    pub position: Vec2,
    pub tex_coord: Vec2,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct Vertex2dTexturedMaterial {
    pub position: Vec2,
    pub tex_coord: Vec2,
    pub material_id: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct Vertex3dMaterial {
    pub position: Vec3,
    pub normal: Vec3,
    pub tangent: Vec3,
    pub tex_coord: Vec2,
    pub material_id: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct InstanceSingleId {
    pub id: u32,
}

const VERTEX_BINDING: u32 = 0;
const INSTANCE_BINDING: u32 = 1;

fn attr(location: u32, binding: u32, format: vk::Format, offset: u32) -> vk::VertexInputAttributeDescription {
    vk::VertexInputAttributeDescription {
        location,
        binding,
        format,
        offset,
    }
}

fn binding(binding: u32, stride: u32, rate: vk::VertexInputRate) -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription {
        binding,
        stride,
        input_rate: rate,
    }
}

impl VertexTemplate {
    pub fn binding_description(self) -> Option<vk::VertexInputBindingDescription> {
        let stride = match self {
            VertexTemplate::None => return None,
            VertexTemplate::Position2d => size_of::<Vertex2d>(),
            VertexTemplate::Position2dTextured => size_of::<Vertex2dTextured>(),
            VertexTemplate::Position2dTexturedMaterial => size_of::<Vertex2dTexturedMaterial>(),
            VertexTemplate::Full3dMaterial => size_of::<Vertex3dMaterial>(),
        };
        Some(binding(VERTEX_BINDING, stride as u32, vk::VertexInputRate::VERTEX))
    }

    pub fn attribute_descriptions(self) -> Vec<vk::VertexInputAttributeDescription> {
        const F32X2: vk::Format = vk::Format::R32G32_SFLOAT;
        const F32X3: vk::Format = vk::Format::R32G32B32_SFLOAT;
        const U32X1: vk::Format = vk::Format::R32_UINT;
        match self {
            VertexTemplate::None => Vec::new(),
            VertexTemplate::Position2d => vec![attr(
                0,
                VERTEX_BINDING,
                F32X2,
                offset_of!(Vertex2d, position) as u32,
            )],
            VertexTemplate::Position2dTextured => vec![
                attr(0, VERTEX_BINDING, F32X2, offset_of!(Vertex2dTextured, position) as u32),
                attr(1, VERTEX_BINDING, F32X2, offset_of!(Vertex2dTextured, tex_coord) as u32),
            ],
            VertexTemplate::Position2dTexturedMaterial => vec![
                attr(
                    0,
                    VERTEX_BINDING,
                    F32X2,
                    offset_of!(Vertex2dTexturedMaterial, position) as u32,
                ),
                attr(
                    1,
                    VERTEX_BINDING,
                    F32X2,
                    offset_of!(Vertex2dTexturedMaterial, tex_coord) as u32,
                ),
                attr(
                    2,
                    VERTEX_BINDING,
                    U32X1,
                    offset_of!(Vertex2dTexturedMaterial, material_id) as u32,
                ),
            ],
            VertexTemplate::Full3dMaterial => vec![
                attr(0, VERTEX_BINDING, F32X3, offset_of!(Vertex3dMaterial, position) as u32),
                attr(1, VERTEX_BINDING, F32X3, offset_of!(Vertex3dMaterial, normal) as u32),
                attr(2, VERTEX_BINDING, F32X3, offset_of!(Vertex3dMaterial, tangent) as u32),
                attr(3, VERTEX_BINDING, F32X2, offset_of!(Vertex3dMaterial, tex_coord) as u32),
                attr(
                    4,
                    VERTEX_BINDING,
                    U32X1,
                    offset_of!(Vertex3dMaterial, material_id) as u32,
                ),
            ],
        }
    }
}

/// Resolves a template pair plus caller-supplied explicit descriptions into
/// the pipeline's vertex input state. Explicit descriptions come first;
/// instance attributes take the locations after the last template attribute.
pub fn resolve_vertex_input(
    template: VertexTemplate,
    instance: InstanceTemplate,
    explicit_bindings: &[vk::VertexInputBindingDescription],
    explicit_attributes: &[vk::VertexInputAttributeDescription],
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let mut bindings = explicit_bindings.to_vec();
    let mut attributes = explicit_attributes.to_vec();
    if let Some(b) = template.binding_description() {
        bindings.push(b);
    }
    attributes.extend(template.attribute_descriptions());
    if instance == InstanceTemplate::SingleId {
        bindings.push(binding(
            INSTANCE_BINDING,
            size_of::<InstanceSingleId>() as u32,
            vk::VertexInputRate::INSTANCE,
        ));
        let next_location = attributes.iter().map(|a| a.location + 1).max().unwrap_or(0);
        attributes.push(attr(
            next_location,
            INSTANCE_BINDING,
            vk::Format::R32_UINT,
            offset_of!(InstanceSingleId, id) as u32,
        ));
    }
    (bindings, attributes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_3d_material_layout() {
        let attrs = VertexTemplate::Full3dMaterial.attribute_descriptions();
        assert_eq!(attrs.len(), 5);
        assert_eq!(attrs[3].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attrs[3].offset, 36);
        assert_eq!(attrs[4].format, vk::Format::R32_UINT);
        assert_eq!(attrs[4].offset, 44);
        let b = VertexTemplate::Full3dMaterial.binding_description().unwrap();
        assert_eq!(b.stride, 48);
        assert_eq!(b.input_rate, vk::VertexInputRate::VERTEX);
    }

    #[test]
    fn instance_template_continues_locations() {
        let (bindings, attrs) = resolve_vertex_input(
            VertexTemplate::Position2dTextured,
            InstanceTemplate::SingleId,
            &[],
            &[],
        );
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[1].binding, 1);
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
        let instance_attr = attrs.last().unwrap();
        assert_eq!(instance_attr.location, 2);
        assert_eq!(instance_attr.binding, 1);
        assert_eq!(instance_attr.format, vk::Format::R32_UINT);
    }

    #[test]
    fn explicit_descriptions_pass_through() {
        let explicit = [binding(0, 12, vk::VertexInputRate::VERTEX)];
        let (bindings, attrs) =
            resolve_vertex_input(VertexTemplate::None, InstanceTemplate::None, &explicit, &[]);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 12);
        assert!(attrs.is_empty());
    }
}
