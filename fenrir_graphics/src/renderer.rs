//! Pipeline + mesh registry for one render pass.
//!
//! A renderer owns one graphics pipeline description and the meshes drawn
//! with it. Declaring is cheap; `create` materializes the pipeline and the
//! per-mesh descriptor sets, and may be called again after more meshes were
//! added without rebuilding anything that already exists.

use std::path::PathBuf;

use ash::vk;

use crate::device::{
    BufferId, CommandBufferId, DescriptorBinding, DescriptorPoolId, DescriptorResources,
    DescriptorSetId, DescriptorWrite, DeviceError, GraphicsPipelineDesc, ImageId, PipelineId,
    RenderDevice, RenderPassId, SamplerId, SetLayoutId, UniformBufferId,
};
use crate::layout::{BufferLayout, ImageLayout, SamplerLayout, TextureLayout, UniformBufferLayout};
use crate::model::{InstanceBufferRef, Texture, VertexBufferRef};

/// Everything needed to build the pipeline, minus the render pass it
/// targets (supplied at `create` time).
#[derive(Clone, Debug)]
pub struct RendererDesc {
    pub vertex_shader: PathBuf,
    pub geometry_shader: Option<PathBuf>,
    pub fragment_shader: Option<PathBuf>,
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
    pub extent: vk::Extent2D,
    pub viewport_scale: [f32; 2],
    pub viewport_offset: [f32; 2],
    pub alpha_blending: Vec<bool>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub depth_test: bool,
    pub conservative_rasterization: bool,
    pub ubo_layouts: Vec<UniformBufferLayout>,
    pub texture_layouts: Vec<TextureLayout>,
    pub image_layouts: Vec<ImageLayout>,
    pub sampler_layouts: Vec<SamplerLayout>,
    pub buffer_layouts: Vec<BufferLayout>,
}

/// Resources one mesh binds, paired with the slots they fill.
#[derive(Clone, Default)]
pub struct MeshBindings {
    pub ubos: Vec<(UniformBufferId, UniformBufferLayout)>,
    pub textures: Vec<(Texture, TextureLayout)>,
    pub images: Vec<(ImageId, ImageLayout)>,
    pub samplers: Vec<(SamplerId, SamplerLayout)>,
    pub buffers: Vec<(BufferId, BufferLayout)>,
}

impl MeshBindings {
    pub fn is_empty(&self) -> bool {
        self.ubos.is_empty()
            && self.textures.is_empty()
            && self.images.is_empty()
            && self.samplers.is_empty()
            && self.buffers.is_empty()
    }
}

pub(crate) struct MeshInfo {
    pub vertex: VertexBufferRef,
    pub instance: Option<InstanceBufferRef>,
    pub bindings: MeshBindings,
    pub descriptor_set: Option<DescriptorSetId>,
}

impl MeshInfo {
    fn needs_descriptor_set(&self) -> bool {
        !self.bindings.is_empty()
    }
}

#[derive(PartialEq, Eq)]
enum BuildState {
    Declared,
    Built,
}

pub struct Renderer {
    desc: RendererDesc,
    set_layout: SetLayoutId,
    state: BuildState,
    pipeline: Option<PipelineId>,
    meshes: Vec<MeshInfo>,
}

impl Renderer {
    /// Stores the description and creates the descriptor set layout from
    /// the aggregated binding slots. The pipeline waits for `create`.
    pub fn new(device: &mut dyn RenderDevice, desc: RendererDesc) -> Result<Self, DeviceError> {
        let bindings = aggregate_bindings(
            &desc.ubo_layouts,
            &desc.texture_layouts,
            &desc.image_layouts,
            &desc.sampler_layouts,
            &desc.buffer_layouts,
        );
        let set_layout = device.create_set_layout(&bindings)?;
        Ok(Self {
            desc,
            set_layout,
            state: BuildState::Declared,
            pipeline: None,
            meshes: Vec::new(),
        })
    }

    pub fn add_mesh(&mut self, vertex: VertexBufferRef, bindings: MeshBindings) {
        self.meshes.push(MeshInfo {
            vertex,
            instance: None,
            bindings,
            descriptor_set: None,
        });
    }

    pub fn add_mesh_instanced(
        &mut self,
        vertex: VertexBufferRef,
        instance: InstanceBufferRef,
        bindings: MeshBindings,
    ) {
        self.meshes.push(MeshInfo {
            vertex,
            instance: Some(instance),
            bindings,
            descriptor_set: None,
        });
    }

    /// Builds the pipeline once, then allocates and writes a descriptor set
    /// for every mesh that binds resources and does not have one yet. Safe
    /// to call repeatedly; already-built objects are left alone.
    pub fn create(
        &mut self,
        device: &mut dyn RenderDevice,
        render_pass: RenderPassId,
        sample_count: vk::SampleCountFlags,
        pool: DescriptorPoolId,
    ) -> Result<(), DeviceError> {
        if self.state == BuildState::Declared {
            let desc = GraphicsPipelineDesc {
                render_pass,
                vertex_shader: self.desc.vertex_shader.clone(),
                geometry_shader: self.desc.geometry_shader.clone(),
                fragment_shader: self.desc.fragment_shader.clone(),
                bindings: self.desc.bindings.clone(),
                attributes: self.desc.attributes.clone(),
                extent: self.desc.extent,
                viewport_scale: self.desc.viewport_scale,
                viewport_offset: self.desc.viewport_offset,
                sample_count,
                alpha_blending: self.desc.alpha_blending.clone(),
                topology: self.desc.topology,
                polygon_mode: self.desc.polygon_mode,
                depth_test: self.desc.depth_test,
                conservative_rasterization: self.desc.conservative_rasterization,
                set_layout: self.set_layout,
            };
            self.pipeline = Some(device.create_graphics_pipeline(&desc)?);
            self.state = BuildState::Built;
        }
        for mesh in &mut self.meshes {
            if mesh.needs_descriptor_set() && mesh.descriptor_set.is_none() {
                let set = device.allocate_descriptor_set(pool, self.set_layout)?;
                device.update_descriptor_set(set, &build_writes(&mesh.bindings))?;
                mesh.descriptor_set = Some(set);
            }
        }
        Ok(())
    }

    /// Records bind + draw for every mesh. Meshes without resources are
    /// drawn without a descriptor-set bind.
    pub fn record(&self, device: &mut dyn RenderDevice, cb: CommandBufferId) {
        let Some(pipeline) = self.pipeline else {
            return;
        };
        device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline);
        for mesh in &self.meshes {
            device.cmd_bind_vertex_buffer(cb, 0, mesh.vertex.vertex_buffer);
            if let Some(instance) = &mesh.instance {
                device.cmd_bind_vertex_buffer(cb, 1, instance.buffer);
            }
            device.cmd_bind_index_buffer(cb, mesh.vertex.index_buffer);
            if let Some(set) = mesh.descriptor_set {
                device.cmd_bind_descriptor_set(cb, vk::PipelineBindPoint::GRAPHICS, pipeline, set);
            }
            let instances = mesh.instance.map_or(1, |i| i.instance_count);
            device.cmd_draw_indexed(cb, mesh.vertex.index_count, instances);
        }
    }

    pub fn pipeline(&self) -> Option<PipelineId> {
        self.pipeline
    }

    pub(crate) fn meshes(&self) -> &[MeshInfo] {
        &self.meshes
    }
}

/// Folds layout declarations into descriptor set layout slots.
///
/// Uniform buffers, combined image samplers and storage buffers keep one
/// slot per entry. Sampled images, storage images and samplers are each
/// coalesced into a single arrayed slot whose binding and stage mask come
/// from the first entry of the group.
pub(crate) fn aggregate_bindings(
    ubos: &[UniformBufferLayout],
    textures: &[TextureLayout],
    images: &[ImageLayout],
    samplers: &[SamplerLayout],
    buffers: &[BufferLayout],
) -> Vec<DescriptorBinding> {
    let mut out = Vec::new();
    for ubo in ubos {
        out.push(DescriptorBinding {
            binding: ubo.binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            count: 1,
            stages: ubo.stages,
        });
    }
    for texture in textures {
        out.push(DescriptorBinding {
            binding: texture.binding,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: 1,
            stages: texture.stages,
        });
    }
    for descriptor_type in [
        vk::DescriptorType::SAMPLED_IMAGE,
        vk::DescriptorType::STORAGE_IMAGE,
    ] {
        let group: Vec<&ImageLayout> = images
            .iter()
            .filter(|i| i.descriptor_type == descriptor_type)
            .collect();
        if let Some(first) = group.first() {
            out.push(DescriptorBinding {
                binding: first.binding,
                descriptor_type,
                count: group.len() as u32,
                stages: first.stages,
            });
        }
    }
    if let Some(first) = samplers.first() {
        out.push(DescriptorBinding {
            binding: first.binding,
            descriptor_type: vk::DescriptorType::SAMPLER,
            count: samplers.len() as u32,
            stages: first.stages,
        });
    }
    for buffer in buffers {
        out.push(DescriptorBinding {
            binding: buffer.binding,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            count: 1,
            stages: buffer.stages,
        });
    }
    out
}

/// Builds the descriptor writes for one mesh, mirroring the aggregation:
/// arrayed slots get one write covering the whole group.
pub(crate) fn build_writes(bindings: &MeshBindings) -> Vec<DescriptorWrite> {
    let mut writes = Vec::new();
    for (ubo, layout) in &bindings.ubos {
        writes.push(DescriptorWrite {
            binding: layout.binding,
            resources: DescriptorResources::UniformBuffer(*ubo),
        });
    }
    for (texture, layout) in &bindings.textures {
        writes.push(DescriptorWrite {
            binding: layout.binding,
            resources: DescriptorResources::CombinedImageSamplers(vec![*texture]),
        });
    }
    for descriptor_type in [
        vk::DescriptorType::SAMPLED_IMAGE,
        vk::DescriptorType::STORAGE_IMAGE,
    ] {
        let group: Vec<_> = bindings
            .images
            .iter()
            .filter(|(_, layout)| layout.descriptor_type == descriptor_type)
            .collect();
        if let Some((_, first)) = group.first() {
            let images: Vec<ImageId> = group.iter().map(|(image, _)| *image).collect();
            writes.push(DescriptorWrite {
                binding: first.binding,
                resources: if descriptor_type == vk::DescriptorType::SAMPLED_IMAGE {
                    DescriptorResources::SampledImages(images)
                } else {
                    DescriptorResources::StorageImages(images)
                },
            });
        }
    }
    if let Some((_, first)) = bindings.samplers.first() {
        writes.push(DescriptorWrite {
            binding: first.binding,
            resources: DescriptorResources::Samplers(
                bindings.samplers.iter().map(|(s, _)| *s).collect(),
            ),
        });
    }
    for (buffer, layout) in &bindings.buffers {
        writes.push(DescriptorWrite {
            binding: layout.binding,
            resources: DescriptorResources::StorageBuffer {
                buffer: *buffer,
                range: layout.range,
            },
        });
    }
    writes
}
