//! The scene orchestrator.
//!
//! A scene is declared once (`add_command_buffer`, `add_render_pass`,
//! `add_renderer`, `add_compute_pass`, `add_model`, `add_text`), recorded
//! once (`record`), then replayed every frame (`frame`). Declaration errors
//! go to the injected [`DebugSink`] and leave the scene usable; device
//! failures propagate.

use std::path::PathBuf;

use ash::vk;

use crate::attachment::{resolve_outputs, RenderPassOutput};
use crate::descriptor::DescriptorPool;
use crate::device::{
    CommandBufferId, CommandType, ImageId, QueueId, RenderDevice, SemaphoreId, UniformBufferId,
};
use crate::error::{DebugSink, SceneError, Severity};
use crate::layout::{ImageLayout, SamplerLayout, UniformBufferLayout};
use crate::model::{Font, InstanceBufferRef, Model, TextGeometry};
use crate::render_pass::RenderPass;
use crate::renderer::{MeshBindings, Renderer, RendererDesc};
use crate::vertex::{resolve_vertex_input, InstanceTemplate, VertexTemplate};
use crate::compute::ComputePass;

/// A command buffer declared on the scene. Passes reference it by this id;
/// `None` in those slots means the implicit per-swapchain-image buffer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SceneBufferId(pub usize);

/// Index of a render pass within its scene.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PassIndex(pub usize);

/// Index of a renderer within its render pass.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RendererIndex(pub usize);

/// Index of a compute pass within its scene.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ComputePassIndex(pub usize);

pub struct SceneCreateInfo {
    pub swap_chain_images: Vec<ImageId>,
    pub swap_chain_command_type: CommandType,
    /// Window-presentable images to mirror the swapchain into (one per
    /// swapchain image); empty disables mirroring. Used when the primary
    /// target is an HMD and a desktop window shows a copy.
    pub mirror_images: Vec<ImageId>,
}

#[derive(Clone, Copy, Debug)]
pub struct CommandBufferCreateInfo {
    pub command_type: CommandType,
    /// Last pipeline stage the buffer's work touches; consumers waiting on
    /// this buffer wait at this stage.
    pub final_pipeline_stage: vk::PipelineStageFlags,
}

pub struct RenderPassCreateInfo {
    pub command_buffer: Option<SceneBufferId>,
    pub output_is_swap_chain: bool,
    pub outputs: Vec<RenderPassOutput>,
}

pub struct RendererCreateInfo {
    pub render_pass: PassIndex,
    pub vertex_shader: PathBuf,
    pub geometry_shader: Option<PathBuf>,
    pub fragment_shader: Option<PathBuf>,
    pub vertex_template: VertexTemplate,
    pub instance_template: InstanceTemplate,
    /// Explicit input state, prepended to whatever the templates resolve to.
    pub input_binding_descriptions: Vec<vk::VertexInputBindingDescription>,
    pub input_attribute_descriptions: Vec<vk::VertexInputAttributeDescription>,
    pub ubo_layouts: Vec<UniformBufferLayout>,
    pub texture_layouts: Vec<crate::layout::TextureLayout>,
    pub image_layouts: Vec<ImageLayout>,
    pub sampler_layouts: Vec<SamplerLayout>,
    pub buffer_layouts: Vec<crate::layout::BufferLayout>,
    pub alpha_blending: Vec<bool>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub depth_test: bool,
    pub conservative_rasterization: bool,
    pub viewport_scale: [f32; 2],
    pub viewport_offset: [f32; 2],
}

impl Default for RendererCreateInfo {
    fn default() -> Self {
        Self {
            render_pass: PassIndex(0),
            vertex_shader: PathBuf::new(),
            geometry_shader: None,
            fragment_shader: None,
            vertex_template: VertexTemplate::None,
            instance_template: InstanceTemplate::None,
            input_binding_descriptions: Vec::new(),
            input_attribute_descriptions: Vec::new(),
            ubo_layouts: Vec::new(),
            texture_layouts: Vec::new(),
            image_layouts: Vec::new(),
            sampler_layouts: Vec::new(),
            buffer_layouts: Vec::new(),
            alpha_blending: vec![true],
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            depth_test: true,
            conservative_rasterization: false,
            viewport_scale: [1.0, 1.0],
            viewport_offset: [0.0, 0.0],
        }
    }
}

/// Uniform buffers and storage images one compute dispatch binds.
#[derive(Clone, Default)]
pub struct ComputeBindingSet {
    pub ubos: Vec<(UniformBufferId, UniformBufferLayout)>,
    pub images: Vec<(ImageId, ImageLayout)>,
}

/// Extra commands recorded around a compute dispatch (layout transitions,
/// typically).
pub type RecordHook = Box<dyn Fn(&mut dyn RenderDevice, CommandBufferId)>;

pub struct ComputePassCreateInfo {
    pub command_buffer: Option<SceneBufferId>,
    /// One pipeline instance per swapchain image, with that image appended
    /// as a storage output at `output_binding`.
    pub output_is_swap_chain: bool,
    pub output_binding: u32,
    pub extent: vk::Extent2D,
    pub dispatch_groups: vk::Extent3D,
    pub shader: PathBuf,
    /// One dispatch per set; all sets share the shader and extent.
    pub bindings: Vec<ComputeBindingSet>,
    pub before_record: Option<RecordHook>,
    pub after_record: Option<RecordHook>,
}

pub struct AddModelInfo<'a> {
    pub model: &'a dyn Model,
    pub render_pass: PassIndex,
    pub renderer: RendererIndex,
    /// Bound at the instance-rate vertex binding for every mesh.
    pub instance: Option<InstanceBufferRef>,
    /// Shared by all meshes of the model; each mesh gets its own descriptor
    /// set over them.
    pub bindings: MeshBindings,
}

pub struct AddTextInfo<'a> {
    pub text: &'a mut dyn TextGeometry,
    pub font: &'a Font,
    pub size: f32,
    pub render_pass: PassIndex,
    pub renderer: RendererIndex,
    /// Merged after the synthesized text bindings.
    pub extra: MeshBindings,
}

const TEXT_UBO_BINDING: u32 = 0;
const TEXT_SAMPLER_BINDING: u32 = 1;
const TEXT_GLYPH_BINDING: u32 = 2;

#[derive(PartialEq, Eq)]
enum SceneState {
    Declaring,
    Recorded,
}

struct SceneCommandBuffer {
    command_type: CommandType,
    final_stage: vk::PipelineStageFlags,
    semaphore: SemaphoreId,
    command_buffer: Option<CommandBufferId>,
}

struct ScenePass {
    render_pass: RenderPass,
    outputs: Vec<RenderPassOutput>,
    command_buffer: Option<SceneBufferId>,
    output_is_swap_chain: bool,
    renderers: Vec<Renderer>,
}

struct SceneCompute {
    passes: Vec<ComputePass>,
    command_buffer: Option<SceneBufferId>,
    per_swapchain_image: bool,
    extent: vk::Extent2D,
    dispatch_groups: vk::Extent3D,
    before_record: Option<RecordHook>,
    after_record: Option<RecordHook>,
}

pub struct Scene<D: RenderDevice> {
    device: D,
    debug: Box<dyn DebugSink>,
    swap_chain_images: Vec<ImageId>,
    swap_chain_command_type: CommandType,
    mirror_images: Vec<ImageId>,
    swap_chain_extent: vk::Extent2D,
    swap_chain_format: vk::Format,
    depth_format: vk::Format,
    pool: DescriptorPool,
    state: SceneState,
    buffers: Vec<SceneCommandBuffer>,
    passes: Vec<ScenePass>,
    compute_passes: Vec<SceneCompute>,
    swap_chain_command_buffers: Vec<CommandBufferId>,
    swap_chain_complete: Option<SemaphoreId>,
}

impl<D: RenderDevice> Scene<D> {
    pub fn new(
        mut device: D,
        info: SceneCreateInfo,
        debug: Box<dyn DebugSink>,
    ) -> Result<Self, SceneError> {
        let Some(&first) = info.swap_chain_images.first() else {
            debug.report(Severity::Error, "scene created without swapchain images");
            return Err(SceneError::InvalidId {
                kind: "swap chain image",
                id: 0,
            });
        };
        let swap_info = device.image_info(first)?;
        let depth_format = device.find_depth_format()?;
        log::info!(
            "scene over {}x{} swapchain, {} images, depth format {:?}",
            swap_info.extent.width,
            swap_info.extent.height,
            info.swap_chain_images.len(),
            depth_format
        );
        Ok(Self {
            device,
            debug,
            swap_chain_images: info.swap_chain_images,
            swap_chain_command_type: info.swap_chain_command_type,
            mirror_images: info.mirror_images,
            swap_chain_extent: swap_info.extent,
            swap_chain_format: swap_info.format,
            depth_format,
            pool: DescriptorPool::new(),
            state: SceneState::Declaring,
            buffers: Vec::new(),
            passes: Vec::new(),
            compute_passes: Vec::new(),
            swap_chain_command_buffers: Vec::new(),
            swap_chain_complete: None,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Signaled by each frame's swapchain submission; wait on it before
    /// presenting.
    pub fn swap_chain_complete_semaphore(&self) -> Option<SemaphoreId> {
        self.swap_chain_complete
    }

    pub fn descriptor_pool(&self) -> &DescriptorPool {
        &self.pool
    }

    fn invalid(&self, kind: &'static str, id: usize) -> SceneError {
        self.debug
            .report(Severity::Error, &format!("unknown {kind} id {id}"));
        SceneError::InvalidId { kind, id }
    }

    fn guard_declaring(&self) -> Result<(), SceneError> {
        if self.state == SceneState::Recorded {
            self.debug
                .report(Severity::Error, "declaration after record is ignored");
            return Err(SceneError::AlreadyRecorded);
        }
        Ok(())
    }

    fn check_buffer(&self, buffer: Option<SceneBufferId>) -> Result<(), SceneError> {
        match buffer {
            Some(SceneBufferId(id)) if id >= self.buffers.len() => {
                Err(self.invalid("command buffer", id))
            }
            _ => Ok(()),
        }
    }

    /// Declares a named command buffer. Its completion semaphore exists
    /// immediately; the buffer itself is allocated in `record`.
    pub fn add_command_buffer(
        &mut self,
        info: CommandBufferCreateInfo,
    ) -> Result<SceneBufferId, SceneError> {
        self.guard_declaring()?;
        let semaphore = self.device.create_semaphore()?;
        self.buffers.push(SceneCommandBuffer {
            command_type: info.command_type,
            final_stage: info.final_pipeline_stage,
            semaphore,
            command_buffer: None,
        });
        Ok(SceneBufferId(self.buffers.len() - 1))
    }

    pub fn add_render_pass(&mut self, info: RenderPassCreateInfo) -> Result<PassIndex, SceneError> {
        self.guard_declaring()?;
        self.check_buffer(info.command_buffer)?;
        let color_final_layout = if self.mirror_images.is_empty() {
            vk::ImageLayout::PRESENT_SRC_KHR
        } else {
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        };
        let outputs = match resolve_outputs(
            &info.outputs,
            info.output_is_swap_chain,
            self.swap_chain_extent,
            self.swap_chain_format,
            self.depth_format,
            color_final_layout,
        ) {
            Ok(outputs) => outputs,
            Err(err) => {
                self.debug
                    .report(Severity::Error, "render pass declared without outputs");
                return Err(err);
            }
        };
        let render_pass = if info.output_is_swap_chain {
            RenderPass::new_swap_chain(&mut self.device, &outputs, &self.swap_chain_images)?
        } else {
            RenderPass::new_offscreen(&mut self.device, &outputs)?
        };
        log::debug!(
            "render pass {} created: {} attachments, {}x{}",
            self.passes.len(),
            outputs.len(),
            render_pass.extent().width,
            render_pass.extent().height
        );
        self.passes.push(ScenePass {
            render_pass,
            outputs,
            command_buffer: info.command_buffer,
            output_is_swap_chain: info.output_is_swap_chain,
            renderers: Vec::new(),
        });
        Ok(PassIndex(self.passes.len() - 1))
    }

    /// Offscreen images a custom pass created, in attachment order. Callers
    /// feed these into later passes as sampled inputs.
    pub fn render_pass_images(&self, pass: PassIndex) -> Result<&[ImageId], SceneError> {
        self.passes
            .get(pass.0)
            .map(|p| p.render_pass.images())
            .ok_or_else(|| self.invalid("render pass", pass.0))
    }

    pub fn add_renderer(&mut self, info: RendererCreateInfo) -> Result<RendererIndex, SceneError> {
        self.guard_declaring()?;
        if info.render_pass.0 >= self.passes.len() {
            return Err(self.invalid("render pass", info.render_pass.0));
        }
        let (bindings, attributes) = resolve_vertex_input(
            info.vertex_template,
            info.instance_template,
            &info.input_binding_descriptions,
            &info.input_attribute_descriptions,
        );
        let extent = self.passes[info.render_pass.0].render_pass.extent();
        let renderer = Renderer::new(
            &mut self.device,
            RendererDesc {
                vertex_shader: info.vertex_shader,
                geometry_shader: info.geometry_shader,
                fragment_shader: info.fragment_shader,
                bindings,
                attributes,
                extent,
                viewport_scale: info.viewport_scale,
                viewport_offset: info.viewport_offset,
                alpha_blending: info.alpha_blending,
                topology: info.topology,
                polygon_mode: info.polygon_mode,
                depth_test: info.depth_test,
                conservative_rasterization: info.conservative_rasterization,
                ubo_layouts: info.ubo_layouts,
                texture_layouts: info.texture_layouts,
                image_layouts: info.image_layouts,
                sampler_layouts: info.sampler_layouts,
                buffer_layouts: info.buffer_layouts,
            },
        )?;
        let pass = &mut self.passes[info.render_pass.0];
        pass.renderers.push(renderer);
        Ok(RendererIndex(pass.renderers.len() - 1))
    }

    pub fn add_compute_pass(
        &mut self,
        info: ComputePassCreateInfo,
    ) -> Result<ComputePassIndex, SceneError> {
        self.guard_declaring()?;
        self.check_buffer(info.command_buffer)?;
        let mut passes = Vec::new();
        if info.output_is_swap_chain {
            let base = info.bindings.first().cloned().unwrap_or_default();
            for &swap_image in &self.swap_chain_images {
                let mut images = base.images.clone();
                images.push((
                    swap_image,
                    ImageLayout {
                        binding: info.output_binding,
                        descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                        stages: vk::ShaderStageFlags::COMPUTE,
                    },
                ));
                passes.push(ComputePass::new(
                    &mut self.device,
                    info.shader.clone(),
                    base.ubos.clone(),
                    images,
                )?);
            }
        } else if info.bindings.is_empty() {
            passes.push(ComputePass::new(
                &mut self.device,
                info.shader.clone(),
                Vec::new(),
                Vec::new(),
            )?);
        } else {
            for set in &info.bindings {
                passes.push(ComputePass::new(
                    &mut self.device,
                    info.shader.clone(),
                    set.ubos.clone(),
                    set.images.clone(),
                )?);
            }
        }
        for pass in &passes {
            self.pool.add_uniform_buffers(pass.ubo_count() as u32)?;
            self.pool.add_storage_images(pass.image_count() as u32)?;
            if pass.ubo_count() + pass.image_count() > 0 {
                self.pool.add_sets(1)?;
            }
        }
        self.compute_passes.push(SceneCompute {
            passes,
            command_buffer: info.command_buffer,
            per_swapchain_image: info.output_is_swap_chain,
            extent: info.extent,
            dispatch_groups: info.dispatch_groups,
            before_record: info.before_record,
            after_record: info.after_record,
        });
        Ok(ComputePassIndex(self.compute_passes.len() - 1))
    }

    pub fn add_model(&mut self, info: AddModelInfo) -> Result<(), SceneError> {
        self.guard_declaring()?;
        let renderer = self.renderer_mut(info.render_pass, info.renderer)?;
        let meshes = info.model.vertex_buffers();
        for vertex in &meshes {
            match info.instance {
                Some(instance) => {
                    renderer.add_mesh_instanced(*vertex, instance, info.bindings.clone())
                }
                None => renderer.add_mesh(*vertex, info.bindings.clone()),
            }
        }
        for _ in 0..meshes.len() {
            account_mesh(&mut self.pool, &info.bindings)?;
        }
        Ok(())
    }

    /// Registers text as a mesh. The glyph geometry is laid out against the
    /// target pass's output extent; the MVP uniform lands at binding 0
    /// (vertex stage), the font sampler at binding 1 and the glyph images
    /// from binding 2 (fragment stage), with the caller's extras after.
    pub fn add_text(&mut self, info: AddTextInfo) -> Result<(), SceneError> {
        self.guard_declaring()?;
        let extent = self
            .passes
            .get(info.render_pass.0)
            .map(|p| p.render_pass.extent())
            .ok_or_else(|| self.invalid("render pass", info.render_pass.0))?;
        info.text.build(extent, info.font, info.size);

        let mut bindings = MeshBindings {
            ubos: vec![(
                info.text.ubo(),
                UniformBufferLayout {
                    binding: TEXT_UBO_BINDING,
                    stages: vk::ShaderStageFlags::VERTEX,
                },
            )],
            samplers: vec![(
                info.font.sampler(),
                SamplerLayout {
                    binding: TEXT_SAMPLER_BINDING,
                    stages: vk::ShaderStageFlags::FRAGMENT,
                },
            )],
            images: info
                .font
                .images()
                .iter()
                .enumerate()
                .map(|(i, &image)| {
                    (
                        image,
                        ImageLayout {
                            binding: TEXT_GLYPH_BINDING + i as u32,
                            descriptor_type: vk::DescriptorType::SAMPLED_IMAGE,
                            stages: vk::ShaderStageFlags::FRAGMENT,
                        },
                    )
                })
                .collect(),
            ..MeshBindings::default()
        };
        bindings.ubos.extend(info.extra.ubos.iter().copied());
        bindings.textures.extend(info.extra.textures.iter().copied());
        bindings.images.extend(info.extra.images.iter().copied());
        bindings.samplers.extend(info.extra.samplers.iter().copied());
        bindings.buffers.extend(info.extra.buffers.iter().copied());

        let vertex = info.text.vertex_buffer();
        let renderer = self.renderer_mut(info.render_pass, info.renderer)?;
        renderer.add_mesh(vertex, bindings.clone());
        account_mesh(&mut self.pool, &bindings)
    }

    fn renderer_mut(
        &mut self,
        pass: PassIndex,
        renderer: RendererIndex,
    ) -> Result<&mut Renderer, SceneError> {
        if pass.0 >= self.passes.len() {
            return Err(self.invalid("render pass", pass.0));
        }
        if renderer.0 >= self.passes[pass.0].renderers.len() {
            return Err(self.invalid("renderer", renderer.0));
        }
        Ok(&mut self.passes[pass.0].renderers[renderer.0])
    }

    /// Materializes everything declared so far and bakes the command
    /// buffers. One-way: further declarations and repeated `record` calls
    /// are errors.
    pub fn record(&mut self) -> Result<(), SceneError> {
        self.guard_declaring()?;
        let pool = self.pool.allocate(&mut self.device)?;

        for pass in &mut self.passes {
            for renderer in &mut pass.renderers {
                renderer.create(
                    &mut self.device,
                    pass.render_pass.id(),
                    vk::SampleCountFlags::TYPE_1,
                    pool,
                )?;
            }
        }
        for compute in &mut self.compute_passes {
            for pass in &mut compute.passes {
                pass.create(&mut self.device, pool)?;
            }
        }

        for image_index in 0..self.swap_chain_images.len() {
            let cb = self
                .device
                .create_command_buffer(self.swap_chain_command_type)?;
            self.device.begin_command_buffer(cb)?;
            record_slot(
                &mut self.device,
                &self.passes,
                &self.compute_passes,
                None,
                Some(image_index),
                cb,
            );
            if !self.mirror_images.is_empty() {
                record_mirror(
                    &mut self.device,
                    cb,
                    self.swap_chain_images[image_index],
                    self.mirror_images[image_index],
                );
            }
            self.device.end_command_buffer(cb)?;
            self.swap_chain_command_buffers.push(cb);
        }

        for index in 0..self.buffers.len() {
            let cb = self
                .device
                .create_command_buffer(self.buffers[index].command_type)?;
            self.device.begin_command_buffer(cb)?;
            record_slot(
                &mut self.device,
                &self.passes,
                &self.compute_passes,
                Some(SceneBufferId(index)),
                None,
                cb,
            );
            self.device.end_command_buffer(cb)?;
            self.buffers[index].command_buffer = Some(cb);
        }

        self.swap_chain_complete = Some(self.device.create_semaphore()?);
        self.state = SceneState::Recorded;
        log::info!(
            "scene recorded: {} render passes, {} compute passes, {} named buffers",
            self.passes.len(),
            self.compute_passes.len(),
            self.buffers.len()
        );
        Ok(())
    }

    /// Submits one frame: the per-image buffer first (waiting on
    /// `image_available`, signaling swapchain-complete), then the named
    /// buffers in the given order. Each consumer in `sync_pairs` waits on
    /// its producer's semaphore at the producer's declared final stage.
    pub fn frame(
        &mut self,
        graphics_queue: QueueId,
        compute_queue: QueueId,
        image_index: usize,
        image_available: Option<SemaphoreId>,
        buffer_order: &[SceneBufferId],
        sync_pairs: &[(SceneBufferId, SceneBufferId)],
    ) -> Result<(), SceneError> {
        if self.state != SceneState::Recorded {
            return Err(SceneError::NotRecorded);
        }
        if image_index >= self.swap_chain_command_buffers.len() {
            return Err(self.invalid("swap chain image", image_index));
        }
        for &SceneBufferId(id) in buffer_order {
            if id >= self.buffers.len() {
                return Err(self.invalid("command buffer", id));
            }
        }
        for &(SceneBufferId(producer), SceneBufferId(consumer)) in sync_pairs {
            if producer >= self.buffers.len() {
                return Err(self.invalid("command buffer", producer));
            }
            if consumer >= self.buffers.len() {
                return Err(self.invalid("command buffer", consumer));
            }
        }
        let Some(complete) = self.swap_chain_complete else {
            return Err(SceneError::NotRecorded);
        };

        let route = |command_type: CommandType| match command_type {
            CommandType::Compute => compute_queue,
            CommandType::Graphics | CommandType::Transfer => graphics_queue,
        };

        let waits: Vec<(SemaphoreId, vk::PipelineStageFlags)> = image_available
            .into_iter()
            .map(|s| (s, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT))
            .collect();
        self.device.submit(
            route(self.swap_chain_command_type),
            self.swap_chain_command_buffers[image_index],
            &waits,
            &[complete],
        )?;

        for &id in buffer_order {
            let buffer = &self.buffers[id.0];
            let Some(cb) = buffer.command_buffer else {
                return Err(SceneError::NotRecorded);
            };
            let waits: Vec<(SemaphoreId, vk::PipelineStageFlags)> = sync_pairs
                .iter()
                .filter(|&&(_, consumer)| consumer == id)
                .map(|&(producer, _)| {
                    let producer = &self.buffers[producer.0];
                    (producer.semaphore, producer.final_stage)
                })
                .collect();
            self.device
                .submit(route(buffer.command_type), cb, &waits, &[buffer.semaphore])?;
        }
        Ok(())
    }
}

/// Records every pass assigned to `slot` into `cb`, declaration order,
/// render passes before compute passes.
fn record_slot(
    device: &mut dyn RenderDevice,
    passes: &[ScenePass],
    compute_passes: &[SceneCompute],
    slot: Option<SceneBufferId>,
    swap_image: Option<usize>,
    cb: CommandBufferId,
) {
    for pass in passes.iter().filter(|p| p.command_buffer == slot) {
        let clear_values: Vec<vk::ClearValue> =
            pass.outputs.iter().map(|o| o.clear_value).collect();
        let framebuffer_index = if pass.output_is_swap_chain {
            swap_image.unwrap_or(0)
        } else {
            0
        };
        pass.render_pass.begin(device, cb, framebuffer_index, &clear_values);
        for renderer in &pass.renderers {
            renderer.record(device, cb);
        }
        pass.render_pass.end(device, cb);
    }
    for compute in compute_passes.iter().filter(|c| c.command_buffer == slot) {
        if let Some(hook) = &compute.before_record {
            hook(device, cb);
        }
        if compute.per_swapchain_image {
            if let Some(index) = swap_image {
                compute.passes[index].record(device, cb, compute.extent, compute.dispatch_groups);
            }
        } else {
            for pass in &compute.passes {
                pass.record(device, cb, compute.extent, compute.dispatch_groups);
            }
        }
        if let Some(hook) = &compute.after_record {
            hook(device, cb);
        }
    }
}

/// Copies the finished swapchain image into the window-presentable mirror:
/// transition in, blit, transition back.
fn record_mirror(device: &mut dyn RenderDevice, cb: CommandBufferId, src: ImageId, dst: ImageId) {
    device.cmd_transition_image_layout(
        cb,
        dst,
        vk::ImageLayout::PRESENT_SRC_KHR,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::PipelineStageFlags::TRANSFER,
    );
    device.cmd_blit_image(cb, src, dst);
    device.cmd_transition_image_layout(
        cb,
        dst,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::PRESENT_SRC_KHR,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
    );
}

/// Grows the pool by one mesh's declared resources plus the set itself.
fn account_mesh(pool: &mut DescriptorPool, bindings: &MeshBindings) -> Result<(), SceneError> {
    if bindings.is_empty() {
        return Ok(());
    }
    pool.add_uniform_buffers(bindings.ubos.len() as u32)?;
    pool.add_combined_image_samplers(bindings.textures.len() as u32)?;
    let sampled = bindings
        .images
        .iter()
        .filter(|(_, l)| l.descriptor_type == vk::DescriptorType::SAMPLED_IMAGE)
        .count() as u32;
    let storage = bindings.images.len() as u32 - sampled;
    pool.add_sampled_images(sampled)?;
    pool.add_storage_images(storage)?;
    pool.add_samplers(bindings.samplers.len() as u32)?;
    pool.add_storage_buffers(bindings.buffers.len() as u32)?;
    pool.add_sets(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::headless::HeadlessDevice;
    use crate::model::{Font, VertexBufferRef};

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 1024,
        height: 768,
    };

    struct CapturingSink(Rc<RefCell<Vec<String>>>);

    impl DebugSink for CapturingSink {
        fn report(&self, _severity: Severity, message: &str) {
            self.0.borrow_mut().push(message.to_owned());
        }
    }

    struct MeshCount(Vec<VertexBufferRef>);

    impl Model for MeshCount {
        fn vertex_buffers(&self) -> Vec<VertexBufferRef> {
            self.0.clone()
        }
    }

    struct StubText {
        ubo: UniformBufferId,
        vertex: VertexBufferRef,
        built_at: RefCell<Option<vk::Extent2D>>,
    }

    impl TextGeometry for StubText {
        fn build(&mut self, output_extent: vk::Extent2D, _font: &Font, _size: f32) {
            *self.built_at.borrow_mut() = Some(output_extent);
        }

        fn ubo(&self) -> UniformBufferId {
            self.ubo
        }

        fn vertex_buffer(&self) -> VertexBufferRef {
            self.vertex
        }
    }

    fn scene_with_sink(
        image_count: usize,
    ) -> (Scene<HeadlessDevice>, Rc<RefCell<Vec<String>>>) {
        let mut device = HeadlessDevice::new();
        let swap_chain_images = (0..image_count)
            .map(|_| {
                device.register_image(EXTENT, vk::Format::B8G8R8A8_UNORM, vk::ImageLayout::UNDEFINED)
            })
            .collect();
        let messages = Rc::new(RefCell::new(Vec::new()));
        let scene = Scene::new(
            device,
            SceneCreateInfo {
                swap_chain_images,
                swap_chain_command_type: CommandType::Graphics,
                mirror_images: Vec::new(),
            },
            Box::new(CapturingSink(messages.clone())),
        )
        .unwrap();
        (scene, messages)
    }

    fn mesh(device: &mut HeadlessDevice, index_count: u32) -> VertexBufferRef {
        VertexBufferRef {
            vertex_buffer: device.register_buffer(),
            index_buffer: device.register_buffer(),
            index_count,
        }
    }

    fn swapchain_pass(scene: &mut Scene<HeadlessDevice>) -> PassIndex {
        scene
            .add_render_pass(RenderPassCreateInfo {
                command_buffer: None,
                output_is_swap_chain: true,
                outputs: Vec::new(),
            })
            .unwrap()
    }

    fn plain_renderer(scene: &mut Scene<HeadlessDevice>, pass: PassIndex) -> RendererIndex {
        scene
            .add_renderer(RendererCreateInfo {
                render_pass: pass,
                vertex_shader: "shaders/mesh.vert.spv".into(),
                fragment_shader: Some("shaders/mesh.frag.spv".into()),
                vertex_template: VertexTemplate::Full3dMaterial,
                ..RendererCreateInfo::default()
            })
            .unwrap()
    }

    #[test]
    fn pool_totals_sum_declared_resources_per_mesh() {
        let (mut scene, _) = scene_with_sink(2);
        let pass = swapchain_pass(&mut scene);
        let renderer = plain_renderer(&mut scene, pass);

        let ubo = scene.device_mut().register_uniform_buffer(64);
        let texture = crate::model::Texture {
            image: scene.device_mut().register_image(
                EXTENT,
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            sampler: scene.device_mut().register_sampler(),
        };
        let meshes = {
            let device = scene.device_mut();
            MeshCount(vec![mesh(device, 6), mesh(device, 9)])
        };
        scene
            .add_model(AddModelInfo {
                model: &meshes,
                render_pass: pass,
                renderer,
                instance: None,
                bindings: MeshBindings {
                    ubos: vec![(
                        ubo,
                        UniformBufferLayout {
                            binding: 0,
                            stages: vk::ShaderStageFlags::VERTEX,
                        },
                    )],
                    textures: vec![(
                        texture,
                        crate::layout::TextureLayout {
                            binding: 1,
                            stages: vk::ShaderStageFlags::FRAGMENT,
                        },
                    )],
                    ..MeshBindings::default()
                },
            })
            .unwrap();

        // Two meshes share the resources, so each kind is counted twice and
        // each mesh gets a set.
        assert_eq!(scene.descriptor_pool().totals(), [2, 2, 0, 0, 0, 0]);
        assert_eq!(scene.descriptor_pool().sets(), 2);
    }

    #[test]
    fn text_synthesizes_fixed_bindings_and_accounts_once_per_text() {
        let (mut scene, _) = scene_with_sink(1);
        let pass = swapchain_pass(&mut scene);
        let renderer = scene
            .add_renderer(RendererCreateInfo {
                render_pass: pass,
                vertex_shader: "shaders/text.vert.spv".into(),
                fragment_shader: Some("shaders/text.frag.spv".into()),
                vertex_template: VertexTemplate::Position2dTexturedMaterial,
                ubo_layouts: vec![UniformBufferLayout {
                    binding: 0,
                    stages: vk::ShaderStageFlags::VERTEX,
                }],
                sampler_layouts: vec![SamplerLayout {
                    binding: 1,
                    stages: vk::ShaderStageFlags::FRAGMENT,
                }],
                image_layouts: vec![ImageLayout {
                    binding: 2,
                    descriptor_type: vk::DescriptorType::SAMPLED_IMAGE,
                    stages: vk::ShaderStageFlags::FRAGMENT,
                }],
                ..RendererCreateInfo::default()
            })
            .unwrap();

        let font = {
            let device = scene.device_mut();
            let pages = vec![
                device.register_image(
                    vk::Extent2D {
                        width: 512,
                        height: 512,
                    },
                    vk::Format::R8_UNORM,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                ),
                device.register_image(
                    vk::Extent2D {
                        width: 512,
                        height: 512,
                    },
                    vk::Format::R8_UNORM,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                ),
            ];
            let sampler = device.register_sampler();
            Font::new(pages, sampler)
        };
        let mut text = {
            let device = scene.device_mut();
            StubText {
                ubo: device.register_uniform_buffer(64),
                vertex: mesh(device, 12),
                built_at: RefCell::new(None),
            }
        };
        scene
            .add_text(AddTextInfo {
                text: &mut text,
                font: &font,
                size: 24.0,
                render_pass: pass,
                renderer,
                extra: MeshBindings::default(),
            })
            .unwrap();

        assert_eq!(*text.built_at.borrow(), Some(EXTENT));
        // One MVP ubo, one font sampler, two glyph pages.
        assert_eq!(scene.descriptor_pool().totals(), [1, 0, 2, 0, 1, 0]);
        assert_eq!(scene.descriptor_pool().sets(), 1);

        let mut second = {
            let device = scene.device_mut();
            StubText {
                ubo: device.register_uniform_buffer(64),
                vertex: mesh(device, 18),
                built_at: RefCell::new(None),
            }
        };
        scene
            .add_text(AddTextInfo {
                text: &mut second,
                font: &font,
                size: 12.0,
                render_pass: pass,
                renderer,
                extra: MeshBindings::default(),
            })
            .unwrap();
        // A second text over the same font counts the font exactly once
        // more (its own set still references the glyph pages).
        assert_eq!(scene.descriptor_pool().totals(), [2, 0, 4, 0, 2, 0]);
        assert_eq!(scene.descriptor_pool().sets(), 2);
    }

    #[test]
    fn invalid_ids_are_reported_and_rejected() {
        let (mut scene, messages) = scene_with_sink(1);
        let err = scene.add_renderer(RendererCreateInfo {
            render_pass: PassIndex(7),
            vertex_shader: "shaders/mesh.vert.spv".into(),
            ..RendererCreateInfo::default()
        });
        assert!(matches!(
            err,
            Err(SceneError::InvalidId {
                kind: "render pass",
                id: 7
            })
        ));
        assert_eq!(messages.borrow().len(), 1);
        // No pipeline state was created for the rejected declaration.
        assert!(scene.device().set_layouts().is_empty());

        let err = scene.add_render_pass(RenderPassCreateInfo {
            command_buffer: Some(SceneBufferId(3)),
            output_is_swap_chain: true,
            outputs: Vec::new(),
        });
        assert!(matches!(err, Err(SceneError::InvalidId { .. })));
        assert_eq!(messages.borrow().len(), 2);
    }

    #[test]
    fn empty_custom_outputs_are_reported() {
        let (mut scene, messages) = scene_with_sink(1);
        let err = scene.add_render_pass(RenderPassCreateInfo {
            command_buffer: None,
            output_is_swap_chain: false,
            outputs: Vec::new(),
        });
        assert!(matches!(err, Err(SceneError::EmptyOutputs)));
        assert_eq!(messages.borrow().len(), 1);
    }

    #[test]
    fn declarations_after_record_are_rejected() {
        let (mut scene, _) = scene_with_sink(1);
        swapchain_pass(&mut scene);
        scene.record().unwrap();
        assert!(matches!(scene.record(), Err(SceneError::AlreadyRecorded)));
        assert!(matches!(
            scene.add_command_buffer(CommandBufferCreateInfo {
                command_type: CommandType::Compute,
                final_pipeline_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            }),
            Err(SceneError::AlreadyRecorded)
        ));
    }

    #[test]
    fn frame_before_record_is_rejected() {
        let (mut scene, _) = scene_with_sink(1);
        let graphics = scene.device_mut().register_queue();
        let compute = scene.device_mut().register_queue();
        assert!(matches!(
            scene.frame(graphics, compute, 0, None, &[], &[]),
            Err(SceneError::NotRecorded)
        ));
    }
}
