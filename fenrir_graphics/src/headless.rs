//! Backend that records instead of rendering.
//!
//! Every handle is an index into a plain registry and every `cmd_*` call is
//! appended to the owning command buffer's log. Useful for dry-running a
//! scene declaration and for tests, which assert directly against the logs
//! and the captured creation descriptions.

use ash::vk;

use crate::attachment::Attachment;
use crate::device::{
    BufferId, CommandBufferId, CommandType, ComputePipelineDesc, DescriptorBinding,
    DescriptorPoolId, DescriptorSetId, DescriptorWrite, DeviceError, FramebufferId,
    GraphicsPipelineDesc, ImageId, ImageInfo, PipelineId, QueueId, RenderDevice, RenderPassId,
    SamplerId, SemaphoreId, SetLayoutId, UniformBufferId,
};

/// One recorded `cmd_*` call.
#[derive(Clone, PartialEq, Debug)]
pub enum Command {
    BeginRenderPass {
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
        extent: vk::Extent2D,
        clear_count: usize,
    },
    EndRenderPass,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineId,
    },
    BindVertexBuffer {
        binding: u32,
        buffer: BufferId,
    },
    BindIndexBuffer {
        buffer: BufferId,
    },
    BindDescriptorSet {
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineId,
        set: DescriptorSetId,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    Dispatch {
        groups: [u32; 3],
    },
    TransitionImageLayout {
        image: ImageId,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    },
    BlitImage {
        src: ImageId,
        dst: ImageId,
    },
}

/// One `submit` call.
#[derive(Clone, PartialEq, Debug)]
pub struct Submission {
    pub queue: QueueId,
    pub command_buffer: CommandBufferId,
    pub waits: Vec<(SemaphoreId, vk::PipelineStageFlags)>,
    pub signals: Vec<SemaphoreId>,
}

/// Captured framebuffer creation.
#[derive(Clone, PartialEq, Debug)]
pub struct FramebufferRecord {
    pub render_pass: RenderPassId,
    pub attachments: Vec<ImageId>,
    pub extent: vk::Extent2D,
}

struct CommandBufferRecord {
    kind: CommandType,
    recording: bool,
    commands: Vec<Command>,
}

#[derive(Default)]
pub struct HeadlessDevice {
    images: Vec<ImageInfo>,
    uniform_buffers: Vec<vk::DeviceSize>,
    buffers: u32,
    samplers: u32,
    queues: u32,
    render_passes: Vec<Vec<Attachment>>,
    framebuffers: Vec<FramebufferRecord>,
    set_layouts: Vec<Vec<DescriptorBinding>>,
    descriptor_pools: Vec<(Vec<(vk::DescriptorType, u32)>, u32)>,
    descriptor_sets: Vec<(DescriptorPoolId, SetLayoutId, Vec<DescriptorWrite>)>,
    graphics_pipelines: Vec<GraphicsPipelineDesc>,
    compute_pipelines: Vec<ComputePipelineDesc>,
    command_buffers: Vec<CommandBufferRecord>,
    semaphores: u32,
    submissions: Vec<Submission>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_image(
        &mut self,
        extent: vk::Extent2D,
        format: vk::Format,
        layout: vk::ImageLayout,
    ) -> ImageId {
        self.images.push(ImageInfo {
            extent,
            format,
            layout,
        });
        ImageId(self.images.len() as u32 - 1)
    }

    pub fn register_uniform_buffer(&mut self, size: vk::DeviceSize) -> UniformBufferId {
        self.uniform_buffers.push(size);
        UniformBufferId(self.uniform_buffers.len() as u32 - 1)
    }

    pub fn register_buffer(&mut self) -> BufferId {
        self.buffers += 1;
        BufferId(self.buffers - 1)
    }

    pub fn register_sampler(&mut self) -> SamplerId {
        self.samplers += 1;
        SamplerId(self.samplers - 1)
    }

    pub fn register_queue(&mut self) -> QueueId {
        self.queues += 1;
        QueueId(self.queues - 1)
    }

    pub fn commands(&self, cb: CommandBufferId) -> &[Command] {
        &self.command_buffers[cb.0 as usize].commands
    }

    pub fn command_buffer_count(&self) -> usize {
        self.command_buffers.len()
    }

    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    pub fn render_passes(&self) -> &[Vec<Attachment>] {
        &self.render_passes
    }

    pub fn framebuffers(&self) -> &[FramebufferRecord] {
        &self.framebuffers
    }

    pub fn set_layouts(&self) -> &[Vec<DescriptorBinding>] {
        &self.set_layouts
    }

    pub fn descriptor_pools(&self) -> &[(Vec<(vk::DescriptorType, u32)>, u32)] {
        &self.descriptor_pools
    }

    pub fn descriptor_set_count(&self) -> usize {
        self.descriptor_sets.len()
    }

    pub fn descriptor_set_writes(&self, set: DescriptorSetId) -> &[DescriptorWrite] {
        &self.descriptor_sets[set.0 as usize].2
    }

    pub fn graphics_pipeline_count(&self) -> usize {
        self.graphics_pipelines.len()
    }

    pub fn graphics_pipelines(&self) -> &[GraphicsPipelineDesc] {
        &self.graphics_pipelines
    }

    pub fn compute_pipelines(&self) -> &[ComputePipelineDesc] {
        &self.compute_pipelines
    }

    fn record(&mut self, cb: CommandBufferId, command: Command) {
        let record = &mut self.command_buffers[cb.0 as usize];
        debug_assert!(record.recording, "command recorded outside begin/end");
        record.commands.push(command);
    }
}

impl RenderDevice for HeadlessDevice {
    fn find_depth_format(&self) -> Result<vk::Format, DeviceError> {
        Ok(vk::Format::D32_SFLOAT)
    }

    fn image_info(&self, image: ImageId) -> Result<ImageInfo, DeviceError> {
        self.images
            .get(image.0 as usize)
            .copied()
            .ok_or(DeviceError::UnknownHandle {
                kind: "image",
                index: image.0,
            })
    }

    fn create_render_pass(&mut self, attachments: &[Attachment]) -> Result<RenderPassId, DeviceError> {
        self.render_passes.push(attachments.to_vec());
        Ok(RenderPassId(self.render_passes.len() as u32 - 1))
    }

    fn create_attachment_image(&mut self, attachment: &Attachment) -> Result<ImageId, DeviceError> {
        Ok(self.register_image(attachment.extent, attachment.format, vk::ImageLayout::UNDEFINED))
    }

    fn create_framebuffer(
        &mut self,
        render_pass: RenderPassId,
        attachments: &[ImageId],
        extent: vk::Extent2D,
    ) -> Result<FramebufferId, DeviceError> {
        self.framebuffers.push(FramebufferRecord {
            render_pass,
            attachments: attachments.to_vec(),
            extent,
        });
        Ok(FramebufferId(self.framebuffers.len() as u32 - 1))
    }

    fn create_set_layout(&mut self, bindings: &[DescriptorBinding]) -> Result<SetLayoutId, DeviceError> {
        self.set_layouts.push(bindings.to_vec());
        Ok(SetLayoutId(self.set_layouts.len() as u32 - 1))
    }

    fn create_descriptor_pool(
        &mut self,
        sizes: &[(vk::DescriptorType, u32)],
        max_sets: u32,
    ) -> Result<DescriptorPoolId, DeviceError> {
        self.descriptor_pools.push((sizes.to_vec(), max_sets));
        Ok(DescriptorPoolId(self.descriptor_pools.len() as u32 - 1))
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: DescriptorPoolId,
        layout: SetLayoutId,
    ) -> Result<DescriptorSetId, DeviceError> {
        if pool.0 as usize >= self.descriptor_pools.len() {
            return Err(DeviceError::UnknownHandle {
                kind: "descriptor pool",
                index: pool.0,
            });
        }
        self.descriptor_sets.push((pool, layout, Vec::new()));
        Ok(DescriptorSetId(self.descriptor_sets.len() as u32 - 1))
    }

    fn update_descriptor_set(
        &mut self,
        set: DescriptorSetId,
        writes: &[DescriptorWrite],
    ) -> Result<(), DeviceError> {
        let entry = self
            .descriptor_sets
            .get_mut(set.0 as usize)
            .ok_or(DeviceError::UnknownHandle {
                kind: "descriptor set",
                index: set.0,
            })?;
        entry.2.extend(writes.iter().cloned());
        Ok(())
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> Result<PipelineId, DeviceError> {
        self.graphics_pipelines.push(desc.clone());
        Ok(PipelineId(
            (self.graphics_pipelines.len() + self.compute_pipelines.len()) as u32 - 1,
        ))
    }

    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc) -> Result<PipelineId, DeviceError> {
        self.compute_pipelines.push(desc.clone());
        Ok(PipelineId(
            (self.graphics_pipelines.len() + self.compute_pipelines.len()) as u32 - 1,
        ))
    }

    fn create_command_buffer(&mut self, kind: CommandType) -> Result<CommandBufferId, DeviceError> {
        self.command_buffers.push(CommandBufferRecord {
            kind,
            recording: false,
            commands: Vec::new(),
        });
        Ok(CommandBufferId(self.command_buffers.len() as u32 - 1))
    }

    fn create_semaphore(&mut self) -> Result<SemaphoreId, DeviceError> {
        self.semaphores += 1;
        Ok(SemaphoreId(self.semaphores - 1))
    }

    fn begin_command_buffer(&mut self, cb: CommandBufferId) -> Result<(), DeviceError> {
        let record =
            self.command_buffers
                .get_mut(cb.0 as usize)
                .ok_or(DeviceError::UnknownHandle {
                    kind: "command buffer",
                    index: cb.0,
                })?;
        record.recording = true;
        record.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&mut self, cb: CommandBufferId) -> Result<(), DeviceError> {
        let record =
            self.command_buffers
                .get_mut(cb.0 as usize)
                .ok_or(DeviceError::UnknownHandle {
                    kind: "command buffer",
                    index: cb.0,
                })?;
        record.recording = false;
        Ok(())
    }

    fn cmd_begin_render_pass(
        &mut self,
        cb: CommandBufferId,
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        self.record(
            cb,
            Command::BeginRenderPass {
                render_pass,
                framebuffer,
                extent,
                clear_count: clear_values.len(),
            },
        );
    }

    fn cmd_end_render_pass(&mut self, cb: CommandBufferId) {
        self.record(cb, Command::EndRenderPass);
    }

    fn cmd_bind_pipeline(
        &mut self,
        cb: CommandBufferId,
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineId,
    ) {
        self.record(cb, Command::BindPipeline { bind_point, pipeline });
    }

    fn cmd_bind_vertex_buffer(&mut self, cb: CommandBufferId, binding: u32, buffer: BufferId) {
        self.record(cb, Command::BindVertexBuffer { binding, buffer });
    }

    fn cmd_bind_index_buffer(&mut self, cb: CommandBufferId, buffer: BufferId) {
        self.record(cb, Command::BindIndexBuffer { buffer });
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        cb: CommandBufferId,
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineId,
        set: DescriptorSetId,
    ) {
        self.record(
            cb,
            Command::BindDescriptorSet {
                bind_point,
                pipeline,
                set,
            },
        );
    }

    fn cmd_draw_indexed(&mut self, cb: CommandBufferId, index_count: u32, instance_count: u32) {
        self.record(
            cb,
            Command::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }

    fn cmd_dispatch(&mut self, cb: CommandBufferId, groups: [u32; 3]) {
        self.record(cb, Command::Dispatch { groups });
    }

    fn cmd_transition_image_layout(
        &mut self,
        cb: CommandBufferId,
        image: ImageId,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        if let Some(info) = self.images.get_mut(image.0 as usize) {
            info.layout = to;
        }
        self.record(
            cb,
            Command::TransitionImageLayout {
                image,
                from,
                to,
                src_stage,
                dst_stage,
            },
        );
    }

    fn cmd_blit_image(&mut self, cb: CommandBufferId, src: ImageId, dst: ImageId) {
        self.record(cb, Command::BlitImage { src, dst });
    }

    fn submit(
        &mut self,
        queue: QueueId,
        cb: CommandBufferId,
        waits: &[(SemaphoreId, vk::PipelineStageFlags)],
        signals: &[SemaphoreId],
    ) -> Result<(), DeviceError> {
        if queue.0 >= self.queues {
            return Err(DeviceError::UnknownHandle {
                kind: "queue",
                index: queue.0,
            });
        }
        let record =
            self.command_buffers
                .get(cb.0 as usize)
                .ok_or(DeviceError::UnknownHandle {
                    kind: "command buffer",
                    index: cb.0,
                })?;
        log::trace!(
            "headless submit: queue {:?} cb {:?} ({:?}), {} waits",
            queue,
            cb,
            record.kind,
            waits.len()
        );
        self.submissions.push(Submission {
            queue,
            command_buffer: cb,
            waits: waits.to_vec(),
            signals: signals.to_vec(),
        });
        Ok(())
    }
}
