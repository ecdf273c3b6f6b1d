//! The device boundary.
//!
//! Everything the orchestration core needs from the GPU goes through
//! [`RenderDevice`]: an object-safe trait over copyable index handles. The
//! embedding application registers its resources (images, buffers, samplers)
//! with a backend and hands the backend to the scene; the core never touches
//! a raw Vulkan handle.

use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

use crate::attachment::Attachment;
use crate::model::Texture;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        pub struct $name(pub u32);
    };
}

handle!(/// An application-registered image (view + current layout + extent).
    ImageId);
handle!(/// An application-registered vertex/index/storage buffer.
    BufferId);
handle!(/// An application-registered sampler.
    SamplerId);
handle!(/// An application-registered uniform buffer.
    UniformBufferId);
handle!(RenderPassId);
handle!(FramebufferId);
handle!(PipelineId);
handle!(SetLayoutId);
handle!(DescriptorPoolId);
handle!(DescriptorSetId);
handle!(CommandBufferId);
handle!(SemaphoreId);
handle!(/// A hardware queue registered with the backend.
    QueueId);

/// Failures at the device boundary. Creation failures here are fatal by
/// contract; callers propagate them to the top of scene setup.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown {kind} handle {index}")]
    UnknownHandle { kind: &'static str, index: u32 },
    #[error("failed to read shader {path}: {source}")]
    Shader {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{call} failed: {result:?}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },
    #[error("no supported depth format")]
    NoDepthFormat,
}

/// Which queue family a command buffer records for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CommandType {
    Graphics,
    Compute,
    Transfer,
}

/// What the backend knows about a registered image.
#[derive(Clone, Copy, Debug)]
pub struct ImageInfo {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub layout: vk::ImageLayout,
}

/// One entry of a descriptor set layout, already aggregated (arrayed slots
/// carry `count > 1`).
#[derive(Clone, Copy, Debug)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Resources written into one descriptor slot.
#[derive(Clone, Debug)]
pub enum DescriptorResources {
    UniformBuffer(UniformBufferId),
    CombinedImageSamplers(Vec<Texture>),
    SampledImages(Vec<ImageId>),
    /// Written with `GENERAL` image layout.
    StorageImages(Vec<ImageId>),
    Samplers(Vec<SamplerId>),
    StorageBuffer { buffer: BufferId, range: vk::DeviceSize },
}

/// One `update_descriptor_set` write.
#[derive(Clone, Debug)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub resources: DescriptorResources,
}

/// Everything a graphics pipeline needs, shader paths included; the backend
/// loads and compiles the SPIR-V.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineDesc {
    pub render_pass: RenderPassId,
    pub vertex_shader: PathBuf,
    pub geometry_shader: Option<PathBuf>,
    pub fragment_shader: Option<PathBuf>,
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
    pub extent: vk::Extent2D,
    /// Viewport as a fraction of `extent`, for sub-region (per-eye) targets.
    pub viewport_scale: [f32; 2],
    pub viewport_offset: [f32; 2],
    pub sample_count: vk::SampleCountFlags,
    /// One flag per color attachment.
    pub alpha_blending: Vec<bool>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub depth_test: bool,
    pub conservative_rasterization: bool,
    pub set_layout: SetLayoutId,
}

#[derive(Clone, Debug)]
pub struct ComputePipelineDesc {
    pub shader: PathBuf,
    pub set_layout: SetLayoutId,
}

/// Object-safe device interface. Implemented by [`crate::VulkanDevice`] and
/// [`crate::HeadlessDevice`].
///
/// Recording ops (`cmd_*`) are infallible once the command buffer exists;
/// handles passed to them are trusted because the core only forwards ids it
/// was given by the same backend.
pub trait RenderDevice {
    /// Best depth-stencil format the hardware supports.
    fn find_depth_format(&self) -> Result<vk::Format, DeviceError>;
    fn image_info(&self, image: ImageId) -> Result<ImageInfo, DeviceError>;

    fn create_render_pass(&mut self, attachments: &[Attachment]) -> Result<RenderPassId, DeviceError>;
    /// Creates and owns an offscreen image matching the attachment.
    fn create_attachment_image(&mut self, attachment: &Attachment) -> Result<ImageId, DeviceError>;
    fn create_framebuffer(
        &mut self,
        render_pass: RenderPassId,
        attachments: &[ImageId],
        extent: vk::Extent2D,
    ) -> Result<FramebufferId, DeviceError>;
    fn create_set_layout(&mut self, bindings: &[DescriptorBinding]) -> Result<SetLayoutId, DeviceError>;
    fn create_descriptor_pool(
        &mut self,
        sizes: &[(vk::DescriptorType, u32)],
        max_sets: u32,
    ) -> Result<DescriptorPoolId, DeviceError>;
    fn allocate_descriptor_set(
        &mut self,
        pool: DescriptorPoolId,
        layout: SetLayoutId,
    ) -> Result<DescriptorSetId, DeviceError>;
    fn update_descriptor_set(
        &mut self,
        set: DescriptorSetId,
        writes: &[DescriptorWrite],
    ) -> Result<(), DeviceError>;
    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> Result<PipelineId, DeviceError>;
    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc) -> Result<PipelineId, DeviceError>;
    fn create_command_buffer(&mut self, kind: CommandType) -> Result<CommandBufferId, DeviceError>;
    fn create_semaphore(&mut self) -> Result<SemaphoreId, DeviceError>;

    fn begin_command_buffer(&mut self, cb: CommandBufferId) -> Result<(), DeviceError>;
    fn end_command_buffer(&mut self, cb: CommandBufferId) -> Result<(), DeviceError>;
    fn cmd_begin_render_pass(
        &mut self,
        cb: CommandBufferId,
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    );
    fn cmd_end_render_pass(&mut self, cb: CommandBufferId);
    fn cmd_bind_pipeline(
        &mut self,
        cb: CommandBufferId,
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineId,
    );
    fn cmd_bind_vertex_buffer(&mut self, cb: CommandBufferId, binding: u32, buffer: BufferId);
    fn cmd_bind_index_buffer(&mut self, cb: CommandBufferId, buffer: BufferId);
    fn cmd_bind_descriptor_set(
        &mut self,
        cb: CommandBufferId,
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineId,
        set: DescriptorSetId,
    );
    fn cmd_draw_indexed(&mut self, cb: CommandBufferId, index_count: u32, instance_count: u32);
    fn cmd_dispatch(&mut self, cb: CommandBufferId, groups: [u32; 3]);
    fn cmd_transition_image_layout(
        &mut self,
        cb: CommandBufferId,
        image: ImageId,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    );
    /// Full-extent linear blit.
    fn cmd_blit_image(&mut self, cb: CommandBufferId, src: ImageId, dst: ImageId);

    fn submit(
        &mut self,
        queue: QueueId,
        cb: CommandBufferId,
        waits: &[(SemaphoreId, vk::PipelineStageFlags)],
        signals: &[SemaphoreId],
    ) -> Result<(), DeviceError>;
}
