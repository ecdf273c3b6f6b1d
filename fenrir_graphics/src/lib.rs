//! Declarative scene / render-pass / compute-pass orchestration over a
//! Vulkan-style device.
//!
//! Effects declare their frame graph against a [`Scene`]: named command
//! buffers, render passes with resolved attachments, renderers with meshes,
//! and compute dispatches. A single [`Scene::record`] call then materializes
//! every GPU object (descriptor pool, pipelines, descriptor sets) and bakes
//! one command buffer per swapchain image; [`Scene::frame`] re-submits the
//! prebuilt buffers with semaphore chaining every frame.
//!
//! The device itself sits behind the [`RenderDevice`] trait: resources owned
//! by the application (images, buffers, samplers, uniform buffers) are
//! registered with the backend and referenced by copyable ids. Two backends
//! ship: [`HeadlessDevice`] for dry runs and tests, and [`VulkanDevice`]
//! wrapping an externally created `ash` device.

pub mod attachment;
pub mod compute;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod headless;
pub mod layout;
pub mod model;
pub mod render_pass;
pub mod renderer;
pub mod scene;
pub mod vertex;
pub mod vulkan;

pub use attachment::{Attachment, RenderPassOutput};
pub use compute::{dispatch_group_count, ComputePass};
pub use descriptor::DescriptorPool;
pub use device::{
    BufferId, CommandBufferId, CommandType, ComputePipelineDesc, DescriptorBinding,
    DescriptorPoolId, DescriptorResources, DescriptorSetId, DescriptorWrite, DeviceError,
    FramebufferId, GraphicsPipelineDesc, ImageId, ImageInfo, PipelineId, QueueId, RenderDevice,
    RenderPassId, SamplerId, SemaphoreId, SetLayoutId, UniformBufferId,
};
pub use error::{DebugSink, LogSink, SceneError, Severity};
pub use headless::{Command, FramebufferRecord, HeadlessDevice, Submission};
pub use layout::{BufferLayout, ImageLayout, SamplerLayout, TextureLayout, UniformBufferLayout};
pub use model::{Font, InstanceBufferRef, Model, TextGeometry, Texture, VertexBufferRef};
pub use render_pass::RenderPass;
pub use renderer::{MeshBindings, Renderer, RendererDesc};
pub use scene::{
    AddModelInfo, AddTextInfo, CommandBufferCreateInfo, ComputeBindingSet, ComputePassCreateInfo,
    ComputePassIndex, PassIndex, RecordHook, RenderPassCreateInfo, RendererCreateInfo,
    RendererIndex, Scene, SceneBufferId, SceneCreateInfo,
};
pub use vertex::{
    resolve_vertex_input, InstanceSingleId, InstanceTemplate, Vertex2d, Vertex2dTextured,
    Vertex2dTexturedMaterial, Vertex3dMaterial, VertexTemplate,
};
pub use vulkan::VulkanDevice;
