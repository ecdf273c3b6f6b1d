//! `ash`-backed [`RenderDevice`].
//!
//! The instance, device and queues are created by the embedding application
//! and handed in; this backend owns the objects it creates on top of them
//! (render passes, pipelines, descriptor machinery, command pools) and the
//! id→handle registries. Queue submission is serialized with one mutex per
//! registered queue.

use std::ffi::CStr;
use std::io::Cursor;
use std::sync::Mutex;

use ash::vk;

use crate::attachment::Attachment;
use crate::device::{
    BufferId, CommandBufferId, CommandType, ComputePipelineDesc, DescriptorBinding,
    DescriptorPoolId, DescriptorResources, DescriptorSetId, DescriptorWrite, DeviceError,
    FramebufferId, GraphicsPipelineDesc, ImageId, ImageInfo, PipelineId, QueueId, RenderDevice,
    RenderPassId, SamplerId, SemaphoreId, SetLayoutId, UniformBufferId,
};

const SHADER_ENTRY: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

struct ImageEntry {
    image: vk::Image,
    view: vk::ImageView,
    extent: vk::Extent2D,
    format: vk::Format,
    layout: vk::ImageLayout,
    /// Backing memory when this backend created the image.
    memory: Option<vk::DeviceMemory>,
}

struct PipelineEntry {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

pub struct VulkanDevice {
    instance: ash::Instance,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    graphics_pool: vk::CommandPool,
    compute_pool: vk::CommandPool,
    images: Vec<ImageEntry>,
    buffers: Vec<vk::Buffer>,
    uniform_buffers: Vec<(vk::Buffer, vk::DeviceSize)>,
    samplers: Vec<vk::Sampler>,
    render_passes: Vec<vk::RenderPass>,
    framebuffers: Vec<vk::Framebuffer>,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    descriptor_pools: Vec<vk::DescriptorPool>,
    descriptor_sets: Vec<vk::DescriptorSet>,
    pipelines: Vec<PipelineEntry>,
    command_buffers: Vec<vk::CommandBuffer>,
    semaphores: Vec<vk::Semaphore>,
    queues: Vec<Mutex<vk::Queue>>,
}

impl VulkanDevice {
    /// Wraps an externally created device. `graphics_family` and
    /// `compute_family` pick the command pools; they may be the same family.
    pub fn new(
        instance: ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        graphics_family: u32,
        compute_family: u32,
    ) -> Result<Self, DeviceError> {
        let pool = |family: u32| -> Result<vk::CommandPool, DeviceError> {
            let info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            unsafe { device.create_command_pool(&info, None) }.map_err(|result| {
                DeviceError::Vulkan {
                    call: "vkCreateCommandPool",
                    result,
                }
            })
        };
        let graphics_pool = pool(graphics_family)?;
        let compute_pool = pool(compute_family)?;
        Ok(Self {
            instance,
            device,
            physical_device,
            graphics_pool,
            compute_pool,
            images: Vec::new(),
            buffers: Vec::new(),
            uniform_buffers: Vec::new(),
            samplers: Vec::new(),
            render_passes: Vec::new(),
            framebuffers: Vec::new(),
            set_layouts: Vec::new(),
            descriptor_pools: Vec::new(),
            descriptor_sets: Vec::new(),
            pipelines: Vec::new(),
            command_buffers: Vec::new(),
            semaphores: Vec::new(),
            queues: Vec::new(),
        })
    }

    pub fn register_image(
        &mut self,
        image: vk::Image,
        view: vk::ImageView,
        extent: vk::Extent2D,
        format: vk::Format,
        layout: vk::ImageLayout,
    ) -> ImageId {
        self.images.push(ImageEntry {
            image,
            view,
            extent,
            format,
            layout,
            memory: None,
        });
        ImageId(self.images.len() as u32 - 1)
    }

    pub fn register_buffer(&mut self, buffer: vk::Buffer) -> BufferId {
        self.buffers.push(buffer);
        BufferId(self.buffers.len() as u32 - 1)
    }

    pub fn register_uniform_buffer(
        &mut self,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> UniformBufferId {
        self.uniform_buffers.push((buffer, size));
        UniformBufferId(self.uniform_buffers.len() as u32 - 1)
    }

    pub fn register_sampler(&mut self, sampler: vk::Sampler) -> SamplerId {
        self.samplers.push(sampler);
        SamplerId(self.samplers.len() as u32 - 1)
    }

    pub fn register_queue(&mut self, queue: vk::Queue) -> QueueId {
        self.queues.push(Mutex::new(queue));
        QueueId(self.queues.len() as u32 - 1)
    }

    pub fn semaphore(&self, id: SemaphoreId) -> Option<vk::Semaphore> {
        self.semaphores.get(id.0 as usize).copied()
    }

    fn image_entry(&self, id: ImageId) -> Result<&ImageEntry, DeviceError> {
        self.images
            .get(id.0 as usize)
            .ok_or(DeviceError::UnknownHandle {
                kind: "image",
                index: id.0,
            })
    }

    fn command_buffer(&self, id: CommandBufferId) -> Result<vk::CommandBuffer, DeviceError> {
        self.command_buffers
            .get(id.0 as usize)
            .copied()
            .ok_or(DeviceError::UnknownHandle {
                kind: "command buffer",
                index: id.0,
            })
    }

    fn cb(&self, id: CommandBufferId) -> Option<vk::CommandBuffer> {
        let cb = self.command_buffers.get(id.0 as usize).copied();
        if cb.is_none() {
            log::error!("recording into unknown command buffer {}", id.0);
        }
        cb
    }

    fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32, DeviceError> {
        let memory =
            unsafe { self.instance.get_physical_device_memory_properties(self.physical_device) };
        for i in 0..memory.memory_type_count {
            if type_bits & (1 << i) != 0
                && memory.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
            {
                return Ok(i);
            }
        }
        Err(DeviceError::Vulkan {
            call: "memory type selection",
            result: vk::Result::ERROR_FEATURE_NOT_PRESENT,
        })
    }

    fn load_shader(&self, path: &std::path::Path) -> Result<vk::ShaderModule, DeviceError> {
        let bytes = std::fs::read(path).map_err(|source| DeviceError::Shader {
            path: path.to_path_buf(),
            source,
        })?;
        let words = ash::util::read_spv(&mut Cursor::new(&bytes)).map_err(|source| {
            DeviceError::Shader {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let info = vk::ShaderModuleCreateInfo::builder().code(&words);
        unsafe { self.device.create_shader_module(&info, None) }.map_err(|result| {
            DeviceError::Vulkan {
                call: "vkCreateShaderModule",
                result,
            }
        })
    }

    fn create_pipeline_layout(
        &self,
        set_layout: SetLayoutId,
    ) -> Result<vk::PipelineLayout, DeviceError> {
        let layout =
            self.set_layouts
                .get(set_layout.0 as usize)
                .ok_or(DeviceError::UnknownHandle {
                    kind: "set layout",
                    index: set_layout.0,
                })?;
        let layouts = [*layout];
        let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&layouts);
        unsafe { self.device.create_pipeline_layout(&info, None) }.map_err(|result| {
            DeviceError::Vulkan {
                call: "vkCreatePipelineLayout",
                result,
            }
        })
    }
}

fn descriptor_type_of(resources: &DescriptorResources) -> vk::DescriptorType {
    match resources {
        DescriptorResources::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorResources::CombinedImageSamplers(_) => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorResources::SampledImages(_) => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorResources::StorageImages(_) => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorResources::Samplers(_) => vk::DescriptorType::SAMPLER,
        DescriptorResources::StorageBuffer { .. } => vk::DescriptorType::STORAGE_BUFFER,
    }
}

fn is_depth_format(format: vk::Format) -> bool {
    DEPTH_CANDIDATES.contains(&format) || format == vk::Format::D16_UNORM
}

fn aspect_of(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_format(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

fn access_for_layout(layout: vk::ImageLayout) -> vk::AccessFlags {
    if layout == vk::ImageLayout::TRANSFER_DST_OPTIMAL {
        vk::AccessFlags::TRANSFER_WRITE
    } else if layout == vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
        vk::AccessFlags::TRANSFER_READ
    } else if layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
        vk::AccessFlags::COLOR_ATTACHMENT_WRITE
    } else if layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
        vk::AccessFlags::SHADER_READ
    } else if layout == vk::ImageLayout::GENERAL {
        vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
    } else if layout == vk::ImageLayout::PRESENT_SRC_KHR {
        vk::AccessFlags::MEMORY_READ
    } else {
        vk::AccessFlags::empty()
    }
}

impl RenderDevice for VulkanDevice {
    fn find_depth_format(&self) -> Result<vk::Format, DeviceError> {
        for format in DEPTH_CANDIDATES {
            let props = unsafe {
                self.instance
                    .get_physical_device_format_properties(self.physical_device, format)
            };
            if props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            {
                return Ok(format);
            }
        }
        Err(DeviceError::NoDepthFormat)
    }

    fn image_info(&self, image: ImageId) -> Result<ImageInfo, DeviceError> {
        let entry = self.image_entry(image)?;
        Ok(ImageInfo {
            extent: entry.extent,
            format: entry.format,
            layout: entry.layout,
        })
    }

    fn create_render_pass(&mut self, attachments: &[Attachment]) -> Result<RenderPassId, DeviceError> {
        let descriptions: Vec<vk::AttachmentDescription> = attachments
            .iter()
            .map(|a| {
                vk::AttachmentDescription::builder()
                    .format(a.format)
                    .samples(a.sample_count)
                    .load_op(a.load_op)
                    .store_op(a.store_op)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(a.final_layout)
                    .build()
            })
            .collect();

        let mut color_refs = Vec::new();
        let mut depth_ref = None;
        for (i, attachment) in attachments.iter().enumerate() {
            if attachment.is_depth() {
                depth_ref = Some(vk::AttachmentReference {
                    attachment: i as u32,
                    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                });
            } else {
                color_refs.push(vk::AttachmentReference {
                    attachment: i as u32,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                });
            }
        }
        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth);
        }
        let subpasses = [subpass.build()];

        let dependencies = [vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build()];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&descriptions)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let render_pass =
            unsafe { self.device.create_render_pass(&info, None) }.map_err(|result| {
                DeviceError::Vulkan {
                    call: "vkCreateRenderPass",
                    result,
                }
            })?;
        self.render_passes.push(render_pass);
        Ok(RenderPassId(self.render_passes.len() as u32 - 1))
    }

    fn create_attachment_image(&mut self, attachment: &Attachment) -> Result<ImageId, DeviceError> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(attachment.format)
            .extent(vk::Extent3D {
                width: attachment.extent.width,
                height: attachment.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(attachment.sample_count)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(attachment.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None) }.map_err(|result| {
            DeviceError::Vulkan {
                call: "vkCreateImage",
                result,
            }
        })?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory_type = self.find_memory_type(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let alloc = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = unsafe { self.device.allocate_memory(&alloc, None) }.map_err(|result| {
            DeviceError::Vulkan {
                call: "vkAllocateMemory",
                result,
            }
        })?;
        unsafe { self.device.bind_image_memory(image, memory, 0) }.map_err(|result| {
            DeviceError::Vulkan {
                call: "vkBindImageMemory",
                result,
            }
        })?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(attachment.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_of(attachment.format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { self.device.create_image_view(&view_info, None) }.map_err(
            |result| DeviceError::Vulkan {
                call: "vkCreateImageView",
                result,
            },
        )?;

        self.images.push(ImageEntry {
            image,
            view,
            extent: attachment.extent,
            format: attachment.format,
            layout: vk::ImageLayout::UNDEFINED,
            memory: Some(memory),
        });
        Ok(ImageId(self.images.len() as u32 - 1))
    }

    fn create_framebuffer(
        &mut self,
        render_pass: RenderPassId,
        attachments: &[ImageId],
        extent: vk::Extent2D,
    ) -> Result<FramebufferId, DeviceError> {
        let pass = self
            .render_passes
            .get(render_pass.0 as usize)
            .copied()
            .ok_or(DeviceError::UnknownHandle {
                kind: "render pass",
                index: render_pass.0,
            })?;
        let views = attachments
            .iter()
            .map(|&id| self.image_entry(id).map(|e| e.view))
            .collect::<Result<Vec<_>, _>>()?;
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(pass)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&info, None) }.map_err(
            |result| DeviceError::Vulkan {
                call: "vkCreateFramebuffer",
                result,
            },
        )?;
        self.framebuffers.push(framebuffer);
        Ok(FramebufferId(self.framebuffers.len() as u32 - 1))
    }

    fn create_set_layout(&mut self, bindings: &[DescriptorBinding]) -> Result<SetLayoutId, DeviceError> {
        let entries: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
                    .build()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&entries);
        let layout = unsafe { self.device.create_descriptor_set_layout(&info, None) }.map_err(
            |result| DeviceError::Vulkan {
                call: "vkCreateDescriptorSetLayout",
                result,
            },
        )?;
        self.set_layouts.push(layout);
        Ok(SetLayoutId(self.set_layouts.len() as u32 - 1))
    }

    fn create_descriptor_pool(
        &mut self,
        sizes: &[(vk::DescriptorType, u32)],
        max_sets: u32,
    ) -> Result<DescriptorPoolId, DeviceError> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .map(|&(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count,
            })
            .collect();
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(max_sets);
        let pool = unsafe { self.device.create_descriptor_pool(&info, None) }.map_err(
            |result| DeviceError::Vulkan {
                call: "vkCreateDescriptorPool",
                result,
            },
        )?;
        self.descriptor_pools.push(pool);
        Ok(DescriptorPoolId(self.descriptor_pools.len() as u32 - 1))
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: DescriptorPoolId,
        layout: SetLayoutId,
    ) -> Result<DescriptorSetId, DeviceError> {
        let pool = self
            .descriptor_pools
            .get(pool.0 as usize)
            .copied()
            .ok_or(DeviceError::UnknownHandle {
                kind: "descriptor pool",
                index: pool.0,
            })?;
        let layout = self
            .set_layouts
            .get(layout.0 as usize)
            .copied()
            .ok_or(DeviceError::UnknownHandle {
                kind: "set layout",
                index: layout.0,
            })?;
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }.map_err(|result| {
            DeviceError::Vulkan {
                call: "vkAllocateDescriptorSets",
                result,
            }
        })?;
        self.descriptor_sets.push(sets[0]);
        Ok(DescriptorSetId(self.descriptor_sets.len() as u32 - 1))
    }

    fn update_descriptor_set(
        &mut self,
        set: DescriptorSetId,
        writes: &[DescriptorWrite],
    ) -> Result<(), DeviceError> {
        let set = self
            .descriptor_sets
            .get(set.0 as usize)
            .copied()
            .ok_or(DeviceError::UnknownHandle {
                kind: "descriptor set",
                index: set.0,
            })?;

        // Info arrays must outlive the write structs pointing into them.
        let mut buffer_infos: Vec<Vec<vk::DescriptorBufferInfo>> = Vec::new();
        let mut image_infos: Vec<Vec<vk::DescriptorImageInfo>> = Vec::new();
        for write in writes {
            match &write.resources {
                DescriptorResources::UniformBuffer(ubo) => {
                    let &(buffer, range) = self
                        .uniform_buffers
                        .get(ubo.0 as usize)
                        .ok_or(DeviceError::UnknownHandle {
                            kind: "uniform buffer",
                            index: ubo.0,
                        })?;
                    buffer_infos.push(vec![vk::DescriptorBufferInfo {
                        buffer,
                        offset: 0,
                        range,
                    }]);
                    image_infos.push(Vec::new());
                }
                DescriptorResources::StorageBuffer { buffer, range } => {
                    let handle = self
                        .buffers
                        .get(buffer.0 as usize)
                        .copied()
                        .ok_or(DeviceError::UnknownHandle {
                            kind: "buffer",
                            index: buffer.0,
                        })?;
                    buffer_infos.push(vec![vk::DescriptorBufferInfo {
                        buffer: handle,
                        offset: 0,
                        range: *range,
                    }]);
                    image_infos.push(Vec::new());
                }
                DescriptorResources::CombinedImageSamplers(textures) => {
                    let mut infos = Vec::with_capacity(textures.len());
                    for texture in textures {
                        let entry = self.image_entry(texture.image)?;
                        let sampler = self
                            .samplers
                            .get(texture.sampler.0 as usize)
                            .copied()
                            .ok_or(DeviceError::UnknownHandle {
                                kind: "sampler",
                                index: texture.sampler.0,
                            })?;
                        infos.push(vk::DescriptorImageInfo {
                            sampler,
                            image_view: entry.view,
                            image_layout: entry.layout,
                        });
                    }
                    image_infos.push(infos);
                    buffer_infos.push(Vec::new());
                }
                DescriptorResources::SampledImages(images) => {
                    let mut infos = Vec::with_capacity(images.len());
                    for &image in images {
                        let entry = self.image_entry(image)?;
                        infos.push(vk::DescriptorImageInfo {
                            sampler: vk::Sampler::null(),
                            image_view: entry.view,
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        });
                    }
                    image_infos.push(infos);
                    buffer_infos.push(Vec::new());
                }
                DescriptorResources::StorageImages(images) => {
                    let mut infos = Vec::with_capacity(images.len());
                    for &image in images {
                        let entry = self.image_entry(image)?;
                        infos.push(vk::DescriptorImageInfo {
                            sampler: vk::Sampler::null(),
                            image_view: entry.view,
                            image_layout: vk::ImageLayout::GENERAL,
                        });
                    }
                    image_infos.push(infos);
                    buffer_infos.push(Vec::new());
                }
                DescriptorResources::Samplers(samplers) => {
                    let mut infos = Vec::with_capacity(samplers.len());
                    for id in samplers {
                        let sampler = self
                            .samplers
                            .get(id.0 as usize)
                            .copied()
                            .ok_or(DeviceError::UnknownHandle {
                                kind: "sampler",
                                index: id.0,
                            })?;
                        infos.push(vk::DescriptorImageInfo {
                            sampler,
                            image_view: vk::ImageView::null(),
                            image_layout: vk::ImageLayout::UNDEFINED,
                        });
                    }
                    image_infos.push(infos);
                    buffer_infos.push(Vec::new());
                }
            }
        }

        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .enumerate()
            .map(|(i, write)| {
                let mut builder = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .descriptor_type(descriptor_type_of(&write.resources));
                if !buffer_infos[i].is_empty() {
                    builder = builder.buffer_info(&buffer_infos[i]);
                } else {
                    builder = builder.image_info(&image_infos[i]);
                }
                builder.build()
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
        Ok(())
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> Result<PipelineId, DeviceError> {
        let render_pass = self
            .render_passes
            .get(desc.render_pass.0 as usize)
            .copied()
            .ok_or(DeviceError::UnknownHandle {
                kind: "render pass",
                index: desc.render_pass.0,
            })?;
        let layout = self.create_pipeline_layout(desc.set_layout)?;

        let vertex = self.load_shader(&desc.vertex_shader)?;
        let geometry = desc
            .geometry_shader
            .as_deref()
            .map(|p| self.load_shader(p))
            .transpose()?;
        let fragment = desc
            .fragment_shader
            .as_deref()
            .map(|p| self.load_shader(p))
            .transpose()?;

        let mut stages = vec![vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex)
            .name(SHADER_ENTRY)
            .build()];
        if let Some(module) = geometry {
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(vk::ShaderStageFlags::GEOMETRY)
                    .module(module)
                    .name(SHADER_ENTRY)
                    .build(),
            );
        }
        if let Some(module) = fragment {
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(module)
                    .name(SHADER_ENTRY)
                    .build(),
            );
        }

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&desc.bindings)
            .vertex_attribute_descriptions(&desc.attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(desc.topology)
            .primitive_restart_enable(false);

        let width = desc.extent.width as f32;
        let height = desc.extent.height as f32;
        let viewports = [vk::Viewport {
            x: width * desc.viewport_offset[0],
            y: height * desc.viewport_offset[1],
            width: width * desc.viewport_scale[0],
            height: height * desc.viewport_scale[1],
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: desc.extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewports)
            .scissors(&scissors);

        let mut conservative =
            vk::PipelineRasterizationConservativeStateCreateInfoEXT::builder()
                .conservative_rasterization_mode(vk::ConservativeRasterizationModeEXT::OVERESTIMATE);
        let mut rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(desc.polygon_mode)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        if desc.conservative_rasterization {
            rasterization = rasterization.push_next(&mut conservative);
        }

        let multisample =
            vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(desc.sample_count);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_test)
            .depth_compare_op(vk::CompareOp::LESS);

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .alpha_blending
            .iter()
            .map(|&enabled| {
                vk::PipelineColorBlendAttachmentState::builder()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
                    .blend_enable(enabled)
                    .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                    .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                    .color_blend_op(vk::BlendOp::ADD)
                    .src_alpha_blend_factor(vk::BlendFactor::ONE)
                    .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                    .alpha_blend_op(vk::BlendOp::ADD)
                    .build()
            })
            .collect();
        let blend_state =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&blend_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);
        let result = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info.build()], None)
        };

        unsafe {
            self.device.destroy_shader_module(vertex, None);
            if let Some(module) = geometry {
                self.device.destroy_shader_module(module, None);
            }
            if let Some(module) = fragment {
                self.device.destroy_shader_module(module, None);
            }
        }

        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, result)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(DeviceError::Vulkan {
                    call: "vkCreateGraphicsPipelines",
                    result,
                });
            }
        };
        self.pipelines.push(PipelineEntry { pipeline, layout });
        Ok(PipelineId(self.pipelines.len() as u32 - 1))
    }

    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc) -> Result<PipelineId, DeviceError> {
        let layout = self.create_pipeline_layout(desc.set_layout)?;
        let module = self.load_shader(&desc.shader)?;
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(SHADER_ENTRY)
            .build();
        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout);
        let result = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info.build()], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };
        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, result)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(DeviceError::Vulkan {
                    call: "vkCreateComputePipelines",
                    result,
                });
            }
        };
        self.pipelines.push(PipelineEntry { pipeline, layout });
        Ok(PipelineId(self.pipelines.len() as u32 - 1))
    }

    fn create_command_buffer(&mut self, kind: CommandType) -> Result<CommandBufferId, DeviceError> {
        let pool = match kind {
            CommandType::Compute => self.compute_pool,
            CommandType::Graphics | CommandType::Transfer => self.graphics_pool,
        };
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }.map_err(
            |result| DeviceError::Vulkan {
                call: "vkAllocateCommandBuffers",
                result,
            },
        )?;
        self.command_buffers.push(buffers[0]);
        Ok(CommandBufferId(self.command_buffers.len() as u32 - 1))
    }

    fn create_semaphore(&mut self) -> Result<SemaphoreId, DeviceError> {
        let info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { self.device.create_semaphore(&info, None) }.map_err(
            |result| DeviceError::Vulkan {
                call: "vkCreateSemaphore",
                result,
            },
        )?;
        self.semaphores.push(semaphore);
        Ok(SemaphoreId(self.semaphores.len() as u32 - 1))
    }

    fn begin_command_buffer(&mut self, cb: CommandBufferId) -> Result<(), DeviceError> {
        let cb = self.command_buffer(cb)?;
        let info = vk::CommandBufferBeginInfo::builder();
        unsafe { self.device.begin_command_buffer(cb, &info) }.map_err(|result| {
            DeviceError::Vulkan {
                call: "vkBeginCommandBuffer",
                result,
            }
        })
    }

    fn end_command_buffer(&mut self, cb: CommandBufferId) -> Result<(), DeviceError> {
        let cb = self.command_buffer(cb)?;
        unsafe { self.device.end_command_buffer(cb) }.map_err(|result| DeviceError::Vulkan {
            call: "vkEndCommandBuffer",
            result,
        })
    }

    fn cmd_begin_render_pass(
        &mut self,
        cb: CommandBufferId,
        render_pass: RenderPassId,
        framebuffer: FramebufferId,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        let (Some(cb), Some(&pass), Some(&framebuffer)) = (
            self.cb(cb),
            self.render_passes.get(render_pass.0 as usize),
            self.framebuffers.get(framebuffer.0 as usize),
        ) else {
            return;
        };
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(cb, &info, vk::SubpassContents::INLINE)
        };
    }

    fn cmd_end_render_pass(&mut self, cb: CommandBufferId) {
        if let Some(cb) = self.cb(cb) {
            unsafe { self.device.cmd_end_render_pass(cb) };
        }
    }

    fn cmd_bind_pipeline(
        &mut self,
        cb: CommandBufferId,
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineId,
    ) {
        let (Some(cb), Some(entry)) = (self.cb(cb), self.pipelines.get(pipeline.0 as usize))
        else {
            return;
        };
        unsafe { self.device.cmd_bind_pipeline(cb, bind_point, entry.pipeline) };
    }

    fn cmd_bind_vertex_buffer(&mut self, cb: CommandBufferId, binding: u32, buffer: BufferId) {
        let (Some(cb), Some(&buffer)) = (self.cb(cb), self.buffers.get(buffer.0 as usize)) else {
            return;
        };
        unsafe { self.device.cmd_bind_vertex_buffers(cb, binding, &[buffer], &[0]) };
    }

    fn cmd_bind_index_buffer(&mut self, cb: CommandBufferId, buffer: BufferId) {
        let (Some(cb), Some(&buffer)) = (self.cb(cb), self.buffers.get(buffer.0 as usize)) else {
            return;
        };
        unsafe {
            self.device
                .cmd_bind_index_buffer(cb, buffer, 0, vk::IndexType::UINT32)
        };
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        cb: CommandBufferId,
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineId,
        set: DescriptorSetId,
    ) {
        let (Some(cb), Some(entry), Some(&set)) = (
            self.cb(cb),
            self.pipelines.get(pipeline.0 as usize),
            self.descriptor_sets.get(set.0 as usize),
        ) else {
            return;
        };
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(cb, bind_point, entry.layout, 0, &[set], &[])
        };
    }

    fn cmd_draw_indexed(&mut self, cb: CommandBufferId, index_count: u32, instance_count: u32) {
        if let Some(cb) = self.cb(cb) {
            unsafe { self.device.cmd_draw_indexed(cb, index_count, instance_count, 0, 0, 0) };
        }
    }

    fn cmd_dispatch(&mut self, cb: CommandBufferId, groups: [u32; 3]) {
        if let Some(cb) = self.cb(cb) {
            unsafe { self.device.cmd_dispatch(cb, groups[0], groups[1], groups[2]) };
        }
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
        let Some(cb) = self.cb(cb) else {
            return;
        };
        let Some(entry) = self.images.get_mut(image.0 as usize) else {
            log::error!("transition of unknown image {}", image.0);
            return;
        };
        entry.layout = to;
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(from)
            .new_layout(to)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(entry.image)
            .src_access_mask(access_for_layout(from))
            .dst_access_mask(access_for_layout(to))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_of(entry.format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        };
    }

    fn cmd_blit_image(&mut self, cb: CommandBufferId, src: ImageId, dst: ImageId) {
        let (Some(cb), Some(src), Some(dst)) = (
            self.cb(cb),
            self.images.get(src.0 as usize),
            self.images.get(dst.0 as usize),
        ) else {
            return;
        };
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageBlit {
            src_subresource: layers,
            src_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: src.extent.width as i32,
                    y: src.extent.height as i32,
                    z: 1,
                },
            ],
            dst_subresource: layers,
            dst_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: dst.extent.width as i32,
                    y: dst.extent.height as i32,
                    z: 1,
                },
            ],
        };
        unsafe {
            self.device.cmd_blit_image(
                cb,
                src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::LINEAR,
            )
        };
    }

    fn submit(
        &mut self,
        queue: QueueId,
        cb: CommandBufferId,
        waits: &[(SemaphoreId, vk::PipelineStageFlags)],
        signals: &[SemaphoreId],
    ) -> Result<(), DeviceError> {
        let cb = self.command_buffer(cb)?;
        let lookup = |id: &SemaphoreId| {
            self.semaphores
                .get(id.0 as usize)
                .copied()
                .ok_or(DeviceError::UnknownHandle {
                    kind: "semaphore",
                    index: id.0,
                })
        };
        let wait_semaphores = waits
            .iter()
            .map(|(id, _)| lookup(id))
            .collect::<Result<Vec<_>, _>>()?;
        let wait_stages: Vec<vk::PipelineStageFlags> = waits.iter().map(|&(_, s)| s).collect();
        let signal_semaphores = signals.iter().map(lookup).collect::<Result<Vec<_>, _>>()?;
        let queue = self
            .queues
            .get(queue.0 as usize)
            .ok_or(DeviceError::UnknownHandle {
                kind: "queue",
                index: queue.0,
            })?;

        let command_buffers = [cb];
        let info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        let queue = queue.lock().map_err(|_| DeviceError::Vulkan {
            call: "queue lock",
            result: vk::Result::ERROR_UNKNOWN,
        })?;
        unsafe { self.device.queue_submit(*queue, &[info], vk::Fence::null()) }.map_err(
            |result| DeviceError::Vulkan {
                call: "vkQueueSubmit",
                result,
            },
        )
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            for framebuffer in self.framebuffers.drain(..) {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for entry in self.pipelines.drain(..) {
                self.device.destroy_pipeline(entry.pipeline, None);
                self.device.destroy_pipeline_layout(entry.layout, None);
            }
            for render_pass in self.render_passes.drain(..) {
                self.device.destroy_render_pass(render_pass, None);
            }
            for layout in self.set_layouts.drain(..) {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            for pool in self.descriptor_pools.drain(..) {
                self.device.destroy_descriptor_pool(pool, None);
            }
            for semaphore in self.semaphores.drain(..) {
                self.device.destroy_semaphore(semaphore, None);
            }
            for entry in self.images.drain(..) {
                // Externally registered images stay with their owner.
                if let Some(memory) = entry.memory {
                    self.device.destroy_image_view(entry.view, None);
                    self.device.destroy_image(entry.image, None);
                    self.device.free_memory(memory, None);
                }
            }
            self.device.destroy_command_pool(self.graphics_pool, None);
            self.device.destroy_command_pool(self.compute_pool, None);
        }
    }
}
