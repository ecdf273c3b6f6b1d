//! Compute dispatch over a fixed binding set.

use std::path::PathBuf;

use ash::vk;

use crate::device::{
    CommandBufferId, ComputePipelineDesc, DescriptorBinding, DescriptorPoolId, DescriptorResources,
    DescriptorSetId, DescriptorWrite, DeviceError, ImageId, PipelineId, RenderDevice, SetLayoutId,
    UniformBufferId,
};
use crate::layout::{ImageLayout, UniformBufferLayout};

/// One compute pipeline plus the descriptor set it dispatches with.
///
/// The binding set is fixed at construction: uniform buffers and storage
/// images, all compute-stage. Set layout and pipeline are built eagerly;
/// the descriptor set waits for the shared pool in [`ComputePass::create`].
pub struct ComputePass {
    ubos: Vec<(UniformBufferId, UniformBufferLayout)>,
    images: Vec<(ImageId, ImageLayout)>,
    set_layout: SetLayoutId,
    pipeline: PipelineId,
    descriptor_set: Option<DescriptorSetId>,
}

impl ComputePass {
    pub fn new(
        device: &mut dyn RenderDevice,
        shader: PathBuf,
        ubos: Vec<(UniformBufferId, UniformBufferLayout)>,
        images: Vec<(ImageId, ImageLayout)>,
    ) -> Result<Self, DeviceError> {
        let mut bindings = Vec::with_capacity(ubos.len() + images.len());
        for (_, layout) in &ubos {
            bindings.push(DescriptorBinding {
                binding: layout.binding,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::COMPUTE,
            });
        }
        for (_, layout) in &images {
            bindings.push(DescriptorBinding {
                binding: layout.binding,
                descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                count: 1,
                stages: vk::ShaderStageFlags::COMPUTE,
            });
        }
        let set_layout = device.create_set_layout(&bindings)?;
        let pipeline = device.create_compute_pipeline(&ComputePipelineDesc {
            shader,
            set_layout,
        })?;
        Ok(Self {
            ubos,
            images,
            set_layout,
            pipeline,
            descriptor_set: None,
        })
    }

    /// Allocates and writes the descriptor set, once. Images are written as
    /// storage in `GENERAL` layout.
    pub fn create(
        &mut self,
        device: &mut dyn RenderDevice,
        pool: DescriptorPoolId,
    ) -> Result<(), DeviceError> {
        if self.descriptor_set.is_some() {
            return Ok(());
        }
        let set = device.allocate_descriptor_set(pool, self.set_layout)?;
        let mut writes = Vec::with_capacity(self.ubos.len() + self.images.len());
        for (ubo, layout) in &self.ubos {
            writes.push(DescriptorWrite {
                binding: layout.binding,
                resources: DescriptorResources::UniformBuffer(*ubo),
            });
        }
        for (image, layout) in &self.images {
            writes.push(DescriptorWrite {
                binding: layout.binding,
                resources: DescriptorResources::StorageImages(vec![*image]),
            });
        }
        device.update_descriptor_set(set, &writes)?;
        self.descriptor_set = Some(set);
        Ok(())
    }

    /// Binds pipeline + set and dispatches enough workgroups to cover
    /// `extent`.
    pub fn record(
        &self,
        device: &mut dyn RenderDevice,
        cb: CommandBufferId,
        extent: vk::Extent2D,
        workgroups: vk::Extent3D,
    ) {
        device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, self.pipeline);
        if let Some(set) = self.descriptor_set {
            device.cmd_bind_descriptor_set(cb, vk::PipelineBindPoint::COMPUTE, self.pipeline, set);
        }
        device.cmd_dispatch(cb, dispatch_group_count(extent, workgroups));
    }

    pub fn ubo_count(&self) -> usize {
        self.ubos.len()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

/// Workgroup counts covering `extent`: ceil division in X and Y, the
/// workgroup depth passed through as Z.
pub fn dispatch_group_count(extent: vk::Extent2D, workgroups: vk::Extent3D) -> [u32; 3] {
    let ceil = |size: u32, group: u32| {
        if size % group != 0 {
            size / group + 1
        } else {
            size / group
        }
    };
    [
        ceil(extent.width, workgroups.width),
        ceil(extent.height, workgroups.height),
        workgroups.depth,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{Command, HeadlessDevice};

    #[test]
    fn dispatch_covers_full_hd_with_16x16_groups() {
        let extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        let groups = vk::Extent3D {
            width: 16,
            height: 16,
            depth: 1,
        };
        // 1080 / 16 leaves a remainder, so Y rounds up.
        assert_eq!(dispatch_group_count(extent, groups), [120, 68, 1]);
    }

    #[test]
    fn dispatch_exact_multiple_does_not_round_up() {
        let extent = vk::Extent2D {
            width: 256,
            height: 256,
        };
        let groups = vk::Extent3D {
            width: 16,
            height: 8,
            depth: 4,
        };
        assert_eq!(dispatch_group_count(extent, groups), [16, 32, 4]);
    }

    #[test]
    fn create_writes_the_set_once() {
        let mut device = HeadlessDevice::new();
        let ubo = device.register_uniform_buffer(128);
        let image = device.register_image(
            vk::Extent2D {
                width: 64,
                height: 64,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageLayout::GENERAL,
        );
        let mut pass = ComputePass::new(
            &mut device,
            "shaders/blur.comp.spv".into(),
            vec![(
                ubo,
                UniformBufferLayout {
                    binding: 0,
                    stages: vk::ShaderStageFlags::COMPUTE,
                },
            )],
            vec![(
                image,
                ImageLayout {
                    binding: 1,
                    descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                    stages: vk::ShaderStageFlags::COMPUTE,
                },
            )],
        )
        .unwrap();
        let pool = device.create_descriptor_pool(&[], 4).unwrap();
        pass.create(&mut device, pool).unwrap();
        pass.create(&mut device, pool).unwrap();
        assert_eq!(device.descriptor_set_count(), 1);

        let cb = device
            .create_command_buffer(crate::device::CommandType::Compute)
            .unwrap();
        device.begin_command_buffer(cb).unwrap();
        pass.record(
            &mut device,
            cb,
            vk::Extent2D {
                width: 100,
                height: 40,
            },
            vk::Extent3D {
                width: 16,
                height: 16,
                depth: 1,
            },
        );
        device.end_command_buffer(cb).unwrap();
        assert!(device
            .commands(cb)
            .iter()
            .any(|c| matches!(c, Command::Dispatch { groups: [7, 3, 1] })));
    }
}
