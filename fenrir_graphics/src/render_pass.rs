//! Native render pass + framebuffer ownership.

use ash::vk;

use crate::attachment::RenderPassOutput;
use crate::device::{CommandBufferId, DeviceError, FramebufferId, ImageId, RenderDevice, RenderPassId};

/// A created render pass with its framebuffers: one per swapchain image for
/// swapchain-backed passes, exactly one over self-created offscreen images
/// otherwise.
pub struct RenderPass {
    render_pass: RenderPassId,
    framebuffers: Vec<FramebufferId>,
    extent: vk::Extent2D,
    /// Images this pass created for its attachments, in attachment order
    /// (swapchain color slots excluded).
    images: Vec<ImageId>,
}

impl RenderPass {
    /// Builds a pass targeting the swapchain: the color slot of framebuffer
    /// `i` is `swap_chain_images[i]`, every other slot gets one shared
    /// created image.
    pub fn new_swap_chain(
        device: &mut dyn RenderDevice,
        outputs: &[RenderPassOutput],
        swap_chain_images: &[ImageId],
    ) -> Result<Self, DeviceError> {
        let attachments: Vec<_> = outputs.iter().map(|o| o.attachment).collect();
        let render_pass = device.create_render_pass(&attachments)?;
        let extent = attachments[0].extent;

        // Non-color slots are shared across all framebuffers.
        let mut shared = Vec::with_capacity(attachments.len());
        let mut images = Vec::new();
        for attachment in &attachments {
            if attachment.usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
                shared.push(None);
            } else {
                let image = match attachment.image {
                    Some(image) => image,
                    None => {
                        let image = device.create_attachment_image(attachment)?;
                        images.push(image);
                        image
                    }
                };
                shared.push(Some(image));
            }
        }

        let mut framebuffers = Vec::with_capacity(swap_chain_images.len());
        for &swap_image in swap_chain_images {
            let slots: Vec<ImageId> = shared
                .iter()
                .map(|slot| slot.unwrap_or(swap_image))
                .collect();
            framebuffers.push(device.create_framebuffer(render_pass, &slots, extent)?);
        }
        Ok(Self {
            render_pass,
            framebuffers,
            extent,
            images,
        })
    }

    /// Builds an offscreen pass: every attachment without a bound image gets
    /// one created for it.
    pub fn new_offscreen(
        device: &mut dyn RenderDevice,
        outputs: &[RenderPassOutput],
    ) -> Result<Self, DeviceError> {
        let attachments: Vec<_> = outputs.iter().map(|o| o.attachment).collect();
        let render_pass = device.create_render_pass(&attachments)?;
        let extent = attachments[0].extent;

        let mut slots = Vec::with_capacity(attachments.len());
        let mut images = Vec::new();
        for attachment in &attachments {
            let image = match attachment.image {
                Some(image) => image,
                None => {
                    let image = device.create_attachment_image(attachment)?;
                    images.push(image);
                    image
                }
            };
            slots.push(image);
        }
        let framebuffer = device.create_framebuffer(render_pass, &slots, extent)?;
        Ok(Self {
            render_pass,
            framebuffers: vec![framebuffer],
            extent,
            images,
        })
    }

    pub fn begin(
        &self,
        device: &mut dyn RenderDevice,
        cb: CommandBufferId,
        framebuffer_index: usize,
        clear_values: &[vk::ClearValue],
    ) {
        let framebuffer = self.framebuffers[framebuffer_index.min(self.framebuffers.len() - 1)];
        device.cmd_begin_render_pass(cb, self.render_pass, framebuffer, self.extent, clear_values);
    }

    pub fn end(&self, device: &mut dyn RenderDevice, cb: CommandBufferId) {
        device.cmd_end_render_pass(cb);
    }

    pub fn id(&self) -> RenderPassId {
        self.render_pass
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Offscreen images this pass created, in attachment order.
    pub fn images(&self) -> &[ImageId] {
        &self.images
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::resolve_outputs;
    use crate::headless::HeadlessDevice;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    #[test]
    fn swapchain_pass_builds_one_framebuffer_per_image() {
        let mut device = HeadlessDevice::new();
        let swap_images: Vec<ImageId> = (0..3)
            .map(|_| device.register_image(EXTENT, vk::Format::B8G8R8A8_UNORM, vk::ImageLayout::UNDEFINED))
            .collect();
        let outputs = resolve_outputs(
            &[],
            true,
            EXTENT,
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::D32_SFLOAT,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .unwrap();
        let pass = RenderPass::new_swap_chain(&mut device, &outputs, &swap_images).unwrap();
        assert_eq!(pass.framebuffers.len(), 3);
        // One shared depth image was created.
        assert_eq!(pass.images().len(), 1);
        // Each framebuffer pairs the shared depth with its own color image.
        let fbs = device.framebuffers();
        assert_eq!(fbs[0].attachments[0], pass.images()[0]);
        assert_eq!(fbs[0].attachments[1], swap_images[0]);
        assert_eq!(fbs[2].attachments[1], swap_images[2]);
    }

    #[test]
    fn offscreen_pass_creates_missing_images() {
        let mut device = HeadlessDevice::new();
        let bound = device.register_image(EXTENT, vk::Format::R8G8B8A8_UNORM, vk::ImageLayout::UNDEFINED);
        let mut first = RenderPassOutput::new(
            crate::attachment::Attachment::new(
                EXTENT,
                vk::Format::R8G8B8A8_UNORM,
                vk::SampleCountFlags::TYPE_1,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AttachmentStoreOp::STORE,
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ),
            vk::ClearValue::default(),
        );
        first.attachment.image = Some(bound);
        let outputs = resolve_outputs(
            &[first],
            false,
            EXTENT,
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::D32_SFLOAT,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .unwrap();
        let pass = RenderPass::new_offscreen(&mut device, &outputs).unwrap();
        assert_eq!(pass.framebuffers.len(), 1);
        // Only the synthesized depth needed an image.
        assert_eq!(pass.images().len(), 1);
        let fb = &device.framebuffers()[0];
        assert_eq!(fb.attachments[0], bound);
        assert_eq!(fb.attachments[1], pass.images()[0]);
    }
}
