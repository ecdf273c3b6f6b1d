//! Render-pass attachments and output resolution.
//!
//! `resolve_outputs` normalizes what a caller declared into the attachment
//! list the native render pass is created from. It runs before any device
//! object exists, so it is a pure function and is tested as one.

use ash::vk;

use crate::device::ImageId;
use crate::error::SceneError;

/// One attachment of a render pass.
#[derive(Clone, Copy, Debug)]
pub struct Attachment {
    /// `{0, 0}` inherits the extent during resolution.
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub sample_count: vk::SampleCountFlags,
    pub final_layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub usage: vk::ImageUsageFlags,
    /// Pre-existing image to attach; `None` means the pass creates (or, for
    /// a swapchain color slot, borrows) the image.
    pub image: Option<ImageId>,
}

impl Attachment {
    pub fn new(
        extent: vk::Extent2D,
        format: vk::Format,
        sample_count: vk::SampleCountFlags,
        final_layout: vk::ImageLayout,
        store_op: vk::AttachmentStoreOp,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            extent,
            format,
            sample_count,
            final_layout,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op,
            usage,
            image: None,
        }
    }

    pub fn is_depth(&self) -> bool {
        self.usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
    }
}

/// An attachment plus the clear value used when its pass begins.
#[derive(Clone, Copy)]
pub struct RenderPassOutput {
    pub attachment: Attachment,
    pub clear_value: vk::ClearValue,
}

impl std::fmt::Debug for RenderPassOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // `vk::ClearValue` is a union and has no `Debug` impl.
        f.debug_struct("RenderPassOutput")
            .field("attachment", &self.attachment)
            .finish_non_exhaustive()
    }
}

impl RenderPassOutput {
    pub fn new(attachment: Attachment, clear_value: vk::ClearValue) -> Self {
        Self {
            attachment,
            clear_value,
        }
    }
}

fn depth_output(extent: vk::Extent2D, format: vk::Format) -> RenderPassOutput {
    RenderPassOutput {
        attachment: Attachment::new(
            extent,
            format,
            vk::SampleCountFlags::TYPE_1,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::AttachmentStoreOp::DONT_CARE,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        ),
        clear_value: vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    }
}

/// Normalizes declared outputs.
///
/// Swapchain-backed passes ignore the declaration entirely: they always
/// render to [synthesized depth, swapchain color], the color finishing in
/// `color_final_layout` (present-ready, or transfer-src when the scene blits
/// a mirror copy afterwards). Custom passes must declare at least one
/// output; zero extents inherit from the first declared attachment, falling
/// back to the swapchain extent, and a depth attachment is appended when
/// none was declared.
pub(crate) fn resolve_outputs(
    declared: &[RenderPassOutput],
    output_is_swap_chain: bool,
    swapchain_extent: vk::Extent2D,
    swapchain_format: vk::Format,
    depth_format: vk::Format,
    color_final_layout: vk::ImageLayout,
) -> Result<Vec<RenderPassOutput>, SceneError> {
    if output_is_swap_chain {
        let color = RenderPassOutput {
            attachment: Attachment::new(
                swapchain_extent,
                swapchain_format,
                vk::SampleCountFlags::TYPE_1,
                color_final_layout,
                vk::AttachmentStoreOp::STORE,
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ),
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [1.0, 0.0, 0.0, 1.0],
                },
            },
        };
        return Ok(vec![depth_output(swapchain_extent, depth_format), color]);
    }

    if declared.is_empty() {
        return Err(SceneError::EmptyOutputs);
    }
    let mut outputs = declared.to_vec();
    let inherited = match outputs[0].attachment.extent {
        vk::Extent2D {
            width: 0,
            height: 0,
        } => swapchain_extent,
        extent => extent,
    };
    for output in &mut outputs {
        if output.attachment.extent.width == 0 && output.attachment.extent.height == 0 {
            output.attachment.extent = inherited;
        }
    }
    if !outputs.iter().any(|o| o.attachment.is_depth()) {
        outputs.push(depth_output(inherited, depth_format));
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 1280,
        height: 720,
    };

    fn color_output(extent: vk::Extent2D) -> RenderPassOutput {
        RenderPassOutput {
            attachment: Attachment::new(
                extent,
                vk::Format::R8G8B8A8_UNORM,
                vk::SampleCountFlags::TYPE_1,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AttachmentStoreOp::STORE,
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ),
            clear_value: vk::ClearValue::default(),
        }
    }

    #[test]
    fn swapchain_pass_is_depth_then_present_color() {
        let outputs = resolve_outputs(
            &[],
            true,
            EXTENT,
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::D32_SFLOAT,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(outputs[0].attachment.is_depth());
        assert_eq!(outputs[0].attachment.format, vk::Format::D32_SFLOAT);
        assert_eq!(
            outputs[0].attachment.store_op,
            vk::AttachmentStoreOp::DONT_CARE
        );
        assert_eq!(
            outputs[1].attachment.final_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(outputs[1].attachment.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn swapchain_declarations_are_ignored() {
        let declared = [color_output(vk::Extent2D {
            width: 16,
            height: 16,
        })];
        let outputs = resolve_outputs(
            &declared,
            true,
            EXTENT,
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::D32_SFLOAT,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )
        .unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[1].attachment.extent, EXTENT);
        assert_eq!(
            outputs[1].attachment.final_layout,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
    }

    #[test]
    fn custom_pass_without_outputs_is_an_error() {
        let err = resolve_outputs(
            &[],
            false,
            EXTENT,
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::D32_SFLOAT,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .unwrap_err();
        assert!(matches!(err, SceneError::EmptyOutputs));
    }

    #[test]
    fn custom_pass_gets_depth_appended_and_extents_inherited() {
        let first = color_output(vk::Extent2D {
            width: 640,
            height: 360,
        });
        let second = color_output(vk::Extent2D {
            width: 0,
            height: 0,
        });
        let outputs = resolve_outputs(
            &[first, second],
            false,
            EXTENT,
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::D32_SFLOAT,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[1].attachment.extent.width, 640);
        assert!(outputs[2].attachment.is_depth());
        assert_eq!(outputs[2].attachment.extent.height, 360);
    }

    #[test]
    fn custom_pass_first_extent_falls_back_to_swapchain() {
        let declared = [color_output(vk::Extent2D {
            width: 0,
            height: 0,
        })];
        let outputs = resolve_outputs(
            &declared,
            false,
            EXTENT,
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::D32_SFLOAT,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .unwrap();
        assert_eq!(outputs[0].attachment.extent, EXTENT);
    }

    #[test]
    fn declared_depth_is_not_duplicated() {
        let mut depth = color_output(EXTENT);
        depth.attachment.usage = vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        depth.attachment.format = vk::Format::D32_SFLOAT;
        let outputs = resolve_outputs(
            &[color_output(EXTENT), depth],
            false,
            EXTENT,
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::D32_SFLOAT,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(
            outputs
                .iter()
                .filter(|o| o.attachment.is_depth())
                .count(),
            1
        );
    }
}
