//! Binding layout descriptions.
//!
//! Each layout entry pairs a shader binding slot with the stages allowed to
//! access it. They describe *where* a resource is visible; the resource
//! itself is referenced separately by id.

use ash::vk;

/// A uniform buffer slot.
#[derive(Clone, Copy, Debug)]
pub struct UniformBufferLayout {
    pub binding: u32,
    pub stages: vk::ShaderStageFlags,
}

/// A combined image sampler slot.
#[derive(Clone, Copy, Debug)]
pub struct TextureLayout {
    pub binding: u32,
    pub stages: vk::ShaderStageFlags,
}

/// A sampled or storage image slot.
///
/// Images sharing a `descriptor_type` within one mesh are coalesced into a
/// single arrayed binding; the first entry's `binding` and `stages` win.
#[derive(Clone, Copy, Debug)]
pub struct ImageLayout {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

/// A standalone sampler slot. Samplers within one mesh are coalesced into a
/// single arrayed binding.
#[derive(Clone, Copy, Debug)]
pub struct SamplerLayout {
    pub binding: u32,
    pub stages: vk::ShaderStageFlags,
}

/// A storage buffer slot, bound over `range` bytes from offset zero.
#[derive(Clone, Copy, Debug)]
pub struct BufferLayout {
    pub binding: u32,
    pub stages: vk::ShaderStageFlags,
    pub range: vk::DeviceSize,
}
