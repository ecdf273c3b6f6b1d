//! Additive descriptor pool sizing.
//!
//! Declarations grow per-kind totals while the scene is being described;
//! `allocate` then creates the native pool exactly once, sized to the
//! totals. The pool never under-allocates relative to what was declared.

use ash::vk;

use crate::device::{DescriptorPoolId, DeviceError, RenderDevice};
use crate::error::SceneError;

#[derive(Default)]
pub struct DescriptorPool {
    uniform_buffers: u32,
    combined_image_samplers: u32,
    sampled_images: u32,
    storage_images: u32,
    samplers: u32,
    storage_buffers: u32,
    sets: u32,
    allocated: Option<DescriptorPoolId>,
}

impl DescriptorPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_uniform_buffers(&mut self, count: u32) -> Result<(), SceneError> {
        self.unallocated()?;
        self.uniform_buffers += count;
        Ok(())
    }

    pub fn add_combined_image_samplers(&mut self, count: u32) -> Result<(), SceneError> {
        self.unallocated()?;
        self.combined_image_samplers += count;
        Ok(())
    }

    pub fn add_sampled_images(&mut self, count: u32) -> Result<(), SceneError> {
        self.unallocated()?;
        self.sampled_images += count;
        Ok(())
    }

    pub fn add_storage_images(&mut self, count: u32) -> Result<(), SceneError> {
        self.unallocated()?;
        self.storage_images += count;
        Ok(())
    }

    pub fn add_samplers(&mut self, count: u32) -> Result<(), SceneError> {
        self.unallocated()?;
        self.samplers += count;
        Ok(())
    }

    pub fn add_storage_buffers(&mut self, count: u32) -> Result<(), SceneError> {
        self.unallocated()?;
        self.storage_buffers += count;
        Ok(())
    }

    /// One descriptor set will be allocated from the pool.
    pub fn add_sets(&mut self, count: u32) -> Result<(), SceneError> {
        self.unallocated()?;
        self.sets += count;
        Ok(())
    }

    fn unallocated(&self) -> Result<(), SceneError> {
        if self.allocated.is_some() {
            return Err(SceneError::PoolAlreadyAllocated);
        }
        Ok(())
    }

    /// Creates the native pool from the accumulated totals. Freezes the
    /// sizing: any later `add_*` is an error.
    pub fn allocate(&mut self, device: &mut dyn RenderDevice) -> Result<DescriptorPoolId, SceneError> {
        if let Some(pool) = self.allocated {
            return Ok(pool);
        }
        let sizes: Vec<(vk::DescriptorType, u32)> = [
            (vk::DescriptorType::UNIFORM_BUFFER, self.uniform_buffers),
            (
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                self.combined_image_samplers,
            ),
            (vk::DescriptorType::SAMPLED_IMAGE, self.sampled_images),
            (vk::DescriptorType::STORAGE_IMAGE, self.storage_images),
            (vk::DescriptorType::SAMPLER, self.samplers),
            (vk::DescriptorType::STORAGE_BUFFER, self.storage_buffers),
        ]
        .into_iter()
        .filter(|&(_, count)| count > 0)
        .collect();
        log::debug!(
            "allocating descriptor pool: {} sets, sizes {:?}",
            self.sets.max(1),
            sizes
        );
        let pool = device.create_descriptor_pool(&sizes, self.sets.max(1))?;
        self.allocated = Some(pool);
        Ok(pool)
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated.is_some()
    }

    /// Current totals in declaration order: uniform buffers, combined image
    /// samplers, sampled images, storage images, samplers, storage buffers.
    pub fn totals(&self) -> [u32; 6] {
        [
            self.uniform_buffers,
            self.combined_image_samplers,
            self.sampled_images,
            self.storage_images,
            self.samplers,
            self.storage_buffers,
        ]
    }

    pub fn sets(&self) -> u32 {
        self.sets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    #[test]
    fn totals_accumulate_across_declarations() {
        let mut pool = DescriptorPool::new();
        pool.add_uniform_buffers(2).unwrap();
        pool.add_uniform_buffers(3).unwrap();
        pool.add_storage_images(4).unwrap();
        pool.add_samplers(1).unwrap();
        assert_eq!(pool.totals(), [5, 0, 0, 4, 1, 0]);
    }

    #[test]
    fn allocate_freezes_sizing() {
        let mut device = HeadlessDevice::new();
        let mut pool = DescriptorPool::new();
        pool.add_uniform_buffers(1).unwrap();
        pool.add_sets(1).unwrap();
        let first = pool.allocate(&mut device).unwrap();
        // Re-allocation returns the same pool.
        assert_eq!(pool.allocate(&mut device).unwrap(), first);
        assert!(matches!(
            pool.add_uniform_buffers(1),
            Err(SceneError::PoolAlreadyAllocated)
        ));
    }

    #[test]
    fn zero_sized_kinds_are_omitted() {
        let mut device = HeadlessDevice::new();
        let mut pool = DescriptorPool::new();
        pool.add_combined_image_samplers(3).unwrap();
        pool.add_sets(2).unwrap();
        pool.allocate(&mut device).unwrap();
        let (sizes, max_sets) = device.descriptor_pools()[0].clone();
        assert_eq!(
            sizes,
            vec![(ash::vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 3)]
        );
        assert_eq!(max_sets, 2);
    }
}
