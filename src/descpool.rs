// An allocator for descriptor sets, targeted for
// creating many sets of image samplers
//
// Every texture needs one combined image sampler binding. Those come
// out of fixed-capacity pools; when every pool is exhausted a new one
// is created sized like the last. Pools are never destroyed before
// teardown, which trades memory for allocation simplicity. Textures
// are long-lived relative to frame cadence so the trade is fine.

use ash::vk;

use crate::device::Device;
use crate::{Result, SquallError};

use std::sync::{Arc, Mutex};

/// Capacity of the first pool created
const START_POOL_SIZE: usize = 256;

/// Single descriptor
///
/// This tracks the lifetime of one texture binding. When this is
/// dropped the set is freed and returned to its pool.
pub(crate) struct Descriptor {
    /// The owning pool
    d_pool: Arc<Mutex<DescPool>>,
    /// The descriptor set itself
    pub(crate) d_set: vk::DescriptorSet,
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        self.d_pool.lock().unwrap().free_set(self.d_set);
    }
}

/// One fixed-capacity descriptor pool
pub(crate) struct DescPool {
    dp_dev: Arc<Device>,
    dp_pool: vk::DescriptorPool,
    /// sets still available, counts down from dp_capacity
    dp_free: usize,
    dp_capacity: usize,
}

impl DescPool {
    fn has_space(&self) -> bool {
        self.dp_free > 0
    }

    /// Allocate one set from this pool. The caller must have checked
    /// `has_space`.
    fn alloc_set(&mut self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        assert!(self.dp_free > 0 && self.dp_free <= self.dp_capacity);

        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.dp_pool)
            .set_layouts(&layouts)
            .build();

        let set = unsafe {
            self.dp_dev
                .dev
                .allocate_descriptor_sets(&info)
                .map_err(|_| SquallError::ALLOCATION_FAILED)?[0]
        };

        self.dp_free -= 1;
        Ok(set)
    }

    /// Free one set in this pool
    fn free_set(&mut self, set: vk::DescriptorSet) {
        unsafe {
            self.dp_dev
                .dev
                .free_descriptor_sets(self.dp_pool, &[set])
                .expect("Could not free descriptor set");
        }
        self.dp_free += 1;
        assert!(self.dp_free <= self.dp_capacity);
    }
}

impl Drop for DescPool {
    fn drop(&mut self) {
        unsafe {
            self.dp_dev.dev.destroy_descriptor_pool(self.dp_pool, None);
        }
    }
}

/// The overall descriptor tracker
///
/// This is in charge of fulfilling allocation requests by finding an
/// open pool to allocate from.
pub(crate) struct DescriptorSystem {
    ds_dev: Arc<Device>,
    ds_pools: Vec<Arc<Mutex<DescPool>>>,
    /// capacity of the most recently created pool
    ds_last_capacity: usize,
}

impl DescriptorSystem {
    pub fn new(dev: Arc<Device>) -> Self {
        Self {
            ds_dev: dev,
            ds_pools: Vec::new(),
            ds_last_capacity: 0,
        }
    }

    /// Capacity for the next pool: match the last one created, or the
    /// fixed start size if none exist yet.
    fn next_pool_capacity(last: usize) -> usize {
        if last == 0 {
            START_POOL_SIZE
        } else {
            last
        }
    }

    /// Allocate one Descriptor from the first available pool
    ///
    /// This may add a new pool to the system if needed.
    pub fn alloc_descriptor(&mut self, layout: vk::DescriptorSetLayout) -> Result<Descriptor> {
        for pool in self.ds_pools.iter() {
            let mut inner = pool.lock().unwrap();
            if !inner.has_space() {
                continue;
            }

            let set = inner.alloc_set(layout)?;
            drop(inner);
            return Ok(Descriptor {
                d_pool: pool.clone(),
                d_set: set,
            });
        }

        // If we couldn't find a pool then add a new one
        let pool = self.add_pool()?;
        let set = pool.lock().unwrap().alloc_set(layout)?;
        Ok(Descriptor {
            d_pool: pool,
            d_set: set,
        })
    }

    /// Adds and returns a new DescPool in the system
    fn add_pool(&mut self) -> Result<Arc<Mutex<DescPool>>> {
        let capacity = Self::next_pool_capacity(self.ds_last_capacity);

        let sizes = [vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(capacity as u32)
            .build()];
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            // we want to be able to free descriptor sets individually
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(capacity as u32)
            .build();

        let pool = unsafe {
            self.ds_dev
                .dev
                .create_descriptor_pool(&info, None)
                .map_err(|_| {
                    log::error!("Could not create descriptor pool");
                    SquallError::ALLOCATION_FAILED
                })?
        };

        self.ds_last_capacity = capacity;
        let ret = Arc::new(Mutex::new(DescPool {
            dp_dev: self.ds_dev.clone(),
            dp_pool: pool,
            dp_free: capacity,
            dp_capacity: capacity,
        }));
        self.ds_pools.push(ret.clone());

        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_capacity_policy() {
        assert_eq!(DescriptorSystem::next_pool_capacity(0), START_POOL_SIZE);
        assert_eq!(DescriptorSystem::next_pool_capacity(128), 128);
    }
}
