// Descriptor set allocation
//
// One allocator exists per descriptor-set-layout hash, owned by the
// pipeline layouts that use it. Each worker thread gets its own pool
// chain and a temp map from binding hash to descriptor set, so the
// draw-time lookup path is contention free. Pools allocate all of
// their sets up front; sets are never freed, only recycled through the
// vacant list when the temp map rotates at a frame boundary.

use ash::vk;

use crate::shader::{DescriptorSetLayout, DescriptorResource};
use crate::{
    CandelaError, Result, VULKAN_NUM_BINDINGS, VULKAN_NUM_BINDINGS_BINDLESS_VARYING,
};

use std::collections::HashMap;
use std::sync::Mutex;

/// Sets allocated per VkDescriptorPool.
pub(crate) const VULKAN_NUM_SETS_PER_POOL: u32 = 16;

struct ThreadState {
    set_map: HashMap<u64, vk::DescriptorSet>,
    vacants: Vec<vk::DescriptorSet>,
    pools: Vec<vk::DescriptorPool>,
    should_begin: bool,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            set_map: HashMap::new(),
            vacants: Vec::new(),
            pools: Vec::new(),
            should_begin: false,
        }
    }

    fn request_vacant(&mut self, hash: u64) -> Option<vk::DescriptorSet> {
        let set = self.vacants.pop()?;
        self.set_map.insert(hash, set);
        Some(set)
    }
}

/// Allocates descriptor sets for one set layout.
pub struct DescriptorSetAllocator {
    dev: ash::Device,
    set_layout: vk::DescriptorSetLayout,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    is_bindless: bool,
    threads: Vec<Mutex<ThreadState>>,
}

impl DescriptorSetAllocator {
    pub(crate) fn new(
        dev: ash::Device,
        layout: &DescriptorSetLayout,
        stages_for_bindings: &[u32; VULKAN_NUM_BINDINGS],
        immutable_samplers: &[vk::Sampler; VULKAN_NUM_BINDINGS],
        num_threads: usize,
    ) -> Result<Self> {
        let mut bindings = Vec::new();
        let mut pool_sizes = Vec::new();
        let mut binding_flags = Vec::new();
        let is_bindless = layout.is_bindless;

        // immutable sampler handles need stable addresses for the
        // create info
        let sampler_refs: Vec<[vk::Sampler; 1]> =
            immutable_samplers.iter().map(|s| [*s]).collect();

        for binding in 0..VULKAN_NUM_BINDINGS {
            let stages = stages_for_bindings[binding];
            if stages == 0 {
                continue;
            }

            let role = match layout.role_for_binding(binding as u32) {
                Some(r) => r,
                None => continue,
            };

            let array_size = layout.array_sizes[binding];
            let (descriptor_count, pool_count) = if array_size == crate::shader::UNSIZED_ARRAY {
                (
                    VULKAN_NUM_BINDINGS_BINDLESS_VARYING,
                    VULKAN_NUM_BINDINGS_BINDLESS_VARYING,
                )
            } else {
                (
                    array_size as u32,
                    array_size as u32 * VULKAN_NUM_SETS_PER_POOL,
                )
            };

            let mut builder = vk::DescriptorSetLayoutBinding::builder()
                .binding(binding as u32)
                .descriptor_type(role.to_vk())
                .descriptor_count(descriptor_count)
                .stage_flags(vk::ShaderStageFlags::from_raw(stages));

            if layout.immutable_sampler_mask & (1 << binding) != 0
                && role == DescriptorResource::Sampler
            {
                builder = builder.immutable_samplers(&sampler_refs[binding]);
            }

            bindings.push(builder.build());
            pool_sizes.push(
                vk::DescriptorPoolSize::builder()
                    .ty(role.to_vk())
                    .descriptor_count(pool_count)
                    .build(),
            );
            binding_flags.push(if is_bindless {
                vk::DescriptorBindingFlags::PARTIALLY_BOUND
                    | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
            } else {
                vk::DescriptorBindingFlags::empty()
            });
        }

        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&binding_flags)
            .build();

        let mut info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .build();
        if is_bindless {
            info.flags = vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL;
            info.p_next = &mut flags_info as *mut _ as *mut std::os::raw::c_void;
        }

        let set_layout = unsafe {
            dev.create_descriptor_set_layout(&info, None).map_err(|e| {
                log::error!("Failed to create descriptor set layout: {:?}", e);
                CandelaError::INVALID
            })?
        };

        let mut threads = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            threads.push(Mutex::new(ThreadState::new()));
        }

        Ok(Self {
            dev,
            set_layout,
            pool_sizes,
            is_bindless,
            threads,
        })
    }

    pub fn vk_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn is_bindless(&self) -> bool {
        self.is_bindless
    }

    /// Mark every thread's temp map as flushable. The actual rotation
    /// happens lazily on the next lookup from that thread.
    pub(crate) fn begin_frame(&self) {
        for thread in self.threads.iter() {
            thread.lock().unwrap().should_begin = true;
        }
    }

    /// Find or allocate the set for a binding hash.
    ///
    /// Returns the set plus whether it was already written for this
    /// hash. A false return means the caller owns writing the
    /// descriptors before binding.
    pub(crate) fn get_or_allocate(
        &self,
        thread_index: usize,
        hash: u64,
    ) -> Result<(vk::DescriptorSet, bool)> {
        assert!(!self.is_bindless);
        let mut state = self.threads[thread_index].lock().unwrap();

        if state.should_begin {
            state.should_begin = false;
            let recycled: Vec<vk::DescriptorSet> = state.set_map.drain().map(|(_, s)| s).collect();
            state.vacants.extend(recycled);
        }

        if let Some(set) = state.set_map.get(&hash) {
            return Ok((*set, true));
        }

        if let Some(set) = state.request_vacant(hash) {
            return Ok((set, false));
        }

        // out of sets, grow the pool chain by one pool worth
        let info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(VULKAN_NUM_SETS_PER_POOL)
            .pool_sizes(&self.pool_sizes)
            .build();

        let pool = unsafe {
            self.dev.create_descriptor_pool(&info, None).map_err(|e| {
                log::error!("Failed to create descriptor pool: {:?}", e);
                CandelaError::COULD_NOT_CREATE_DESCRIPTOR_POOL
            })?
        };

        let layouts = [self.set_layout; VULKAN_NUM_SETS_PER_POOL as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts)
            .build();

        let sets = unsafe {
            self.dev.allocate_descriptor_sets(&alloc_info).map_err(|e| {
                log::error!("Failed to allocate descriptor sets: {:?}", e);
                CandelaError::COULD_NOT_CREATE_DESCRIPTOR_POOL
            })?
        };

        state.pools.push(pool);
        state.vacants.extend(sets);

        Ok((state.request_vacant(hash).unwrap(), false))
    }

    /// Allocate the one long-lived set for a bindless heap. The
    /// returned pool belongs to the caller.
    pub(crate) fn allocate_bindless_set(
        &self,
        num_descriptors: u32,
    ) -> Result<(vk::DescriptorPool, vk::DescriptorSet)> {
        assert!(self.is_bindless);

        let pool_sizes: Vec<vk::DescriptorPoolSize> = self
            .pool_sizes
            .iter()
            .map(|size| {
                vk::DescriptorPoolSize::builder()
                    .ty(size.ty)
                    .descriptor_count(num_descriptors)
                    .build()
            })
            .collect();

        let info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .build();

        let pool = unsafe {
            self.dev.create_descriptor_pool(&info, None).map_err(|e| {
                log::error!("Failed to create bindless descriptor pool: {:?}", e);
                CandelaError::COULD_NOT_CREATE_DESCRIPTOR_POOL
            })?
        };

        let layouts = [self.set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts)
            .build();

        let sets = unsafe {
            match self.dev.allocate_descriptor_sets(&alloc_info) {
                Ok(s) => s,
                Err(e) => {
                    log::error!("Failed to allocate bindless descriptor set: {:?}", e);
                    self.dev.destroy_descriptor_pool(pool, None);
                    return Err(CandelaError::COULD_NOT_CREATE_DESCRIPTOR_POOL);
                }
            }
        };

        Ok((pool, sets[0]))
    }

    /// Destroy all pool chains. Teardown or wait_idle only.
    pub(crate) fn clear(&self) {
        for thread in self.threads.iter() {
            let mut state = thread.lock().unwrap();
            state.set_map.clear();
            state.vacants.clear();
            for pool in state.pools.drain(..) {
                unsafe {
                    let _ = self.dev.reset_descriptor_pool(
                        pool,
                        vk::DescriptorPoolResetFlags::empty(),
                    );
                    self.dev.destroy_descriptor_pool(pool, None);
                }
            }
        }
    }

    /// Teardown: clear pools and destroy the layout itself.
    pub(crate) fn destroy(&self) {
        self.clear();
        unsafe {
            self.dev
                .destroy_descriptor_set_layout(self.set_layout, None)
        };
    }
}
