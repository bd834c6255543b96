// Bindless descriptor heaps
//
// Each bindless resource class owns one huge descriptor pool with a
// single descriptor set of N bindings, fronted by a freelist of
// indices. Shaders address resources by index; the CPU side only has
// to write the descriptor once and hand the index around. Freed
// indices go through the frame destruction queues so an index is never
// reused while in-flight work may still read it.

use ash::vk;

use crate::device::Device;

use std::sync::{Mutex, Weak};

/// Resource classes with a dedicated bindless heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BindlessResourceType {
    SampledImage = 0,
    StorageBuffer,
    StorageImage,
    Sampler,
}

pub const BINDLESS_RESOURCE_TYPE_COUNT: usize = 4;

/// Freelist over the index space of one heap.
pub(crate) struct IndexFreeList {
    /// high water mark, indices below this have been handed out at
    /// least once
    next: u32,
    capacity: u32,
    free: Vec<u32>,
}

impl IndexFreeList {
    pub fn new(capacity: u32) -> Self {
        Self {
            next: 0,
            capacity,
            free: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> Option<u32> {
        if let Some(index) = self.free.pop() {
            return Some(index);
        }

        if self.next >= self.capacity {
            return None;
        }

        let index = self.next;
        self.next += 1;
        Some(index)
    }

    pub fn free(&mut self, index: u32) {
        debug_assert!(index < self.next);
        self.free.push(index);
    }
}

/// One bindless descriptor table.
pub struct BindlessDescriptorHeap {
    dev: ash::Device,
    class: BindlessResourceType,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    free_list: Mutex<IndexFreeList>,
}

impl BindlessDescriptorHeap {
    pub(crate) fn new(
        dev: ash::Device,
        class: BindlessResourceType,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
        capacity: u32,
    ) -> Self {
        Self {
            dev,
            class,
            pool,
            set,
            free_list: Mutex::new(IndexFreeList::new(capacity)),
        }
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn resource_type(&self) -> BindlessResourceType {
        self.class
    }

    /// Pop a free index, or -1 when the heap is exhausted.
    pub fn allocate(&self) -> i32 {
        match self.free_list.lock().unwrap().allocate() {
            Some(index) => index as i32,
            None => {
                log::error!("Bindless heap for {:?} is exhausted", self.class);
                -1
            }
        }
    }

    /// Return an index to the freelist. Callers reach this through
    /// the frame destruction queue, never directly from a drop.
    pub(crate) fn free(&self, index: u32) {
        self.free_list.lock().unwrap().free(index);
    }

    fn descriptor_type(&self) -> vk::DescriptorType {
        match self.class {
            BindlessResourceType::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            BindlessResourceType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            BindlessResourceType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            BindlessResourceType::Sampler => vk::DescriptorType::SAMPLER,
        }
    }

    /// Write an image descriptor at `index`.
    pub fn set_texture(&self, index: i32, view: vk::ImageView, layout: vk::ImageLayout) {
        let image_info = [vk::DescriptorImageInfo::builder()
            .image_view(view)
            .image_layout(layout)
            .build()];
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(0)
            .dst_array_element(index as u32)
            .descriptor_type(self.descriptor_type())
            .image_info(&image_info)
            .build()];

        unsafe { self.dev.update_descriptor_sets(&writes, &[]) };
    }

    /// Write a buffer descriptor at `index`.
    pub fn set_buffer(
        &self,
        index: i32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        let buffer_info = [vk::DescriptorBufferInfo::builder()
            .buffer(buffer)
            .offset(offset)
            .range(range)
            .build()];
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(0)
            .dst_array_element(index as u32)
            .descriptor_type(self.descriptor_type())
            .buffer_info(&buffer_info)
            .build()];

        unsafe { self.dev.update_descriptor_sets(&writes, &[]) };
    }

    /// Write a texel buffer view descriptor at `index`.
    pub fn set_uniform_texel_buffer(&self, index: i32, view: vk::BufferView) {
        let views = [view];
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(0)
            .dst_array_element(index as u32)
            .descriptor_type(vk::DescriptorType::UNIFORM_TEXEL_BUFFER)
            .texel_buffer_view(&views)
            .build()];

        unsafe { self.dev.update_descriptor_sets(&writes, &[]) };
    }

    /// Teardown: destroy the backing pool.
    pub(crate) fn destroy(&self) {
        unsafe { self.dev.destroy_descriptor_pool(self.pool, None) };
    }
}

/// A live index into one bindless heap.
///
/// Dropping the handle queues the index on the current frame context;
/// it only returns to the freelist once that frame's timeline work has
/// drained, so shaders in flight never observe reuse.
pub struct BindlessDescriptorHandle {
    dev: Weak<Device>,
    class: BindlessResourceType,
    index: i32,
}

impl BindlessDescriptorHandle {
    pub(crate) fn new(dev: Weak<Device>, class: BindlessResourceType, index: i32) -> Self {
        Self { dev, class, index }
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn resource_type(&self) -> BindlessResourceType {
        self.class
    }
}

impl Drop for BindlessDescriptorHandle {
    fn drop(&mut self) {
        if self.index < 0 {
            return;
        }
        if let Some(dev) = self.dev.upgrade() {
            dev.free_bindless_index_deferred(self.class, self.index as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freelist_indices_are_unique_while_live() {
        let mut list = IndexFreeList::new(16);
        let a = list.allocate().unwrap();
        let b = list.allocate().unwrap();
        let c = list.allocate().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn freed_index_is_reused() {
        let mut list = IndexFreeList::new(16);
        let _a = list.allocate().unwrap();
        let b = list.allocate().unwrap();
        let _c = list.allocate().unwrap();

        list.free(b);
        // until the free happens, fresh indices keep growing past the
        // high water mark; after it, the freed slot comes back first
        assert_eq!(list.allocate().unwrap(), b);
        assert_eq!(list.allocate().unwrap(), 3);
    }

    #[test]
    fn exhausted_freelist_returns_none() {
        let mut list = IndexFreeList::new(2);
        assert!(list.allocate().is_some());
        assert!(list.allocate().is_some());
        assert!(list.allocate().is_none());
    }
}
