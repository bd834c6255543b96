// Buffer block pools
//
// Vertex, index, uniform, staging and storage streams all allocate
// out of ring-style blocks. A block is one persistently mapped buffer
// plus a bump offset; when a request no longer fits the caller
// recycles the block and grabs a fresh one from the pool. Pools retain
// a bounded number of spent blocks across frames to avoid reallocating
// the same memory every frame.

use ash::vk;

use crate::bindless::BindlessDescriptorHandle;
use crate::buffer::Buffer;

use std::sync::Arc;

/// The bump allocator state of one block, separated out so the fit
/// math is independent of the vulkan objects.
#[derive(Copy, Clone, Debug)]
pub(crate) struct BlockSuballocator {
    pub offset: u32,
    pub capacity: u32,
    pub alignment: u32,
    pub spill_size: u32,
}

impl BlockSuballocator {
    /// Align the current offset and reserve `size` bytes.
    ///
    /// The reported padded size spills up to `spill_size` so uniform
    /// style bindings can bind a fixed window, clamped to what is left
    /// of the block.
    fn reserve(&mut self, size: u32) -> Option<(u32, u32)> {
        let aligned = (self.offset + self.alignment - 1) & !(self.alignment - 1);
        if aligned + size > self.capacity {
            return None;
        }

        let padded = size.max(self.spill_size).min(self.capacity - aligned);
        self.offset = aligned + size;
        Some((aligned, padded))
    }
}

/// One sub-allocation out of a block.
pub struct BufferBlockAllocation {
    /// mapped pointer at `offset`, null for unmapped blocks
    pub host: *mut u8,
    pub offset: u32,
    pub padded_size: u32,
}

impl BufferBlockAllocation {
    pub fn is_valid(&self) -> bool {
        self.padded_size != 0
    }
}

/// A recyclable slice of GPU memory for streamed data.
pub struct BufferBlock {
    /// the buffer shaders read
    pub(crate) gpu: Arc<Buffer>,
    /// the buffer the CPU writes; identical to `gpu` for host
    /// visible blocks
    pub(crate) cpu: Arc<Buffer>,
    pub(crate) mapped: *mut u8,
    pub(crate) state: BlockSuballocator,
    /// storage blocks carry a bindless index so shaders can address
    /// them without rebinding
    pub(crate) bindless: Option<BindlessDescriptorHandle>,
}

// mapped is only written through &mut self
unsafe impl Send for BufferBlock {}

impl BufferBlock {
    pub fn capacity(&self) -> u32 {
        self.state.capacity
    }

    pub fn offset(&self) -> u32 {
        self.state.offset
    }

    pub fn gpu_buffer(&self) -> &Arc<Buffer> {
        &self.gpu
    }

    /// True when the CPU side is a separate staging buffer that has
    /// to be copied into the GPU buffer before use.
    pub fn needs_device_copy(&self) -> bool {
        !Arc::ptr_eq(&self.gpu, &self.cpu)
    }

    pub fn bindless_handle(&self) -> Option<&BindlessDescriptorHandle> {
        self.bindless.as_ref()
    }

    /// Teardown path: destroy the block's buffers directly.
    pub(crate) fn destroy_now(
        &self,
        dev: &ash::Device,
        allocator: &crate::memory::DeviceAllocator,
    ) {
        self.gpu.destroy_now(dev, allocator);
        if !Arc::ptr_eq(&self.gpu, &self.cpu) {
            self.cpu.destroy_now(dev, allocator);
        }
    }

    /// Sub-allocate `size` bytes. A zero padded_size result means the
    /// block is spent and should be recycled for a fresh one.
    pub fn allocate(&mut self, size: u32) -> BufferBlockAllocation {
        match self.state.reserve(size) {
            Some((offset, padded)) => BufferBlockAllocation {
                host: if self.mapped.is_null() {
                    std::ptr::null_mut()
                } else {
                    unsafe { self.mapped.add(offset as usize) }
                },
                offset,
                padded_size: padded,
            },
            None => BufferBlockAllocation {
                host: std::ptr::null_mut(),
                offset: 0,
                padded_size: 0,
            },
        }
    }
}

/// Recycles buffer blocks of one usage class.
pub struct BufferPool {
    block_size: u32,
    alignment: u32,
    spill_size: u32,
    usage: vk::BufferUsageFlags,
    max_retained_blocks: usize,
    blocks: Vec<BufferBlock>,
    /// storage pools attach a bindless descriptor to every block
    needs_bindless: bool,
}

impl BufferPool {
    pub(crate) fn new(
        block_size: u32,
        alignment: u32,
        spill_size: u32,
        usage: vk::BufferUsageFlags,
        max_retained_blocks: usize,
        needs_bindless: bool,
    ) -> Self {
        Self {
            block_size,
            alignment,
            spill_size,
            usage,
            max_retained_blocks,
            blocks: Vec::new(),
            needs_bindless,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub(crate) fn alignment(&self) -> u32 {
        self.alignment
    }

    pub(crate) fn spill_size(&self) -> u32 {
        self.spill_size
    }

    pub(crate) fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub(crate) fn needs_bindless(&self) -> bool {
        self.needs_bindless
    }

    /// Size a fresh block for a request.
    pub(crate) fn size_for_request(&self, min_size: u32) -> u32 {
        self.block_size.max(min_size)
    }

    /// Pop a retained block if the request fits the standard block
    /// size. Oversized requests always get a dedicated block.
    pub(crate) fn pop_retained(&mut self, min_size: u32) -> Option<BufferBlock> {
        if min_size > self.block_size {
            return None;
        }

        let mut block = self.blocks.pop()?;
        block.state.offset = 0;
        Some(block)
    }

    /// Hand a spent block back. Blocks beyond the retention cap are
    /// dropped and free their buffers through the frame queue.
    pub(crate) fn recycle_block(&mut self, block: BufferBlock) {
        if self.blocks.len() < self.max_retained_blocks
            && block.state.capacity == self.block_size
        {
            self.blocks.push(block);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Teardown path: destroy retained blocks' buffers directly.
    pub(crate) fn clear_with(
        &mut self,
        dev: &ash::Device,
        allocator: &crate::memory::DeviceAllocator,
    ) {
        for block in self.blocks.drain(..) {
            block.destroy_now(dev, allocator);
        }
    }

    /// Build the block wrapper for freshly created buffers.
    pub(crate) fn wrap_block(
        &self,
        gpu: Arc<Buffer>,
        cpu: Arc<Buffer>,
        capacity: u32,
        bindless: Option<BindlessDescriptorHandle>,
    ) -> BufferBlock {
        let mapped = cpu.host_ptr().unwrap_or(std::ptr::null_mut());
        BufferBlock {
            gpu,
            cpu,
            mapped,
            state: BlockSuballocator {
                offset: 0,
                capacity,
                alignment: self.alignment,
                spill_size: self.spill_size,
            },
            bindless,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suballocation_respects_alignment_and_spill() {
        let mut state = BlockSuballocator {
            offset: 0,
            capacity: 256,
            alignment: 16,
            spill_size: 64,
        };

        let (off_a, padded_a) = state.reserve(20).unwrap();
        assert_eq!(off_a, 0);
        assert_eq!(padded_a, 64);

        let (off_b, _padded_b) = state.reserve(100).unwrap();
        assert_eq!(off_b, 32);

        // 200 bytes no longer fit behind offset 132 aligned to 144
        assert!(state.reserve(200).is_none());
    }

    #[test]
    fn offsets_are_aligned() {
        let mut state = BlockSuballocator {
            offset: 0,
            capacity: 1024,
            alignment: 64,
            spill_size: 0,
        };

        let (a, _) = state.reserve(1).unwrap();
        let (b, _) = state.reserve(1).unwrap();
        let (c, _) = state.reserve(130).unwrap();
        assert_eq!(a % 64, 0);
        assert_eq!(b % 64, 0);
        assert_eq!(c % 64, 0);
        assert_eq!(b, 64);
        assert_eq!(c, 128);
    }

    #[test]
    fn padded_size_clamps_to_remaining_space() {
        let mut state = BlockSuballocator {
            offset: 0,
            capacity: 96,
            alignment: 16,
            spill_size: 256,
        };

        let (off, padded) = state.reserve(32).unwrap();
        assert_eq!(off, 0);
        // spill would exceed the block, clamp to what is left
        assert_eq!(padded, 96);
        assert!(off + padded <= 96);
    }
}
