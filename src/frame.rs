// Per-frame contexts
//
// Everything with frame lifetime hangs off one of these: the
// per-queue per-thread command pools, the destruction queues, the
// recycle lists for sync primitives and buffer blocks, the pending
// submissions and the timeline values to wait for before the slot can
// be reused.

use ash::vk;

use crate::bindless::BindlessResourceType;
use crate::buffer_pool::BufferBlock;
use crate::command_pool::CommandPool;
use crate::device::QUEUE_COUNT;
use crate::memory::DeviceAllocation;

use std::collections::HashMap;

/// One pending queue submission.
pub(crate) struct Submission {
    pub cmd: vk::CommandBuffer,
    /// stages under which this command list touched a swapchain
    /// image, 0 if it never did
    pub swapchain_stages: vk::PipelineStageFlags,
}

/// Handles queued for destruction once this frame drains.
///
/// This lives behind its own mutex, apart from the device state lock:
/// resources owned by per-frame allocators drop while the device lock
/// is held and take the `_nolock` entry points straight into here.
#[derive(Default)]
pub(crate) struct DestroyedQueues {
    pub framebuffers: Vec<vk::Framebuffer>,
    pub samplers: Vec<vk::Sampler>,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub buffers: Vec<vk::Buffer>,
    pub buffer_views: Vec<vk::BufferView>,
    pub descriptor_pools: Vec<vk::DescriptorPool>,
    pub semaphores: Vec<vk::Semaphore>,
    pub pipelines: Vec<vk::Pipeline>,
    pub shader_modules: Vec<vk::ShaderModule>,
    pub allocations: Vec<DeviceAllocation>,
    pub bindless_indices: Vec<(BindlessResourceType, u32)>,
    /// unsignalled binary semaphores go back to the pool instead of
    /// being destroyed
    pub recycled_semaphores: Vec<vk::Semaphore>,
    pub recycled_events: Vec<vk::Event>,
}

/// The device-lock-guarded half of one in-flight frame.
pub(crate) struct FrameContext {
    /// command pools, indexed [queue][thread]
    pub cmd_pools: [Vec<CommandPool>; QUEUE_COUNT],

    /// recorded but not yet submitted command lists, per queue
    pub submissions: [Vec<Submission>; QUEUE_COUNT],

    /// timeline value each queue reached during this frame; waited on
    /// before the slot is reused
    pub timeline_values: [u64; QUEUE_COUNT],

    /// legacy fence path
    pub wait_fences: Vec<vk::Fence>,
    pub recycle_fences: Vec<vk::Fence>,

    /// spent buffer blocks to recycle into their pools
    pub vbo_blocks: Vec<BufferBlock>,
    pub ibo_blocks: Vec<BufferBlock>,
    pub ubo_blocks: Vec<BufferBlock>,
    pub staging_blocks: Vec<BufferBlock>,
    pub storage_blocks: Vec<BufferBlock>,

    /// persistent storage block per command buffer; offsets reset
    /// when the frame begins
    pub storage_block_map: HashMap<vk::CommandBuffer, BufferBlock>,
}

impl FrameContext {
    pub fn new(dev: &ash::Device, queue_families: &[u32; QUEUE_COUNT], threads: usize) -> Self {
        let mut cmd_pools: [Vec<CommandPool>; QUEUE_COUNT] = Default::default();
        for (queue, family) in queue_families.iter().enumerate() {
            for _ in 0..threads {
                cmd_pools[queue].push(CommandPool::new(dev.clone(), *family));
            }
        }

        Self {
            cmd_pools,
            submissions: Default::default(),
            timeline_values: [0; QUEUE_COUNT],
            wait_fences: Vec::new(),
            recycle_fences: Vec::new(),
            vbo_blocks: Vec::new(),
            ibo_blocks: Vec::new(),
            ubo_blocks: Vec::new(),
            staging_blocks: Vec::new(),
            storage_blocks: Vec::new(),
            storage_block_map: HashMap::new(),
        }
    }
}
