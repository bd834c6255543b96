// Vulkan device core
//
// This owns the logical device and its three queues, and is the
// center every other subsystem hangs off of: command list request and
// submission with timeline ordering, the per-frame contexts and their
// destruction queues, the hash-keyed caches for derivable pipeline
// objects, the bindless heaps and the buffer block pools.
//
// Locking is coarse: one device mutex serializes submission, frame
// rotation and the WSI handshake. The hash caches carry their own
// read/write split and stay off that lock, and resources flagged as
// internally synced push their destruction through the `_nolock`
// entry points because they drop while the device lock is held.

use ash::extensions::khr;
use ash::extensions::nv;
use ash::vk;
use ash::vk::Handle;

use crate::attachment::{FramebufferAllocator, TransientAttachmentAllocator};
use crate::bindless::{
    BindlessDescriptorHandle, BindlessDescriptorHeap, BindlessResourceType,
    BINDLESS_RESOURCE_TYPE_COUNT,
};
use crate::buffer::{Buffer, BufferCreateInfo, BufferMiscFlags, BufferView, BufferViewCreateInfo};
use crate::buffer_pool::{BufferBlock, BufferPool};
use crate::cache::{HashCombiner, VulkanCache};
use crate::command_list::CommandList;
use crate::descriptor::DescriptorSetAllocator;
use crate::frame::{DestroyedQueues, FrameContext, Submission};
use crate::image::{
    format_aspect_flags, Image, ImageCreateInfo, ImageMiscFlags, ImageView, ImageViewCreateInfo,
};
use crate::instance::Instance;
use crate::memory::{
    BufferDomain, DeviceAllocation, DeviceAllocator, ImageDomain, MemoryAccessFlags,
};
use crate::pipeline_cache::PersistentPipelineCache;
use crate::platform::WSIPlatform;
use crate::renderpass::{Framebuffer, RenderPass, RenderPassInfo};
use crate::sampler::{Sampler, SamplerCreateInfo, StockSampler, STOCK_SAMPLER_COUNT};
use crate::shader::{
    CombinedResourceLayout, DescriptorSetLayout, PipelineLayout, Shader, ShaderProgram,
    ShaderStage, SHADER_STAGE_COUNT,
};
use crate::shader_manager::ShaderManager;
use crate::swapchain::Swapchain;
use crate::sync::{EventManager, Fence, FenceManager, Semaphore, SemaphoreManager};
use crate::{CandelaError, Result, VULKAN_NUM_BINDINGS, VULKAN_NUM_DESCRIPTOR_SETS};

use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

/// The queues a device drives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueType {
    Graphics = 0,
    Compute = 1,
    Transfer = 2,
}

pub(crate) const QUEUE_COUNT: usize = 3;

/// Queues are flushed in this order at a frame boundary; transfer
/// goes first because graphics and compute conceptually depend on it.
const QUEUE_FLUSH_ORDER: [QueueType; 3] =
    [QueueType::Transfer, QueueType::Graphics, QueueType::Compute];

/// In-flight frame contexts.
const FRAME_CONTEXT_COUNT: usize = 2;

/// Spill window for uniform buffer sub-allocations.
pub(crate) const VULKAN_MAX_UBO_SIZE: u32 = 16 * 1024;

const VBO_BLOCK_SIZE: u32 = 4 * 1024;
const IBO_BLOCK_SIZE: u32 = 4 * 1024;
const UBO_BLOCK_SIZE: u32 = 256 * 1024;
const STAGING_BLOCK_SIZE: u32 = 64 * 1024;
const STORAGE_BLOCK_SIZE: u32 = 64 * 1024;
const MAX_RETAINED_BLOCKS: usize = 32;

const BINDLESS_HEAP_CAPACITY: u32 = crate::VULKAN_NUM_BINDINGS_BINDLESS_VARYING;

#[derive(Copy, Clone)]
pub(crate) struct QueueInfo {
    pub queues: [vk::Queue; QUEUE_COUNT],
    pub families: [u32; QUEUE_COUNT],
}

/// A semaphore another queue must wait on before executing.
struct PendingWait {
    sema: Semaphore,
    stages: vk::PipelineStageFlags,
}

/// Swapchain handshake state for the frame in flight.
struct WsiState {
    acquire: Option<Semaphore>,
    release: Option<Semaphore>,
    index: u32,
    present_queue: vk::Queue,
    consumed: bool,
}

/// Which block pool a stream allocation draws from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Vertex,
    Index,
    Uniform,
    Staging,
    Storage,
}

/// A cpu->gpu block copy waiting for the transfer queue.
struct PendingBlockCopy {
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
}

pub(crate) struct DeviceInner {
    pub frames: Vec<FrameContext>,
    pub frame_index: usize,
    /// outstanding request_command_list calls not yet balanced by a
    /// submit; next_frame_context drains on this
    frame_counter: u64,
    timeline_values: [u64; QUEUE_COUNT],

    semaphore_manager: SemaphoreManager,
    fence_manager: FenceManager,
    event_manager: EventManager,

    transient_allocator: TransientAttachmentAllocator,
    framebuffer_allocator: FramebufferAllocator,

    pending_waits: [Vec<PendingWait>; QUEUE_COUNT],
    wsi: WsiState,

    vbo_pool: BufferPool,
    ibo_pool: BufferPool,
    ubo_pool: BufferPool,
    staging_pool: BufferPool,
    storage_pool: BufferPool,
    pending_block_copies: Vec<PendingBlockCopy>,
}

pub struct Device {
    pub(crate) instance: Arc<Instance>,
    pub(crate) dev: ash::Device,
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) swapchain_loader: khr::Swapchain,
    checkpoints: Option<nv::DeviceDiagnosticCheckpoints>,
    queue_info: QueueInfo,
    allocator: DeviceAllocator,
    num_threads: usize,

    /// one timeline per queue, signalled at each submission
    timeline_semaphores: [vk::Semaphore; QUEUE_COUNT],

    // hash keyed caches, all with their own read/write split
    render_passes: VulkanCache<RenderPass>,
    shaders: VulkanCache<Shader>,
    programs: VulkanCache<ShaderProgram>,
    pipeline_layouts: VulkanCache<PipelineLayout>,
    descriptor_set_allocators: VulkanCache<DescriptorSetAllocator>,
    immutable_samplers: VulkanCache<Sampler>,

    pipeline_cache: PersistentPipelineCache,
    shader_manager: ShaderManager,

    stock_samplers: [Arc<Sampler>; STOCK_SAMPLER_COUNT],
    bindless_heaps: [BindlessDescriptorHeap; BINDLESS_RESOURCE_TYPE_COUNT],

    inner: Mutex<DeviceInner>,
    drain_cond: Condvar,

    /// destruction queues, one per frame context, deliberately kept
    /// off the device lock so the `_nolock` paths can reach them
    destroyed: Vec<Mutex<DestroyedQueues>>,
    current_frame: AtomicUsize,
}

impl Device {
    /// Choose queue family indices for graphics, async compute and
    /// async transfer, preferring dedicated families where the
    /// hardware has them.
    fn select_queue_families(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> Result<[u32; 3]> {
        let props = unsafe { inst.get_physical_device_queue_family_properties(pdev) };

        let graphics = props
            .iter()
            .enumerate()
            .find(|(_, info)| {
                info.queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map(|(i, _)| i as u32)
            .ok_or(CandelaError::VK_NOT_ALL_EXTENSIONS_AVAILABLE)?;

        let compute = props
            .iter()
            .enumerate()
            .find(|(i, info)| {
                *i as u32 != graphics && info.queue_flags.contains(vk::QueueFlags::COMPUTE)
            })
            .map(|(i, _)| i as u32)
            .unwrap_or(graphics);

        let transfer = props
            .iter()
            .enumerate()
            .find(|(i, info)| {
                *i as u32 != graphics
                    && *i as u32 != compute
                    && info.queue_flags.contains(vk::QueueFlags::TRANSFER)
            })
            .map(|(i, _)| i as u32)
            .unwrap_or(compute);

        Ok([graphics, compute, transfer])
    }

    fn supports_extension(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        name: &CStr,
    ) -> bool {
        let props = match unsafe { inst.enumerate_device_extension_properties(pdev) } {
            Ok(p) => p,
            Err(_) => return false,
        };
        props.iter().any(|ext| {
            let ext_name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
            ext_name == name
        })
    }

    fn create_logical_device(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        families: &[u32; 3],
        mut extensions: Vec<*const c_char>,
        enable_checkpoints: bool,
    ) -> Result<ash::Device> {
        let features = vk::PhysicalDeviceFeatures::builder()
            .vertex_pipeline_stores_and_atomics(true)
            .fragment_stores_and_atomics(true)
            .build();

        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::builder()
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_update_unused_while_pending(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .build();

        if enable_checkpoints {
            extensions.push(nv::DeviceDiagnosticCheckpoints::name().as_ptr());
        }

        // one queue per distinct family
        let mut distinct: Vec<u32> = families.to_vec();
        distinct.sort();
        distinct.dedup();

        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = distinct
            .iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut vulkan12_features);

        unsafe {
            inst.create_device(pdev, &info, None).map_err(|e| {
                log::error!("Could not create logical device: {:?}", e);
                CandelaError::VK_NOT_ALL_EXTENSIONS_AVAILABLE
            })
        }
    }

    fn create_timeline_semaphore(dev: &ash::Device) -> Result<vk::Semaphore> {
        let mut timeline_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0)
            .build();
        let info = vk::SemaphoreCreateInfo::builder()
            .push_next(&mut timeline_info)
            .build();

        unsafe {
            dev.create_semaphore(&info, None)
                .or(Err(CandelaError::INVALID))
        }
    }

    /// Create a device for the first physical device in the instance.
    ///
    /// `thread_count` is the number of worker threads that will
    /// record command lists; every per-thread container is sized by
    /// it up front.
    pub fn new<P: WSIPlatform>(
        instance: Arc<Instance>,
        platform: &P,
        thread_count: usize,
    ) -> Result<Arc<Self>> {
        let num_threads = thread_count.max(1);
        let pdevs = unsafe {
            instance
                .inst
                .enumerate_physical_devices()
                .or(Err(CandelaError::VK_NOT_ALL_EXTENSIONS_AVAILABLE))?
        };
        let pdev = *pdevs
            .first()
            .ok_or(CandelaError::VK_NOT_ALL_EXTENSIONS_AVAILABLE)?;

        let properties = unsafe { instance.inst.get_physical_device_properties(pdev) };
        let mem_props = unsafe { instance.inst.get_physical_device_memory_properties(pdev) };
        let families = Self::select_queue_families(&instance.inst, pdev)?;

        let supports_checkpoints = Self::supports_extension(
            &instance.inst,
            pdev,
            nv::DeviceDiagnosticCheckpoints::name(),
        );

        let dev = Self::create_logical_device(
            &instance.inst,
            pdev,
            &families,
            platform.device_extensions(),
            supports_checkpoints,
        )?;

        let queues = [
            unsafe { dev.get_device_queue(families[0], 0) },
            unsafe { dev.get_device_queue(families[1], 0) },
            unsafe { dev.get_device_queue(families[2], 0) },
        ];
        let queue_info = QueueInfo {
            queues,
            families,
        };

        let timeline_semaphores = [
            Self::create_timeline_semaphore(&dev)?,
            Self::create_timeline_semaphore(&dev)?,
            Self::create_timeline_semaphore(&dev)?,
        ];

        let checkpoints = if supports_checkpoints {
            Some(nv::DeviceDiagnosticCheckpoints::new(&instance.inst, &dev))
        } else {
            None
        };

        let allocator = DeviceAllocator::new(dev.clone(), mem_props, &properties.limits);
        let swapchain_loader = khr::Swapchain::new(&instance.inst, &dev);
        let pipeline_cache = PersistentPipelineCache::open(&dev, &properties);

        let limits = &properties.limits;
        let ubo_align = (limits.min_uniform_buffer_offset_alignment as u32).max(16);
        let staging_align = (limits.optimal_buffer_copy_offset_alignment as u32).max(4);
        let storage_align = (limits.min_storage_buffer_offset_alignment as u32).max(64);

        let mut frames = Vec::with_capacity(FRAME_CONTEXT_COUNT);
        let mut destroyed = Vec::with_capacity(FRAME_CONTEXT_COUNT);
        for _ in 0..FRAME_CONTEXT_COUNT {
            frames.push(FrameContext::new(&dev, &families, num_threads));
            destroyed.push(Mutex::new(DestroyedQueues::default()));
        }

        let inner = DeviceInner {
            frames,
            frame_index: 0,
            frame_counter: 0,
            timeline_values: [0; QUEUE_COUNT],
            semaphore_manager: SemaphoreManager::new(dev.clone()),
            fence_manager: FenceManager::new(dev.clone()),
            event_manager: EventManager::new(dev.clone()),
            transient_allocator: TransientAttachmentAllocator::new(),
            framebuffer_allocator: FramebufferAllocator::new(),
            pending_waits: Default::default(),
            wsi: WsiState {
                acquire: None,
                release: None,
                index: 0,
                present_queue: vk::Queue::null(),
                consumed: false,
            },
            vbo_pool: BufferPool::new(
                VBO_BLOCK_SIZE,
                16,
                0,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                MAX_RETAINED_BLOCKS,
                false,
            ),
            ibo_pool: BufferPool::new(
                IBO_BLOCK_SIZE,
                16,
                0,
                vk::BufferUsageFlags::INDEX_BUFFER,
                MAX_RETAINED_BLOCKS,
                false,
            ),
            ubo_pool: BufferPool::new(
                UBO_BLOCK_SIZE,
                ubo_align,
                VULKAN_MAX_UBO_SIZE,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MAX_RETAINED_BLOCKS,
                false,
            ),
            staging_pool: BufferPool::new(
                STAGING_BLOCK_SIZE,
                staging_align,
                0,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MAX_RETAINED_BLOCKS,
                false,
            ),
            storage_pool: BufferPool::new(
                STORAGE_BLOCK_SIZE,
                storage_align,
                0,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST,
                MAX_RETAINED_BLOCKS,
                true,
            ),
            pending_block_copies: Vec::new(),
        };

        let shader_manager = ShaderManager::new();
        let bindless_heaps = Self::create_bindless_heaps(&dev, num_threads)?;

        let ret = Arc::new_cyclic(|weak: &Weak<Device>| {
            let stock_samplers = Self::create_stock_samplers(&dev, weak);

            Self {
                instance,
                dev: dev.clone(),
                pdev,
                properties,
                swapchain_loader,
                checkpoints,
                queue_info,
                allocator,
                num_threads,
                timeline_semaphores,
                render_passes: VulkanCache::new(),
                shaders: VulkanCache::new(),
                programs: VulkanCache::new(),
                pipeline_layouts: VulkanCache::new(),
                descriptor_set_allocators: VulkanCache::new(),
                immutable_samplers: VulkanCache::new(),
                pipeline_cache,
                shader_manager,
                stock_samplers,
                bindless_heaps,
                inner: Mutex::new(inner),
                drain_cond: Condvar::new(),
                destroyed,
                current_frame: AtomicUsize::new(0),
            }
        });

        Ok(ret)
    }

    fn create_stock_samplers(
        dev: &ash::Device,
        weak: &Weak<Device>,
    ) -> [Arc<Sampler>; STOCK_SAMPLER_COUNT] {
        let make = |stock: StockSampler| {
            let info = stock.create_info();
            let vk_info = info.as_vk();
            let sampler = unsafe {
                dev.create_sampler(&vk_info, None)
                    .expect("Could not create stock sampler")
            };
            Arc::new(Sampler::new(weak.clone(), sampler, info, true))
        };

        [
            make(StockSampler::NearestClamp),
            make(StockSampler::NearestWrap),
            make(StockSampler::PointClamp),
            make(StockSampler::PointWrap),
        ]
    }

    fn create_bindless_heaps(
        dev: &ash::Device,
        num_threads: usize,
    ) -> Result<[BindlessDescriptorHeap; BINDLESS_RESOURCE_TYPE_COUNT]> {
        let make = |class: BindlessResourceType,
                    role: crate::shader::DescriptorResource|
         -> Result<BindlessDescriptorHeap> {
            let mut layout = DescriptorSetLayout::default();
            layout.role_masks[role as usize] = 1;
            layout.array_sizes[0] = crate::shader::UNSIZED_ARRAY;
            layout.is_bindless = true;

            let mut stages = [0u32; VULKAN_NUM_BINDINGS];
            stages[0] = vk::ShaderStageFlags::ALL.as_raw() as u32;
            let samplers = [vk::Sampler::null(); VULKAN_NUM_BINDINGS];

            let alloc =
                DescriptorSetAllocator::new(dev.clone(), &layout, &stages, &samplers, num_threads)?;
            let (pool, set) = alloc.allocate_bindless_set(BINDLESS_HEAP_CAPACITY)?;
            // the heap keeps the pool; the temporary allocator only
            // contributed the layout
            let heap =
                BindlessDescriptorHeap::new(dev.clone(), class, pool, set, BINDLESS_HEAP_CAPACITY);
            alloc.destroy();
            Ok(heap)
        };

        Ok([
            make(
                BindlessResourceType::SampledImage,
                crate::shader::DescriptorResource::SeparateImage,
            )?,
            make(
                BindlessResourceType::StorageBuffer,
                crate::shader::DescriptorResource::StorageBuffer,
            )?,
            make(
                BindlessResourceType::StorageImage,
                crate::shader::DescriptorResource::StorageImage,
            )?,
            make(
                BindlessResourceType::Sampler,
                crate::shader::DescriptorResource::Sampler,
            )?,
        ])
    }

    pub(crate) fn vk_dev(&self) -> &ash::Device {
        &self.dev
    }

    pub(crate) fn queue_family(&self, queue: QueueType) -> u32 {
        self.queue_info.families[queue as usize]
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    pub(crate) fn vk_pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache.vk_handle()
    }

    pub fn stock_sampler(&self, stock: StockSampler) -> &Arc<Sampler> {
        &self.stock_samplers[stock.index()]
    }

    pub fn bindless_heap(&self, class: BindlessResourceType) -> &BindlessDescriptorHeap {
        &self.bindless_heaps[class as usize]
    }

    /// Allocate a bindless table index. The handle frees itself
    /// through the frame destruction queue.
    pub fn allocate_bindless_handle(
        self: &Arc<Self>,
        class: BindlessResourceType,
    ) -> Option<BindlessDescriptorHandle> {
        let index = self.bindless_heaps[class as usize].allocate();
        if index < 0 {
            return None;
        }
        Some(BindlessDescriptorHandle::new(
            Arc::downgrade(self),
            class,
            index,
        ))
    }

    // ---------------------------------------------------------------
    // Deferred destruction entry points
    //
    // The plain variants serialize against frame rotation through the
    // device lock. The `_nolock` variants go straight to the current
    // frame's queues and exist for internally synced resources that
    // drop while the lock is held.
    // ---------------------------------------------------------------

    fn destroyed_queues(&self, internal_sync: bool) -> MutexGuard<DestroyedQueues> {
        let index = if internal_sync {
            self.current_frame.load(Ordering::Acquire)
        } else {
            // serialize with frame rotation
            let inner = self.inner.lock().unwrap();
            let index = inner.frame_index;
            drop(inner);
            index
        };
        self.destroyed[index].lock().unwrap()
    }

    pub(crate) fn destroy_buffer_deferred(
        &self,
        buffer: vk::Buffer,
        alloc: DeviceAllocation,
        internal_sync: bool,
    ) {
        let mut queues = self.destroyed_queues(internal_sync);
        queues.buffers.push(buffer);
        queues.allocations.push(alloc);
    }

    pub(crate) fn destroy_buffer_view_deferred(&self, view: vk::BufferView, internal_sync: bool) {
        self.destroyed_queues(internal_sync).buffer_views.push(view);
    }

    pub(crate) fn destroy_image_deferred(
        &self,
        image: Option<vk::Image>,
        alloc: Option<DeviceAllocation>,
        internal_sync: bool,
    ) {
        let mut queues = self.destroyed_queues(internal_sync);
        if let Some(image) = image {
            queues.images.push(image);
        }
        if let Some(alloc) = alloc {
            queues.allocations.push(alloc);
        }
    }

    pub(crate) fn destroy_image_views_deferred(&self, views: &[vk::ImageView], internal_sync: bool) {
        self.destroyed_queues(internal_sync)
            .image_views
            .extend_from_slice(views);
    }

    pub(crate) fn destroy_sampler_deferred(&self, sampler: vk::Sampler, internal_sync: bool) {
        self.destroyed_queues(internal_sync).samplers.push(sampler);
    }

    pub(crate) fn release_binary_semaphore(
        &self,
        sema: vk::Semaphore,
        signalled: bool,
        internal_sync: bool,
    ) {
        let mut queues = self.destroyed_queues(internal_sync);
        if signalled {
            // a pending signal cannot be recycled
            queues.semaphores.push(sema);
        } else {
            queues.recycled_semaphores.push(sema);
        }
    }

    pub(crate) fn release_fence(&self, fence: vk::Fence, waited: bool) {
        let mut inner = self.inner.lock().unwrap();
        if waited {
            unsafe {
                let _ = self.dev.reset_fences(&[fence]);
            }
            inner.fence_manager.recycle(fence);
        } else {
            let index = inner.frame_index;
            inner.frames[index].recycle_fences.push(fence);
        }
    }

    pub(crate) fn free_bindless_index_deferred(&self, class: BindlessResourceType, index: u32) {
        self.destroyed_queues(false)
            .bindless_indices
            .push((class, index));
    }

    // ---------------------------------------------------------------
    // Cache request entry points
    // ---------------------------------------------------------------

    /// Find or create the render pass for `info`.
    ///
    /// Compatible variants hash without the load/store/clear masks
    /// and are what framebuffers and pipelines validate against.
    pub fn request_render_pass(&self, info: &RenderPassInfo, compatible: bool) -> Result<Arc<RenderPass>> {
        let hash = info.get_hash(compatible);
        self.render_passes
            .try_get_or_insert_with(hash, || RenderPass::new(&self.dev, info, hash))
    }

    /// Find or create the framebuffer for `info` in the frame cache.
    pub fn request_framebuffer(&self, info: &RenderPassInfo) -> Result<Arc<Framebuffer>> {
        let compat = self.request_render_pass(info, true)?;
        let hash = FramebufferAllocator::get_hash(compat.get_hash(), info);

        let mut inner = self.inner.lock().unwrap();
        if let Some(fb) = inner.framebuffer_allocator.request(hash) {
            return Ok(fb);
        }

        let fb = Arc::new(Framebuffer::new(&self.dev, compat, info)?);
        Ok(inner.framebuffer_allocator.insert(hash, fb))
    }

    /// Find or create a frame scoped transient attachment.
    pub fn request_transient_attachment(
        self: &Arc<Self>,
        width: u32,
        height: u32,
        format: vk::Format,
        index: u32,
        samples: u32,
        layers: u32,
    ) -> Result<Arc<Image>> {
        let hash = TransientAttachmentAllocator::get_hash(width, height, format, index, samples, layers);

        let mut inner = self.inner.lock().unwrap();
        if let Some(image) = inner.transient_allocator.request(hash) {
            return Ok(image);
        }

        let mut info = ImageCreateInfo::transient_render_target(width, height, format);
        info.samples = vk::SampleCountFlags::from_raw(samples);
        info.layers = layers;

        let image = self.create_image_inner(&info)?;
        image.set_internal_sync();
        Ok(inner.transient_allocator.insert(hash, image))
    }

    /// Find or create the shader for a SPIR-V stream.
    pub fn request_shader(&self, stage: ShaderStage, spirv: &[u8]) -> Result<Arc<Shader>> {
        let mut hasher = HashCombiner::new();
        hasher.data(spirv);
        let hash = hasher.get();

        self.shaders
            .try_get_or_insert_with(hash, || Shader::new(&self.dev, stage, spirv, hash, None))
    }

    /// Find or create the program for a stage permutation, baking its
    /// pipeline layout.
    pub fn request_program(
        &self,
        shaders: &[Option<Arc<Shader>>; SHADER_STAGE_COUNT],
    ) -> Result<Arc<ShaderProgram>> {
        let mut hasher = HashCombiner::new();
        for shader in shaders.iter().flatten() {
            hasher.u64(shader.get_hash());
        }
        let hash = hasher.get();

        self.programs.try_get_or_insert_with(hash, || {
            let layout = CombinedResourceLayout::from_shaders(shaders);
            let pipeline_layout = self.request_pipeline_layout(&layout)?;
            Ok(ShaderProgram::new(shaders.clone(), pipeline_layout, hash))
        })
    }

    /// Find or create the pipeline layout for a combined resource
    /// layout.
    pub fn request_pipeline_layout(
        &self,
        layout: &CombinedResourceLayout,
    ) -> Result<Arc<PipelineLayout>> {
        let hash = layout.get_hash();

        self.pipeline_layouts.try_get_or_insert_with(hash, || {
            let mut set_allocators: [Option<Arc<DescriptorSetAllocator>>;
                VULKAN_NUM_DESCRIPTOR_SETS] = Default::default();
            let mut vk_layouts = [vk::DescriptorSetLayout::null(); VULKAN_NUM_DESCRIPTOR_SETS];
            let mut num_sets = 0;

            for set in 0..VULKAN_NUM_DESCRIPTOR_SETS {
                if layout.descriptor_set_mask & (1 << set) == 0 {
                    continue;
                }
                let alloc = self.request_descriptor_set_allocator(
                    &layout.sets[set],
                    &layout.stages_for_bindings[set],
                )?;
                vk_layouts[set] = alloc.vk_layout();
                set_allocators[set] = Some(alloc);
                num_sets = set + 1;
            }

            let mut info = vk::PipelineLayoutCreateInfo::builder();
            if num_sets > 0 {
                info = info.set_layouts(&vk_layouts[0..num_sets]);
            }
            let ranges = [vk::PushConstantRange {
                stage_flags: layout.push_constant_range.stage_flags,
                offset: 0,
                size: layout.push_constant_range.size,
            }];
            if layout.push_constant_range.size > 0 {
                info = info.push_constant_ranges(&ranges);
            }

            let vk_layout = unsafe {
                self.dev
                    .create_pipeline_layout(&info.build(), None)
                    .map_err(|e| {
                        log::error!("Failed to create pipeline layout: {:?}", e);
                        CandelaError::INVALID
                    })?
            };

            Ok(PipelineLayout::new(vk_layout, hash, *layout, set_allocators))
        })
    }

    /// Find or create the descriptor set allocator for one set
    /// layout.
    pub(crate) fn request_descriptor_set_allocator(
        &self,
        layout: &DescriptorSetLayout,
        stages_for_bindings: &[u32; VULKAN_NUM_BINDINGS],
    ) -> Result<Arc<DescriptorSetAllocator>> {
        let mut hasher = HashCombiner::new();
        layout.hash_into(&mut hasher);
        for stages in stages_for_bindings.iter() {
            hasher.u32(*stages);
        }
        let hash = hasher.get();

        self.descriptor_set_allocators
            .try_get_or_insert_with(hash, || {
                let mut samplers = [vk::Sampler::null(); VULKAN_NUM_BINDINGS];
                for binding in 0..VULKAN_NUM_BINDINGS {
                    if let Some(stock) = layout.immutable_samplers[binding] {
                        samplers[binding] = self.stock_samplers[stock.index()].vk_handle();
                    }
                }
                DescriptorSetAllocator::new(
                    self.dev.clone(),
                    layout,
                    stages_for_bindings,
                    &samplers,
                    self.num_threads,
                )
            })
    }

    /// Find or create an immutable sampler for `info`.
    pub fn request_immutable_sampler(
        self: &Arc<Self>,
        info: &SamplerCreateInfo,
    ) -> Result<Arc<Sampler>> {
        let hash = info.get_hash();
        self.immutable_samplers.try_get_or_insert_with(hash, || {
            let vk_info = info.as_vk();
            let sampler = unsafe {
                self.dev
                    .create_sampler(&vk_info, None)
                    .or(Err(CandelaError::INVALID))?
            };
            Ok(Sampler::new(Arc::downgrade(self), sampler, *info, true))
        })
    }

    /// Create a transient sampler released through the frame queues.
    pub fn create_sampler(self: &Arc<Self>, info: &SamplerCreateInfo) -> Result<Sampler> {
        let vk_info = info.as_vk();
        let sampler = unsafe {
            self.dev
                .create_sampler(&vk_info, None)
                .or(Err(CandelaError::INVALID))?
        };
        Ok(Sampler::new(Arc::downgrade(self), sampler, *info, false))
    }

    /// Request a binary semaphore from the pool.
    pub fn request_semaphore(self: &Arc<Self>) -> Semaphore {
        let mut inner = self.inner.lock().unwrap();
        let sema = inner.semaphore_manager.request();
        Semaphore::new_binary(Arc::downgrade(self), sema, false)
    }

    /// Wrap a queue's latest timeline point as a waitable semaphore.
    ///
    /// Registering it on another queue via `add_wait_semaphore`
    /// orders that queue behind everything submitted here so far.
    pub fn current_timeline_point(self: &Arc<Self>, queue: QueueType) -> Semaphore {
        let inner = self.inner.lock().unwrap();
        Semaphore::new_timeline(
            Arc::downgrade(self),
            self.timeline_semaphores[queue as usize],
            inner.timeline_values[queue as usize],
        )
    }

    /// Request an event from the pool. Recycled at frame reclaim.
    pub fn request_event(&self) -> vk::Event {
        self.inner.lock().unwrap().event_manager.request()
    }

    pub fn recycle_event_deferred(&self, event: vk::Event) {
        self.destroyed_queues(false).recycled_events.push(event);
    }

    /// Resolve a program from shader source paths through the shader
    /// manager.
    pub fn request_program_from_source(
        self: &Arc<Self>,
        vertex_path: &str,
        fragment_path: &str,
        defines: &[String],
    ) -> Result<Arc<ShaderProgram>> {
        let vs = self
            .shader_manager
            .load_shader(self, ShaderStage::Vertex, vertex_path, defines)?;
        let fs = self
            .shader_manager
            .load_shader(self, ShaderStage::Fragment, fragment_path, defines)?;

        let mut shaders: [Option<Arc<Shader>>; SHADER_STAGE_COUNT] = Default::default();
        shaders[ShaderStage::Vertex as usize] = Some(vs);
        shaders[ShaderStage::Fragment as usize] = Some(fs);
        self.request_program(&shaders)
    }

    // ---------------------------------------------------------------
    // Resource creation
    // ---------------------------------------------------------------

    fn image_sharing_families(&self, misc: ImageMiscFlags) -> Vec<u32> {
        let mut families = Vec::new();
        if misc.intersects(
            ImageMiscFlags::CONCURRENT_QUEUE_GRAPHICS | ImageMiscFlags::CONCURRENT_QUEUE_ASYNC_GRAPHICS,
        ) {
            families.push(self.queue_info.families[QueueType::Graphics as usize]);
        }
        if misc.contains(ImageMiscFlags::CONCURRENT_QUEUE_ASYNC_COMPUTE) {
            families.push(self.queue_info.families[QueueType::Compute as usize]);
        }
        if misc.contains(ImageMiscFlags::CONCURRENT_QUEUE_ASYNC_TRANSFER) {
            families.push(self.queue_info.families[QueueType::Transfer as usize]);
        }
        families.sort();
        families.dedup();
        families
    }

    /// Create an image plus its default views. Does not touch the
    /// device lock, so frame-scoped allocators can call it while
    /// holding it.
    pub(crate) fn create_image_inner(self: &Arc<Self>, info: &ImageCreateInfo) -> Result<Arc<Image>> {
        if info.misc.contains(ImageMiscFlags::VERIFY_FORMAT_FEATURE_SAMPLED_LINEAR_FILTER) {
            let props = unsafe {
                self.instance
                    .inst
                    .get_physical_device_format_properties(self.pdev, info.format)
            };
            if !props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
            {
                log::warn!("Format {:?} does not support linear filtering", info.format);
                return Err(CandelaError::INVALID_FORMAT);
            }
        }

        let mut usage = info.usage;
        if info.domain == ImageDomain::Transient {
            usage |= vk::ImageUsageFlags::TRANSIENT_ATTACHMENT;
        }
        if info.misc.contains(ImageMiscFlags::GENERATE_MIPS) {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        }

        let mut flags = info.flags;
        if info.misc.contains(ImageMiscFlags::MUTABLE_SRGB) {
            flags |= vk::ImageCreateFlags::MUTABLE_FORMAT;
        }

        let families = self.image_sharing_families(info.misc);
        let sharing_mode = if families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let tiling = match info.domain {
            ImageDomain::LinearHost | ImageDomain::LinearHostCached => vk::ImageTiling::LINEAR,
            _ => vk::ImageTiling::OPTIMAL,
        };

        let mut builder = vk::ImageCreateInfo::builder()
            .image_type(info.image_type)
            .format(info.format)
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: info.depth,
            })
            .mip_levels(info.levels)
            .array_layers(info.layers)
            .samples(sample_count_from_flags(info.samples))
            .tiling(tiling)
            .usage(usage)
            .flags(flags)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .sharing_mode(sharing_mode);
        if sharing_mode == vk::SharingMode::CONCURRENT {
            builder = builder.queue_family_indices(&families);
        }
        let vk_info = builder.build();

        let (image, alloc) = self.allocator.create_image(&vk_info, info.domain)?;

        let mut ret = Image::new(Arc::downgrade(self), image, *info, alloc, true, true);

        if !info.misc.contains(ImageMiscFlags::NO_DEFAULT_VIEWS) {
            let view = self.create_default_view(image, info, ret.cookie(), vk::ImageLayout::UNDEFINED)?;
            ret.set_default_view(Arc::new(view));
        }

        Ok(Arc::new(ret))
    }

    fn default_view_type(info: &ImageCreateInfo) -> vk::ImageViewType {
        match info.image_type {
            vk::ImageType::TYPE_1D => {
                if info.layers > 1 {
                    vk::ImageViewType::TYPE_1D_ARRAY
                } else {
                    vk::ImageViewType::TYPE_1D
                }
            }
            vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
            _ => {
                if info.layers > 1 || info.misc.contains(ImageMiscFlags::FORCE_ARRAY) {
                    vk::ImageViewType::TYPE_2D_ARRAY
                } else {
                    vk::ImageViewType::TYPE_2D
                }
            }
        }
    }

    fn make_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        view_type: vk::ImageViewType,
        aspect: vk::ImageAspectFlags,
        base_level: u32,
        levels: u32,
        base_layer: u32,
        layers: u32,
    ) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(view_type)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect)
                    .base_mip_level(base_level)
                    .level_count(levels)
                    .base_array_layer(base_layer)
                    .layer_count(layers)
                    .build(),
            )
            .build();

        unsafe {
            self.dev
                .create_image_view(&info, None)
                .or(Err(CandelaError::COULD_NOT_CREATE_IMAGE))
        }
    }

    pub(crate) fn create_default_view(
        self: &Arc<Self>,
        image: vk::Image,
        info: &ImageCreateInfo,
        image_cookie: u64,
        swapchain_layout: vk::ImageLayout,
    ) -> Result<ImageView> {
        let aspect = format_aspect_flags(info.format);
        let view_type = Self::default_view_type(info);
        let main = self.make_view(
            image,
            info.format,
            view_type,
            aspect,
            0,
            info.levels,
            0,
            info.layers,
        )?;

        let view_info = ImageViewCreateInfo {
            format: info.format,
            view_type,
            base_level: 0,
            levels: info.levels,
            base_layer: 0,
            layers: info.layers,
        };

        let mut view = ImageView::new(
            Arc::downgrade(self),
            main,
            view_info,
            image_cookie,
            info.width,
            info.height,
            swapchain_layout,
            info.domain == ImageDomain::Transient,
            None,
        );

        // depth/stencil-only aux views for mixed format attachments
        let mut depth_view = vk::ImageView::null();
        let mut stencil_view = vk::ImageView::null();
        if aspect.contains(vk::ImageAspectFlags::DEPTH)
            && aspect.contains(vk::ImageAspectFlags::STENCIL)
        {
            depth_view = self.make_view(
                image,
                info.format,
                view_type,
                vk::ImageAspectFlags::DEPTH,
                0,
                info.levels,
                0,
                info.layers,
            )?;
            stencil_view = self.make_view(
                image,
                info.format,
                view_type,
                vk::ImageAspectFlags::STENCIL,
                0,
                info.levels,
                0,
                info.layers,
            )?;
        }

        // per-layer render target views for layered attachments
        let mut rt_views = Vec::new();
        if info.layers > 1
            && info.usage.intersects(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            )
        {
            for layer in 0..info.layers {
                rt_views.push(self.make_view(
                    image,
                    info.format,
                    vk::ImageViewType::TYPE_2D,
                    aspect,
                    0,
                    1,
                    layer,
                    1,
                )?);
            }
        }

        view.set_aux_views(depth_view, stencil_view, rt_views);
        Ok(view)
    }

    /// Create an image, optionally seeding it from initial data
    /// through the staging path.
    pub fn create_image(
        self: &Arc<Self>,
        info: &ImageCreateInfo,
        initial_data: Option<&[u8]>,
    ) -> Result<Arc<Image>> {
        let image = self.create_image_inner(info)?;

        if let Some(data) = initial_data {
            self.upload_image_data(&image, data)?;
        } else if info.initial_layout != vk::ImageLayout::UNDEFINED {
            // transition to the requested initial layout
            let mut cmd = self.request_command_list(QueueType::Graphics, 0)?;
            cmd.image_barrier(
                &image,
                vk::ImageLayout::UNDEFINED,
                info.initial_layout,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            );
            self.submit(cmd);
        }

        Ok(image)
    }

    /// Upload raw texel data into level 0 via a staging buffer on the
    /// transfer queue, then hand ownership to the consuming queues.
    fn upload_image_data(self: &Arc<Self>, image: &Arc<Image>, data: &[u8]) -> Result<()> {
        let staging_info = BufferCreateInfo {
            domain: BufferDomain::Host,
            size: data.len() as vk::DeviceSize,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            misc: BufferMiscFlags::empty(),
        };
        let staging = self.create_buffer(&staging_info, Some(data))?;

        let mut cmd = self.request_command_list(QueueType::Transfer, 0)?;
        cmd.image_barrier(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        );

        let info = image.info();
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::builder()
                    .aspect_mask(format_aspect_flags(info.format))
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(info.layers)
                    .build(),
            )
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: info.depth,
            })
            .build();

        cmd.copy_to_image(image, &staging, &[region]);

        let final_layout = if info.initial_layout == vk::ImageLayout::UNDEFINED {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else {
            info.initial_layout
        };

        if info.misc.contains(ImageMiscFlags::GENERATE_MIPS) && info.levels > 1 {
            // the mip chain is blitted on the graphics queue after
            // the transfer lands; it owns the final transition
            self.submit_staging_access(
                cmd,
                vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TRANSFER,
                true,
            );

            let mut mips = self.request_command_list(QueueType::Graphics, 0)?;
            mips.generate_mipmaps(image, final_layout);
            self.submit(mips);
            return Ok(());
        }

        cmd.image_barrier(
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            final_layout,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::SHADER_READ,
        );

        // images are consumed as shader resources on the target
        // queues
        self.submit_staging_access(
            cmd,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER,
            true,
        );
        Ok(())
    }

    /// Create a buffer, optionally seeded with initial data.
    pub fn create_buffer(
        self: &Arc<Self>,
        info: &BufferCreateInfo,
        initial_data: Option<&[u8]>,
    ) -> Result<Arc<Buffer>> {
        let mut usage = info.usage;
        if initial_data.is_some() || info.misc.contains(BufferMiscFlags::ZERO_INITIALIZE) {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        usage |= vk::BufferUsageFlags::TRANSFER_SRC;

        let vk_info = vk::BufferCreateInfo::builder()
            .size(info.size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        let (buffer, alloc) = self.allocator.create_buffer(&vk_info, info.domain)?;
        let ret = Arc::new(Buffer::new(Arc::downgrade(self), buffer, alloc, *info));

        let zero_init = info.misc.contains(BufferMiscFlags::ZERO_INITIALIZE);

        if let Some(host) = ret.host_ptr() {
            // host visible path writes straight through the mapping
            if let Some(data) = initial_data {
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), host, data.len());
                }
            } else if zero_init {
                unsafe {
                    std::ptr::write_bytes(host, 0, info.size as usize);
                }
            }
            return Ok(ret);
        }

        if let Some(data) = initial_data {
            let staging_info = BufferCreateInfo {
                domain: BufferDomain::Host,
                size: info.size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                misc: BufferMiscFlags::empty(),
            };
            let staging = self.create_buffer(&staging_info, Some(data))?;

            let mut cmd = self.request_command_list(QueueType::Transfer, 0)?;
            cmd.copy_buffer(&ret, &staging);
            self.submit_staging(cmd, info.usage, true);
        } else if zero_init {
            let mut cmd = self.request_command_list(QueueType::Transfer, 0)?;
            cmd.fill_buffer(&ret, 0);
            self.submit_staging(cmd, info.usage, true);
        }

        Ok(ret)
    }

    /// Map a range of a host visible buffer. Non-coherent memory is
    /// invalidated first when the access includes reads.
    pub fn map_buffer(
        &self,
        buffer: &Buffer,
        access: MemoryAccessFlags,
        offset: u64,
        len: u64,
    ) -> Result<*mut u8> {
        self.allocator.map(buffer.allocation(), access, offset, len)
    }

    /// Finish host access to a mapped range. Non-coherent memory is
    /// flushed when the access included writes.
    pub fn unmap_buffer(
        &self,
        buffer: &Buffer,
        access: MemoryAccessFlags,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        self.allocator.unmap(buffer.allocation(), access, offset, len)
    }

    /// Create a typed texel view over a buffer.
    pub fn create_buffer_view(
        self: &Arc<Self>,
        buffer: &Arc<Buffer>,
        info: &BufferViewCreateInfo,
    ) -> Result<Arc<BufferView>> {
        let vk_info = vk::BufferViewCreateInfo::builder()
            .buffer(buffer.vk_handle())
            .format(info.format)
            .offset(info.offset)
            .range(info.range)
            .build();

        let view = unsafe {
            self.dev
                .create_buffer_view(&vk_info, None)
                .or(Err(CandelaError::COULD_NOT_CREATE_BUFFER))?
        };

        Ok(Arc::new(BufferView::new(
            Arc::downgrade(self),
            view,
            buffer.clone(),
            *info,
        )))
    }

    /// Attach a debug name to an image.
    pub fn set_name(&self, image: &Image, name: &str) {
        self.instance.set_name_raw(
            self.dev.handle(),
            vk::ObjectType::IMAGE,
            image.vk_handle().as_raw(),
            name,
        );
    }

    // ---------------------------------------------------------------
    // Buffer block streaming
    // ---------------------------------------------------------------

    fn pool_for_kind<'a>(inner: &'a mut DeviceInner, kind: BlockKind) -> &'a mut BufferPool {
        match kind {
            BlockKind::Vertex => &mut inner.vbo_pool,
            BlockKind::Index => &mut inner.ibo_pool,
            BlockKind::Uniform => &mut inner.ubo_pool,
            BlockKind::Staging => &mut inner.staging_pool,
            BlockKind::Storage => &mut inner.storage_pool,
        }
    }

    /// Request a block with at least `min_size` bytes free.
    pub(crate) fn request_block(self: &Arc<Self>, kind: BlockKind, min_size: u32) -> Result<BufferBlock> {
        let mut inner = self.inner.lock().unwrap();
        let pool = Self::pool_for_kind(&mut inner, kind);

        if let Some(block) = pool.pop_retained(min_size) {
            return Ok(block);
        }

        let capacity = pool.size_for_request(min_size);
        let usage = pool.usage();
        let needs_bindless = pool.needs_bindless();
        let is_staging_src = usage.contains(vk::BufferUsageFlags::TRANSFER_SRC);

        // staging sources live in host memory, everything else
        // prefers a mapped device local buffer
        let domain = if is_staging_src {
            BufferDomain::Host
        } else {
            BufferDomain::LinkedDeviceHost
        };

        let vk_info = vk::BufferCreateInfo::builder()
            .size(capacity as vk::DeviceSize)
            .usage(usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        let (vk_buffer, alloc) = self.allocator.create_buffer(&vk_info, domain)?;
        let info = BufferCreateInfo {
            domain,
            size: capacity as vk::DeviceSize,
            usage,
            misc: BufferMiscFlags::empty(),
        };
        let gpu = Arc::new(Buffer::new(Arc::downgrade(self), vk_buffer, alloc, info));
        gpu.set_internal_sync();

        // if the device-local allocation did not come back mapped,
        // pair it with a host staging buffer and copy at flush time
        let cpu = if gpu.host_ptr().is_none() && !is_staging_src {
            let staging_vk = vk::BufferCreateInfo::builder()
                .size(capacity as vk::DeviceSize)
                .usage(vk::BufferUsageFlags::TRANSFER_SRC)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .build();
            let (staging_buffer, staging_alloc) =
                self.allocator.create_buffer(&staging_vk, BufferDomain::Host)?;
            let staging_info = BufferCreateInfo {
                domain: BufferDomain::Host,
                size: capacity as vk::DeviceSize,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                misc: BufferMiscFlags::empty(),
            };
            let cpu = Arc::new(Buffer::new(
                Arc::downgrade(self),
                staging_buffer,
                staging_alloc,
                staging_info,
            ));
            cpu.set_internal_sync();
            cpu
        } else {
            gpu.clone()
        };

        let pool = Self::pool_for_kind(&mut inner, kind);
        let mut block = pool.wrap_block(gpu, cpu, capacity, None);
        drop(inner);

        if needs_bindless {
            if let Some(handle) = self.allocate_bindless_handle(BindlessResourceType::StorageBuffer)
            {
                self.bindless_heap(BindlessResourceType::StorageBuffer).set_buffer(
                    handle.index(),
                    block.gpu_buffer().vk_handle(),
                    0,
                    capacity as vk::DeviceSize,
                );
                block.bindless = Some(handle);
            }
        }

        Ok(block)
    }

    /// Hand a spent block back to the current frame for recycling.
    pub(crate) fn recycle_block(&self, kind: BlockKind, block: BufferBlock) {
        if block.needs_device_copy() && block.offset() > 0 {
            let mut inner = self.inner.lock().unwrap();
            inner.pending_block_copies.push(PendingBlockCopy {
                src: block.cpu.vk_handle(),
                dst: block.gpu.vk_handle(),
                size: block.offset() as vk::DeviceSize,
            });
            let index = inner.frame_index;
            Self::frame_block_list(&mut inner.frames[index], kind).push(block);
        } else {
            let mut inner = self.inner.lock().unwrap();
            let index = inner.frame_index;
            Self::frame_block_list(&mut inner.frames[index], kind).push(block);
        }
    }

    fn frame_block_list<'a>(frame: &'a mut FrameContext, kind: BlockKind) -> &'a mut Vec<BufferBlock> {
        match kind {
            BlockKind::Vertex => &mut frame.vbo_blocks,
            BlockKind::Index => &mut frame.ibo_blocks,
            BlockKind::Uniform => &mut frame.ubo_blocks,
            BlockKind::Staging => &mut frame.staging_blocks,
            BlockKind::Storage => &mut frame.storage_blocks,
        }
    }

    /// Sub-allocate out of the persistent storage block bound to one
    /// command buffer. The block survives across frames; its offset
    /// resets when the frame begins.
    pub(crate) fn allocate_command_storage(
        self: &Arc<Self>,
        cmd: vk::CommandBuffer,
        size: u32,
    ) -> Result<(vk::Buffer, crate::buffer_pool::BufferBlockAllocation, Option<i32>)> {
        {
            let mut inner = self.inner.lock().unwrap();
            let index = inner.frame_index;
            if let Some(block) = inner.frames[index].storage_block_map.get_mut(&cmd) {
                let alloc = block.allocate(size);
                if alloc.is_valid() {
                    let buffer = block.gpu_buffer().vk_handle();
                    let bindless = block.bindless_handle().map(|h| h.index());
                    return Ok((buffer, alloc, bindless));
                }
                // spent; fall through and replace it
            }
        }

        let mut block = self.request_block(BlockKind::Storage, size)?;
        let alloc = block.allocate(size);
        let buffer = block.gpu_buffer().vk_handle();
        let bindless = block.bindless_handle().map(|h| h.index());

        let mut inner = self.inner.lock().unwrap();
        let index = inner.frame_index;
        if let Some(old) = inner.frames[index].storage_block_map.insert(cmd, block) {
            inner.frames[index].storage_blocks.push(old);
        }

        Ok((buffer, alloc, bindless))
    }

    // ---------------------------------------------------------------
    // Command list request and submission
    // ---------------------------------------------------------------

    /// Reserve a command buffer from the current frame's per-thread
    /// pool and begin recording on it.
    pub fn request_command_list(
        self: &Arc<Self>,
        queue: QueueType,
        thread_index: usize,
    ) -> Result<CommandList> {
        assert!(thread_index < self.num_threads);
        let mut inner = self.inner.lock().unwrap();
        let index = inner.frame_index;
        let pool = &mut inner.frames[index].cmd_pools[queue as usize][thread_index];
        let buffer = pool.request_command_buffer();

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .build();
        unsafe {
            self.dev
                .begin_command_buffer(buffer, &begin_info)
                .or(Err(CandelaError::INVALID))?
        };

        // gate next_frame_context until this list is submitted
        inner.frame_counter += 1;

        Ok(CommandList::new(self.clone(), buffer, queue, thread_index))
    }

    /// A dropped-but-never-submitted command list balances the drain
    /// gate here; its buffer returns to the pool at the frame reset.
    pub(crate) fn abandon_command_list(&self, blocks: Vec<(BlockKind, BufferBlock)>) {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.frame_index;
        for (kind, block) in blocks {
            Self::frame_block_list(&mut inner.frames[index], kind).push(block);
        }
        inner.frame_counter -= 1;
        self.drain_cond.notify_all();
    }

    /// Queue a recorded command list for submission.
    ///
    /// Without a fence or signal request the submission is batched
    /// and flushed at the frame boundary; otherwise the queue is
    /// flushed immediately so the sync objects are live on return.
    pub fn submit(self: &Arc<Self>, cmd: CommandList) {
        let _ = self.submit_internal(cmd, false, 0);
    }

    pub fn submit_with_signals(
        self: &Arc<Self>,
        cmd: CommandList,
        need_fence: bool,
        signal_count: u32,
    ) -> (Option<Fence>, Vec<Semaphore>) {
        self.submit_internal(cmd, need_fence, signal_count)
    }

    fn submit_internal(
        self: &Arc<Self>,
        mut cmd: CommandList,
        need_fence: bool,
        signal_count: u32,
    ) -> (Option<Fence>, Vec<Semaphore>) {
        let queue = cmd.queue_type();
        let (buffer, swapchain_stages, blocks) = cmd.end_recording();

        let mut inner = self.inner.lock().unwrap();
        let index = inner.frame_index;
        for (kind, block) in blocks {
            Self::frame_block_list(&mut inner.frames[index], kind).push(block);
        }

        inner.frames[index].submissions[queue as usize].push(Submission {
            cmd: buffer,
            swapchain_stages,
        });

        let ret = if need_fence || signal_count > 0 {
            self.submit_queue_locked(&mut inner, queue, need_fence, signal_count)
        } else {
            (None, Vec::new())
        };

        inner.frame_counter -= 1;
        self.drain_cond.notify_all();
        ret
    }

    /// Flush a queue's pending submissions without a command list,
    /// optionally producing sync objects. An empty queue still
    /// advances its timeline.
    pub fn submit_empty(
        self: &Arc<Self>,
        queue: QueueType,
        need_fence: bool,
        signal_count: u32,
    ) -> (Option<Fence>, Vec<Semaphore>) {
        let mut inner = self.inner.lock().unwrap();
        self.submit_queue_locked(&mut inner, queue, need_fence, signal_count)
    }

    /// Register a semaphore the next submission on `queue` must wait
    /// for.
    pub fn add_wait_semaphore(
        self: &Arc<Self>,
        queue: QueueType,
        mut sema: Semaphore,
        stages: vk::PipelineStageFlags,
        flush: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if flush {
            self.submit_queue_locked(&mut inner, queue, false, 0);
        }
        sema.set_pending_wait();
        inner.pending_waits[queue as usize].push(PendingWait { sema, stages });
    }

    /// Record the swapchain acquire for this frame. Consumed by the
    /// first submission that touches the swapchain.
    pub(crate) fn set_acquire_semaphore(&self, index: u32, sema: Semaphore) {
        let mut inner = self.inner.lock().unwrap();
        inner.wsi.acquire = Some(sema);
        inner.wsi.index = index;
        inner.wsi.consumed = false;
    }

    pub fn swapchain_image_index(&self) -> u32 {
        self.inner.lock().unwrap().wsi.index
    }

    pub fn is_swapchain_touched(&self) -> bool {
        self.inner.lock().unwrap().wsi.consumed
    }

    /// Take the release semaphore the swapchain-touching submission
    /// emitted. Present consumes this implicitly; embedders driving
    /// presentation themselves take it here.
    pub fn consume_release_semaphore(&self) -> Option<Semaphore> {
        self.inner.lock().unwrap().wsi.release.take()
    }

    /// The queue the current frame's swapchain work landed on.
    pub fn present_queue(&self) -> vk::Queue {
        self.inner.lock().unwrap().wsi.present_queue
    }

    /// Flush pending work on one queue.
    pub fn flush_frame(self: &Arc<Self>, queue: QueueType) {
        let mut inner = self.inner.lock().unwrap();
        self.flush_frame_locked(&mut inner, queue);
    }

    fn flush_frame_locked(self: &Arc<Self>, inner: &mut DeviceInner, queue: QueueType) {
        if queue == QueueType::Transfer {
            self.sync_pending_buffer_blocks_locked(inner);
        }
        self.submit_queue_locked(inner, queue, false, 0);
    }

    /// Emit the staged cpu->gpu block copies on the transfer queue.
    fn sync_pending_buffer_blocks_locked(self: &Arc<Self>, inner: &mut DeviceInner) {
        if inner.pending_block_copies.is_empty() {
            return;
        }
        let copies = std::mem::take(&mut inner.pending_block_copies);

        let index = inner.frame_index;
        let pool = &mut inner.frames[index].cmd_pools[QueueType::Transfer as usize][0];
        let buffer = pool.request_command_buffer();

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .build();
        unsafe {
            self.dev
                .begin_command_buffer(buffer, &begin_info)
                .expect("Could not begin block sync command buffer");
            for copy in copies.iter() {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: copy.size,
                };
                self.dev.cmd_copy_buffer(buffer, copy.src, copy.dst, &[region]);
            }
            self.dev
                .end_command_buffer(buffer)
                .expect("Could not end block sync command buffer");
        }

        inner.frames[index].submissions[QueueType::Transfer as usize].push(Submission {
            cmd: buffer,
            swapchain_stages: vk::PipelineStageFlags::empty(),
        });
    }

    /// Serialize one queue's pending submissions into batches and
    /// hand them to vkQueueSubmit.
    fn submit_queue_locked(
        self: &Arc<Self>,
        inner: &mut DeviceInner,
        queue: QueueType,
        need_fence: bool,
        signal_count: u32,
    ) -> (Option<Fence>, Vec<Semaphore>) {
        // graphics and compute conceptually depend on transfer
        if queue != QueueType::Transfer {
            self.flush_frame_locked(inner, QueueType::Transfer);
        }

        let index = inner.frame_index;
        let submissions =
            std::mem::take(&mut inner.frames[index].submissions[queue as usize]);
        let pending_waits = std::mem::take(&mut inner.pending_waits[queue as usize]);

        if submissions.is_empty()
            && pending_waits.is_empty()
            && !need_fence
            && signal_count == 0
        {
            return (None, Vec::new());
        }

        // advance the queue timeline; this frame will wait on it
        inner.timeline_values[queue as usize] += 1;
        let timeline_value = inner.timeline_values[queue as usize];
        inner.frames[index].timeline_values[queue as usize] = timeline_value;

        let timeline_sema = self.timeline_semaphores[queue as usize];
        let vk_queue = self.queue_info.queues[queue as usize];

        let mut composer = BatchComposer::new();

        // externally registered waits come first
        for mut wait in pending_waits {
            let value = wait.sema.timeline_value();
            if wait.sema.is_timeline() {
                composer.add_wait_semaphore(wait.sema.vk_handle(), wait.stages, value);
            } else {
                let handle = wait.sema.consume();
                composer.add_wait_semaphore(handle, wait.stages, 0);
                // recycled once the frame's timeline wait proves the
                // GPU consumed the signal
                self.destroyed[index]
                    .lock()
                    .unwrap()
                    .recycled_semaphores
                    .push(handle);
            }
        }

        for submission in submissions.iter() {
            let stages = submission.swapchain_stages;

            if stages != vk::PipelineStageFlags::empty() && !inner.wsi.consumed {
                // first swapchain touch: wait the acquire before this
                // batch, emit the release after it
                if let Some(mut acquire) = inner.wsi.acquire.take() {
                    if acquire.vk_handle() != vk::Semaphore::null() {
                        let handle = acquire.consume();
                        composer.add_wait_semaphore(handle, stages, 0);
                        self.destroyed[index]
                            .lock()
                            .unwrap()
                            .recycled_semaphores
                            .push(handle);
                    }
                }

                composer.add_command_buffer(submission.cmd);

                let release = inner.semaphore_manager.request();
                let mut release_sema =
                    Semaphore::new_binary(Arc::downgrade(self), release, false);
                release_sema.signal();
                composer.add_signal_semaphore(release, 0);
                inner.wsi.release = Some(release_sema);
                inner.wsi.present_queue = vk_queue;
                inner.wsi.consumed = true;
            } else {
                composer.add_command_buffer(submission.cmd);
            }
        }

        // queue ordering signal, always last in the final batch
        composer.add_signal_semaphore(timeline_sema, timeline_value);

        let fence = if need_fence {
            Some(Fence::new_timeline(
                self.clone(),
                timeline_sema,
                timeline_value,
            ))
        } else {
            None
        };

        let mut signal_semas = Vec::with_capacity(signal_count as usize);
        for _ in 0..signal_count {
            let sema = inner.semaphore_manager.request();
            composer.add_signal_semaphore(sema, 0);
            let mut wrapper = Semaphore::new_binary(Arc::downgrade(self), sema, false);
            wrapper.signal();
            signal_semas.push(wrapper);
        }

        let result = composer.submit(&self.dev, vk_queue);
        if let Err(err) = result {
            if err == vk::Result::ERROR_DEVICE_LOST {
                log::error!("Queue submission lost the device");
                self.dump_checkpoints(vk_queue);
            } else {
                log::error!("Queue submission failed: {:?}", err);
            }
        }

        (fence, signal_semas)
    }

    /// Log NV diagnostic checkpoint markers after a device loss.
    fn dump_checkpoints(&self, queue: vk::Queue) {
        if let Some(checkpoints) = self.checkpoints.as_ref() {
            let data = unsafe { checkpoints.get_queue_checkpoint_data(queue) };
            for point in data.iter() {
                log::error!(
                    "Checkpoint at stage {:?}: marker {:?}",
                    point.stage,
                    point.p_checkpoint_marker
                );
            }
        }
    }

    /// Bridge an async transfer back to the queues that will consume
    /// the destination.
    ///
    /// When everything shares one queue a pipeline barrier inside the
    /// command list is enough (a shared family with distinct queues
    /// takes this path too). Otherwise the transfer signals one
    /// binary semaphore per consuming queue and registers it as a
    /// wait over there.
    pub fn submit_staging(
        self: &Arc<Self>,
        cmd: CommandList,
        buffer_usage: vk::BufferUsageFlags,
        flush: bool,
    ) {
        let access = buffer_usage_to_possible_access(buffer_usage);
        let stages = buffer_usage_to_possible_stages(buffer_usage);
        self.submit_staging_access(cmd, access, stages, flush);
    }

    fn submit_staging_access(
        self: &Arc<Self>,
        mut cmd: CommandList,
        access: vk::AccessFlags,
        graphics_stages: vk::PipelineStageFlags,
        flush: bool,
    ) {
        // the async compute queue only observes the compute-visible
        // subset of the access mask
        let compute_access = access
            & (vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::SHADER_WRITE
                | vk::AccessFlags::TRANSFER_READ
                | vk::AccessFlags::TRANSFER_WRITE
                | vk::AccessFlags::UNIFORM_READ
                | vk::AccessFlags::INDIRECT_COMMAND_READ);
        let compute_stages = graphics_stages
            & (vk::PipelineStageFlags::COMPUTE_SHADER
                | vk::PipelineStageFlags::TRANSFER
                | vk::PipelineStageFlags::DRAW_INDIRECT);

        let src_queue = cmd.queue_type();
        let graphics_family = self.queue_family(QueueType::Graphics);
        let compute_family = self.queue_family(QueueType::Compute);
        let src_family = self.queue_family(src_queue);

        if src_family == graphics_family && src_family == compute_family {
            // same family: an in-queue barrier covers all consumers
            cmd.barrier(
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
                graphics_stages | compute_stages,
                access | compute_access,
            );
            if flush {
                let _ = self.submit_internal(cmd, false, 0);
                self.flush_frame(src_queue);
            } else {
                self.submit(cmd);
            }
            return;
        }

        // cross queue: one semaphore per distinct consuming queue
        let mut semaphore_targets = Vec::new();
        if graphics_family != src_family {
            semaphore_targets.push((QueueType::Graphics, graphics_stages));
        }
        if compute_family != src_family && compute_family != graphics_family {
            semaphore_targets.push((QueueType::Compute, compute_stages));
        }

        let (_, semaphores) =
            self.submit_internal(cmd, false, semaphore_targets.len() as u32);
        for ((target_queue, stages), sema) in
            semaphore_targets.into_iter().zip(semaphores.into_iter())
        {
            if stages != vk::PipelineStageFlags::empty() {
                self.add_wait_semaphore(target_queue, sema, stages, flush);
            }
        }
    }

    // ---------------------------------------------------------------
    // Frame flow
    // ---------------------------------------------------------------

    /// End the frame: flush every queue in transfer-first order.
    pub fn end_frame_context(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        for queue in QUEUE_FLUSH_ORDER.iter() {
            self.flush_frame_locked(&mut inner, *queue);
        }
    }

    /// Advance to the next frame context.
    ///
    /// Blocks until every outstanding command list has been
    /// submitted, flushes the queues, rotates the frame-scoped
    /// allocators, then waits on the new frame's recorded timeline
    /// values and reclaims everything it deferred.
    pub fn next_frame_context(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();

        // drain: all request_command_list calls must be balanced
        while inner.frame_counter > 0 {
            inner = self.drain_cond.wait(inner).unwrap();
        }

        for queue in QUEUE_FLUSH_ORDER.iter() {
            self.flush_frame_locked(&mut inner, *queue);
        }

        // rotate frame scoped caches
        inner.transient_allocator.begin_frame();
        {
            let index = inner.frame_index;
            let mut destroyed = self.destroyed[index].lock().unwrap();
            let mut evicted = Vec::new();
            inner.framebuffer_allocator.begin_frame(&mut evicted);
            destroyed.framebuffers.extend(evicted);
        }
        self.descriptor_set_allocators.for_each(|alloc| alloc.begin_frame());

        // promote the write halves of the hash caches
        self.render_passes.move_to_read_only();
        self.shaders.move_to_read_only();
        self.pipeline_layouts.move_to_read_only();
        self.descriptor_set_allocators.move_to_read_only();
        self.immutable_samplers.move_to_read_only();
        self.programs.move_to_read_only();
        self.programs.for_each(|p| p.move_pipelines_to_read_only());
        self.shader_manager.move_to_read_only();

        // advance the frame index
        inner.frame_index = (inner.frame_index + 1) % inner.frames.len();
        self.current_frame.store(inner.frame_index, Ordering::Release);

        self.begin_frame_locked(&mut inner);
    }

    /// Begin the (new) current frame: wait out its previous work and
    /// reclaim its deferred resources.
    fn begin_frame_locked(self: &Arc<Self>, inner: &mut DeviceInner) {
        let index = inner.frame_index;

        // wait for the timeline values this frame recorded last time
        // around
        let mut semas = Vec::new();
        let mut values = Vec::new();
        for queue in 0..QUEUE_COUNT {
            let value = inner.frames[index].timeline_values[queue];
            if value > 0 {
                semas.push(self.timeline_semaphores[queue]);
                values.push(value);
            }
        }
        if !semas.is_empty() {
            let wait_info = vk::SemaphoreWaitInfo::builder()
                .semaphores(&semas)
                .values(&values)
                .build();
            unsafe {
                self.dev
                    .wait_semaphores(&wait_info, u64::MAX)
                    .expect("Could not wait for frame timeline values");
            }
        }
        inner.frames[index].timeline_values = [0; QUEUE_COUNT];

        // legacy fence path
        let wait_fences = std::mem::take(&mut inner.frames[index].wait_fences);
        if !wait_fences.is_empty() {
            unsafe {
                self.dev
                    .wait_for_fences(&wait_fences, true, u64::MAX)
                    .expect("Could not wait for frame fences");
            }
        }
        let recycle_fences = std::mem::take(&mut inner.frames[index].recycle_fences);
        if !recycle_fences.is_empty() {
            unsafe {
                self.dev
                    .reset_fences(&recycle_fences)
                    .expect("Could not reset frame fences");
            }
            for fence in recycle_fences {
                inner.fence_manager.recycle(fence);
            }
        }

        // reset the frame's command pools
        for queue in 0..QUEUE_COUNT {
            for pool in inner.frames[index].cmd_pools[queue].iter_mut() {
                pool.begin_frame();
            }
        }

        // recycle the frame's buffer blocks into their pools
        let frame = &mut inner.frames[index];
        let vbo = std::mem::take(&mut frame.vbo_blocks);
        let ibo = std::mem::take(&mut frame.ibo_blocks);
        let ubo = std::mem::take(&mut frame.ubo_blocks);
        let staging = std::mem::take(&mut frame.staging_blocks);
        let storage = std::mem::take(&mut frame.storage_blocks);
        for block in frame.storage_block_map.values_mut() {
            block.state.offset = 0;
        }
        for block in vbo {
            inner.vbo_pool.recycle_block(block);
        }
        for block in ibo {
            inner.ibo_pool.recycle_block(block);
        }
        for block in ubo {
            inner.ubo_pool.recycle_block(block);
        }
        for block in staging {
            inner.staging_pool.recycle_block(block);
        }
        for block in storage {
            inner.storage_pool.recycle_block(block);
        }

        // reclaim everything this frame deferred
        let queues = {
            let mut destroyed = self.destroyed[index].lock().unwrap();
            std::mem::take(&mut *destroyed)
        };
        self.process_destroyed(inner, queues);
    }

    fn process_destroyed(&self, inner: &mut DeviceInner, queues: DestroyedQueues) {
        unsafe {
            for fb in queues.framebuffers {
                self.dev.destroy_framebuffer(fb, None);
            }
            for sampler in queues.samplers {
                self.dev.destroy_sampler(sampler, None);
            }
            for view in queues.image_views {
                self.dev.destroy_image_view(view, None);
            }
            for image in queues.images {
                self.dev.destroy_image(image, None);
            }
            for view in queues.buffer_views {
                self.dev.destroy_buffer_view(view, None);
            }
            for buffer in queues.buffers {
                self.dev.destroy_buffer(buffer, None);
            }
            for pool in queues.descriptor_pools {
                self.dev.destroy_descriptor_pool(pool, None);
            }
            for sema in queues.semaphores {
                self.dev.destroy_semaphore(sema, None);
            }
            for pipeline in queues.pipelines {
                self.dev.destroy_pipeline(pipeline, None);
            }
            for module in queues.shader_modules {
                self.dev.destroy_shader_module(module, None);
            }
        }
        for alloc in queues.allocations {
            self.allocator.free(&alloc);
        }
        for (class, index) in queues.bindless_indices {
            self.bindless_heaps[class as usize].free(index);
        }
        for sema in queues.recycled_semaphores {
            inner.semaphore_manager.recycle(sema);
        }
        for event in queues.recycled_events {
            inner.event_manager.recycle(event);
        }
    }

    /// Full stop: flush, wait for the device to idle, and reclaim
    /// every deferred resource in every frame.
    pub fn wait_idle(self: &Arc<Self>) {
        self.end_frame_context();

        unsafe {
            if let Err(e) = self.dev.device_wait_idle() {
                log::error!("vkDeviceWaitIdle failed: {:?}", e);
            }
        }

        let mut inner = self.inner.lock().unwrap();

        inner.transient_allocator.clear();
        {
            let dev = self.dev.clone();
            inner.framebuffer_allocator.clear(&dev);
        }
        self.descriptor_set_allocators.for_each(|alloc| alloc.clear());

        // all frames are provably idle, reclaim everything
        for index in 0..self.destroyed.len() {
            inner.frames[index].timeline_values = [0; QUEUE_COUNT];
            let wait_fences = std::mem::take(&mut inner.frames[index].wait_fences);
            for fence in wait_fences {
                unsafe {
                    let _ = self.dev.reset_fences(&[fence]);
                }
                inner.fence_manager.recycle(fence);
            }
            for queue in 0..QUEUE_COUNT {
                for pool in inner.frames[index].cmd_pools[queue].iter_mut() {
                    pool.begin_frame();
                }
            }

            // recycle outstanding buffer blocks; the GPU is idle
            let frame = &mut inner.frames[index];
            let vbo = std::mem::take(&mut frame.vbo_blocks);
            let ibo = std::mem::take(&mut frame.ibo_blocks);
            let ubo = std::mem::take(&mut frame.ubo_blocks);
            let staging = std::mem::take(&mut frame.staging_blocks);
            let storage = std::mem::take(&mut frame.storage_blocks);
            for block in frame.storage_block_map.values_mut() {
                block.state.offset = 0;
            }
            for block in vbo {
                inner.vbo_pool.recycle_block(block);
            }
            for block in ibo {
                inner.ibo_pool.recycle_block(block);
            }
            for block in ubo {
                inner.ubo_pool.recycle_block(block);
            }
            for block in staging {
                inner.staging_pool.recycle_block(block);
            }
            for block in storage {
                inner.storage_pool.recycle_block(block);
            }

            let queues = {
                let mut destroyed = self.destroyed[index].lock().unwrap();
                std::mem::take(&mut *destroyed)
            };
            self.process_destroyed(&mut inner, queues);
        }
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Present the current swapchain image on the recorded present
    /// queue.
    pub fn present(self: &Arc<Self>, swapchain: &Swapchain) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.wsi.consumed {
            return Err(CandelaError::NOT_READY);
        }

        let mut release = inner.wsi.release.take().ok_or(CandelaError::NOT_READY)?;
        let wait = release.consume();
        let present_queue = inner.wsi.present_queue;
        let image_index = inner.wsi.index;

        let waits = [wait];
        let swapchains = [swapchain.vk_handle()];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices)
            .build();

        let result = unsafe {
            self.swapchain_loader
                .queue_present(present_queue, &present_info)
        };

        // the wait consumed the semaphore; recycle it after the frame
        // drains
        let index = inner.frame_index;
        self.destroyed[index]
            .lock()
            .unwrap()
            .recycled_semaphores
            .push(wait);
        inner.wsi.consumed = false;

        match result {
            Ok(_) => Ok(()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                Err(CandelaError::OUT_OF_DATE)
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                self.dump_checkpoints(present_queue);
                Err(CandelaError::DEVICE_LOST)
            }
            Err(_) => Err(CandelaError::PRESENT_FAILED),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            // everything must be provably idle before teardown
            if let Err(e) = self.dev.device_wait_idle() {
                log::error!("vkDeviceWaitIdle failed during teardown: {:?}", e);
            }
        }

        let mut inner = self.inner.lock().unwrap();

        // resource backrefs no longer upgrade mid-drop, so the
        // wrapped binary semaphores are destroyed by hand
        for queue in 0..QUEUE_COUNT {
            let waits = std::mem::take(&mut inner.pending_waits[queue]);
            for wait in waits {
                let handle = wait.sema.vk_handle();
                if handle != vk::Semaphore::null() && !wait.sema.is_timeline() {
                    unsafe { self.dev.destroy_semaphore(handle, None) };
                }
            }
        }
        for sema in inner.wsi.acquire.take().into_iter().chain(inner.wsi.release.take()) {
            let handle = sema.vk_handle();
            if handle != vk::Semaphore::null() {
                unsafe { self.dev.destroy_semaphore(handle, None) };
            }
        }

        // frame caches: while the device is mid-drop, resource
        // backrefs no longer upgrade, so handles are destroyed
        // explicitly here
        inner.transient_allocator.clear_with(|image| {
            image.destroy_now(&self.dev, &self.allocator);
        });
        {
            let dev = self.dev.clone();
            inner.framebuffer_allocator.clear(&dev);
        }

        inner.vbo_pool.clear_with(&self.dev, &self.allocator);
        inner.ibo_pool.clear_with(&self.dev, &self.allocator);
        inner.ubo_pool.clear_with(&self.dev, &self.allocator);
        inner.staging_pool.clear_with(&self.dev, &self.allocator);
        inner.storage_pool.clear_with(&self.dev, &self.allocator);
        for frame in inner.frames.iter_mut() {
            for block in frame
                .vbo_blocks
                .drain(..)
                .chain(frame.ibo_blocks.drain(..))
                .chain(frame.ubo_blocks.drain(..))
                .chain(frame.staging_blocks.drain(..))
                .chain(frame.storage_blocks.drain(..))
                .chain(frame.storage_block_map.drain().map(|(_, b)| b))
            {
                block.destroy_now(&self.dev, &self.allocator);
            }
        }

        // drain the deferred queues
        for index in 0..self.destroyed.len() {
            let queues = {
                let mut destroyed = self.destroyed[index].lock().unwrap();
                std::mem::take(&mut *destroyed)
            };
            self.process_destroyed(&mut inner, queues);
        }

        // command pools and pooled sync primitives must go while the
        // device is still alive
        inner.frames.clear();
        inner.semaphore_manager.clear_all();
        inner.fence_manager.clear_all();
        inner.event_manager.clear_all();
        drop(inner);

        // device owned caches
        self.programs.clear(|program| {
            program.destroy_pipelines(&self.dev);
        });
        self.pipeline_layouts.clear(|layout| layout.destroy(&self.dev));
        self.descriptor_set_allocators.clear(|alloc| alloc.destroy());
        self.render_passes.clear(|pass| pass.destroy(&self.dev));
        self.shaders.clear(|shader| shader.destroy(&self.dev));
        self.immutable_samplers.clear(|sampler| unsafe {
            self.dev.destroy_sampler(sampler.vk_handle(), None);
        });

        for heap in self.bindless_heaps.iter() {
            heap.destroy();
        }
        for stock in self.stock_samplers.iter() {
            unsafe { self.dev.destroy_sampler(stock.vk_handle(), None) };
        }
        for sema in self.timeline_semaphores.iter() {
            unsafe { self.dev.destroy_semaphore(*sema, None) };
        }

        self.pipeline_cache.save_and_destroy(&self.dev);

        unsafe {
            self.dev.destroy_device(None);
        }
    }
}

/// Groups pending command buffers into vkQueueSubmit batches.
///
/// A new batch opens whenever a wait semaphore has to precede command
/// buffers already in the current batch, or when command buffers
/// follow signals, so signals always come last in their batch.
pub(crate) struct BatchComposer {
    batches: Vec<Batch>,
}

#[derive(Default)]
struct Batch {
    wait_semaphores: Vec<vk::Semaphore>,
    wait_stages: Vec<vk::PipelineStageFlags>,
    wait_values: Vec<u64>,
    cmds: Vec<vk::CommandBuffer>,
    signal_semaphores: Vec<vk::Semaphore>,
    signal_values: Vec<u64>,
}

impl BatchComposer {
    pub fn new() -> Self {
        Self {
            batches: vec![Batch::default()],
        }
    }

    fn current(&mut self) -> &mut Batch {
        self.batches.last_mut().unwrap()
    }

    fn begin_batch(&mut self) {
        let cur = self.current();
        if !cur.cmds.is_empty() || !cur.wait_semaphores.is_empty() {
            self.batches.push(Batch::default());
        }
    }

    /// Timeline waits pass their value; binary waits pass 0.
    pub fn add_wait_semaphore(
        &mut self,
        sema: vk::Semaphore,
        stages: vk::PipelineStageFlags,
        value: u64,
    ) {
        if !self.current().cmds.is_empty() {
            self.begin_batch();
        }
        let cur = self.current();
        cur.wait_semaphores.push(sema);
        cur.wait_stages.push(stages);
        cur.wait_values.push(value);
    }

    pub fn add_signal_semaphore(&mut self, sema: vk::Semaphore, value: u64) {
        let cur = self.current();
        cur.signal_semaphores.push(sema);
        cur.signal_values.push(value);
    }

    pub fn add_command_buffer(&mut self, cmd: vk::CommandBuffer) {
        if !self.current().signal_semaphores.is_empty() {
            self.begin_batch();
        }
        self.current().cmds.push(cmd);
    }

    pub(crate) fn num_batches(&self) -> usize {
        self.batches.len()
    }

    #[cfg(test)]
    fn batch_cmd_counts(&self) -> Vec<usize> {
        self.batches.iter().map(|b| b.cmds.len()).collect()
    }

    /// Bake and submit the batches.
    pub fn submit(
        &mut self,
        dev: &ash::Device,
        queue: vk::Queue,
    ) -> std::result::Result<(), vk::Result> {
        let mut timeline_infos: Vec<vk::TimelineSemaphoreSubmitInfo> =
            Vec::with_capacity(self.batches.len());
        let mut submits: Vec<vk::SubmitInfo> = Vec::with_capacity(self.batches.len());

        for batch in self.batches.iter() {
            let mut submit = vk::SubmitInfo::builder()
                .wait_semaphores(&batch.wait_semaphores)
                .wait_dst_stage_mask(&batch.wait_stages)
                .command_buffers(&batch.cmds)
                .signal_semaphores(&batch.signal_semaphores)
                .build();

            // only chain the timeline info when the batch carries
            // any values
            let has_values = batch.wait_values.iter().any(|v| *v != 0)
                || batch.signal_values.iter().any(|v| *v != 0);
            if has_values {
                timeline_infos.push(
                    vk::TimelineSemaphoreSubmitInfo::builder()
                        .wait_semaphore_values(&batch.wait_values)
                        .signal_semaphore_values(&batch.signal_values)
                        .build(),
                );
                submit.p_next = timeline_infos.last().unwrap() as *const _
                    as *const std::os::raw::c_void;
            }

            submits.push(submit);
        }

        unsafe { dev.queue_submit(queue, &submits, vk::Fence::null()) }
    }
}

/// All accesses a buffer with this usage could be subject to.
pub(crate) fn buffer_usage_to_possible_access(usage: vk::BufferUsageFlags) -> vk::AccessFlags {
    let mut access = vk::AccessFlags::empty();
    if usage.contains(vk::BufferUsageFlags::TRANSFER_SRC) {
        access |= vk::AccessFlags::TRANSFER_READ;
    }
    if usage.contains(vk::BufferUsageFlags::TRANSFER_DST) {
        access |= vk::AccessFlags::TRANSFER_WRITE;
    }
    if usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER) {
        access |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
    }
    if usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) {
        access |= vk::AccessFlags::INDEX_READ;
    }
    if usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER) {
        access |= vk::AccessFlags::INDIRECT_COMMAND_READ;
    }
    if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
        access |= vk::AccessFlags::UNIFORM_READ;
    }
    if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
        access |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
    }
    if usage.contains(vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER) {
        access |= vk::AccessFlags::SHADER_READ;
    }
    access
}

/// All stages a buffer with this usage could be consumed in.
pub(crate) fn buffer_usage_to_possible_stages(
    usage: vk::BufferUsageFlags,
) -> vk::PipelineStageFlags {
    let mut stages = vk::PipelineStageFlags::empty();
    if usage
        .intersects(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
    {
        stages |= vk::PipelineStageFlags::TRANSFER;
    }
    if usage.intersects(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER) {
        stages |= vk::PipelineStageFlags::VERTEX_INPUT;
    }
    if usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER) {
        stages |= vk::PipelineStageFlags::DRAW_INDIRECT;
    }
    if usage.intersects(
        vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER,
    ) {
        stages |= vk::PipelineStageFlags::VERTEX_SHADER
            | vk::PipelineStageFlags::FRAGMENT_SHADER
            | vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    stages
}

fn sample_count_from_flags(samples: vk::SampleCountFlags) -> vk::SampleCountFlags {
    if samples.is_empty() {
        vk::SampleCountFlags::TYPE_1
    } else {
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn cbuf(id: u64) -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(id)
    }

    fn sema(id: u64) -> vk::Semaphore {
        vk::Semaphore::from_raw(id)
    }

    #[test]
    fn wait_semaphore_splits_batches() {
        let mut composer = BatchComposer::new();
        composer.add_command_buffer(cbuf(1));
        composer.add_command_buffer(cbuf(2));
        // a wait arriving after commands opens a new batch so the
        // wait precedes only later work
        composer.add_wait_semaphore(sema(10), vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT, 0);
        composer.add_command_buffer(cbuf(3));

        assert_eq!(composer.num_batches(), 2);
        assert_eq!(composer.batch_cmd_counts(), vec![2, 1]);
    }

    #[test]
    fn signals_end_their_batch() {
        let mut composer = BatchComposer::new();
        composer.add_command_buffer(cbuf(1));
        composer.add_signal_semaphore(sema(20), 0);
        // commands after a signal must start a new batch
        composer.add_command_buffer(cbuf(2));

        assert_eq!(composer.num_batches(), 2);
        assert_eq!(composer.batch_cmd_counts(), vec![1, 1]);
    }

    #[test]
    fn empty_composer_keeps_one_batch() {
        let mut composer = BatchComposer::new();
        composer.add_signal_semaphore(sema(1), 7);
        assert_eq!(composer.num_batches(), 1);
    }

    #[test]
    fn buffer_usage_masks() {
        let access =
            buffer_usage_to_possible_access(vk::BufferUsageFlags::STORAGE_BUFFER);
        assert!(access.contains(vk::AccessFlags::SHADER_READ));
        assert!(access.contains(vk::AccessFlags::SHADER_WRITE));

        let stages =
            buffer_usage_to_possible_stages(vk::BufferUsageFlags::VERTEX_BUFFER);
        assert_eq!(stages, vk::PipelineStageFlags::VERTEX_INPUT);
    }
}
