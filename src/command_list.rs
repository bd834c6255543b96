// Command list recording
//
// A CommandList wraps one command buffer for one frame. All render
// state is tracked through dirty flags and only flushed at draw time:
// the pipeline is looked up (or baked) from the compile state hash,
// descriptor sets are hashed and pulled from the per-thread set
// allocators, and the push constant shadow is uploaded if touched.
// Transfer and barrier helpers record directly since the caller owns
// synchronization for those.

use ash::vk;

use crate::buffer::{Buffer, BufferView};
use crate::buffer_pool::BufferBlock;
use crate::cache::HashCombiner;
use crate::device::{BlockKind, Device, QueueType};
use crate::image::{Image, ImageView};
use crate::renderpass::{Framebuffer, RenderPass, RenderPassInfo};
use crate::sampler::{Sampler, StockSampler};
use crate::shader::{
    DescriptorResource, PipelineLayout, ShaderProgram, ShaderStage, UNSIZED_ARRAY,
};
use crate::{
    CandelaError, Result, VULKAN_NUM_ATTACHMENTS, VULKAN_NUM_BINDINGS,
    VULKAN_NUM_DESCRIPTOR_SETS, VULKAN_NUM_VERTEX_ATTRIBS, VULKAN_NUM_VERTEX_BUFFERS,
    VULKAN_PUSH_CONSTANT_SIZE,
};

use std::sync::Arc;

bitflags::bitflags! {
    /// State that has to be re-emitted before the next draw.
    struct DirtyFlags: u32 {
        const PIPELINE = 1 << 0;
        const VIEWPORT = 1 << 1;
        const SCISSOR = 1 << 2;
        const PUSH_CONSTANTS = 1 << 3;
        const VERTEX_BUFFERS = 1 << 4;
        const DYNAMIC_BITS = Self::VIEWPORT.bits | Self::SCISSOR.bits;
    }
}

/// One slot of the resource binding matrix.
#[derive(Copy, Clone)]
struct Binding {
    buffer: vk::DescriptorBufferInfo,
    image: vk::DescriptorImageInfo,
    buffer_view: vk::BufferView,
    dynamic_offset: u32,
    cookie: u64,
    /// sampler identity for combined bindings
    secondary_cookie: u64,
}

impl Default for Binding {
    fn default() -> Self {
        Self {
            buffer: vk::DescriptorBufferInfo::default(),
            image: vk::DescriptorImageInfo::default(),
            buffer_view: vk::BufferView::null(),
            dynamic_offset: 0,
            cookie: 0,
            secondary_cookie: 0,
        }
    }
}

/// The binding matrix plus the push constant shadow.
struct ResourceBindings {
    sets: [[Binding; VULKAN_NUM_BINDINGS]; VULKAN_NUM_DESCRIPTOR_SETS],
    push_constants: [u8; VULKAN_PUSH_CONSTANT_SIZE],
}

impl Default for ResourceBindings {
    fn default() -> Self {
        Self {
            sets: [[Binding::default(); VULKAN_NUM_BINDINGS]; VULKAN_NUM_DESCRIPTOR_SETS],
            push_constants: [0; VULKAN_PUSH_CONSTANT_SIZE],
        }
    }
}

#[derive(Copy, Clone, PartialEq)]
pub struct PipelineBlendState {
    pub blend_enable: bool,
    pub src_color_blend: vk::BlendFactor,
    pub dst_color_blend: vk::BlendFactor,
    pub color_blend_op: vk::BlendOp,
    pub src_alpha_blend: vk::BlendFactor,
    pub dst_alpha_blend: vk::BlendFactor,
    pub alpha_blend_op: vk::BlendOp,
    pub color_write_mask: vk::ColorComponentFlags,
}

impl Default for PipelineBlendState {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_blend: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend: vk::BlendFactor::ONE,
            dst_alpha_blend: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

#[derive(Copy, Clone, PartialEq)]
pub struct PipelineRasterState {
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub polygon_mode: vk::PolygonMode,
    pub depth_clamp: bool,
}

impl Default for PipelineRasterState {
    fn default() -> Self {
        Self {
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            polygon_mode: vk::PolygonMode::FILL,
            depth_clamp: false,
        }
    }
}

#[derive(Copy, Clone, PartialEq)]
pub struct PipelineDepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub stencil_test: bool,
}

impl Default for PipelineDepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            stencil_test: false,
        }
    }
}

#[derive(Copy, Clone, Default)]
struct VertexAttribState {
    binding: u32,
    format: vk::Format,
    offset: u32,
}

/// Everything a graphics pipeline bake depends on.
pub struct CompilePipelineState {
    program: Option<Arc<ShaderProgram>>,
    pub blend: PipelineBlendState,
    pub raster: PipelineRasterState,
    pub depth_stencil: PipelineDepthStencilState,
    pub topology: vk::PrimitiveTopology,
    attribs: [VertexAttribState; VULKAN_NUM_VERTEX_ATTRIBS],
    strides: [u32; VULKAN_NUM_VERTEX_BUFFERS],
    input_rates: [vk::VertexInputRate; VULKAN_NUM_VERTEX_BUFFERS],
    subpass_index: u32,
}

impl Default for CompilePipelineState {
    fn default() -> Self {
        Self {
            program: None,
            blend: PipelineBlendState::default(),
            raster: PipelineRasterState::default(),
            depth_stencil: PipelineDepthStencilState::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            attribs: [VertexAttribState::default(); VULKAN_NUM_VERTEX_ATTRIBS],
            strides: [0; VULKAN_NUM_VERTEX_BUFFERS],
            input_rates: [vk::VertexInputRate::VERTEX; VULKAN_NUM_VERTEX_BUFFERS],
            subpass_index: 0,
        }
    }
}

impl CompilePipelineState {
    /// Digest everything pipeline creation reads, plus the compatible
    /// render pass and the program identity.
    fn get_hash(&self, compat_hash: u64, active_attrs: u32, active_vbos: u32) -> u64 {
        let mut h = HashCombiner::new();

        h.bool(self.blend.blend_enable)
            .u32(self.blend.src_color_blend.as_raw() as u32)
            .u32(self.blend.dst_color_blend.as_raw() as u32)
            .u32(self.blend.color_blend_op.as_raw() as u32)
            .u32(self.blend.src_alpha_blend.as_raw() as u32)
            .u32(self.blend.dst_alpha_blend.as_raw() as u32)
            .u32(self.blend.alpha_blend_op.as_raw() as u32)
            .u32(self.blend.color_write_mask.as_raw());

        h.u32(self.raster.cull_mode.as_raw())
            .u32(self.raster.front_face.as_raw() as u32)
            .u32(self.raster.polygon_mode.as_raw() as u32)
            .bool(self.raster.depth_clamp);

        h.bool(self.depth_stencil.depth_test)
            .bool(self.depth_stencil.depth_write)
            .u32(self.depth_stencil.depth_compare.as_raw() as u32)
            .bool(self.depth_stencil.stencil_test);

        h.u32(self.topology.as_raw() as u32);

        let mut attr = active_attrs;
        while attr != 0 {
            let index = attr.trailing_zeros() as usize;
            attr &= !(1 << index);
            let state = &self.attribs[index];
            h.u32(index as u32)
                .u32(state.binding)
                .u32(state.format.as_raw() as u32)
                .u32(state.offset);
        }

        let mut vbo = active_vbos;
        while vbo != 0 {
            let index = vbo.trailing_zeros() as usize;
            vbo &= !(1 << index);
            h.u32(index as u32)
                .u32(self.strides[index])
                .u32(self.input_rates[index].as_raw() as u32);
        }

        h.u32(self.subpass_index);
        h.u64(compat_hash);
        if let Some(program) = self.program.as_ref() {
            h.u64(program.cookie());
        }

        h.get()
    }
}

/// Records one frame's worth of commands on a single buffer.
pub struct CommandList {
    dev: Arc<Device>,
    cmd: vk::CommandBuffer,
    queue: QueueType,
    thread_index: usize,
    submitted: bool,

    dirty: DirtyFlags,
    dirty_sets: u32,
    active_vbos: u32,

    pipeline_state: CompilePipelineState,
    current_pipeline: vk::Pipeline,
    current_layout: Option<Arc<PipelineLayout>>,
    current_vk_layout: vk::PipelineLayout,

    bindings: ResourceBindings,
    bindless_sets: [vk::DescriptorSet; VULKAN_NUM_DESCRIPTOR_SETS],
    allocated_sets: [vk::DescriptorSet; VULKAN_NUM_DESCRIPTOR_SETS],

    viewport: vk::Viewport,
    scissor: vk::Rect2D,

    // render pass runtime state
    framebuffer: Option<Arc<Framebuffer>>,
    framebuffer_attachments: Vec<Arc<ImageView>>,
    render_pass: Option<Arc<RenderPass>>,
    compatible_render_pass: Option<Arc<RenderPass>>,

    /// stages under which this list touched a swapchain image
    swapchain_stages: vk::PipelineStageFlags,

    vbo_buffers: [vk::Buffer; VULKAN_NUM_VERTEX_BUFFERS],
    vbo_offsets: [vk::DeviceSize; VULKAN_NUM_VERTEX_BUFFERS],

    // stream blocks in use by this list
    vbo_block: Option<BufferBlock>,
    ibo_block: Option<BufferBlock>,
    ubo_block: Option<BufferBlock>,
    staging_block: Option<BufferBlock>,
}

impl CommandList {
    pub(crate) fn new(
        dev: Arc<Device>,
        cmd: vk::CommandBuffer,
        queue: QueueType,
        thread_index: usize,
    ) -> Self {
        Self {
            dev,
            cmd,
            queue,
            thread_index,
            submitted: false,
            dirty: DirtyFlags::all(),
            dirty_sets: 0,
            active_vbos: 0,
            pipeline_state: CompilePipelineState::default(),
            current_pipeline: vk::Pipeline::null(),
            current_layout: None,
            current_vk_layout: vk::PipelineLayout::null(),
            bindings: ResourceBindings::default(),
            bindless_sets: [vk::DescriptorSet::null(); VULKAN_NUM_DESCRIPTOR_SETS],
            allocated_sets: [vk::DescriptorSet::null(); VULKAN_NUM_DESCRIPTOR_SETS],
            viewport: vk::Viewport::default(),
            scissor: vk::Rect2D::default(),
            framebuffer: None,
            framebuffer_attachments: Vec::new(),
            render_pass: None,
            compatible_render_pass: None,
            swapchain_stages: vk::PipelineStageFlags::empty(),
            vbo_buffers: [vk::Buffer::null(); VULKAN_NUM_VERTEX_BUFFERS],
            vbo_offsets: [0; VULKAN_NUM_VERTEX_BUFFERS],
            vbo_block: None,
            ibo_block: None,
            ubo_block: None,
            staging_block: None,
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue
    }

    pub fn vk_handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub fn swapchain_stages(&self) -> vk::PipelineStageFlags {
        self.swapchain_stages
    }

    fn set_dirty(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
    }

    fn is_dirty_and_clear(&mut self, flags: DirtyFlags) -> bool {
        let ret = self.dirty.intersects(flags);
        self.dirty &= !flags;
        ret
    }

    // ---------------------------------------------------------------
    // Render pass management
    // ---------------------------------------------------------------

    /// Begin a render pass, setting up the framebuffer, clear values
    /// and full-framebuffer viewport/scissor.
    pub fn begin_render_pass(&mut self, info: &RenderPassInfo) -> Result<()> {
        assert!(self.render_pass.is_none());

        let framebuffer = self.dev.request_framebuffer(info)?;
        let render_pass = self.dev.request_render_pass(info, false)?;
        let compatible_render_pass = framebuffer.render_pass().clone();

        // clamp the requested render area to the framebuffer
        let fb_width = framebuffer.width();
        let fb_height = framebuffer.height();
        let mut rect = info.render_area;
        rect.offset.x = rect.offset.x.min(fb_width as i32);
        rect.offset.y = rect.offset.y.min(fb_height as i32);
        rect.extent.width = rect.extent.width.min(fb_width - rect.offset.x as u32);
        rect.extent.height = rect.extent.height.min(fb_height - rect.offset.y as u32);

        self.viewport = vk::Viewport {
            x: rect.offset.x as f32,
            y: rect.offset.y as f32,
            width: rect.extent.width as f32,
            height: rect.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        self.scissor = rect;

        // collect clear values per the clear mask; the depth/stencil
        // slot sits after the colors so a depth-only pass gets a
        // single clear value
        let num_color = info.color_attachments.len();
        let mut clear_values =
            [vk::ClearValue::default(); VULKAN_NUM_ATTACHMENTS + 1];
        let mut num_clear_values = 0;
        for i in 0..num_color {
            if info.clear_attachments & (1 << i) != 0 {
                clear_values[i].color = info.clear_colors[i];
                num_clear_values = i + 1;
            }

            if info.color_attachments[i].is_swapchain_image() {
                self.swapchain_stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
            }
        }
        if info.depth_stencil.is_some() {
            clear_values[num_color].depth_stencil = info.clear_depth_stencil;
            num_clear_values = num_color + 1;
        }

        self.framebuffer_attachments.clear();
        self.framebuffer_attachments
            .extend(info.color_attachments.iter().cloned());
        if let Some(ds) = info.depth_stencil.as_ref() {
            self.framebuffer_attachments.push(ds.clone());
        }

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass.vk_handle())
            .framebuffer(framebuffer.vk_handle())
            .render_area(rect)
            .clear_values(&clear_values[0..num_clear_values])
            .build();

        unsafe {
            self.dev
                .vk_dev()
                .cmd_begin_render_pass(self.cmd, &begin_info, vk::SubpassContents::INLINE);
        }

        self.framebuffer = Some(framebuffer);
        self.render_pass = Some(render_pass);
        self.compatible_render_pass = Some(compatible_render_pass);
        self.pipeline_state.subpass_index = 0;
        self.begin_graphics_context();
        Ok(())
    }

    /// Step to the next subpass of the current render pass.
    pub fn next_subpass(&mut self) {
        assert!(self.render_pass.is_some());
        unsafe {
            self.dev
                .vk_dev()
                .cmd_next_subpass(self.cmd, vk::SubpassContents::INLINE);
        }
        self.pipeline_state.subpass_index += 1;
        self.current_pipeline = vk::Pipeline::null();
        self.set_dirty(DirtyFlags::PIPELINE | DirtyFlags::DYNAMIC_BITS);
    }

    pub fn end_render_pass(&mut self) {
        assert!(self.render_pass.is_some());
        unsafe {
            self.dev.vk_dev().cmd_end_render_pass(self.cmd);
        }

        self.framebuffer = None;
        self.framebuffer_attachments.clear();
        self.render_pass = None;
        self.compatible_render_pass = None;
    }

    /// Reset all state tracking to "everything dirty".
    fn begin_graphics_context(&mut self) {
        self.dirty = DirtyFlags::all();
        self.dirty_sets = !0u32;
        self.pipeline_state.program = None;
        self.current_pipeline = vk::Pipeline::null();
        self.current_vk_layout = vk::PipelineLayout::null();
        self.current_layout = None;
        self.allocated_sets = [vk::DescriptorSet::null(); VULKAN_NUM_DESCRIPTOR_SETS];
    }

    // ---------------------------------------------------------------
    // Pipeline state
    // ---------------------------------------------------------------

    /// Reset to the default opaque raster state.
    pub fn set_opaque_state(&mut self) {
        self.pipeline_state.blend = PipelineBlendState::default();
        self.pipeline_state.raster = PipelineRasterState::default();
        self.pipeline_state.depth_stencil = PipelineDepthStencilState {
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            stencil_test: false,
        };
        self.pipeline_state.topology = vk::PrimitiveTopology::TRIANGLE_LIST;
        self.set_dirty(DirtyFlags::PIPELINE);
    }

    pub fn set_blend_state(&mut self, blend: PipelineBlendState) {
        self.pipeline_state.blend = blend;
        self.set_dirty(DirtyFlags::PIPELINE);
    }

    pub fn set_raster_state(&mut self, raster: PipelineRasterState) {
        self.pipeline_state.raster = raster;
        self.set_dirty(DirtyFlags::PIPELINE);
    }

    pub fn set_depth_stencil_state(&mut self, ds: PipelineDepthStencilState) {
        self.pipeline_state.depth_stencil = ds;
        self.set_dirty(DirtyFlags::PIPELINE);
    }

    pub fn set_topology(&mut self, topology: vk::PrimitiveTopology) {
        self.pipeline_state.topology = topology;
        self.set_dirty(DirtyFlags::PIPELINE);
    }

    /// Bind a shader program. Idempotent on identity; a program with
    /// a different pipeline layout rebinds the layout pointer and
    /// invalidates every set.
    pub fn set_program(&mut self, program: &Arc<ShaderProgram>) {
        if let Some(current) = self.pipeline_state.program.as_ref() {
            if Arc::ptr_eq(current, program) {
                return;
            }
        }

        self.pipeline_state.program = Some(program.clone());
        self.current_pipeline = vk::Pipeline::null();
        self.set_dirty(DirtyFlags::PIPELINE | DirtyFlags::DYNAMIC_BITS);

        let layout = program.pipeline_layout();
        let rebind = match self.current_layout.as_ref() {
            None => true,
            Some(current) => current.get_hash() != layout.get_hash(),
        };
        if rebind {
            self.dirty_sets = !0u32;
            self.set_dirty(DirtyFlags::PUSH_CONSTANTS);
            self.current_layout = Some(layout.clone());
            self.current_vk_layout = layout.vk_handle();
        }
    }

    /// Convenience entry: resolve a vertex/fragment pair through the
    /// shader manager and bind the baked program.
    pub fn set_program_from_source(
        &mut self,
        vertex_path: &str,
        fragment_path: &str,
        defines: &[String],
    ) -> Result<()> {
        let dev = self.dev.clone();
        let program = dev.request_program_from_source(vertex_path, fragment_path, defines)?;
        self.set_program(&program);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Vertex streams
    // ---------------------------------------------------------------

    pub fn set_vertex_attrib(&mut self, attrib: u32, binding: u32, format: vk::Format, offset: u32) {
        assert!((attrib as usize) < VULKAN_NUM_VERTEX_ATTRIBS);
        let state = &mut self.pipeline_state.attribs[attrib as usize];
        state.binding = binding;
        state.format = format;
        state.offset = offset;
        self.set_dirty(DirtyFlags::PIPELINE);
    }

    pub fn bind_vertex_buffer(
        &mut self,
        binding: u32,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
        stride: u32,
        input_rate: vk::VertexInputRate,
    ) {
        self.bind_vertex_buffer_raw(binding, buffer.vk_handle(), offset, stride, input_rate);
    }

    fn bind_vertex_buffer_raw(
        &mut self,
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        stride: u32,
        input_rate: vk::VertexInputRate,
    ) {
        assert!((binding as usize) < VULKAN_NUM_VERTEX_BUFFERS);
        let index = binding as usize;
        self.active_vbos |= 1 << binding;
        if self.pipeline_state.strides[index] != stride
            || self.pipeline_state.input_rates[index] != input_rate
        {
            self.set_dirty(DirtyFlags::PIPELINE);
        }
        self.pipeline_state.strides[index] = stride;
        self.pipeline_state.input_rates[index] = input_rate;
        self.vbo_buffers[index] = buffer;
        self.vbo_offsets[index] = offset;
        self.set_dirty(DirtyFlags::VERTEX_BUFFERS);
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.dev
                .vk_dev()
                .cmd_bind_index_buffer(self.cmd, buffer.vk_handle(), offset, index_type);
        }
    }

    /// Stream vertex data through the vertex block pool and bind it.
    pub fn allocate_vertex_data(
        &mut self,
        binding: u32,
        size: u32,
        stride: u32,
        input_rate: vk::VertexInputRate,
    ) -> Result<*mut u8> {
        let (buffer, _cookie, alloc) = self.allocate_from_block(BlockKind::Vertex, size)?;
        self.bind_vertex_buffer_raw(binding, buffer, alloc.offset as vk::DeviceSize, stride, input_rate);
        Ok(alloc.host)
    }

    /// Stream index data through the index block pool and bind it.
    pub fn allocate_index_data(
        &mut self,
        size: u32,
        index_type: vk::IndexType,
    ) -> Result<*mut u8> {
        let (buffer, _cookie, alloc) = self.allocate_from_block(BlockKind::Index, size)?;
        unsafe {
            self.dev.vk_dev().cmd_bind_index_buffer(
                self.cmd,
                buffer,
                alloc.offset as vk::DeviceSize,
                index_type,
            );
        }
        Ok(alloc.host)
    }

    /// Stream uniform data and bind it with a dynamic offset.
    pub fn allocate_constant_data(
        &mut self,
        set: u32,
        binding: u32,
        size: u32,
    ) -> Result<*mut u8> {
        let (buffer, cookie, alloc) = self.allocate_from_block(BlockKind::Uniform, size)?;
        self.set_uniform_buffer_raw(
            set,
            binding,
            buffer,
            alloc.offset,
            alloc.padded_size as vk::DeviceSize,
            cookie,
        );
        Ok(alloc.host)
    }

    /// Stream staging bytes; the caller records the copy.
    pub fn allocate_staging_data(&mut self, size: u32) -> Result<(vk::Buffer, u32, *mut u8)> {
        let (buffer, _cookie, alloc) = self.allocate_from_block(BlockKind::Staging, size)?;
        Ok((buffer, alloc.offset, alloc.host))
    }

    /// Sub-allocate from this command buffer's persistent storage
    /// block. Returns the buffer, the allocation and the block's
    /// bindless index if it carries one.
    pub fn allocate_storage_data(
        &mut self,
        size: u32,
    ) -> Result<(vk::Buffer, u32, *mut u8, Option<i32>)> {
        let (buffer, alloc, bindless) = self.dev.allocate_command_storage(self.cmd, size)?;
        Ok((buffer, alloc.offset, alloc.host, bindless))
    }

    fn block_slot(&mut self, kind: BlockKind) -> &mut Option<BufferBlock> {
        match kind {
            BlockKind::Vertex => &mut self.vbo_block,
            BlockKind::Index => &mut self.ibo_block,
            BlockKind::Uniform => &mut self.ubo_block,
            BlockKind::Staging => &mut self.staging_block,
            BlockKind::Storage => unreachable!("storage blocks live in the frame map"),
        }
    }

    fn allocate_from_block(
        &mut self,
        kind: BlockKind,
        size: u32,
    ) -> Result<(vk::Buffer, u64, crate::buffer_pool::BufferBlockAllocation)> {
        if let Some(block) = self.block_slot(kind).as_mut() {
            let alloc = block.allocate(size);
            if alloc.is_valid() {
                let buffer = block.gpu_buffer().vk_handle();
                let cookie = block.gpu_buffer().cookie();
                return Ok((buffer, cookie, alloc));
            }
        }

        // spent or missing; recycle and grab a fresh block
        let dev = self.dev.clone();
        if let Some(old) = self.block_slot(kind).take() {
            dev.recycle_block(kind, old);
        }
        let mut block = dev.request_block(kind, size)?;
        let alloc = block.allocate(size);
        let buffer = block.gpu_buffer().vk_handle();
        let cookie = block.gpu_buffer().cookie();
        *self.block_slot(kind) = Some(block);

        if !alloc.is_valid() {
            return Err(CandelaError::OUT_OF_MEMORY);
        }
        Ok((buffer, cookie, alloc))
    }

    // ---------------------------------------------------------------
    // Resource binding
    // ---------------------------------------------------------------

    /// Copy bytes into the push constant shadow.
    pub fn push_constants(&mut self, data: &[u8], offset: usize) {
        assert!(offset + data.len() <= VULKAN_PUSH_CONSTANT_SIZE);
        self.bindings.push_constants[offset..offset + data.len()].copy_from_slice(data);
        self.set_dirty(DirtyFlags::PUSH_CONSTANTS);
    }

    /// Install a pre-allocated bindless descriptor set in a slot.
    pub fn set_bindless(&mut self, set: u32, descriptor_set: vk::DescriptorSet) {
        assert!((set as usize) < VULKAN_NUM_DESCRIPTOR_SETS);
        self.bindless_sets[set as usize] = descriptor_set;
        self.dirty_sets |= 1 << set;
    }

    /// Bind a sampled texture.
    pub fn set_texture(&mut self, set: u32, binding: u32, view: &Arc<ImageView>) {
        let slot = &mut self.bindings.sets[set as usize][binding as usize];
        if slot.cookie == view.cookie() {
            return;
        }
        slot.cookie = view.cookie();
        slot.image.image_view = view.vk_handle();
        slot.image.image_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        self.dirty_sets |= 1 << set;
    }

    /// Bind a storage image in GENERAL layout.
    pub fn set_storage_texture(&mut self, set: u32, binding: u32, view: &Arc<ImageView>) {
        let slot = &mut self.bindings.sets[set as usize][binding as usize];
        if slot.cookie == view.cookie() {
            return;
        }
        slot.cookie = view.cookie();
        slot.image.image_view = view.vk_handle();
        slot.image.image_layout = vk::ImageLayout::GENERAL;
        self.dirty_sets |= 1 << set;
    }

    /// Bind an input attachment view.
    pub fn set_input_attachment(&mut self, set: u32, binding: u32, view: &Arc<ImageView>) {
        let slot = &mut self.bindings.sets[set as usize][binding as usize];
        slot.cookie = view.cookie();
        slot.image.image_view = view.vk_handle();
        slot.image.image_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        self.dirty_sets |= 1 << set;
    }

    /// Bind a sampler object.
    pub fn set_sampler(&mut self, set: u32, binding: u32, sampler: &Sampler) {
        let slot = &mut self.bindings.sets[set as usize][binding as usize];
        if slot.secondary_cookie == sampler.cookie() {
            return;
        }
        slot.secondary_cookie = sampler.cookie();
        slot.image.sampler = sampler.vk_handle();
        self.dirty_sets |= 1 << set;
    }

    /// Bind one of the device's stock samplers.
    pub fn set_stock_sampler(&mut self, set: u32, binding: u32, stock: StockSampler) {
        let dev = self.dev.clone();
        let sampler = dev.stock_sampler(stock).clone();
        self.set_sampler(set, binding, &sampler);
    }

    /// Bind a uniform buffer range with a dynamic offset.
    pub fn set_uniform_buffer(
        &mut self,
        set: u32,
        binding: u32,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        self.set_uniform_buffer_raw(
            set,
            binding,
            buffer.vk_handle(),
            offset as u32,
            range,
            buffer.cookie(),
        );
    }

    fn set_uniform_buffer_raw(
        &mut self,
        set: u32,
        binding: u32,
        buffer: vk::Buffer,
        dynamic_offset: u32,
        range: vk::DeviceSize,
        cookie: u64,
    ) {
        let slot = &mut self.bindings.sets[set as usize][binding as usize];
        // uniform buffers bind at offset zero; the sub-allocation
        // offset rides in as a dynamic offset at bind time
        slot.buffer = vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        };
        slot.dynamic_offset = dynamic_offset;
        slot.cookie = cookie;
        self.dirty_sets |= 1 << set;
    }

    /// Bind a storage buffer range.
    pub fn set_storage_buffer(
        &mut self,
        set: u32,
        binding: u32,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        let slot = &mut self.bindings.sets[set as usize][binding as usize];
        slot.buffer = vk::DescriptorBufferInfo {
            buffer: buffer.vk_handle(),
            offset,
            range,
        };
        slot.dynamic_offset = 0;
        slot.cookie = buffer.cookie();
        self.dirty_sets |= 1 << set;
    }

    /// Bind a texel buffer view.
    pub fn set_buffer_view(&mut self, set: u32, binding: u32, view: &Arc<BufferView>) {
        let slot = &mut self.bindings.sets[set as usize][binding as usize];
        if slot.cookie == view.cookie() {
            return;
        }
        slot.cookie = view.cookie();
        slot.buffer_view = view.vk_handle();
        self.dirty_sets |= 1 << set;
    }

    // ---------------------------------------------------------------
    // Draw / dispatch
    // ---------------------------------------------------------------

    /// Draw non-indexed. Silently dropped when no usable program is
    /// bound.
    pub fn draw(&mut self, vertex_count: u32, first_vertex: u32) {
        if self.flush_render_state() {
            unsafe {
                self.dev
                    .vk_dev()
                    .cmd_draw(self.cmd, vertex_count, 1, first_vertex, 0);
            }
        }
    }

    pub fn draw_indexed(&mut self, index_count: u32, first_index: u32, vertex_offset: i32) {
        if self.flush_render_state() {
            unsafe {
                self.dev.vk_dev().cmd_draw_indexed(
                    self.cmd,
                    index_count,
                    1,
                    first_index,
                    vertex_offset,
                    0,
                );
            }
        }
    }

    /// Dispatch compute work through the same deferred flush path.
    pub fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) {
        if self.flush_compute_state() {
            unsafe {
                self.dev
                    .vk_dev()
                    .cmd_dispatch(self.cmd, groups_x, groups_y, groups_z);
            }
        }
    }

    // ---------------------------------------------------------------
    // Transfers and barriers
    // ---------------------------------------------------------------

    /// Copy a whole buffer. The caller owns the barriers.
    pub fn copy_buffer(&mut self, dst: &Arc<Buffer>, src: &Arc<Buffer>) {
        let size = dst.info().size.min(src.info().size);
        self.copy_buffer_region(dst, 0, src, 0, size);
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: &Arc<Buffer>,
        dst_offset: vk::DeviceSize,
        src: &Arc<Buffer>,
        src_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            self.dev.vk_dev().cmd_copy_buffer(
                self.cmd,
                src.vk_handle(),
                dst.vk_handle(),
                &[region],
            );
        }
    }

    /// Copy buffer regions into an image. The caller owns layout
    /// transitions.
    pub fn copy_to_image(
        &mut self,
        image: &Arc<Image>,
        buffer: &Arc<Buffer>,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.dev.vk_dev().cmd_copy_buffer_to_image(
                self.cmd,
                buffer.vk_handle(),
                image.vk_handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            );
        }
    }

    /// Fill a buffer with a repeated 32-bit value.
    pub fn fill_buffer(&mut self, buffer: &Arc<Buffer>, value: u32) {
        unsafe {
            self.dev.vk_dev().cmd_fill_buffer(
                self.cmd,
                buffer.vk_handle(),
                0,
                vk::WHOLE_SIZE,
                value,
            );
        }
    }

    /// Global execution + memory barrier.
    pub fn barrier(
        &mut self,
        src_stages: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stages: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build();
        unsafe {
            self.dev.vk_dev().cmd_pipeline_barrier(
                self.cmd,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    /// Transition an image between layouts.
    pub fn image_barrier(
        &mut self,
        image: &Arc<Image>,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_stages: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stages: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let info = image.info();
        let barrier = vk::ImageMemoryBarrier::builder()
            .image(image.vk_handle())
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(crate::image::format_aspect_flags(info.format))
                    .base_mip_level(0)
                    .level_count(info.levels)
                    .base_array_layer(0)
                    .layer_count(info.layers)
                    .build(),
            )
            .build();

        unsafe {
            self.dev.vk_dev().cmd_pipeline_barrier(
                self.cmd,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    /// Blit the mip chain of an image down from level 0.
    ///
    /// Expects every level in TRANSFER_DST; leaves the whole image in
    /// `final_layout`. Must run on a queue with graphics capability
    /// since transfer queues cannot blit.
    pub fn generate_mipmaps(&mut self, image: &Arc<Image>, final_layout: vk::ImageLayout) {
        let info = *image.info();
        let aspect = crate::image::format_aspect_flags(info.format);
        let dev = self.dev.clone();

        let level_barrier = |cmd: vk::CommandBuffer,
                             level: u32,
                             old: vk::ImageLayout,
                             new: vk::ImageLayout,
                             src_access: vk::AccessFlags,
                             dst_access: vk::AccessFlags| {
            let barrier = vk::ImageMemoryBarrier::builder()
                .image(image.vk_handle())
                .old_layout(old)
                .new_layout(new)
                .src_access_mask(src_access)
                .dst_access_mask(dst_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(aspect)
                        .base_mip_level(level)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(info.layers)
                        .build(),
                )
                .build();
            unsafe {
                dev.vk_dev().cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
        };

        let mut src_width = info.width as i32;
        let mut src_height = info.height as i32;

        for level in 1..info.levels {
            let dst_width = (src_width / 2).max(1);
            let dst_height = (src_height / 2).max(1);

            // the source level is done being written, flip it to
            // TRANSFER_SRC for the blit
            level_barrier(
                self.cmd,
                level - 1,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            );

            let blit = vk::ImageBlit::builder()
                .src_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(aspect)
                        .mip_level(level - 1)
                        .base_array_layer(0)
                        .layer_count(info.layers)
                        .build(),
                )
                .src_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: src_width,
                        y: src_height,
                        z: 1,
                    },
                ])
                .dst_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(aspect)
                        .mip_level(level)
                        .base_array_layer(0)
                        .layer_count(info.layers)
                        .build(),
                )
                .dst_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: dst_width,
                        y: dst_height,
                        z: 1,
                    },
                ])
                .build();

            unsafe {
                dev.vk_dev().cmd_blit_image(
                    self.cmd,
                    image.vk_handle(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image.vk_handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }

            src_width = dst_width;
            src_height = dst_height;
        }

        // settle every level into the final layout
        for level in 0..info.levels {
            let (old, src_access) = if level + 1 == info.levels {
                (
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::TRANSFER_WRITE,
                )
            } else {
                (
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags::TRANSFER_READ,
                )
            };
            level_barrier(
                self.cmd,
                level,
                old,
                final_layout,
                src_access,
                vk::AccessFlags::SHADER_READ,
            );
        }
    }

    /// Stream bytes into a buffer through the staging block and
    /// record the copy.
    pub fn update_buffer(&mut self, buffer: &Arc<Buffer>, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let (staging, staging_offset, host) = self.allocate_staging_data(data.len() as u32)?;
        if host.is_null() {
            return Err(CandelaError::INVALID);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), host, data.len());
        }

        let region = vk::BufferCopy {
            src_offset: staging_offset as vk::DeviceSize,
            dst_offset: offset,
            size: data.len() as vk::DeviceSize,
        };
        unsafe {
            self.dev.vk_dev().cmd_copy_buffer(
                self.cmd,
                staging,
                buffer.vk_handle(),
                &[region],
            );
        }
        Ok(())
    }

    /// Release/acquire an image across queue families.
    pub fn image_family_barrier(
        &mut self,
        image: &Arc<Image>,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_family: u32,
        dst_family: u32,
        src_stages: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stages: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let info = image.info();
        let barrier = vk::ImageMemoryBarrier::builder()
            .image(image.vk_handle())
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(crate::image::format_aspect_flags(info.format))
                    .level_count(info.levels)
                    .layer_count(info.layers)
                    .build(),
            )
            .build();

        unsafe {
            self.dev.vk_dev().cmd_pipeline_barrier(
                self.cmd,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    /// Open a debug label scope.
    pub fn begin_event(&mut self, name: &str) {
        self.dev.instance.cmd_begin_label(self.cmd, name);
    }

    pub fn end_event(&mut self) {
        self.dev.instance.cmd_end_label(self.cmd);
    }

    // ---------------------------------------------------------------
    // State flushing
    // ---------------------------------------------------------------

    /// Flush all deferred graphics state. Returns false when the draw
    /// should be dropped.
    fn flush_render_state(&mut self) -> bool {
        let program = match self.pipeline_state.program.as_ref() {
            Some(p) if !p.is_empty() => p.clone(),
            _ => return false,
        };

        if self.current_pipeline == vk::Pipeline::null() {
            self.set_dirty(DirtyFlags::PIPELINE);
        }

        if self.is_dirty_and_clear(DirtyFlags::PIPELINE) {
            let old_pipeline = self.current_pipeline;
            if !self.flush_graphics_pipeline(&program) {
                return false;
            }
            if old_pipeline != self.current_pipeline {
                unsafe {
                    self.dev.vk_dev().cmd_bind_pipeline(
                        self.cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.current_pipeline,
                    );
                }
                self.set_dirty(DirtyFlags::DYNAMIC_BITS);
            }
        }

        if self.current_pipeline == vk::Pipeline::null() {
            return false;
        }

        if self.is_dirty_and_clear(DirtyFlags::VIEWPORT) {
            unsafe {
                self.dev
                    .vk_dev()
                    .cmd_set_viewport(self.cmd, 0, &[self.viewport]);
            }
        }

        if self.is_dirty_and_clear(DirtyFlags::SCISSOR) {
            unsafe {
                self.dev
                    .vk_dev()
                    .cmd_set_scissor(self.cmd, 0, &[self.scissor]);
            }
        }

        if self.is_dirty_and_clear(DirtyFlags::VERTEX_BUFFERS) && self.active_vbos != 0 {
            // bind each active slot; the mask may have holes
            let mut mask = self.active_vbos;
            while mask != 0 {
                let index = mask.trailing_zeros() as usize;
                mask &= !(1 << index);
                unsafe {
                    self.dev.vk_dev().cmd_bind_vertex_buffers(
                        self.cmd,
                        index as u32,
                        &self.vbo_buffers[index..index + 1],
                        &self.vbo_offsets[index..index + 1],
                    );
                }
            }
        }

        self.flush_descriptor_sets(&program, vk::PipelineBindPoint::GRAPHICS);
        self.flush_push_constants(&program);

        true
    }

    /// Flush deferred compute state.
    fn flush_compute_state(&mut self) -> bool {
        let program = match self.pipeline_state.program.as_ref() {
            Some(p) if p.is_compute() => p.clone(),
            _ => return false,
        };

        if self.current_pipeline == vk::Pipeline::null() {
            self.set_dirty(DirtyFlags::PIPELINE);
        }

        if self.is_dirty_and_clear(DirtyFlags::PIPELINE) {
            let old_pipeline = self.current_pipeline;

            let mut hasher = HashCombiner::new();
            hasher.u64(program.cookie());
            let hash = hasher.get();

            let pipeline = match program.get_pipeline(hash) {
                Some(p) => p,
                None => match self.build_compute_pipeline(&program) {
                    Some(p) => program.add_pipeline(hash, p),
                    None => return false,
                },
            };
            self.current_pipeline = pipeline;

            if old_pipeline != self.current_pipeline {
                unsafe {
                    self.dev.vk_dev().cmd_bind_pipeline(
                        self.cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        self.current_pipeline,
                    );
                }
            }
        }

        if self.current_pipeline == vk::Pipeline::null() {
            return false;
        }

        self.flush_descriptor_sets(&program, vk::PipelineBindPoint::COMPUTE);
        self.flush_push_constants(&program);

        true
    }

    /// Look up or bake the graphics pipeline for the current compile
    /// state.
    fn flush_graphics_pipeline(&mut self, program: &Arc<ShaderProgram>) -> bool {
        let compat = match self.compatible_render_pass.as_ref() {
            Some(pass) => pass.clone(),
            None => return false,
        };

        let active_attrs = program.pipeline_layout().resource_layout().attribute_input_mask;
        let hash = self
            .pipeline_state
            .get_hash(compat.get_hash(), active_attrs, self.active_vbos);

        if let Some(pipeline) = program.get_pipeline(hash) {
            self.current_pipeline = pipeline;
            return true;
        }

        match self.build_graphics_pipeline(program, &compat) {
            Some(pipeline) => {
                self.current_pipeline = program.add_pipeline(hash, pipeline);
                true
            }
            None => false,
        }
    }

    /// Bake a graphics pipeline against the compatible render pass.
    fn build_graphics_pipeline(
        &self,
        program: &Arc<ShaderProgram>,
        compat: &Arc<RenderPass>,
    ) -> Option<vk::Pipeline> {
        let state = &self.pipeline_state;
        let subpass = state.subpass_index;

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1)
            .build();

        // viewport and scissor stay dynamic, everything else bakes
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states)
            .build();

        let num_color = compat.num_color_attachments(subpass) as usize;
        let mut blend_attachments =
            [vk::PipelineColorBlendAttachmentState::default(); VULKAN_NUM_ATTACHMENTS];
        for i in 0..num_color {
            if compat.color_attachment(subpass, i as u32).attachment == vk::ATTACHMENT_UNUSED {
                continue;
            }
            let att = &mut blend_attachments[i];
            att.color_write_mask = state.blend.color_write_mask;
            att.blend_enable = state.blend.blend_enable as u32;
            if state.blend.blend_enable {
                att.src_color_blend_factor = state.blend.src_color_blend;
                att.dst_color_blend_factor = state.blend.dst_color_blend;
                att.color_blend_op = state.blend.color_blend_op;
                att.src_alpha_blend_factor = state.blend.src_alpha_blend;
                att.dst_alpha_blend_factor = state.blend.dst_alpha_blend;
                att.alpha_blend_op = state.blend.alpha_blend_op;
            }
        }
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(&blend_attachments[0..num_color])
            .build();

        let has_depth = compat.has_depth(subpass);
        let has_stencil = compat.has_stencil(subpass);
        let mut depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(has_depth && state.depth_stencil.depth_test)
            .depth_write_enable(has_depth && state.depth_stencil.depth_write)
            .stencil_test_enable(has_stencil && state.depth_stencil.stencil_test)
            .build();
        if depth_stencil.depth_test_enable != 0 {
            depth_stencil.depth_compare_op = state.depth_stencil.depth_compare;
        }

        // vertex input state from the program's attribute mask
        let layout = program.pipeline_layout();
        let mut attr_descs = Vec::new();
        let mut binding_mask = 0u32;
        let mut mask = layout.resource_layout().attribute_input_mask;
        while mask != 0 {
            let location = mask.trailing_zeros();
            mask &= !(1 << location);
            let attr = &state.attribs[location as usize];
            attr_descs.push(vk::VertexInputAttributeDescription {
                location,
                binding: attr.binding,
                format: attr.format,
                offset: attr.offset,
            });
            binding_mask |= 1 << attr.binding;
        }

        let mut binding_descs = Vec::new();
        while binding_mask != 0 {
            let binding = binding_mask.trailing_zeros();
            binding_mask &= !(1 << binding);
            binding_descs.push(vk::VertexInputBindingDescription {
                binding,
                stride: state.strides[binding as usize],
                input_rate: state.input_rates[binding as usize],
            });
        }

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_attribute_descriptions(&attr_descs)
            .vertex_binding_descriptions(&binding_descs)
            .build();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(state.topology)
            .primitive_restart_enable(false)
            .build();

        let raster = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(state.raster.depth_clamp)
            .rasterizer_discard_enable(false)
            .polygon_mode(state.raster.polygon_mode)
            .cull_mode(state.raster.cull_mode)
            .front_face(state.raster.front_face)
            .line_width(1.0)
            .build();

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .build();

        let entry = std::ffi::CString::new("main").unwrap();
        let mut stages = Vec::new();
        for stage in ShaderStage::all().iter() {
            if *stage == ShaderStage::Compute {
                continue;
            }
            if let Some(shader) = program.get_shader(*stage) {
                stages.push(
                    vk::PipelineShaderStageCreateInfo::builder()
                        .stage(stage.to_vk())
                        .module(shader.vk_handle())
                        .name(&entry)
                        .build(),
                );
            }
        }
        if stages.is_empty() {
            return None;
        }

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout.vk_handle())
            .render_pass(compat.vk_handle())
            .subpass(subpass)
            .build();

        let result = unsafe {
            self.dev.vk_dev().create_graphics_pipelines(
                self.dev.vk_pipeline_cache(),
                &[info],
                None,
            )
        };

        match result {
            Ok(pipelines) => Some(pipelines[0]),
            Err((_, e)) => {
                log::error!("Failed to create graphics pipeline: {:?}", e);
                None
            }
        }
    }

    fn build_compute_pipeline(&self, program: &Arc<ShaderProgram>) -> Option<vk::Pipeline> {
        let shader = program.get_shader(ShaderStage::Compute)?;
        let entry = std::ffi::CString::new("main").unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.vk_handle())
            .name(&entry)
            .build();

        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(program.pipeline_layout().vk_handle())
            .build();

        let result = unsafe {
            self.dev.vk_dev().create_compute_pipelines(
                self.dev.vk_pipeline_cache(),
                &[info],
                None,
            )
        };

        match result {
            Ok(pipelines) => Some(pipelines[0]),
            Err((_, e)) => {
                log::error!("Failed to create compute pipeline: {:?}", e);
                None
            }
        }
    }

    /// Flush the dirty descriptor sets of the bound program.
    fn flush_descriptor_sets(
        &mut self,
        program: &Arc<ShaderProgram>,
        bind_point: vk::PipelineBindPoint,
    ) {
        let layout = program.pipeline_layout().clone();
        let res_layout = *layout.resource_layout();

        let mut sets_to_flush = res_layout.descriptor_set_mask & self.dirty_sets;
        while sets_to_flush != 0 {
            let set = sets_to_flush.trailing_zeros();
            sets_to_flush &= !(1 << set);
            self.flush_descriptor_set(set, &layout, bind_point);
        }
        self.dirty_sets &= !res_layout.descriptor_set_mask;
    }

    fn flush_descriptor_set(
        &mut self,
        set: u32,
        layout: &Arc<PipelineLayout>,
        bind_point: vk::PipelineBindPoint,
    ) {
        let res_layout = layout.resource_layout();

        // bindless slots bind the externally installed set
        if res_layout.bindless_descriptor_set_mask & (1 << set) != 0 {
            let bindless = self.bindless_sets[set as usize];
            if bindless != vk::DescriptorSet::null() {
                unsafe {
                    self.dev.vk_dev().cmd_bind_descriptor_sets(
                        self.cmd,
                        bind_point,
                        self.current_vk_layout,
                        set,
                        &[bindless],
                        &[],
                    );
                }
                self.allocated_sets[set as usize] = bindless;
            }
            return;
        }

        let set_layout = &res_layout.sets[set as usize];
        let active_mask = set_layout.active_binding_mask();

        // digest the active bindings into the set lookup key
        let mut hasher = HashCombiner::new();
        let mut dynamic_offsets = Vec::new();
        let mut mask = active_mask;
        while mask != 0 {
            let binding = mask.trailing_zeros();
            mask &= !(1 << binding);
            let slot = &self.bindings.sets[set as usize][binding as usize];
            let role = set_layout.role_for_binding(binding).unwrap();

            hasher.u32(binding).u64(slot.cookie).u64(slot.secondary_cookie);
            match role {
                DescriptorResource::UniformBuffer => {
                    hasher.u64(slot.buffer.range);
                    dynamic_offsets.push(slot.dynamic_offset);
                }
                DescriptorResource::StorageBuffer => {
                    hasher.u64(slot.buffer.offset).u64(slot.buffer.range);
                }
                _ => {}
            }
        }
        let hash = hasher.get();

        let allocator = match layout.set_allocator(set) {
            Some(a) => a,
            None => return,
        };
        let (vk_set, found) = match allocator.get_or_allocate(self.thread_index, hash) {
            Ok(ret) => ret,
            Err(_) => return,
        };

        if !found {
            self.write_descriptor_set(vk_set, set, set_layout, active_mask);
        }

        unsafe {
            self.dev.vk_dev().cmd_bind_descriptor_sets(
                self.cmd,
                bind_point,
                self.current_vk_layout,
                set,
                &[vk_set],
                &dynamic_offsets,
            );
        }
        self.allocated_sets[set as usize] = vk_set;
    }

    /// Write descriptors for every active binding of a freshly
    /// allocated set.
    fn write_descriptor_set(
        &self,
        vk_set: vk::DescriptorSet,
        set: u32,
        set_layout: &crate::shader::DescriptorSetLayout,
        active_mask: u32,
    ) {
        // storage kept alive until the update call below
        let mut buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = Vec::new();
        let mut image_infos: Vec<[vk::DescriptorImageInfo; 1]> = Vec::new();
        let mut texel_views: Vec<[vk::BufferView; 1]> = Vec::new();
        let mut writes: Vec<(u32, DescriptorResource, usize)> = Vec::new();

        let mut mask = active_mask;
        while mask != 0 {
            let binding = mask.trailing_zeros();
            mask &= !(1 << binding);
            if set_layout.array_sizes[binding as usize] == UNSIZED_ARRAY {
                continue;
            }
            let slot = &self.bindings.sets[set as usize][binding as usize];
            let role = set_layout.role_for_binding(binding).unwrap();

            let index = match role {
                DescriptorResource::UniformBuffer | DescriptorResource::StorageBuffer => {
                    buffer_infos.push([slot.buffer]);
                    buffer_infos.len() - 1
                }
                DescriptorResource::SampledBuffer => {
                    texel_views.push([slot.buffer_view]);
                    texel_views.len() - 1
                }
                _ => {
                    image_infos.push([slot.image]);
                    image_infos.len() - 1
                }
            };
            writes.push((binding, role, index));
        }

        let mut vk_writes = Vec::with_capacity(writes.len());
        for (binding, role, index) in writes.iter() {
            let mut write = vk::WriteDescriptorSet::builder()
                .dst_set(vk_set)
                .dst_binding(*binding)
                .dst_array_element(0)
                .descriptor_type(role.to_vk());

            write = match role {
                DescriptorResource::UniformBuffer | DescriptorResource::StorageBuffer => {
                    write.buffer_info(&buffer_infos[*index])
                }
                DescriptorResource::SampledBuffer => {
                    write.texel_buffer_view(&texel_views[*index])
                }
                _ => write.image_info(&image_infos[*index]),
            };
            vk_writes.push(write.build());
        }

        unsafe {
            self.dev.vk_dev().update_descriptor_sets(&vk_writes, &[]);
        }
    }

    fn flush_push_constants(&mut self, program: &Arc<ShaderProgram>) {
        let range = program.pipeline_layout().resource_layout().push_constant_range;
        if range.size == 0 {
            self.dirty &= !DirtyFlags::PUSH_CONSTANTS;
            return;
        }

        if self.is_dirty_and_clear(DirtyFlags::PUSH_CONSTANTS) {
            unsafe {
                self.dev.vk_dev().cmd_push_constants(
                    self.cmd,
                    self.current_vk_layout,
                    range.stage_flags,
                    0,
                    &self.bindings.push_constants[0..range.size as usize],
                );
            }
        }
    }

    // ---------------------------------------------------------------
    // End of recording
    // ---------------------------------------------------------------

    /// End the command buffer and strip the parts the device needs
    /// for submission and block recycling.
    pub(crate) fn end_recording(
        &mut self,
    ) -> (
        vk::CommandBuffer,
        vk::PipelineStageFlags,
        Vec<(BlockKind, BufferBlock)>,
    ) {
        assert!(!self.submitted);
        self.submitted = true;

        unsafe {
            self.dev
                .vk_dev()
                .end_command_buffer(self.cmd)
                .expect("Could not end command buffer");
        }

        (self.cmd, self.swapchain_stages, self.take_blocks())
    }

    fn take_blocks(&mut self) -> Vec<(BlockKind, BufferBlock)> {
        let mut blocks = Vec::new();
        if let Some(block) = self.vbo_block.take() {
            blocks.push((BlockKind::Vertex, block));
        }
        if let Some(block) = self.ibo_block.take() {
            blocks.push((BlockKind::Index, block));
        }
        if let Some(block) = self.ubo_block.take() {
            blocks.push((BlockKind::Uniform, block));
        }
        if let Some(block) = self.staging_block.take() {
            blocks.push((BlockKind::Staging, block));
        }
        blocks
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if !self.submitted {
            // never submitted: balance the drain gate, the pool
            // reclaims the buffer at the next frame reset
            let blocks = self.take_blocks();
            self.dev.abandon_command_list(blocks);
        }
    }
}
