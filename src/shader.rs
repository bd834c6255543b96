// Shaders, programs and pipeline layouts
//
// A Shader wraps one SPIR-V module together with the resource layout
// reflected out of it. Programs combine a legal stage permutation
// (graphics stages, or one compute stage), OR the per-stage layouts
// into a combined layout, and own a read-optimized cache of baked
// pipelines keyed by pipeline state hash.

use ash::vk;

use crate::cache::{HashCombiner, VulkanCache};
use crate::cookie::generate_cookie;
use crate::descriptor::DescriptorSetAllocator;
use crate::sampler::StockSampler;
use crate::{CandelaError, Result, VULKAN_NUM_BINDINGS, VULKAN_NUM_DESCRIPTOR_SETS};

use std::sync::Arc;

/// Pipeline stages a shader module can implement.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex = 0,
    TessControl,
    TessEval,
    Geometry,
    Fragment,
    Compute,
}

pub const SHADER_STAGE_COUNT: usize = 6;

impl ShaderStage {
    pub fn to_vk(&self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::TessControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderStage::TessEval => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    pub(crate) fn all() -> [ShaderStage; SHADER_STAGE_COUNT] {
        [
            ShaderStage::Vertex,
            ShaderStage::TessControl,
            ShaderStage::TessEval,
            ShaderStage::Geometry,
            ShaderStage::Fragment,
            ShaderStage::Compute,
        ]
    }
}

/// The role a descriptor binding plays.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DescriptorResource {
    SampledImage = 0,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
    SampledBuffer,
    InputAttachment,
    Sampler,
    SeparateImage,
}

pub const DESCRIPTOR_RESOURCE_COUNT: usize = 8;

impl DescriptorResource {
    pub(crate) fn all() -> [DescriptorResource; DESCRIPTOR_RESOURCE_COUNT] {
        [
            DescriptorResource::SampledImage,
            DescriptorResource::StorageImage,
            DescriptorResource::UniformBuffer,
            DescriptorResource::StorageBuffer,
            DescriptorResource::SampledBuffer,
            DescriptorResource::InputAttachment,
            DescriptorResource::Sampler,
            DescriptorResource::SeparateImage,
        ]
    }

    /// The vulkan descriptor type backing this role. Uniform buffers
    /// bind with dynamic offsets so the buffer block suballocator can
    /// rebind cheaply.
    pub(crate) fn to_vk(&self) -> vk::DescriptorType {
        match self {
            DescriptorResource::SampledImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorResource::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorResource::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            DescriptorResource::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorResource::SampledBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            DescriptorResource::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
            DescriptorResource::Sampler => vk::DescriptorType::SAMPLER,
            DescriptorResource::SeparateImage => vk::DescriptorType::SAMPLED_IMAGE,
        }
    }
}

/// Marks a binding whose array size is only known at draw time.
pub const UNSIZED_ARRAY: u8 = 0xff;

/// The logical layout of one descriptor set.
#[derive(Copy, Clone)]
pub struct DescriptorSetLayout {
    /// per-role bitmask of active bindings
    pub role_masks: [u32; DESCRIPTOR_RESOURCE_COUNT],
    pub array_sizes: [u8; VULKAN_NUM_BINDINGS],
    pub immutable_sampler_mask: u32,
    pub immutable_samplers: [Option<StockSampler>; VULKAN_NUM_BINDINGS],
    pub is_bindless: bool,
}

impl Default for DescriptorSetLayout {
    fn default() -> Self {
        Self {
            role_masks: [0; DESCRIPTOR_RESOURCE_COUNT],
            array_sizes: [0; VULKAN_NUM_BINDINGS],
            immutable_sampler_mask: 0,
            immutable_samplers: [None; VULKAN_NUM_BINDINGS],
            is_bindless: false,
        }
    }
}

impl DescriptorSetLayout {
    /// Union of every role's binding mask.
    pub fn active_binding_mask(&self) -> u32 {
        self.role_masks.iter().fold(0, |acc, m| acc | m)
    }

    pub fn role_for_binding(&self, binding: u32) -> Option<DescriptorResource> {
        for role in DescriptorResource::all().iter() {
            if self.role_masks[*role as usize] & (1 << binding) != 0 {
                return Some(*role);
            }
        }
        None
    }

    pub(crate) fn hash_into(&self, hasher: &mut HashCombiner) {
        for mask in self.role_masks.iter() {
            hasher.u32(*mask);
        }
        for size in self.array_sizes.iter() {
            hasher.u8(*size);
        }
        hasher.u32(self.immutable_sampler_mask);
        hasher.bool(self.is_bindless);
    }
}

/// Reflected resource layout of one shader stage.
#[derive(Copy, Clone, Default)]
pub struct ShaderResourceLayout {
    pub sets: [DescriptorSetLayout; VULKAN_NUM_DESCRIPTOR_SETS],
    pub push_constant_size: u32,
    pub input_mask: u32,
    pub output_mask: u32,
    pub bindless_set_mask: u32,
}

/// Reflect the resource layout out of a SPIR-V byte stream.
pub(crate) fn reflect_shader_layout(spirv: &[u8]) -> Result<ShaderResourceLayout> {
    let module = spirv_reflect::ShaderModule::load_u8_data(spirv).map_err(|e| {
        log::error!("Failed to reflect shader module: {}", e);
        CandelaError::SHADER_REFLECTION_FAILED
    })?;

    let mut layout = ShaderResourceLayout::default();

    let bindings = module
        .enumerate_descriptor_bindings(None)
        .map_err(|_| CandelaError::SHADER_REFLECTION_FAILED)?;
    for binding in bindings.iter() {
        let set = binding.set as usize;
        let bind = binding.binding;
        if set >= VULKAN_NUM_DESCRIPTOR_SETS || bind >= VULKAN_NUM_BINDINGS as u32 {
            log::error!("Shader binding (set {}, binding {}) is out of range", set, bind);
            return Err(CandelaError::SHADER_REFLECTION_FAILED);
        }

        use spirv_reflect::types::ReflectDescriptorType;
        let role = match binding.descriptor_type {
            ReflectDescriptorType::CombinedImageSampler => DescriptorResource::SampledImage,
            ReflectDescriptorType::StorageImage => DescriptorResource::StorageImage,
            ReflectDescriptorType::UniformBuffer => DescriptorResource::UniformBuffer,
            ReflectDescriptorType::StorageBuffer => DescriptorResource::StorageBuffer,
            ReflectDescriptorType::UniformTexelBuffer => DescriptorResource::SampledBuffer,
            ReflectDescriptorType::InputAttachment => DescriptorResource::InputAttachment,
            ReflectDescriptorType::Sampler => DescriptorResource::Sampler,
            ReflectDescriptorType::SampledImage => DescriptorResource::SeparateImage,
            other => {
                log::error!("Unsupported descriptor type in shader: {:?}", other);
                return Err(CandelaError::SHADER_REFLECTION_FAILED);
            }
        };

        layout.sets[set].role_masks[role as usize] |= 1 << bind;

        // runtime sized arrays reflect a zero element count
        if binding.count == 0 {
            layout.sets[set].array_sizes[bind as usize] = UNSIZED_ARRAY;
            layout.sets[set].is_bindless = true;
            layout.bindless_set_mask |= 1 << set;
        } else {
            layout.sets[set].array_sizes[bind as usize] = binding.count.min(254) as u8;
        }
    }

    let push_blocks = module
        .enumerate_push_constant_blocks(None)
        .map_err(|_| CandelaError::SHADER_REFLECTION_FAILED)?;
    if let Some(block) = push_blocks.first() {
        layout.push_constant_size = block.offset + block.size;
    }

    for input in module
        .enumerate_input_variables(None)
        .map_err(|_| CandelaError::SHADER_REFLECTION_FAILED)?
    {
        if input.location < 32 {
            layout.input_mask |= 1 << input.location;
        }
    }
    for output in module
        .enumerate_output_variables(None)
        .map_err(|_| CandelaError::SHADER_REFLECTION_FAILED)?
    {
        if output.location < 32 {
            layout.output_mask |= 1 << output.location;
        }
    }

    Ok(layout)
}

/// One compiled shader module.
pub struct Shader {
    module: vk::ShaderModule,
    cookie: u64,
    hash: u64,
    stage: ShaderStage,
    layout: ShaderResourceLayout,
}

unsafe impl Send for Shader {}
unsafe impl Sync for Shader {}

impl Shader {
    pub(crate) fn new(
        dev: &ash::Device,
        stage: ShaderStage,
        spirv: &[u8],
        hash: u64,
        layout: Option<ShaderResourceLayout>,
    ) -> Result<Self> {
        let layout = match layout {
            Some(l) => l,
            None => reflect_shader_layout(spirv)?,
        };

        // SPIR-V streams are 4 byte words
        if spirv.len() % 4 != 0 {
            return Err(CandelaError::INVALID);
        }
        let words =
            unsafe { std::slice::from_raw_parts(spirv.as_ptr() as *const u32, spirv.len() / 4) };

        let info = vk::ShaderModuleCreateInfo::builder().code(words).build();
        let module = unsafe {
            dev.create_shader_module(&info, None).map_err(|e| {
                log::error!("Failed to create shader module: {:?}", e);
                CandelaError::INVALID
            })?
        };

        Ok(Self {
            module,
            cookie: generate_cookie(),
            hash,
            stage,
            layout,
        })
    }

    pub fn vk_handle(&self) -> vk::ShaderModule {
        self.module
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn get_hash(&self) -> u64 {
        self.hash
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn resource_layout(&self) -> &ShaderResourceLayout {
        &self.layout
    }

    pub(crate) fn destroy(&self, dev: &ash::Device) {
        unsafe { dev.destroy_shader_module(self.module, None) };
    }
}

/// Aggregated resource layout across a program's stages.
#[derive(Copy, Clone)]
pub struct CombinedResourceLayout {
    pub sets: [DescriptorSetLayout; VULKAN_NUM_DESCRIPTOR_SETS],
    pub stages_for_sets: [u32; VULKAN_NUM_DESCRIPTOR_SETS],
    pub stages_for_bindings: [[u32; VULKAN_NUM_BINDINGS]; VULKAN_NUM_DESCRIPTOR_SETS],
    pub descriptor_set_mask: u32,
    pub bindless_descriptor_set_mask: u32,
    pub attribute_input_mask: u32,
    pub render_target_mask: u32,
    pub push_constant_range: vk::PushConstantRange,
    pub push_constant_hash: u64,
}

impl Default for CombinedResourceLayout {
    fn default() -> Self {
        Self {
            sets: [DescriptorSetLayout::default(); VULKAN_NUM_DESCRIPTOR_SETS],
            stages_for_sets: [0; VULKAN_NUM_DESCRIPTOR_SETS],
            stages_for_bindings: [[0; VULKAN_NUM_BINDINGS]; VULKAN_NUM_DESCRIPTOR_SETS],
            descriptor_set_mask: 0,
            bindless_descriptor_set_mask: 0,
            attribute_input_mask: 0,
            render_target_mask: 0,
            push_constant_range: vk::PushConstantRange::default(),
            push_constant_hash: 0,
        }
    }
}

impl CombinedResourceLayout {
    /// OR together the per-stage layouts of a program.
    ///
    /// Bindings touched by multiple stages accumulate stage bits;
    /// array size disagreements between stages are an authoring error
    /// and keep the first size seen. Unsized bindings are visible to
    /// all stages so one bindless set layout serves every program.
    pub fn from_shaders(shaders: &[Option<Arc<Shader>>; SHADER_STAGE_COUNT]) -> Self {
        let mut combined = Self::default();

        if let Some(vs) = &shaders[ShaderStage::Vertex as usize] {
            combined.attribute_input_mask = vs.resource_layout().input_mask;
        }
        if let Some(fs) = &shaders[ShaderStage::Fragment as usize] {
            combined.render_target_mask = fs.resource_layout().output_mask;
        }

        for stage in ShaderStage::all().iter() {
            let shader = match &shaders[*stage as usize] {
                Some(s) => s,
                None => continue,
            };
            let stage_mask = shader.stage().to_vk().as_raw() as u32;
            let layout = shader.resource_layout();

            for set in 0..VULKAN_NUM_DESCRIPTOR_SETS {
                let mut active_binds = 0u32;
                for role in 0..DESCRIPTOR_RESOURCE_COUNT {
                    combined.sets[set].role_masks[role] |= layout.sets[set].role_masks[role];
                    active_binds |= layout.sets[set].role_masks[role];
                }
                combined.sets[set].is_bindless |= layout.sets[set].is_bindless;

                if active_binds != 0 {
                    combined.stages_for_sets[set] |= stage_mask;

                    for binding in 0..VULKAN_NUM_BINDINGS {
                        if active_binds & (1 << binding) == 0 {
                            continue;
                        }
                        combined.stages_for_bindings[set][binding] |= stage_mask;

                        let shader_size = layout.sets[set].array_sizes[binding];
                        let combined_size = &mut combined.sets[set].array_sizes[binding];
                        if *combined_size != 0 && *combined_size != shader_size {
                            log::error!(
                                "Mismatched array sizes for (set {}, binding {}) between stages",
                                set,
                                binding
                            );
                        } else {
                            *combined_size = shader_size;
                        }
                    }
                }
            }

            if layout.push_constant_size > 0 {
                combined.push_constant_range.stage_flags |= shader.stage().to_vk();
                combined.push_constant_range.size = combined
                    .push_constant_range
                    .size
                    .max(layout.push_constant_size);
            }

            combined.bindless_descriptor_set_mask |= layout.bindless_set_mask;
        }

        for set in 0..VULKAN_NUM_DESCRIPTOR_SETS {
            if combined.stages_for_sets[set] == 0 {
                continue;
            }
            combined.descriptor_set_mask |= 1 << set;

            for binding in 0..VULKAN_NUM_BINDINGS {
                let size = &mut combined.sets[set].array_sizes[binding];
                if *size == UNSIZED_ARRAY {
                    combined.stages_for_bindings[set][binding] =
                        vk::ShaderStageFlags::ALL.as_raw() as u32;
                } else if *size == 0 && combined.stages_for_bindings[set][binding] != 0 {
                    *size = 1;
                }
            }
        }

        let mut hasher = HashCombiner::new();
        hasher.u32(combined.push_constant_range.stage_flags.as_raw() as u32);
        hasher.u32(combined.push_constant_range.size);
        combined.push_constant_hash = hasher.get();

        combined
    }

    /// Digest for the pipeline layout cache.
    pub fn get_hash(&self) -> u64 {
        let mut hasher = HashCombiner::new();
        for set in 0..VULKAN_NUM_DESCRIPTOR_SETS {
            self.sets[set].hash_into(&mut hasher);
            hasher.u32(self.stages_for_sets[set]);
            for binding in 0..VULKAN_NUM_BINDINGS {
                hasher.u32(self.stages_for_bindings[set][binding]);
            }
            for binding in 0..VULKAN_NUM_BINDINGS {
                if let Some(stock) = self.sets[set].immutable_samplers[binding] {
                    hasher.u32(stock as u32 + 1);
                } else {
                    hasher.u32(0);
                }
            }
        }
        hasher.u32(self.push_constant_range.stage_flags.as_raw() as u32);
        hasher.u32(self.push_constant_range.size);
        hasher.u32(self.attribute_input_mask);
        hasher.u32(self.render_target_mask);
        hasher.u32(self.descriptor_set_mask);
        hasher.u32(self.bindless_descriptor_set_mask);
        hasher.get()
    }
}

/// A VkPipelineLayout plus the per-set descriptor allocators derived
/// from the combined resource layout.
pub struct PipelineLayout {
    layout: vk::PipelineLayout,
    hash: u64,
    cookie: u64,
    res_layout: CombinedResourceLayout,
    set_allocators: [Option<Arc<DescriptorSetAllocator>>; VULKAN_NUM_DESCRIPTOR_SETS],
}

unsafe impl Send for PipelineLayout {}
unsafe impl Sync for PipelineLayout {}

impl PipelineLayout {
    pub(crate) fn new(
        layout: vk::PipelineLayout,
        hash: u64,
        res_layout: CombinedResourceLayout,
        set_allocators: [Option<Arc<DescriptorSetAllocator>>; VULKAN_NUM_DESCRIPTOR_SETS],
    ) -> Self {
        Self {
            layout,
            hash,
            cookie: generate_cookie(),
            res_layout,
            set_allocators,
        }
    }

    pub fn vk_handle(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn get_hash(&self) -> u64 {
        self.hash
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn resource_layout(&self) -> &CombinedResourceLayout {
        &self.res_layout
    }

    pub(crate) fn set_allocator(&self, set: u32) -> Option<&Arc<DescriptorSetAllocator>> {
        self.set_allocators[set as usize].as_ref()
    }

    pub(crate) fn destroy(&self, dev: &ash::Device) {
        unsafe { dev.destroy_pipeline_layout(self.layout, None) };
    }
}

/// A legal permutation of shader stages.
pub struct ShaderProgram {
    shaders: [Option<Arc<Shader>>; SHADER_STAGE_COUNT],
    pipeline_layout: Arc<PipelineLayout>,
    pipelines: VulkanCache<vk::Pipeline>,
    hash: u64,
    cookie: u64,
}

impl ShaderProgram {
    pub(crate) fn new(
        shaders: [Option<Arc<Shader>>; SHADER_STAGE_COUNT],
        pipeline_layout: Arc<PipelineLayout>,
        hash: u64,
    ) -> Self {
        Self {
            shaders,
            pipeline_layout,
            pipelines: VulkanCache::new(),
            hash,
            cookie: generate_cookie(),
        }
    }

    pub fn get_shader(&self, stage: ShaderStage) -> Option<&Arc<Shader>> {
        self.shaders[stage as usize].as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.iter().all(|s| s.is_none())
    }

    pub fn is_compute(&self) -> bool {
        self.shaders[ShaderStage::Compute as usize].is_some()
    }

    pub fn pipeline_layout(&self) -> &Arc<PipelineLayout> {
        &self.pipeline_layout
    }

    pub fn get_hash(&self) -> u64 {
        self.hash
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Look up a baked pipeline by pipeline state hash.
    pub(crate) fn get_pipeline(&self, hash: u64) -> Option<vk::Pipeline> {
        self.pipelines.find(hash).map(|p| *p)
    }

    pub(crate) fn add_pipeline(&self, hash: u64, pipeline: vk::Pipeline) -> vk::Pipeline {
        *self.pipelines.get_or_insert_with(hash, || pipeline)
    }

    pub(crate) fn move_pipelines_to_read_only(&self) {
        self.pipelines.move_to_read_only();
    }

    /// Destroy every baked pipeline. Teardown only.
    pub(crate) fn destroy_pipelines(&self, dev: &ash::Device) {
        self.pipelines
            .clear(|pipeline| unsafe { dev.destroy_pipeline(*pipeline, None) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_with(
        set: usize,
        binding: usize,
        role: DescriptorResource,
        push_size: u32,
    ) -> ShaderResourceLayout {
        let mut layout = ShaderResourceLayout::default();
        layout.sets[set].role_masks[role as usize] |= 1 << binding;
        layout.sets[set].array_sizes[binding] = 1;
        layout.push_constant_size = push_size;
        layout
    }

    // Test-only shader construction that skips the VkShaderModule.
    fn dummy_shader(stage: ShaderStage, layout: ShaderResourceLayout) -> Arc<Shader> {
        Arc::new(Shader {
            module: vk::ShaderModule::null(),
            cookie: generate_cookie(),
            hash: 0,
            stage,
            layout,
        })
    }

    #[test]
    fn combining_layouts_ors_stage_masks() {
        let mut shaders: [Option<Arc<Shader>>; SHADER_STAGE_COUNT] = Default::default();
        shaders[ShaderStage::Vertex as usize] = Some(dummy_shader(
            ShaderStage::Vertex,
            layout_with(0, 0, DescriptorResource::UniformBuffer, 16),
        ));
        shaders[ShaderStage::Fragment as usize] = Some(dummy_shader(
            ShaderStage::Fragment,
            layout_with(0, 1, DescriptorResource::SampledImage, 64),
        ));

        let combined = CombinedResourceLayout::from_shaders(&shaders);

        assert_eq!(combined.descriptor_set_mask, 1);
        assert_eq!(
            combined.stages_for_sets[0],
            (vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT).as_raw() as u32
        );
        assert_eq!(
            combined.stages_for_bindings[0][0],
            vk::ShaderStageFlags::VERTEX.as_raw() as u32
        );
        assert_eq!(
            combined.stages_for_bindings[0][1],
            vk::ShaderStageFlags::FRAGMENT.as_raw() as u32
        );
        // push constant range covers both stages at the larger size
        assert_eq!(combined.push_constant_range.size, 64);
        assert_eq!(
            combined.push_constant_range.stage_flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn unsized_bindings_become_all_stage_visible() {
        let mut layout = ShaderResourceLayout::default();
        layout.sets[1].role_masks[DescriptorResource::SampledImage as usize] |= 1;
        layout.sets[1].array_sizes[0] = UNSIZED_ARRAY;
        layout.sets[1].is_bindless = true;
        layout.bindless_set_mask = 1 << 1;

        let mut shaders: [Option<Arc<Shader>>; SHADER_STAGE_COUNT] = Default::default();
        shaders[ShaderStage::Fragment as usize] = Some(dummy_shader(ShaderStage::Fragment, layout));

        let combined = CombinedResourceLayout::from_shaders(&shaders);
        assert_eq!(combined.bindless_descriptor_set_mask, 1 << 1);
        assert_eq!(
            combined.stages_for_bindings[1][0],
            vk::ShaderStageFlags::ALL.as_raw() as u32
        );
        assert!(combined.sets[1].is_bindless);
    }

    #[test]
    fn layout_hash_is_sensitive_to_bindings() {
        let mut shaders: [Option<Arc<Shader>>; SHADER_STAGE_COUNT] = Default::default();
        shaders[ShaderStage::Vertex as usize] = Some(dummy_shader(
            ShaderStage::Vertex,
            layout_with(0, 0, DescriptorResource::UniformBuffer, 0),
        ));
        let a = CombinedResourceLayout::from_shaders(&shaders);

        shaders[ShaderStage::Vertex as usize] = Some(dummy_shader(
            ShaderStage::Vertex,
            layout_with(0, 2, DescriptorResource::UniformBuffer, 0),
        ));
        let b = CombinedResourceLayout::from_shaders(&shaders);

        assert_ne!(a.get_hash(), b.get_hash());
    }
}
