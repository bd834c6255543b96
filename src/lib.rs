// The candela GPU runtime
//
// This crate owns one logical Vulkan device: it records command streams
// on reusable per-thread command pools, submits them to the graphics,
// async compute and async transfer queues under timeline synchronization,
// defers all resource destruction through per-frame contexts, caches
// derivable pipeline objects by content hash, and presents rendered
// frames through a swapchain.

#![allow(non_camel_case_types)]

mod attachment;
mod bindless;
mod buffer;
mod buffer_pool;
mod cache;
mod command_list;
mod command_pool;
mod cookie;
mod descriptor;
mod device;
mod frame;
mod image;
mod instance;
mod memory;
mod pipeline_cache;
mod platform;
mod renderpass;
mod sampler;
mod shader;
mod shader_manager;
mod swapchain;
mod sync;

pub use crate::bindless::{
    BindlessDescriptorHandle, BindlessDescriptorHeap, BindlessResourceType,
};
pub use crate::buffer::{Buffer, BufferCreateInfo, BufferMiscFlags, BufferView, BufferViewCreateInfo};
pub use crate::buffer_pool::{BufferBlock, BufferBlockAllocation, BufferPool};
pub use crate::command_list::{
    CommandList, PipelineBlendState, PipelineDepthStencilState, PipelineRasterState,
};
pub use crate::device::{Device, QueueType};
pub use crate::image::{
    Image, ImageCreateInfo, ImageLayoutType, ImageMiscFlags, ImageView, ImageViewCreateInfo,
};
pub use crate::instance::Instance;
pub use crate::memory::{BufferDomain, DeviceAllocation, ImageDomain, MemoryAccessFlags};
pub use crate::platform::WSIPlatform;
pub use crate::renderpass::{
    DepthStencilMode, Framebuffer, RenderPass, RenderPassInfo, RenderPassOpFlags,
    RenderPassSubpassInfo,
};
pub use crate::sampler::{Sampler, SamplerCreateInfo, StockSampler};
pub use crate::shader::{
    CombinedResourceLayout, DescriptorResource, DescriptorSetLayout, PipelineLayout, Shader,
    ShaderProgram, ShaderResourceLayout, ShaderStage, UNSIZED_ARRAY,
};
pub use crate::swapchain::{SwapChainDesc, Swapchain, SwapchainError};
pub use crate::sync::{Fence, Semaphore};

/// Number of descriptor sets a pipeline layout may address.
pub const VULKAN_NUM_DESCRIPTOR_SETS: usize = 4;
/// Number of bindings within one descriptor set.
pub const VULKAN_NUM_BINDINGS: usize = 32;
/// Number of attachments a render pass may reference.
pub const VULKAN_NUM_ATTACHMENTS: usize = 8;
pub const VULKAN_NUM_VERTEX_ATTRIBS: usize = 16;
pub const VULKAN_NUM_VERTEX_BUFFERS: usize = 4;
/// Size of the push constant shadow mirrored by every command list.
pub const VULKAN_PUSH_CONSTANT_SIZE: usize = 128;
/// Descriptor count used for unsized (bindless) binding arrays.
pub const VULKAN_NUM_BINDINGS_BINDLESS_VARYING: u32 = 16 * 1024;

use thiserror::Error;

/// Candela errors
///
/// These errors are relatively coarse and represent a large class
/// of internal vulkan failures. The steady-state creation paths hand
/// one of these back instead of unwinding so the caller can check and
/// fall through.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum CandelaError {
    #[error("Operation timed out")]
    TIMEOUT,
    #[error("Operation is not ready")]
    NOT_READY,
    #[error("Invalid operation")]
    INVALID,
    #[error("Invalid format")]
    INVALID_FORMAT,
    #[error("A required vulkan extension or feature is not available")]
    VK_NOT_ALL_EXTENSIONS_AVAILABLE,
    #[error("The surface is not supported by this device")]
    VK_SURF_NOT_SUPPORTED,
    #[error("Could not create the vulkan swapchain")]
    COULD_NOT_CREATE_SWAPCHAIN,
    #[error("Could not acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("Could not create an image")]
    COULD_NOT_CREATE_IMAGE,
    #[error("Could not create a buffer")]
    COULD_NOT_CREATE_BUFFER,
    #[error("Could not allocate device memory")]
    OUT_OF_MEMORY,
    #[error("Could not create a pipeline object")]
    COULD_NOT_CREATE_PIPELINE,
    #[error("Could not create a descriptor pool")]
    COULD_NOT_CREATE_DESCRIPTOR_POOL,
    #[error("Could not compile a shader")]
    SHADER_COMPILE_FAILED,
    #[error("Could not reflect a shader resource layout")]
    SHADER_REFLECTION_FAILED,
    #[error("The swapchain is out of date and must be recreated")]
    OUT_OF_DATE,
    #[error("Presentation to the surface failed")]
    PRESENT_FAILED,
    #[error("The vulkan device was lost")]
    DEVICE_LOST,
    #[error("Queue submission failed")]
    SUBMIT_FAILED,
}

pub type Result<T> = std::result::Result<T, CandelaError>;
