// Frame scoped attachment allocators
//
// Transient attachments and framebuffers are both cached for exactly
// as long as render passes keep asking for them. The two generation
// maps mean an entry requested every frame is never recreated, while
// anything untouched for a full frame is reclaimed on the following
// rotation.

use ash::vk;

use crate::cache::{HashCombiner, TempHashMap};
use crate::image::Image;
use crate::renderpass::{Framebuffer, RenderPassInfo};

use std::sync::Arc;

/// Frame cache for lazily allocated attachment images.
///
/// Two render passes in the same frame asking for the same
/// (size, format, index, samples, layers) share one image; the index
/// exists so a pass can ask for distinct attachments of identical
/// shape.
pub(crate) struct TransientAttachmentAllocator {
    attachments: TempHashMap<Arc<Image>>,
}

impl TransientAttachmentAllocator {
    pub fn new() -> Self {
        Self {
            attachments: TempHashMap::new(),
        }
    }

    pub fn get_hash(
        width: u32,
        height: u32,
        format: vk::Format,
        index: u32,
        samples: u32,
        layers: u32,
    ) -> u64 {
        let mut hasher = HashCombiner::new();
        hasher
            .u32(width)
            .u32(height)
            .u32(format.as_raw() as u32)
            .u32(index)
            .u32(samples)
            .u32(layers);
        hasher.get()
    }

    pub fn request(&mut self, hash: u64) -> Option<Arc<Image>> {
        self.attachments.request(hash).cloned()
    }

    pub fn insert(&mut self, hash: u64, image: Arc<Image>) -> Arc<Image> {
        self.attachments.insert(hash, image).clone()
    }

    /// Rotate; evicted images release themselves through the frame
    /// destruction queues when their last reference drops here.
    pub fn begin_frame(&mut self) {
        let _ = self.attachments.begin_frame();
    }

    pub fn clear(&mut self) {
        self.attachments.clear();
    }

    /// Teardown: visit every cached image so the caller can destroy
    /// the vulkan handles directly, then drop the cache.
    pub fn clear_with<F>(&mut self, mut func: F)
    where
        F: FnMut(&Arc<Image>),
    {
        for image in self.attachments.begin_frame().iter() {
            func(image);
        }
        for image in self.attachments.begin_frame().iter() {
            func(image);
        }
        self.attachments.clear();
    }
}

/// Frame cache for framebuffers.
///
/// Keyed by the compatible render pass digest plus the attachment
/// cookies, so the same set of attachments maps to one framebuffer no
/// matter which load/store variant of the pass is in use.
pub(crate) struct FramebufferAllocator {
    framebuffers: TempHashMap<Arc<Framebuffer>>,
}

impl FramebufferAllocator {
    pub fn new() -> Self {
        Self {
            framebuffers: TempHashMap::new(),
        }
    }

    pub fn get_hash(compat_render_pass_hash: u64, info: &RenderPassInfo) -> u64 {
        let mut hasher = HashCombiner::new();
        hasher.u64(compat_render_pass_hash);
        for view in info.color_attachments.iter() {
            hasher.u64(view.cookie());
        }
        if let Some(ds) = info.depth_stencil.as_ref() {
            hasher.u64(ds.cookie());
        }
        hasher.get()
    }

    pub fn request(&mut self, hash: u64) -> Option<Arc<Framebuffer>> {
        self.framebuffers.request(hash).cloned()
    }

    pub fn insert(&mut self, hash: u64, fb: Arc<Framebuffer>) -> Arc<Framebuffer> {
        self.framebuffers.insert(hash, fb).clone()
    }

    /// Rotate, collecting the VkFramebuffers of evicted entries for
    /// the caller's destruction queue.
    pub fn begin_frame(&mut self, destroyed: &mut Vec<vk::Framebuffer>) {
        for fb in self.framebuffers.begin_frame() {
            destroyed.push(fb.vk_handle());
        }
    }

    /// Teardown: destroy everything immediately. The device has
    /// already waited idle.
    pub fn clear(&mut self, dev: &ash::Device) {
        let mut handles = Vec::new();
        for fb in self.framebuffers.begin_frame() {
            handles.push(fb.vk_handle());
        }
        for fb in self.framebuffers.begin_frame() {
            handles.push(fb.vk_handle());
        }
        self.framebuffers.clear();
        for fb in handles {
            unsafe { dev.destroy_framebuffer(fb, None) };
        }
    }
}
