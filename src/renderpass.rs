// Render passes and framebuffers
//
// Render passes are derived from a RenderPassInfo and cached by a
// digest of their attachment formats, layouts and op masks. A
// "compatible" variant hashes without the load/store/clear bits and is
// what pipelines and framebuffers key off of, since vulkan render pass
// compatibility ignores those ops.

use ash::vk;

use crate::cache::HashCombiner;
use crate::cookie::generate_cookie;
use crate::image::{format_has_depth, format_has_stencil, ImageView};
use crate::{CandelaError, Result, VULKAN_NUM_ATTACHMENTS};

use std::sync::Arc;

bitflags::bitflags! {
    pub struct RenderPassOpFlags: u32 {
        const CLEAR_DEPTH_STENCIL = 1 << 0;
        const DEPTH_STENCIL_READ_ONLY = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DepthStencilMode {
    None,
    ReadOnly,
    ReadWrite,
}

/// One subpass of a multi-subpass render pass.
#[derive(Clone)]
pub struct RenderPassSubpassInfo {
    pub color_attachments: [u32; VULKAN_NUM_ATTACHMENTS],
    pub num_color_attachments: u32,
    pub input_attachments: [u32; VULKAN_NUM_ATTACHMENTS],
    pub num_input_attachments: u32,
    pub resolve_attachments: [u32; VULKAN_NUM_ATTACHMENTS],
    pub num_resolve_attachments: u32,
    pub depth_stencil_mode: DepthStencilMode,
}

impl Default for RenderPassSubpassInfo {
    fn default() -> Self {
        Self {
            color_attachments: [0; VULKAN_NUM_ATTACHMENTS],
            num_color_attachments: 0,
            input_attachments: [0; VULKAN_NUM_ATTACHMENTS],
            num_input_attachments: 0,
            resolve_attachments: [0; VULKAN_NUM_ATTACHMENTS],
            num_resolve_attachments: 0,
            depth_stencil_mode: DepthStencilMode::ReadWrite,
        }
    }
}

/// Everything needed to begin a render pass.
///
/// The clear/load/store masks are indexed by color attachment slot.
#[derive(Clone)]
pub struct RenderPassInfo {
    pub color_attachments: Vec<Arc<ImageView>>,
    pub depth_stencil: Option<Arc<ImageView>>,
    pub clear_attachments: u32,
    pub load_attachments: u32,
    pub store_attachments: u32,
    pub render_area: vk::Rect2D,
    pub clear_colors: [vk::ClearColorValue; VULKAN_NUM_ATTACHMENTS],
    pub clear_depth_stencil: vk::ClearDepthStencilValue,
    pub op_flags: RenderPassOpFlags,
    pub sub_passes: Vec<RenderPassSubpassInfo>,
}

impl Default for RenderPassInfo {
    fn default() -> Self {
        Self {
            color_attachments: Vec::new(),
            depth_stencil: None,
            clear_attachments: 0,
            load_attachments: 0,
            store_attachments: 0,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: u32::MAX,
                    height: u32::MAX,
                },
            },
            clear_colors: [vk::ClearColorValue::default(); VULKAN_NUM_ATTACHMENTS],
            clear_depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
            op_flags: RenderPassOpFlags::empty(),
            sub_passes: Vec::new(),
        }
    }
}

impl RenderPassInfo {
    /// Digest of the render pass state. Compatible digests ignore the
    /// clear/load/store masks so any op combination maps to the same
    /// compatible pass.
    pub fn get_hash(&self, compatible: bool) -> u64 {
        let mut hasher = HashCombiner::new();

        for view in self.color_attachments.iter() {
            hasher.u32(view.format().as_raw() as u32);
            hasher.u32(view.swapchain_layout().as_raw() as u32);
            hasher.bool(view.is_transient());
        }

        let ds_format = self
            .depth_stencil
            .as_ref()
            .map(|ds| ds.format())
            .unwrap_or(vk::Format::UNDEFINED);

        hasher.u32(self.sub_passes.len() as u32);
        for subpass in self.sub_passes.iter() {
            hasher.u32(subpass.num_color_attachments);
            hasher.u32(subpass.num_input_attachments);
            hasher.u32(subpass.num_resolve_attachments);
            hasher.u32(subpass.depth_stencil_mode as u32);
            for i in 0..subpass.num_color_attachments as usize {
                hasher.u32(subpass.color_attachments[i]);
            }
            for i in 0..subpass.num_input_attachments as usize {
                hasher.u32(subpass.input_attachments[i]);
            }
            for i in 0..subpass.num_resolve_attachments as usize {
                hasher.u32(subpass.resolve_attachments[i]);
            }
        }

        hasher.u32(self.color_attachments.len() as u32);
        hasher.u32(ds_format.as_raw() as u32);
        hasher.u32(self.op_flags.bits());

        if !compatible {
            hasher.u32(self.clear_attachments);
            hasher.u32(self.load_attachments);
            hasher.u32(self.store_attachments);
        }

        hasher.get()
    }
}

struct BakedSubpass {
    color_attachments: [vk::AttachmentReference; VULKAN_NUM_ATTACHMENTS],
    num_color_attachments: u32,
    input_attachments: [vk::AttachmentReference; VULKAN_NUM_ATTACHMENTS],
    num_input_attachments: u32,
    depth_stencil_attachment: vk::AttachmentReference,
    samples: vk::SampleCountFlags,
}

/// A cached VkRenderPass plus the subpass metadata pipeline creation
/// asks about.
pub struct RenderPass {
    render_pass: vk::RenderPass,
    cookie: u64,
    hash: u64,
    depth_stencil_format: vk::Format,
    subpasses: Vec<BakedSubpass>,
}

// vk::RenderPass is an opaque handle, safe to hand across threads
unsafe impl Send for RenderPass {}
unsafe impl Sync for RenderPass {}

impl RenderPass {
    fn color_load_op(info: &RenderPassInfo, index: u32) -> vk::AttachmentLoadOp {
        if info.clear_attachments & (1 << index) != 0 {
            vk::AttachmentLoadOp::CLEAR
        } else if info.load_attachments & (1 << index) != 0 {
            vk::AttachmentLoadOp::LOAD
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        }
    }

    fn color_store_op(info: &RenderPassInfo, index: u32) -> vk::AttachmentStoreOp {
        if info.store_attachments & (1 << index) != 0 {
            vk::AttachmentStoreOp::STORE
        } else {
            vk::AttachmentStoreOp::DONT_CARE
        }
    }

    pub(crate) fn new(dev: &ash::Device, info: &RenderPassInfo, hash: u64) -> Result<Self> {
        let num_color = info.color_attachments.len() as u32;
        let mut attachments = Vec::with_capacity(num_color as usize + 1);

        for (i, view) in info.color_attachments.iter().enumerate() {
            let load_op = Self::color_load_op(info, i as u32);
            let swapchain_layout = view.swapchain_layout();

            let (initial_layout, final_layout) = if swapchain_layout != vk::ImageLayout::UNDEFINED
            {
                // backbuffers end the pass in their present layout
                let initial = if load_op == vk::AttachmentLoadOp::LOAD {
                    swapchain_layout
                } else {
                    vk::ImageLayout::UNDEFINED
                };
                (initial, swapchain_layout)
            } else {
                let initial = if load_op == vk::AttachmentLoadOp::LOAD {
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                } else {
                    vk::ImageLayout::UNDEFINED
                };
                (initial, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            };

            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(view.format())
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(load_op)
                    .store_op(Self::color_store_op(info, i as u32))
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(initial_layout)
                    .final_layout(final_layout)
                    .build(),
            );
        }

        let mut depth_stencil_format = vk::Format::UNDEFINED;
        let ds_read_only = info
            .op_flags
            .contains(RenderPassOpFlags::DEPTH_STENCIL_READ_ONLY);
        let ds_layout = if ds_read_only {
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        };

        if let Some(ds) = info.depth_stencil.as_ref() {
            depth_stencil_format = ds.format();
            let clear_ds = info
                .op_flags
                .contains(RenderPassOpFlags::CLEAR_DEPTH_STENCIL);
            let load_op = if clear_ds {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            };
            let initial_layout = if clear_ds {
                vk::ImageLayout::UNDEFINED
            } else {
                ds_layout
            };

            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(depth_stencil_format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(load_op)
                    .store_op(if ds_read_only {
                        vk::AttachmentStoreOp::DONT_CARE
                    } else {
                        vk::AttachmentStoreOp::STORE
                    })
                    .stencil_load_op(load_op)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(initial_layout)
                    .final_layout(ds_layout)
                    .build(),
            );
        }

        // An info without explicit subpasses gets one subpass that
        // covers everything.
        let default_subpass;
        let subpass_infos: &[RenderPassSubpassInfo] = if info.sub_passes.is_empty() {
            let mut sp = RenderPassSubpassInfo::default();
            sp.num_color_attachments = num_color;
            for i in 0..num_color {
                sp.color_attachments[i as usize] = i;
            }
            sp.depth_stencil_mode = if info.depth_stencil.is_some() {
                if ds_read_only {
                    DepthStencilMode::ReadOnly
                } else {
                    DepthStencilMode::ReadWrite
                }
            } else {
                DepthStencilMode::None
            };
            default_subpass = [sp];
            &default_subpass
        } else {
            &info.sub_passes
        };

        let unused = vk::AttachmentReference {
            attachment: vk::ATTACHMENT_UNUSED,
            layout: vk::ImageLayout::UNDEFINED,
        };

        let mut baked: Vec<BakedSubpass> = Vec::with_capacity(subpass_infos.len());
        for sp in subpass_infos.iter() {
            let mut b = BakedSubpass {
                color_attachments: [unused; VULKAN_NUM_ATTACHMENTS],
                num_color_attachments: sp.num_color_attachments,
                input_attachments: [unused; VULKAN_NUM_ATTACHMENTS],
                num_input_attachments: sp.num_input_attachments,
                depth_stencil_attachment: unused,
                samples: vk::SampleCountFlags::TYPE_1,
            };

            for i in 0..sp.num_color_attachments as usize {
                b.color_attachments[i] = vk::AttachmentReference {
                    attachment: sp.color_attachments[i],
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                };
            }
            for i in 0..sp.num_input_attachments as usize {
                b.input_attachments[i] = vk::AttachmentReference {
                    attachment: sp.input_attachments[i],
                    layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                };
            }
            if info.depth_stencil.is_some() && sp.depth_stencil_mode != DepthStencilMode::None {
                b.depth_stencil_attachment = vk::AttachmentReference {
                    attachment: num_color,
                    layout: if sp.depth_stencil_mode == DepthStencilMode::ReadOnly {
                        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                    } else {
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                    },
                };
            }

            baked.push(b);
        }

        let mut subpass_descs = Vec::with_capacity(baked.len());
        for b in baked.iter() {
            let mut desc = vk::SubpassDescription::builder()
                .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                .color_attachments(&b.color_attachments[0..b.num_color_attachments as usize])
                .input_attachments(&b.input_attachments[0..b.num_input_attachments as usize]);
            if b.depth_stencil_attachment.attachment != vk::ATTACHMENT_UNUSED {
                desc = desc.depth_stencil_attachment(&b.depth_stencil_attachment);
            }
            subpass_descs.push(desc.build());
        }

        // Chain a coarse dependency between consecutive subpasses.
        // Anything finer is the caller's barrier problem.
        let mut dependencies = Vec::new();
        for i in 1..subpass_descs.len() as u32 {
            dependencies.push(
                vk::SubpassDependency::builder()
                    .src_subpass(i - 1)
                    .dst_subpass(i)
                    .src_stage_mask(
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                    )
                    .dst_stage_mask(
                        vk::PipelineStageFlags::FRAGMENT_SHADER
                            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                    )
                    .src_access_mask(
                        vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    )
                    .dst_access_mask(
                        vk::AccessFlags::INPUT_ATTACHMENT_READ
                            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
                    )
                    .dependency_flags(vk::DependencyFlags::BY_REGION)
                    .build(),
            );
        }

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpass_descs)
            .dependencies(&dependencies)
            .build();

        let render_pass = unsafe {
            dev.create_render_pass(&create_info, None)
                .map_err(|e| {
                    log::error!("Failed to create render pass: {:?}", e);
                    CandelaError::INVALID
                })?
        };

        Ok(Self {
            render_pass,
            cookie: generate_cookie(),
            hash,
            depth_stencil_format,
            subpasses: baked,
        })
    }

    pub fn vk_handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn get_hash(&self) -> u64 {
        self.hash
    }

    pub fn num_subpasses(&self) -> u32 {
        self.subpasses.len() as u32
    }

    pub fn num_color_attachments(&self, subpass: u32) -> u32 {
        self.subpasses[subpass as usize].num_color_attachments
    }

    pub(crate) fn color_attachment(&self, subpass: u32, index: u32) -> vk::AttachmentReference {
        self.subpasses[subpass as usize].color_attachments[index as usize]
    }

    pub fn has_depth(&self, subpass: u32) -> bool {
        let sp = &self.subpasses[subpass as usize];
        sp.depth_stencil_attachment.attachment != vk::ATTACHMENT_UNUSED
            && format_has_depth(self.depth_stencil_format)
    }

    pub fn has_stencil(&self, subpass: u32) -> bool {
        let sp = &self.subpasses[subpass as usize];
        sp.depth_stencil_attachment.attachment != vk::ATTACHMENT_UNUSED
            && format_has_stencil(self.depth_stencil_format)
    }

    /// Destroy the VkRenderPass. Only the device teardown path calls
    /// this; cached passes never destroy themselves.
    pub(crate) fn destroy(&self, dev: &ash::Device) {
        unsafe { dev.destroy_render_pass(self.render_pass, None) };
    }
}

/// A cached VkFramebuffer.
///
/// Framebuffers are created against the compatible render pass, so one
/// cache entry serves every concrete pass with the same compatibility
/// digest. Width/height are the element-wise minimum over the
/// attachment extents.
pub struct Framebuffer {
    framebuffer: vk::Framebuffer,
    render_pass: Arc<RenderPass>,
    cookie: u64,
    width: u32,
    height: u32,
}

unsafe impl Send for Framebuffer {}
unsafe impl Sync for Framebuffer {}

impl Framebuffer {
    pub(crate) fn new(
        dev: &ash::Device,
        render_pass: Arc<RenderPass>,
        info: &RenderPassInfo,
    ) -> Result<Self> {
        let mut views = Vec::with_capacity(info.color_attachments.len() + 1);
        let mut width = u32::MAX;
        let mut height = u32::MAX;

        for view in info.color_attachments.iter() {
            views.push(view.rt_view(0));
            let (w, h) = view.image_extent();
            width = width.min(w);
            height = height.min(h);
        }
        if let Some(ds) = info.depth_stencil.as_ref() {
            views.push(ds.rt_view(0));
            let (w, h) = ds.image_extent();
            width = width.min(w);
            height = height.min(h);
        }

        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.vk_handle())
            .attachments(&views)
            .width(width)
            .height(height)
            .layers(1)
            .build();

        let framebuffer = unsafe {
            dev.create_framebuffer(&create_info, None).map_err(|e| {
                log::error!("Failed to create framebuffer: {:?}", e);
                CandelaError::INVALID
            })?
        };

        Ok(Self {
            framebuffer,
            render_pass,
            cookie: generate_cookie(),
            width,
            height,
        })
    }

    pub fn vk_handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageViewCreateInfo;
    use std::sync::Weak;

    fn test_view(format: vk::Format, cookie_seed: bool) -> Arc<ImageView> {
        // a dangling device backref; drops are no-ops in tests
        let view = ImageView::new(
            Weak::new(),
            vk::ImageView::null(),
            ImageViewCreateInfo {
                format,
                view_type: vk::ImageViewType::TYPE_2D,
                base_level: 0,
                levels: 1,
                base_layer: 0,
                layers: 1,
            },
            if cookie_seed { 16 } else { 32 },
            640,
            480,
            vk::ImageLayout::UNDEFINED,
            false,
            None,
        );
        Arc::new(view)
    }

    fn info_with_clear(view: Arc<ImageView>, clear: u32) -> RenderPassInfo {
        let mut info = RenderPassInfo::default();
        info.color_attachments.push(view);
        info.clear_attachments = clear;
        info.store_attachments = 1;
        info
    }

    #[test]
    fn compatible_hash_ignores_ops() {
        let view = test_view(vk::Format::B8G8R8A8_UNORM, true);
        let a = info_with_clear(view.clone(), 1);
        let b = info_with_clear(view, 0);

        assert_ne!(a.get_hash(false), b.get_hash(false));
        assert_eq!(a.get_hash(true), b.get_hash(true));
    }

    #[test]
    fn hash_covers_formats() {
        let a = info_with_clear(test_view(vk::Format::B8G8R8A8_UNORM, true), 1);
        let b = info_with_clear(test_view(vk::Format::R16G16B16A16_SFLOAT, true), 1);
        assert_ne!(a.get_hash(true), b.get_hash(true));
    }

    #[test]
    fn framebuffer_hash_keys_on_attachment_cookies() {
        use crate::attachment::FramebufferAllocator;

        let view_a = test_view(vk::Format::B8G8R8A8_UNORM, true);
        let view_b = test_view(vk::Format::B8G8R8A8_UNORM, true);

        // same compatibility digest, different attachment identity
        let a = info_with_clear(view_a, 1);
        let b = info_with_clear(view_b, 0);
        assert_eq!(a.get_hash(true), b.get_hash(true));

        let compat = a.get_hash(true);
        assert_ne!(
            FramebufferAllocator::get_hash(compat, &a),
            FramebufferAllocator::get_hash(compat, &b)
        );

        // identical attachments with different ops share one
        // framebuffer key
        let c = RenderPassInfo {
            clear_attachments: 0,
            load_attachments: 1,
            ..a.clone()
        };
        assert_eq!(
            FramebufferAllocator::get_hash(compat, &a),
            FramebufferAllocator::get_hash(compat, &c)
        );
    }
}
