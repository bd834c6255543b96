// Image resources
//
// An Image wraps one VkImage plus the tracking state the runtime
// needs: a cookie for cache identity, the layout class it is kept in,
// its swapchain layout (PRESENT_SRC for borrowed backbuffers), and
// whether it owns the underlying handle and memory. The default
// ImageView and its aux depth/stencil/per-layer views are created
// alongside the image.

use ash::vk;

use crate::cookie::generate_cookie;
use crate::device::Device;
use crate::memory::{DeviceAllocation, ImageDomain};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

bitflags::bitflags! {
    pub struct ImageMiscFlags: u32 {
        const GENERATE_MIPS = 1 << 0;
        const FORCE_ARRAY = 1 << 1;
        const MUTABLE_SRGB = 1 << 2;
        const CONCURRENT_QUEUE_GRAPHICS = 1 << 3;
        const CONCURRENT_QUEUE_ASYNC_COMPUTE = 1 << 4;
        const CONCURRENT_QUEUE_ASYNC_GRAPHICS = 1 << 5;
        const CONCURRENT_QUEUE_ASYNC_TRANSFER = 1 << 6;
        const VERIFY_FORMAT_FEATURE_SAMPLED_LINEAR_FILTER = 1 << 7;
        const LINEAR_IMAGE_IGNORE_DEVICE_LOCAL = 1 << 8;
        const FORCE_NO_DEDICATED = 1 << 9;
        const NO_DEFAULT_VIEWS = 1 << 10;
    }
}

/// Which layout family an image is kept in while bound.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageLayoutType {
    Optimal,
    General,
}

#[derive(Copy, Clone, Debug)]
pub struct ImageCreateInfo {
    pub domain: ImageDomain,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub levels: u32,
    pub layers: u32,
    pub format: vk::Format,
    pub image_type: vk::ImageType,
    pub usage: vk::ImageUsageFlags,
    pub samples: vk::SampleCountFlags,
    pub flags: vk::ImageCreateFlags,
    pub misc: ImageMiscFlags,
    pub initial_layout: vk::ImageLayout,
}

impl Default for ImageCreateInfo {
    fn default() -> Self {
        Self {
            domain: ImageDomain::Physical,
            width: 1,
            height: 1,
            depth: 1,
            levels: 1,
            layers: 1,
            format: vk::Format::UNDEFINED,
            image_type: vk::ImageType::TYPE_2D,
            usage: vk::ImageUsageFlags::empty(),
            samples: vk::SampleCountFlags::TYPE_1,
            flags: vk::ImageCreateFlags::empty(),
            misc: ImageMiscFlags::empty(),
            initial_layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

impl ImageCreateInfo {
    /// A sampled texture, uploaded once from initial data.
    pub fn immutable_2d_image(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            initial_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ..Default::default()
        }
    }

    /// A physical render target.
    pub fn render_target(width: u32, height: u32, format: vk::Format) -> Self {
        let is_depth = format_is_depth_stencil(format);
        Self {
            width,
            height,
            format,
            usage: if is_depth {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
            } | vk::ImageUsageFlags::SAMPLED,
            initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ..Default::default()
        }
    }

    /// A frame scoped attachment expected to stay on tile.
    pub fn transient_render_target(width: u32, height: u32, format: vk::Format) -> Self {
        let is_depth = format_is_depth_stencil(format);
        Self {
            domain: ImageDomain::Transient,
            width,
            height,
            format,
            usage: if is_depth {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
            } | vk::ImageUsageFlags::INPUT_ATTACHMENT,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        }
    }
}

pub fn format_has_depth(format: vk::Format) -> bool {
    match format {
        vk::Format::D16_UNORM
        | vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT
        | vk::Format::X8_D24_UNORM_PACK32
        | vk::Format::D32_SFLOAT_S8_UINT => true,
        _ => false,
    }
}

pub fn format_has_stencil(format: vk::Format) -> bool {
    match format {
        vk::Format::S8_UINT
        | vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => true,
        _ => false,
    }
}

pub fn format_is_depth_stencil(format: vk::Format) -> bool {
    format_has_depth(format) || format_has_stencil(format)
}

pub fn format_aspect_flags(format: vk::Format) -> vk::ImageAspectFlags {
    let mut flags = vk::ImageAspectFlags::empty();
    if format_has_depth(format) {
        flags |= vk::ImageAspectFlags::DEPTH;
    }
    if format_has_stencil(format) {
        flags |= vk::ImageAspectFlags::STENCIL;
    }
    if flags.is_empty() {
        flags = vk::ImageAspectFlags::COLOR;
    }
    flags
}

#[derive(Copy, Clone, Debug)]
pub struct ImageViewCreateInfo {
    pub format: vk::Format,
    pub view_type: vk::ImageViewType,
    pub base_level: u32,
    pub levels: u32,
    pub base_layer: u32,
    pub layers: u32,
}

/// A view over an image.
///
/// Beyond the main view this carries the aux views the runtime hands
/// to render passes: depth-only and stencil-only views for read-only
/// depth testing, and one render target view per layer for layered
/// attachments.
pub struct ImageView {
    dev: Weak<Device>,
    view: vk::ImageView,
    depth_view: vk::ImageView,
    stencil_view: vk::ImageView,
    rt_views: Vec<vk::ImageView>,
    cookie: u64,
    info: ImageViewCreateInfo,

    // properties copied from the image so attachments do not need to
    // chase the owner
    image_cookie: u64,
    image_width: u32,
    image_height: u32,
    swapchain_layout: vk::ImageLayout,
    is_transient: bool,

    /// Views created standalone share their image's lifetime. The
    /// image's own default view leaves this empty.
    owner: Option<Arc<Image>>,
    internal_sync: AtomicBool,
}

impl ImageView {
    pub(crate) fn new(
        dev: Weak<Device>,
        view: vk::ImageView,
        info: ImageViewCreateInfo,
        image_cookie: u64,
        image_width: u32,
        image_height: u32,
        swapchain_layout: vk::ImageLayout,
        is_transient: bool,
        owner: Option<Arc<Image>>,
    ) -> Self {
        Self {
            dev,
            view,
            depth_view: vk::ImageView::null(),
            stencil_view: vk::ImageView::null(),
            rt_views: Vec::new(),
            cookie: generate_cookie(),
            info,
            image_cookie,
            image_width,
            image_height,
            swapchain_layout,
            is_transient,
            owner,
            internal_sync: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_aux_views(
        &mut self,
        depth: vk::ImageView,
        stencil: vk::ImageView,
        rt_views: Vec<vk::ImageView>,
    ) {
        self.depth_view = depth;
        self.stencil_view = stencil;
        self.rt_views = rt_views;
    }

    pub fn vk_handle(&self) -> vk::ImageView {
        self.view
    }

    pub fn depth_only_view(&self) -> Option<vk::ImageView> {
        if self.depth_view == vk::ImageView::null() {
            None
        } else {
            Some(self.depth_view)
        }
    }

    pub fn stencil_only_view(&self) -> Option<vk::ImageView> {
        if self.stencil_view == vk::ImageView::null() {
            None
        } else {
            Some(self.stencil_view)
        }
    }

    /// Render target view for a single layer. Falls back to the main
    /// view for non-layered images.
    pub fn rt_view(&self, layer: u32) -> vk::ImageView {
        if self.rt_views.is_empty() {
            self.view
        } else {
            self.rt_views[layer as usize]
        }
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn info(&self) -> &ImageViewCreateInfo {
        &self.info
    }

    pub fn format(&self) -> vk::Format {
        self.info.format
    }

    pub fn image_cookie(&self) -> u64 {
        self.image_cookie
    }

    pub fn image_extent(&self) -> (u32, u32) {
        (self.image_width, self.image_height)
    }

    pub fn swapchain_layout(&self) -> vk::ImageLayout {
        self.swapchain_layout
    }

    pub fn is_swapchain_image(&self) -> bool {
        self.swapchain_layout != vk::ImageLayout::UNDEFINED
    }

    pub fn is_transient(&self) -> bool {
        self.is_transient
    }

    pub fn image(&self) -> Option<&Arc<Image>> {
        self.owner.as_ref()
    }

    pub(crate) fn set_internal_sync(&self) {
        self.internal_sync.store(true, Ordering::Relaxed);
    }

    /// Teardown path: destroy every view handle directly.
    pub(crate) fn destroy_now(&self, dev: &ash::Device) {
        unsafe {
            dev.destroy_image_view(self.view, None);
            if self.depth_view != vk::ImageView::null() {
                dev.destroy_image_view(self.depth_view, None);
            }
            if self.stencil_view != vk::ImageView::null() {
                dev.destroy_image_view(self.stencil_view, None);
            }
            for view in self.rt_views.iter() {
                dev.destroy_image_view(*view, None);
            }
        }
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        if let Some(dev) = self.dev.upgrade() {
            let mut views = Vec::with_capacity(3 + self.rt_views.len());
            views.push(self.view);
            if self.depth_view != vk::ImageView::null() {
                views.push(self.depth_view);
            }
            if self.stencil_view != vk::ImageView::null() {
                views.push(self.stencil_view);
            }
            views.extend(self.rt_views.drain(..));

            dev.destroy_image_views_deferred(&views, self.internal_sync.load(Ordering::Relaxed));
        }
    }
}

/// One VkImage plus its runtime tracking state.
pub struct Image {
    dev: Weak<Device>,
    image: vk::Image,
    cookie: u64,
    info: ImageCreateInfo,
    alloc: DeviceAllocation,
    default_view: Option<Arc<ImageView>>,
    layout_type: ImageLayoutType,
    swapchain_layout: vk::ImageLayout,
    access: vk::AccessFlags,
    stages: vk::PipelineStageFlags,
    owns_image: bool,
    owns_memory: bool,
    internal_sync: AtomicBool,
}

impl Image {
    pub(crate) fn new(
        dev: Weak<Device>,
        image: vk::Image,
        info: ImageCreateInfo,
        alloc: DeviceAllocation,
        owns_image: bool,
        owns_memory: bool,
    ) -> Self {
        Self {
            dev,
            image,
            cookie: generate_cookie(),
            info,
            alloc,
            default_view: None,
            layout_type: ImageLayoutType::Optimal,
            swapchain_layout: vk::ImageLayout::UNDEFINED,
            access: vk::AccessFlags::empty(),
            stages: vk::PipelineStageFlags::empty(),
            owns_image,
            owns_memory,
            internal_sync: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_default_view(&mut self, view: Arc<ImageView>) {
        self.default_view = Some(view);
    }

    pub fn vk_handle(&self) -> vk::Image {
        self.image
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn info(&self) -> &ImageCreateInfo {
        &self.info
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    /// The image's canonical view, if default views were requested.
    pub fn view(&self) -> &Arc<ImageView> {
        self.default_view
            .as_ref()
            .expect("Image was created with NO_DEFAULT_VIEWS")
    }

    pub fn has_view(&self) -> bool {
        self.default_view.is_some()
    }

    pub fn layout_type(&self) -> ImageLayoutType {
        self.layout_type
    }

    pub fn set_layout_type(&mut self, layout: ImageLayoutType) {
        self.layout_type = layout;
    }

    /// Pick the concrete layout for this image given the optimal
    /// candidate, honoring GENERAL-class images.
    pub fn pick_layout(&self, optimal: vk::ImageLayout) -> vk::ImageLayout {
        match self.layout_type {
            ImageLayoutType::Optimal => optimal,
            ImageLayoutType::General => vk::ImageLayout::GENERAL,
        }
    }

    pub fn swapchain_layout(&self) -> vk::ImageLayout {
        self.swapchain_layout
    }

    pub(crate) fn set_swapchain_layout(&mut self, layout: vk::ImageLayout) {
        self.swapchain_layout = layout;
        if let Some(view) = self.default_view.as_ref() {
            // borrowed backbuffer views are created before this point
            debug_assert_eq!(view.swapchain_layout(), layout);
        }
    }

    pub fn is_swapchain_image(&self) -> bool {
        self.swapchain_layout != vk::ImageLayout::UNDEFINED
    }

    pub fn access_flags(&self) -> vk::AccessFlags {
        self.access
    }

    pub fn set_access_flags(&mut self, access: vk::AccessFlags) {
        self.access = access;
    }

    pub fn stage_flags(&self) -> vk::PipelineStageFlags {
        self.stages
    }

    pub fn set_stage_flags(&mut self, stages: vk::PipelineStageFlags) {
        self.stages = stages;
    }

    /// Give up ownership of the VkImage handle. Used for swapchain
    /// backbuffers, which belong to the swapchain.
    pub(crate) fn disown_image(&mut self) {
        self.owns_image = false;
    }

    pub(crate) fn set_internal_sync(&self) {
        self.internal_sync.store(true, Ordering::Relaxed);
        if let Some(view) = self.default_view.as_ref() {
            view.set_internal_sync();
        }
    }

    /// Teardown path: destroy the image, its views and its memory
    /// directly. The later Drop no-ops because the device backref is
    /// already dead.
    pub(crate) fn destroy_now(&self, dev: &ash::Device, allocator: &crate::memory::DeviceAllocator) {
        if let Some(view) = self.default_view.as_ref() {
            view.destroy_now(dev);
        }
        if self.owns_image {
            unsafe { dev.destroy_image(self.image, None) };
        }
        if self.owns_memory {
            allocator.free(&self.alloc);
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        // drop the view first so its destruction lands in the queue
        // ahead of the image
        self.default_view = None;

        if let Some(dev) = self.dev.upgrade() {
            let alloc = if self.owns_memory {
                Some(self.alloc)
            } else {
                None
            };
            let image = if self.owns_image {
                Some(self.image)
            } else {
                None
            };
            dev.destroy_image_deferred(image, alloc, self.internal_sync.load(Ordering::Relaxed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_stencil_format_classes() {
        assert!(format_has_depth(vk::Format::D32_SFLOAT));
        assert!(!format_has_stencil(vk::Format::D32_SFLOAT));
        assert!(format_has_stencil(vk::Format::D24_UNORM_S8_UINT));
        assert!(format_has_depth(vk::Format::D24_UNORM_S8_UINT));
        assert!(format_has_stencil(vk::Format::S8_UINT));
        assert!(!format_has_depth(vk::Format::S8_UINT));
        assert!(!format_is_depth_stencil(vk::Format::R8G8B8A8_UNORM));
    }

    #[test]
    fn aspect_flags_match_format() {
        assert_eq!(
            format_aspect_flags(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            format_aspect_flags(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
