// Swapchain management
//
// The swapchain wraps VkSwapchainKHR plus its backbuffers, which are
// exposed as borrowed Images (the swapchain owns the VkImage, we only
// own the views). Acquire hands the device a binary semaphore that
// the first swapchain-touching submission waits on; present consumes
// the release semaphore that submission signalled.

use ash::vk;

use crate::device::Device;
use crate::image::{ImageCreateInfo, ImageViewCreateInfo, ImageView, Image};
use crate::{CandelaError, Result};

use std::sync::Arc;

/// What the caller wants out of a swapchain.
#[derive(Copy, Clone, Debug)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub vsync: bool,
    pub buffer_count: u32,
}

impl Default for SwapChainDesc {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            format: vk::Format::B8G8R8A8_UNORM,
            vsync: true,
            buffer_count: 2,
        }
    }
}

/// Swapchain creation/acquire outcomes the outer loop reacts to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwapchainError {
    None,
    NoSurface,
    Error,
}

pub struct Swapchain {
    dev: Arc<Device>,
    surface_loader: ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    images: Vec<Arc<Image>>,
    image_index: u32,
}

impl Swapchain {
    /// Pick the first supported color format matching the request,
    /// preferring the standard 8-bit UNORM pair.
    fn select_surface_format(
        formats: &[vk::SurfaceFormatKHR],
        requested: vk::Format,
    ) -> Option<vk::SurfaceFormatKHR> {
        let preferred = [
            requested,
            vk::Format::R8G8B8A8_UNORM,
            vk::Format::B8G8R8A8_UNORM,
        ];
        for want in preferred.iter() {
            if let Some(format) = formats.iter().find(|f| f.format == *want) {
                return Some(*format);
            }
        }
        formats.first().copied()
    }

    /// FIFO for vsync; otherwise immediate or mailbox when available.
    fn select_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
        if !vsync {
            for want in [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX].iter() {
                if modes.contains(want) {
                    return *want;
                }
            }
        }
        vk::PresentModeKHR::FIFO
    }

    /// Create (or recreate) a swapchain for `surface`.
    ///
    /// A zero-sized request reports `NoSurface` and leaves any old
    /// swapchain untouched; the outer loop retries after the next
    /// resize.
    pub fn new(
        dev: Arc<Device>,
        desc: &SwapChainDesc,
        surface: vk::SurfaceKHR,
        old: Option<&mut Swapchain>,
    ) -> std::result::Result<Swapchain, SwapchainError> {
        if surface == vk::SurfaceKHR::null() || desc.width == 0 || desc.height == 0 {
            return Err(SwapchainError::NoSurface);
        }

        let surface_loader =
            ash::extensions::khr::Surface::new(&dev.instance.loader, &dev.instance.inst);

        let caps = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(dev.pdev, surface)
                .or(Err(SwapchainError::Error))?
        };
        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(dev.pdev, surface)
                .or(Err(SwapchainError::Error))?
        };
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(dev.pdev, surface)
                .or(Err(SwapchainError::Error))?
        };

        // check the format actually renders
        let surface_format = Self::select_surface_format(&formats, desc.format)
            .filter(|f| {
                let props = unsafe {
                    dev.instance
                        .inst
                        .get_physical_device_format_properties(dev.pdev, f.format)
                };
                props.optimal_tiling_features.contains(
                    vk::FormatFeatureFlags::COLOR_ATTACHMENT
                        | vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND,
                )
            })
            .ok_or_else(|| {
                log::error!("No usable surface format for the swapchain");
                SwapchainError::Error
            })?;

        let present_mode = Self::select_present_mode(&present_modes, desc.vsync);

        // clamp the requested size to what the surface reports
        let extent = vk::Extent2D {
            width: desc
                .width
                .max(caps.min_image_extent.width)
                .min(caps.max_image_extent.width),
            height: desc
                .height
                .max(caps.min_image_extent.height)
                .min(caps.max_image_extent.height),
        };

        let mut desired_images = desc.buffer_count.max(caps.min_image_count);
        if caps.max_image_count > 0 {
            desired_images = desired_images.min(caps.max_image_count);
        }

        let old_swapchain = old
            .as_ref()
            .map(|s| s.swapchain)
            .unwrap_or(vk::SwapchainKHR::null());

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(desired_images)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain)
            .build();

        let swapchain = unsafe {
            dev.swapchain_loader
                .create_swapchain(&info, None)
                .map_err(|e| {
                    log::error!("Could not create swapchain: {:?}", e);
                    SwapchainError::Error
                })?
        };

        // the old swapchain handle was retired by the create call
        if let Some(old) = old {
            old.swapchain = vk::SwapchainKHR::null();
        }

        let vk_images = unsafe {
            dev.swapchain_loader
                .get_swapchain_images(swapchain)
                .or(Err(SwapchainError::Error))?
        };

        // wrap the backbuffers as borrowed images in PRESENT_SRC
        let mut images = Vec::with_capacity(vk_images.len());
        let image_info = ImageCreateInfo::render_target(extent.width, extent.height, surface_format.format);
        for vk_image in vk_images.iter() {
            let mut image = Image::new(
                Arc::downgrade(&dev),
                *vk_image,
                image_info,
                crate::memory::DeviceAllocation::null(),
                true,
                false,
            );
            // the swapchain owns the VkImage, we only own the views
            image.disown_image();

            let view = Self::create_backbuffer_view(&dev, *vk_image, &image_info, image.cookie())
                .map_err(|_| SwapchainError::Error)?;
            image.set_default_view(Arc::new(view));
            image.set_swapchain_layout(vk::ImageLayout::PRESENT_SRC_KHR);
            image.set_internal_sync();

            images.push(Arc::new(image));
        }

        log::debug!(
            "Created swapchain {}x{} with {} images, format {:?}",
            extent.width,
            extent.height,
            images.len(),
            surface_format.format
        );

        Ok(Swapchain {
            dev,
            surface_loader,
            surface,
            swapchain,
            format: surface_format,
            extent,
            images,
            image_index: 0,
        })
    }

    fn create_backbuffer_view(
        dev: &Arc<Device>,
        image: vk::Image,
        info: &ImageCreateInfo,
        image_cookie: u64,
    ) -> Result<ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(info.format)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1)
                    .build(),
            )
            .build();

        let view = unsafe {
            dev.vk_dev()
                .create_image_view(&view_info, None)
                .or(Err(CandelaError::COULD_NOT_CREATE_IMAGE))?
        };

        let mut ret = ImageView::new(
            Arc::downgrade(dev),
            view,
            ImageViewCreateInfo {
                format: info.format,
                view_type: vk::ImageViewType::TYPE_2D,
                base_level: 0,
                levels: 1,
                base_layer: 0,
                layers: 1,
            },
            image_cookie,
            info.width,
            info.height,
            vk::ImageLayout::PRESENT_SRC_KHR,
            false,
            None,
        );
        ret.set_internal_sync();
        Ok(ret)
    }

    pub fn vk_handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Current surface extent as the platform reports it; the outer
    /// loop compares this against `extent` to decide on a rebuild.
    pub fn query_surface_extent(&self) -> Result<vk::Extent2D> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.dev.pdev, self.surface)
                .or(Err(CandelaError::VK_SURF_NOT_SUPPORTED))?
        };
        Ok(caps.current_extent)
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// The backbuffer acquired most recently.
    pub fn current_image(&self) -> &Arc<Image> {
        &self.images[self.image_index as usize]
    }

    pub fn image(&self, index: u32) -> &Arc<Image> {
        &self.images[index as usize]
    }

    /// Acquire the next backbuffer and register its semaphore with
    /// the device's WSI handshake.
    pub fn acquire_next_image(&mut self) -> Result<u32> {
        let mut acquire = self.dev.request_semaphore();

        let result = unsafe {
            self.dev.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                acquire.vk_handle(),
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swapchain acquire reported suboptimal");
                }
                acquire.signal();
                self.image_index = index;
                self.dev.set_acquire_semaphore(index, acquire);
                Ok(index)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(CandelaError::OUT_OF_DATE),
            Err(vk::Result::SUBOPTIMAL_KHR) => Err(CandelaError::OUT_OF_DATE),
            Err(_) => Err(CandelaError::COULD_NOT_ACQUIRE_NEXT_IMAGE),
        }
    }

    /// Build the render pass info for rendering to the current
    /// backbuffer.
    pub fn render_pass_info(&self) -> crate::renderpass::RenderPassInfo {
        let mut info = crate::renderpass::RenderPassInfo::default();
        info.color_attachments
            .push(self.current_image().view().clone());
        info.clear_attachments = 1 << 0;
        info.store_attachments = 1 << 0;
        info
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // the borrowed images only queue their views for deferred
        // destruction
        self.images.clear();

        // the surface stays with the platform that created it; a
        // recreated swapchain keeps using it
        unsafe {
            if self.swapchain != vk::SwapchainKHR::null() {
                self.dev
                    .swapchain_loader
                    .destroy_swapchain(self.swapchain, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn surface_format_prefers_request_then_unorm_pair() {
        let formats = [
            fmt(vk::Format::R5G6B5_UNORM_PACK16),
            fmt(vk::Format::B8G8R8A8_UNORM),
            fmt(vk::Format::R8G8B8A8_UNORM),
        ];

        let picked =
            Swapchain::select_surface_format(&formats, vk::Format::B8G8R8A8_UNORM).unwrap();
        assert_eq!(picked.format, vk::Format::B8G8R8A8_UNORM);

        let fallback =
            Swapchain::select_surface_format(&formats, vk::Format::A2B10G10R10_UNORM_PACK32)
                .unwrap();
        assert_eq!(fallback.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn present_mode_honors_vsync() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            Swapchain::select_present_mode(&modes, true),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            Swapchain::select_present_mode(&modes, false),
            vk::PresentModeKHR::IMMEDIATE
        );

        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            Swapchain::select_present_mode(&fifo_only, false),
            vk::PresentModeKHR::FIFO
        );
    }
}
