//! Viewer swapchain ownership, including the SRGB/UNORM family dance the
//! capture path needs when the producer flips formats.

use ash::vk;
use tracing::debug;

use goggles_core::Result;

use super::{gpu_err, Context};

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Creates a FIFO swapchain, preferring `preferred_format` when the
    /// surface offers it.
    pub fn new(ctx: &Context, width: u32, height: u32, preferred_format: vk::Format) -> Result<Self> {
        let caps = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_capabilities(ctx.physical_device, ctx.surface)
        }
        .map_err(|e| gpu_err("get_physical_device_surface_capabilities", e))?;

        let formats = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_formats(ctx.physical_device, ctx.surface)
        }
        .map_err(|e| gpu_err("get_physical_device_surface_formats", e))?;

        let surface_format = formats
            .iter()
            .copied()
            .find(|f| f.format == preferred_format)
            .or_else(|| {
                formats
                    .iter()
                    .copied()
                    .find(|f| f.format == vk::Format::B8G8R8A8_SRGB)
            })
            .or_else(|| formats.first().copied())
            .ok_or_else(|| {
                goggles_core::Error::new(
                    goggles_core::ErrorKind::GpuInitFailed,
                    "Surface reports no formats",
                )
            })?;

        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };

        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(ctx.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true);

        let handle = unsafe { ctx.swapchain_loader.create_swapchain(&info, None) }
            .map_err(|e| gpu_err("create_swapchain", e))?;

        let images = unsafe { ctx.swapchain_loader.get_swapchain_images(handle) }
            .map_err(|e| gpu_err("get_swapchain_images", e))?;

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { ctx.device.create_image_view(&view_info, None) }
                .map_err(|e| gpu_err("create_image_view", e))?;
            views.push(view);
        }

        debug!(
            "Swapchain: {}x{} {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            images.len()
        );

        Ok(Self {
            handle,
            images,
            views,
            format: surface_format.format,
            extent,
        })
    }

    pub fn destroy(&mut self, ctx: &Context) {
        unsafe {
            for view in self.views.drain(..) {
                ctx.device.destroy_image_view(view, None);
            }
            if self.handle != vk::SwapchainKHR::null() {
                ctx.swapchain_loader.destroy_swapchain(self.handle, None);
                self.handle = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
    }
}

pub fn is_srgb_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::B8G8R8A8_SRGB
            | vk::Format::R8G8B8A8_SRGB
            | vk::Format::A8B8G8R8_SRGB_PACK32
    )
}

/// Maps a captured source format onto the swapchain format family that
/// keeps sampling linear: SRGB sources pair with an SRGB swapchain,
/// UNORM sources with UNORM.
pub fn matching_swapchain_format(source_format: vk::Format) -> vk::Format {
    if is_srgb_format(source_format) {
        vk::Format::B8G8R8A8_SRGB
    } else {
        vk::Format::B8G8R8A8_UNORM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_detection_covers_capture_formats() {
        assert!(is_srgb_format(vk::Format::B8G8R8A8_SRGB));
        assert!(is_srgb_format(vk::Format::R8G8B8A8_SRGB));
        assert!(!is_srgb_format(vk::Format::B8G8R8A8_UNORM));
        assert!(!is_srgb_format(vk::Format::R8G8B8A8_UNORM));
        assert!(!is_srgb_format(vk::Format::R16G16B16A16_SFLOAT));
    }

    #[test]
    fn format_families_match() {
        assert_eq!(
            matching_swapchain_format(vk::Format::R8G8B8A8_SRGB),
            vk::Format::B8G8R8A8_SRGB
        );
        assert_eq!(
            matching_swapchain_format(vk::Format::B8G8R8A8_UNORM),
            vk::Format::B8G8R8A8_UNORM
        );
        assert_eq!(
            matching_swapchain_format(vk::Format::R16G16B16A16_SFLOAT),
            vk::Format::B8G8R8A8_UNORM
        );
    }
}
