//! Owned intermediate framebuffers for non-final passes, feedback
//! buffers and history entries.

use ash::vk;

use goggles_core::Result;

use crate::gpu::{self, Context};
use crate::preset::FramebufferFormat;

pub fn vk_format_for(format: FramebufferFormat, target_format: vk::Format) -> vk::Format {
    match format {
        FramebufferFormat::Unorm8 => vk::Format::R8G8B8A8_UNORM,
        FramebufferFormat::Srgb8 => vk::Format::R8G8B8A8_SRGB,
        FramebufferFormat::Float16 => {
            // Float framebuffers are unaffected by the swapchain family.
            let _ = target_format;
            vk::Format::R16G16B16A16_SFLOAT
        }
    }
}

/// A render target the chain both writes (color attachment) and samples
/// (shader read) once the pass barrier has run.
pub struct Framebuffer {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Framebuffer {
    pub fn new(ctx: &Context, format: vk::Format, extent: vk::Extent2D) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { ctx.device.create_image(&image_info, None) }
            .map_err(|e| gpu::gpu_err("create framebuffer image", e))?;

        let reqs = unsafe { ctx.device.get_image_memory_requirements(image) };
        let mem_type = ctx
            .find_memory_type(reqs.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .or_else(|| ctx.find_memory_type(reqs.memory_type_bits, vk::MemoryPropertyFlags::empty()))
            .ok_or_else(|| {
                unsafe { ctx.device.destroy_image(image, None) };
                goggles_core::Error::new(
                    goggles_core::ErrorKind::GpuInitFailed,
                    "No memory type for framebuffer",
                )
            })?;

        let alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(reqs.size)
            .memory_type_index(mem_type);
        let memory = match unsafe { ctx.device.allocate_memory(&alloc, None) } {
            Ok(m) => m,
            Err(e) => {
                unsafe { ctx.device.destroy_image(image, None) };
                return Err(gpu::gpu_err("allocate framebuffer memory", e));
            }
        };
        if let Err(e) = unsafe { ctx.device.bind_image_memory(image, memory, 0) } {
            unsafe {
                ctx.device.free_memory(memory, None);
                ctx.device.destroy_image(image, None);
            }
            return Err(gpu::gpu_err("bind framebuffer memory", e));
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = match unsafe { ctx.device.create_image_view(&view_info, None) } {
            Ok(v) => v,
            Err(e) => {
                unsafe {
                    ctx.device.free_memory(memory, None);
                    ctx.device.destroy_image(image, None);
                }
                return Err(gpu::gpu_err("create framebuffer view", e));
            }
        };

        Ok(Self {
            image,
            memory,
            view,
            format,
            extent,
        })
    }

    /// Recreates the target when the computed extent or format changed.
    pub fn ensure(&mut self, ctx: &Context, format: vk::Format, extent: vk::Extent2D) -> Result<bool> {
        if self.format == format && self.extent == extent {
            return Ok(false);
        }
        let mut replacement = Framebuffer::new(ctx, format, extent)?;
        std::mem::swap(self, &mut replacement);
        replacement.destroy(ctx);
        Ok(true)
    }

    pub fn destroy(&mut self, ctx: &Context) {
        unsafe {
            if self.view != vk::ImageView::null() {
                ctx.device.destroy_image_view(self.view, None);
                self.view = vk::ImageView::null();
            }
            if self.memory != vk::DeviceMemory::null() {
                ctx.device.free_memory(self.memory, None);
                self.memory = vk::DeviceMemory::null();
            }
            if self.image != vk::Image::null() {
                ctx.device.destroy_image(self.image, None);
                self.image = vk::Image::null();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_formats_map_to_vulkan() {
        assert_eq!(
            vk_format_for(FramebufferFormat::Unorm8, vk::Format::B8G8R8A8_SRGB),
            vk::Format::R8G8B8A8_UNORM
        );
        assert_eq!(
            vk_format_for(FramebufferFormat::Srgb8, vk::Format::B8G8R8A8_UNORM),
            vk::Format::R8G8B8A8_SRGB
        );
        assert_eq!(
            vk_format_for(FramebufferFormat::Float16, vk::Format::B8G8R8A8_SRGB),
            vk::Format::R16G16B16A16_SFLOAT
        );
    }
}
