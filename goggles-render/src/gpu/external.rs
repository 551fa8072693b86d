//! Cross-process GPU resources: dma-buf image import and external
//! timeline semaphores.

use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};

use ash::vk;
use tracing::trace;

use goggles_core::{ErrorKind, ExternalImage, Result};

use super::{gpu_err, Context};

/// An imported external image plus the objects backing it. Destroyed and
/// re-imported every frame; never shared.
pub struct ImportedImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

impl ImportedImage {
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

/// Imports `frame`'s dma-buf as a sampled image with an explicit DRM
/// modifier layout.
///
/// The input handle stays owned by the caller; a duplicate is what the
/// driver consumes (ownership passes to Vulkan on success, the duplicate
/// is closed on failure).
pub fn import_dmabuf_image(ctx: &Context, image_desc: &ExternalImage) -> Result<ImportedImage> {
    let Some(src_fd) = image_desc.handle.as_ref() else {
        return goggles_core::error::err(ErrorKind::GpuInitFailed, "Invalid dma-buf fd");
    };

    let format = vk::Format::from_raw(image_desc.format as i32);

    let plane_layout = vk::SubresourceLayout {
        offset: u64::from(image_desc.offset),
        size: 0,
        row_pitch: u64::from(image_desc.stride),
        array_pitch: 0,
        depth_pitch: 0,
    };
    let plane_layouts = [plane_layout];

    let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
        .drm_format_modifier(image_desc.modifier)
        .plane_layouts(&plane_layouts);

    let mut ext_mem_info = vk::ExternalMemoryImageCreateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

    let image_info = vk::ImageCreateInfo::default()
        .push_next(&mut ext_mem_info)
        .push_next(&mut modifier_info)
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: image_desc.width,
            height: image_desc.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
        .usage(vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::SAMPLED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let mut imported = ImportedImage {
        image: vk::Image::null(),
        memory: vk::DeviceMemory::null(),
        view: vk::ImageView::null(),
        extent: vk::Extent2D {
            width: image_desc.width,
            height: image_desc.height,
        },
        format,
    };

    imported.image = unsafe { ctx.device.create_image(&image_info, None) }
        .map_err(|e| gpu_err("create dma-buf image", e))?;

    let mut dedicated_reqs = vk::MemoryDedicatedRequirements::default();
    let mut mem_reqs2 = vk::MemoryRequirements2::default().push_next(&mut dedicated_reqs);
    let reqs_info = vk::ImageMemoryRequirementsInfo2::default().image(imported.image);
    unsafe {
        ctx.device
            .get_image_memory_requirements2(&reqs_info, &mut mem_reqs2)
    };
    let mem_reqs = mem_reqs2.memory_requirements;

    let mut fd_props = vk::MemoryFdPropertiesKHR::default();
    unsafe {
        ctx.external_memory_fd.get_memory_fd_properties(
            vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
            src_fd.as_raw_fd(),
            &mut fd_props,
        )
    }
    .map_err(|_| {
        imported.destroy(ctx);
        goggles_core::Error::new(ErrorKind::GpuInitFailed, "Stale dma-buf fd, skipping frame")
    })?;

    let combined_bits = mem_reqs.memory_type_bits & fd_props.memory_type_bits;
    let Some(mem_type) = ctx.find_memory_type(combined_bits, vk::MemoryPropertyFlags::empty())
    else {
        imported.destroy(ctx);
        return goggles_core::error::err(
            ErrorKind::GpuInitFailed,
            "No suitable memory type for dma-buf import",
        );
    };

    // Vulkan takes ownership of the fd on success, so import a duplicate.
    let import_fd: OwnedFd = match src_fd.try_clone() {
        Ok(fd) => fd,
        Err(e) => {
            imported.destroy(ctx);
            return goggles_core::error::err(
                ErrorKind::GpuInitFailed,
                format!("Failed to dup dma-buf fd: {e}"),
            );
        }
    };

    let mut import_info = vk::ImportMemoryFdInfoKHR::default()
        .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
        .fd(import_fd.as_raw_fd());

    let mut dedicated_alloc = vk::MemoryDedicatedAllocateInfo::default().image(imported.image);
    let use_dedicated = dedicated_reqs.requires_dedicated_allocation == vk::TRUE
        || dedicated_reqs.prefers_dedicated_allocation == vk::TRUE;

    let mut alloc_info = vk::MemoryAllocateInfo::default()
        .push_next(&mut import_info)
        .allocation_size(mem_reqs.size)
        .memory_type_index(mem_type);
    if use_dedicated {
        alloc_info = alloc_info.push_next(&mut dedicated_alloc);
    }

    match unsafe { ctx.device.allocate_memory(&alloc_info, None) } {
        Ok(memory) => {
            // Success: the driver owns the descriptor now.
            let _ = import_fd.into_raw_fd();
            imported.memory = memory;
        }
        Err(e) => {
            imported.destroy(ctx);
            return Err(gpu_err("import dma-buf memory", e));
        }
    }

    if let Err(e) = unsafe { ctx.device.bind_image_memory(imported.image, imported.memory, 0) } {
        imported.destroy(ctx);
        return Err(gpu_err("bind dma-buf memory", e));
    }

    let view_info = vk::ImageViewCreateInfo::default()
        .image(imported.image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    match unsafe { ctx.device.create_image_view(&view_info, None) } {
        Ok(view) => imported.view = view,
        Err(e) => {
            imported.destroy(ctx);
            return Err(gpu_err("create dma-buf image view", e));
        }
    }

    trace!(
        "dma-buf imported: {}x{} {:?} modifier=0x{:x}",
        image_desc.width,
        image_desc.height,
        format,
        image_desc.modifier
    );
    Ok(imported)
}

/// A timeline semaphore whose payload is shared with another process.
pub struct TimelineSemaphore {
    pub semaphore: vk::Semaphore,
}

impl TimelineSemaphore {
    /// Blocks until the timeline reaches `value` or `timeout_ns` elapses.
    /// Returns `Ok(false)` on timeout.
    pub fn wait(&self, ctx: &Context, value: u64, timeout_ns: u64) -> Result<bool> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        match unsafe { ctx.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(gpu_err("wait_semaphores", e)),
        }
    }

    pub fn destroy(&mut self, ctx: &Context) {
        unsafe {
            if self.semaphore != vk::Semaphore::null() {
                ctx.device.destroy_semaphore(self.semaphore, None);
                self.semaphore = vk::Semaphore::null();
            }
        }
    }
}

/// Creates a timeline semaphore and replaces its payload with the state
/// behind `fd`. Ownership of `fd` passes to the driver on success.
pub fn import_timeline_semaphore(ctx: &Context, fd: OwnedFd) -> Result<TimelineSemaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(0);
    let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

    let semaphore = unsafe { ctx.device.create_semaphore(&info, None) }
        .map_err(|e| gpu_err("create timeline semaphore", e))?;

    let import_info = vk::ImportSemaphoreFdInfoKHR::default()
        .semaphore(semaphore)
        .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD)
        .fd(fd.as_raw_fd());

    match unsafe { ctx.external_semaphore_fd.import_semaphore_fd(&import_info) } {
        Ok(()) => {
            let _ = fd.into_raw_fd();
            Ok(TimelineSemaphore { semaphore })
        }
        Err(e) => {
            unsafe { ctx.device.destroy_semaphore(semaphore, None) };
            Err(gpu_err("import semaphore fd", e))
        }
    }
}
