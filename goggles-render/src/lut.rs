//! Preset lookup textures: decoded on the CPU, uploaded once through a
//! staging buffer, then sampled read-only for the preset's lifetime.

use ash::vk;
use tracing::debug;

use goggles_core::{Error, ErrorKind, Result};

use crate::gpu::{self, Context};
use crate::preset::TextureConfig;

pub struct LutTexture {
    pub name: String,
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub filter: crate::preset::FilterMode,
    pub wrap: crate::preset::WrapMode,
}

impl LutTexture {
    pub fn load(ctx: &Context, config: &TextureConfig) -> Result<Self> {
        let decoded = image_rs::open(&config.path).map_err(|e| {
            Error::new(
                ErrorKind::ShaderLoadFailed,
                format!("Failed to load texture {}: {e}", config.path.display()),
            )
        })?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        let pixels = rgba.into_raw();

        // Linear textures skip the sRGB transfer curve.
        let format = if config.linear {
            vk::Format::R8G8B8A8_UNORM
        } else {
            vk::Format::R8G8B8A8_SRGB
        };

        let lut = upload_rgba(ctx, &pixels, width, height, format)?;
        debug!("LUT '{}' loaded: {width}x{height}", config.name);
        Ok(Self {
            name: config.name.clone(),
            image: lut.0,
            memory: lut.1,
            view: lut.2,
            filter: config.filter_mode,
            wrap: config.wrap_mode,
        })
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

fn upload_rgba(
    ctx: &Context,
    pixels: &[u8],
    width: u32,
    height: u32,
    format: vk::Format,
) -> Result<(vk::Image, vk::DeviceMemory, vk::ImageView)> {
    let device = &ctx.device;
    let size = pixels.len() as u64;

    // Staging buffer.
    let staging_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(vk::BufferUsageFlags::TRANSFER_SRC)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let staging = unsafe { device.create_buffer(&staging_info, None) }
        .map_err(|e| gpu::gpu_err("create lut staging buffer", e))?;
    let staging_reqs = unsafe { device.get_buffer_memory_requirements(staging) };
    let staging_type = ctx
        .find_memory_type(
            staging_reqs.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .ok_or_else(|| Error::new(ErrorKind::GpuInitFailed, "No staging memory type"))?;
    let staging_alloc = vk::MemoryAllocateInfo::default()
        .allocation_size(staging_reqs.size)
        .memory_type_index(staging_type);
    let staging_memory = unsafe { device.allocate_memory(&staging_alloc, None) }
        .map_err(|e| gpu::gpu_err("allocate lut staging memory", e))?;

    let cleanup_staging = |device: &ash::Device| unsafe {
        device.free_memory(staging_memory, None);
        device.destroy_buffer(staging, None);
    };

    if let Err(e) = unsafe { device.bind_buffer_memory(staging, staging_memory, 0) } {
        cleanup_staging(device);
        return Err(gpu::gpu_err("bind lut staging memory", e));
    }
    match unsafe { device.map_memory(staging_memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
    {
        Ok(ptr) => unsafe {
            std::ptr::copy_nonoverlapping(pixels.as_ptr(), ptr as *mut u8, pixels.len());
            device.unmap_memory(staging_memory);
        },
        Err(e) => {
            cleanup_staging(device);
            return Err(gpu::gpu_err("map lut staging memory", e));
        }
    }

    // Device-local image.
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let image = match unsafe { device.create_image(&image_info, None) } {
        Ok(i) => i,
        Err(e) => {
            cleanup_staging(device);
            return Err(gpu::gpu_err("create lut image", e));
        }
    };
    let reqs = unsafe { device.get_image_memory_requirements(image) };
    let Some(mem_type) =
        ctx.find_memory_type(reqs.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
    else {
        unsafe { device.destroy_image(image, None) };
        cleanup_staging(device);
        return goggles_core::error::err(ErrorKind::GpuInitFailed, "No lut memory type");
    };
    let alloc = vk::MemoryAllocateInfo::default()
        .allocation_size(reqs.size)
        .memory_type_index(mem_type);
    let memory = match unsafe { device.allocate_memory(&alloc, None) } {
        Ok(m) => m,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            cleanup_staging(device);
            return Err(gpu::gpu_err("allocate lut memory", e));
        }
    };
    if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
        unsafe {
            device.free_memory(memory, None);
            device.destroy_image(image, None);
        }
        cleanup_staging(device);
        return Err(gpu::gpu_err("bind lut memory", e));
    }

    // One-shot upload.
    let upload = record_and_submit_upload(ctx, staging, image, width, height);
    cleanup_staging(device);
    if let Err(e) = upload {
        unsafe {
            device.free_memory(memory, None);
            device.destroy_image(image, None);
        }
        return Err(e);
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
    let view = match unsafe { device.create_image_view(&view_info, None) } {
        Ok(v) => v,
        Err(e) => {
            unsafe {
                device.free_memory(memory, None);
                device.destroy_image(image, None);
            }
            return Err(gpu::gpu_err("create lut view", e));
        }
    };

    Ok((image, memory, view))
}

fn record_and_submit_upload(
    ctx: &Context,
    staging: vk::Buffer,
    image: vk::Image,
    width: u32,
    height: u32,
) -> Result<()> {
    let device = &ctx.device;

    let alloc = vk::CommandBufferAllocateInfo::default()
        .command_pool(ctx.command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let cmd = unsafe { device.allocate_command_buffers(&alloc) }
        .map_err(|e| gpu::gpu_err("allocate lut upload cmd", e))?[0];

    let subrange = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };

    let begin = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    let result = unsafe {
        device
            .begin_command_buffer(cmd, &begin)
            .map_err(|e| gpu::gpu_err("begin lut upload", e))
            .and_then(|()| {
                let to_dst = vk::ImageMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(subrange);
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_dst],
                );

                let region = vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    },
                };
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );

                let to_shader = vk::ImageMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ)
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(subrange);
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_shader],
                );

                device
                    .end_command_buffer(cmd)
                    .map_err(|e| gpu::gpu_err("end lut upload", e))
            })
            .and_then(|()| {
                let fence_info = vk::FenceCreateInfo::default();
                let fence = device
                    .create_fence(&fence_info, None)
                    .map_err(|e| gpu::gpu_err("create lut fence", e))?;
                let cmds = [cmd];
                let submit = vk::SubmitInfo::default().command_buffers(&cmds);
                let submitted = device
                    .queue_submit(ctx.graphics_queue, &[submit], fence)
                    .map_err(|e| gpu::gpu_err("submit lut upload", e))
                    .and_then(|()| {
                        device
                            .wait_for_fences(&[fence], true, u64::MAX)
                            .map_err(|e| gpu::gpu_err("wait lut upload", e))
                    });
                device.destroy_fence(fence, None);
                submitted
            })
    };

    unsafe { device.free_command_buffers(ctx.command_pool, &[cmd]) };
    result
}
