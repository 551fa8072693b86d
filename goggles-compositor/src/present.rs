//! Composition and export: renders the focused surface tree into a
//! linear, dma-buf-exportable image and publishes it for the viewer.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};

use goggles_core::{Error, ErrorKind, ExternalHandleKind, ExternalImage, ExternalImageFrame, Result};
use goggles_render::gpu::{import_dmabuf_image, Context, ImportedImage};
use goggles_render::shader::{ShaderService, ShadercService};

use crate::buffer::{buffer_backing, fourcc_to_vk_format, BufferBacking};
use crate::state::ServerState;

const EXPORT_IMAGE_COUNT: usize = 3;
const EXPORT_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;
const CURSOR_SIZE: f32 = 8.0;

const QUAD_VERTEX: &str = r#"
#version 450
layout(push_constant) uniform Push {
    vec4 dst_rect;
    vec4 solid_color;
} pc;
layout(location = 0) out vec2 vTexCoord;
void main() {
    vec2 corners[6] = vec2[](
        vec2(0.0, 0.0), vec2(1.0, 0.0), vec2(0.0, 1.0),
        vec2(1.0, 0.0), vec2(1.0, 1.0), vec2(0.0, 1.0)
    );
    vec2 corner = corners[gl_VertexIndex];
    vTexCoord = corner;
    gl_Position = vec4(pc.dst_rect.xy + corner * pc.dst_rect.zw, 0.0, 1.0);
}
"#;

const QUAD_FRAGMENT: &str = r#"
#version 450
layout(push_constant) uniform Push {
    vec4 dst_rect;
    vec4 solid_color;
} pc;
layout(set = 0, binding = 0) uniform sampler2D Tex;
layout(location = 0) in vec2 vTexCoord;
layout(location = 0) out vec4 FragColor;
void main() {
    if (pc.solid_color.a > 0.0) {
        FragColor = pc.solid_color;
    } else {
        FragColor = texture(Tex, vTexCoord);
    }
}
"#;

#[repr(C)]
#[derive(Clone, Copy)]
struct QuadPush {
    dst_rect: [f32; 4],
    solid_color: [f32; 4],
}

/// One exportable target in the composition ring.
struct ExportImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    fd: OwnedFd,
    stride: u32,
}

impl ExportImage {
    fn destroy(&mut self, ctx: &Context) {
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

/// A guest buffer turned into something sampleable for one frame.
enum FrameTexture {
    Imported(ImportedImage),
    Uploaded {
        image: vk::Image,
        memory: vk::DeviceMemory,
        view: vk::ImageView,
    },
}

impl FrameTexture {
    fn view(&self) -> vk::ImageView {
        match self {
            FrameTexture::Imported(imported) => imported.view,
            FrameTexture::Uploaded { view, .. } => *view,
        }
    }

    fn destroy(self, ctx: &Context) {
        match self {
            FrameTexture::Imported(mut imported) => imported.destroy(ctx),
            FrameTexture::Uploaded {
                image,
                memory,
                view,
            } => unsafe {
                ctx.device.destroy_image_view(view, None);
                ctx.device.free_memory(memory, None);
                ctx.device.destroy_image(image, None);
            },
        }
    }
}

/// Owns the export ring, the quad pipeline and the per-frame scratch.
pub(crate) struct FrameComposer {
    gpu: Arc<Context>,
    images: Vec<ExportImage>,
    extent: vk::Extent2D,
    current: usize,
    frame_number: u64,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    descriptor_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    sampler: vk::Sampler,
    fence: vk::Fence,
    command_buffer: vk::CommandBuffer,
}

impl FrameComposer {
    pub fn new(gpu: Arc<Context>) -> Result<Self> {
        let shader_service = ShadercService::new()?;
        let compiled =
            shader_service.compile_pair("compositor-quad", QUAD_VERTEX, QUAD_FRAGMENT)?;

        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT);
        let bindings = [binding];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let descriptor_layout =
            unsafe { gpu.device.create_descriptor_set_layout(&layout_info, None) }
                .map_err(|e| composer_err("create descriptor layout", e))?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 64,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(64)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe { gpu.device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| composer_err("create descriptor pool", e))?;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE);
        let sampler = unsafe { gpu.device.create_sampler(&sampler_info, None) }
            .map_err(|e| composer_err("create sampler", e))?;

        let (pipeline_layout, pipeline) = goggles_render::pass::build_pipeline(
            &gpu,
            &compiled.vertex_spirv,
            &compiled.fragment_spirv,
            descriptor_layout,
            true,
            EXPORT_FORMAT,
        )?;

        let fence_info = vk::FenceCreateInfo::default();
        let fence = unsafe { gpu.device.create_fence(&fence_info, None) }
            .map_err(|e| composer_err("create fence", e))?;

        let alloc = vk::CommandBufferAllocateInfo::default()
            .command_pool(gpu.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { gpu.device.allocate_command_buffers(&alloc) }
            .map_err(|e| composer_err("allocate command buffer", e))?[0];

        Ok(Self {
            gpu,
            images: Vec::new(),
            extent: vk::Extent2D::default(),
            current: 0,
            frame_number: 0,
            pipeline,
            pipeline_layout,
            descriptor_layout,
            descriptor_pool,
            sampler,
            fence,
            command_buffer,
        })
    }

    fn ensure_ring(&mut self, extent: vk::Extent2D) -> Result<()> {
        if self.extent == extent && !self.images.is_empty() {
            return Ok(());
        }
        let _ = self.gpu.wait_idle();
        for mut image in self.images.drain(..) {
            image.destroy(&self.gpu);
        }
        for _ in 0..EXPORT_IMAGE_COUNT {
            let image = create_export_image(&self.gpu, extent)?;
            self.images.push(image);
        }
        self.extent = extent;
        self.current = 0;
        debug!(
            "Composition ring: {}x{} x{EXPORT_IMAGE_COUNT}",
            extent.width, extent.height
        );
        Ok(())
    }

    pub fn destroy(&mut self) {
        let _ = self.gpu.wait_idle();
        for mut image in self.images.drain(..) {
            image.destroy(&self.gpu);
        }
        unsafe {
            self.gpu.device.destroy_fence(self.fence, None);
            self.gpu
                .device
                .free_command_buffers(self.gpu.command_pool, &[self.command_buffer]);
            self.gpu.device.destroy_sampler(self.sampler, None);
            self.gpu.device.destroy_pipeline(self.pipeline, None);
            self.gpu
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None);
            self.gpu
                .device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.gpu
                .device
                .destroy_descriptor_set_layout(self.descriptor_layout, None);
        }
    }
}

impl Drop for FrameComposer {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn composer_err(context: &str, result: vk::Result) -> Error {
    Error::new(ErrorKind::GpuInitFailed, format!("{context}: {result:?}"))
}

/// One quad to draw into the export target.
struct DrawOp {
    texture_index: usize,
    /// Destination in pixels relative to the root surface.
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    solid_color: Option<[f32; 4]>,
}

/// Renders the focused surface tree plus cursor into the next export
/// image and publishes the frame. Called from the event loop whenever a
/// commit or host request invalidated the presented frame.
pub(crate) fn render_focused(state: &mut ServerState) {
    let Some(focused) = state.focused_toplevel() else {
        return;
    };
    let focused_id = focused.id;
    let Some(root_key) = focused.surface_key.clone() else {
        return;
    };

    // Gather the root texture plus any override-redirect children.
    let mut textures: Vec<FrameTexture> = Vec::new();
    let mut ops: Vec<DrawOp> = Vec::new();

    let root_texture = match texture_for_surface(state, &root_key) {
        Some(texture) => texture,
        None => return,
    };
    let (root_w, root_h) = match crate::seat::surface_extent(state, &root_key) {
        Some(extent) => extent,
        None => return,
    };
    if root_w == 0 || root_h == 0 {
        return;
    }
    textures.push(root_texture);
    ops.push(DrawOp {
        texture_index: 0,
        x: 0.0,
        y: 0.0,
        width: root_w as f32,
        height: root_h as f32,
        solid_color: None,
    });

    let (root_x, root_y) = state
        .toplevels
        .get(&focused_id)
        .map(|t| (t.x, t.y))
        .unwrap_or((0, 0));

    // Override-redirect children (menus, tooltips) ride on top.
    let or_children: Vec<(ObjectKey, i32, i32)> = state
        .toplevels
        .values()
        .filter(|t| t.override_redirect && t.mapped)
        .filter_map(|t| {
            t.surface_key
                .clone()
                .map(|key| (key, t.x - root_x, t.y - root_y))
        })
        .collect();
    for (key, dx, dy) in or_children {
        let Some((w, h)) = crate::seat::surface_extent(state, &key) else {
            continue;
        };
        let Some(texture) = texture_for_surface(state, &key) else {
            continue;
        };
        ops.push(DrawOp {
            texture_index: textures.len(),
            x: dx as f32,
            y: dy as f32,
            width: w as f32,
            height: h as f32,
            solid_color: None,
        });
        textures.push(texture);
    }

    // Popup children of the focused toplevel.
    let popups: Vec<ObjectKey> = state
        .surfaces
        .iter()
        .filter(|(_, record)| {
            matches!(record.role, crate::state::SurfaceRole::Popup(root) if root == focused_id)
        })
        .map(|(key, _)| key.clone())
        .collect();
    for key in popups {
        let Some((w, h)) = crate::seat::surface_extent(state, &key) else {
            continue;
        };
        let Some(texture) = texture_for_surface(state, &key) else {
            continue;
        };
        ops.push(DrawOp {
            texture_index: textures.len(),
            x: 0.0,
            y: 0.0,
            width: w as f32,
            height: h as f32,
            solid_color: None,
        });
        textures.push(texture);
    }

    // Cursor overlay, unless hidden or locked away.
    let show_cursor = state
        .cursor_visible
        .load(std::sync::atomic::Ordering::Acquire)
        && state.constraint.kind != Some(crate::seat::ConstraintKind::Locked);
    if show_cursor && state.cursor.initialized {
        let x = (state.cursor.x as f32).clamp(0.0, root_w as f32 - CURSOR_SIZE);
        let y = (state.cursor.y as f32).clamp(0.0, root_h as f32 - CURSOR_SIZE);
        ops.push(DrawOp {
            texture_index: 0,
            x,
            y,
            width: CURSOR_SIZE,
            height: CURSOR_SIZE,
            solid_color: Some([1.0, 1.0, 1.0, 1.0]),
        });
    }

    let extent = vk::Extent2D {
        width: root_w,
        height: root_h,
    };
    let result = state.composer.compose(extent, &textures, &ops);

    for texture in textures {
        texture.destroy(&state.gpu);
    }

    match result {
        Ok(frame) => {
            *state.shared.frame.lock() = Some(frame);
        }
        Err(e) => warn!("Composition failed: {e}"),
    }
}

type ObjectKey = wayland_server::backend::ObjectId;

/// Turns a surface's committed buffer into a texture for this frame.
fn texture_for_surface(state: &ServerState, key: &ObjectKey) -> Option<FrameTexture> {
    let record = state.surfaces.get(key)?;
    let buffer = record.current_buffer.as_ref()?;
    let data = buffer_backing(buffer)?;

    match &data.backing {
        BufferBacking::Shm {
            pool,
            offset,
            width,
            height,
            stride,
            is_bgra,
        } => {
            let pixels = pool.read_pixels(*offset, *width, *height, *stride)?;
            let format = if *is_bgra {
                vk::Format::B8G8R8A8_UNORM
            } else {
                vk::Format::R8G8B8A8_UNORM
            };
            match upload_pixels(&state.gpu, &pixels, *width, *height, format) {
                Ok(texture) => Some(texture),
                Err(e) => {
                    warn!("shm upload failed: {e}");
                    None
                }
            }
        }
        BufferBacking::Dmabuf {
            fd,
            width,
            height,
            stride,
            offset,
            modifier,
            fourcc,
        } => {
            let format = fourcc_to_vk_format(*fourcc)?;
            let handle = fd.try_clone().ok()?;
            let desc = ExternalImage {
                width: *width,
                height: *height,
                stride: *stride,
                offset: *offset,
                format: format.as_raw() as u32,
                modifier: *modifier,
                handle: Some(handle),
                handle_kind: ExternalHandleKind::DmaBuf,
            };
            match import_dmabuf_image(&state.gpu, &desc) {
                Ok(imported) => Some(FrameTexture::Imported(imported)),
                Err(e) => {
                    warn!("guest dmabuf import failed: {e}");
                    None
                }
            }
        }
    }
}

impl FrameComposer {
    /// Records and submits one composition, waits for it, and returns the
    /// published frame with a duplicated fd.
    fn compose(
        &mut self,
        extent: vk::Extent2D,
        textures: &[FrameTexture],
        ops: &[DrawOp],
    ) -> Result<ExternalImageFrame> {
        self.ensure_ring(extent)?;

        let index = self.current;
        self.current = (self.current + 1) % self.images.len();
        let device = &self.gpu.device;

        unsafe {
            device
                .reset_descriptor_pool(
                    self.descriptor_pool,
                    vk::DescriptorPoolResetFlags::empty(),
                )
                .map_err(|e| composer_err("reset descriptor pool", e))?;
        }

        // One descriptor set per texture.
        let set_layouts = vec![self.descriptor_layout; textures.len().max(1)];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        let sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| composer_err("allocate descriptor sets", e))?;
        for (texture, set) in textures.iter().zip(&sets) {
            let image_info = [vk::DescriptorImageInfo {
                sampler: self.sampler,
                image_view: texture.view(),
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];
            let write = vk::WriteDescriptorSet::default()
                .dst_set(*set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_info);
            unsafe { device.update_descriptor_sets(&[write], &[]) };
        }

        let cmd = self.command_buffer;
        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| composer_err("reset command buffer", e))?;
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin)
                .map_err(|e| composer_err("begin command buffer", e))?;

            // Imported guest dmabufs arrive in UNDEFINED; settle them and
            // the render target in one barrier batch.
            let mut barriers = Vec::with_capacity(textures.len() + 1);
            for texture in textures {
                if let FrameTexture::Imported(imported) = texture {
                    barriers.push(layout_barrier(
                        imported.image,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        vk::AccessFlags::empty(),
                        vk::AccessFlags::SHADER_READ,
                    ));
                }
            }
            barriers.push(layout_barrier(
                self.images[index].image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ));
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::FRAGMENT_SHADER
                    | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );

            let clear = vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            };
            let attachment = vk::RenderingAttachmentInfo::default()
                .image_view(self.images[index].view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(clear);
            let color_attachments = [attachment];
            let rendering_info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent,
                })
                .layer_count(1)
                .color_attachments(&color_attachments);
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent,
                }],
            );

            let to_ndc_x = 2.0 / extent.width as f32;
            let to_ndc_y = 2.0 / extent.height as f32;
            for op in ops {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline_layout,
                    0,
                    &[sets[op.texture_index]],
                    &[],
                );
                let push = QuadPush {
                    dst_rect: [
                        op.x * to_ndc_x - 1.0,
                        op.y * to_ndc_y - 1.0,
                        op.width * to_ndc_x,
                        op.height * to_ndc_y,
                    ],
                    solid_color: op.solid_color.unwrap_or([0.0; 4]),
                };
                let bytes = std::slice::from_raw_parts(
                    &push as *const QuadPush as *const u8,
                    std::mem::size_of::<QuadPush>(),
                );
                device.cmd_push_constants(
                    cmd,
                    self.pipeline_layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytes,
                );
                device.cmd_draw(cmd, 6, 1, 0, 0);
            }

            device.cmd_end_rendering(cmd);

            // Leave the target in GENERAL; the viewer transitions it on
            // import anyway and linear export readers expect raw access.
            let to_general = layout_barrier(
                self.images[index].image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::AccessFlags::MEMORY_READ,
            );
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_general],
            );

            device
                .end_command_buffer(cmd)
                .map_err(|e| composer_err("end command buffer", e))?;

            let cmds = [cmd];
            let submit = vk::SubmitInfo::default().command_buffers(&cmds);
            device
                .queue_submit(self.gpu.graphics_queue, &[submit], self.fence)
                .map_err(|e| composer_err("submit composition", e))?;
            device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(|e| composer_err("wait composition fence", e))?;
            device
                .reset_fences(&[self.fence])
                .map_err(|e| composer_err("reset composition fence", e))?;
        }

        let export = &self.images[index];
        let handle = export.fd.try_clone().map_err(|e| {
            Error::new(
                ErrorKind::CaptureFrameFailed,
                format!("Failed to dup export fd: {e}"),
            )
        })?;

        self.frame_number += 1;
        Ok(ExternalImageFrame {
            image: ExternalImage {
                width: extent.width,
                height: extent.height,
                stride: export.stride,
                offset: 0,
                format: EXPORT_FORMAT.as_raw() as u32,
                modifier: 0, // DRM_FORMAT_MOD_LINEAR
                handle: Some(handle),
                handle_kind: ExternalHandleKind::DmaBuf,
            },
            frame_number: self.frame_number,
        })
    }
}

fn layout_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
}

/// Creates one linear, exportable composition target and exports its
/// memory as a dma-buf.
fn create_export_image(ctx: &Context, extent: vk::Extent2D) -> Result<ExportImage> {
    let device = &ctx.device;

    let mut ext_mem = vk::ExternalMemoryImageCreateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
    let image_info = vk::ImageCreateInfo::default()
        .push_next(&mut ext_mem)
        .image_type(vk::ImageType::TYPE_2D)
        .format(EXPORT_FORMAT)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::LINEAR)
        .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let image = unsafe { device.create_image(&image_info, None) }
        .map_err(|e| composer_err("create export image", e))?;

    let reqs = unsafe { device.get_image_memory_requirements(image) };
    let Some(mem_type) = ctx
        .find_memory_type(reqs.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        .or_else(|| ctx.find_memory_type(reqs.memory_type_bits, vk::MemoryPropertyFlags::empty()))
    else {
        unsafe { device.destroy_image(image, None) };
        return goggles_core::error::err(ErrorKind::GpuInitFailed, "No export memory type");
    };

    let mut export_info = vk::ExportMemoryAllocateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
    let alloc = vk::MemoryAllocateInfo::default()
        .push_next(&mut export_info)
        .allocation_size(reqs.size)
        .memory_type_index(mem_type);
    let memory = match unsafe { device.allocate_memory(&alloc, None) } {
        Ok(m) => m,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            return Err(composer_err("allocate export memory", e));
        }
    };
    if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
        unsafe {
            device.free_memory(memory, None);
            device.destroy_image(image, None);
        }
        return Err(composer_err("bind export memory", e));
    }

    let subres = vk::ImageSubresource {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        array_layer: 0,
    };
    let layout = unsafe { device.get_image_subresource_layout(image, subres) };

    let fd_info = vk::MemoryGetFdInfoKHR::default()
        .memory(memory)
        .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
    let fd = match unsafe { ctx.external_memory_fd.get_memory_fd(&fd_info) } {
        Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
        Err(e) => {
            unsafe {
                device.free_memory(memory, None);
                device.destroy_image(image, None);
            }
            return Err(composer_err("export composition dma-buf", e));
        }
    };

    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(EXPORT_FORMAT)
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
            return Err(composer_err("create export view", e));
        }
    };

    Ok(ExportImage {
        image,
        memory,
        view,
        fd,
        stride: layout.row_pitch as u32,
    })
}

/// Uploads tightly packed CPU pixels as a sampled image (shm path).
fn upload_pixels(
    ctx: &Context,
    pixels: &[u8],
    width: u32,
    height: u32,
    format: vk::Format,
) -> Result<FrameTexture> {
    let device = &ctx.device;

    let staging_info = vk::BufferCreateInfo::default()
        .size(pixels.len() as u64)
        .usage(vk::BufferUsageFlags::TRANSFER_SRC)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let staging = unsafe { device.create_buffer(&staging_info, None) }
        .map_err(|e| composer_err("create shm staging", e))?;
    let staging_reqs = unsafe { device.get_buffer_memory_requirements(staging) };
    let Some(staging_type) = ctx.find_memory_type(
        staging_reqs.memory_type_bits,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    ) else {
        unsafe { device.destroy_buffer(staging, None) };
        return goggles_core::error::err(ErrorKind::GpuInitFailed, "No staging memory type");
    };
    let staging_alloc = vk::MemoryAllocateInfo::default()
        .allocation_size(staging_reqs.size)
        .memory_type_index(staging_type);
    let staging_memory = match unsafe { device.allocate_memory(&staging_alloc, None) } {
        Ok(m) => m,
        Err(e) => {
            unsafe { device.destroy_buffer(staging, None) };
            return Err(composer_err("allocate shm staging", e));
        }
    };
    let release_staging = |device: &ash::Device| unsafe {
        device.free_memory(staging_memory, None);
        device.destroy_buffer(staging, None);
    };
    if let Err(e) = unsafe { device.bind_buffer_memory(staging, staging_memory, 0) } {
        release_staging(device);
        return Err(composer_err("bind shm staging", e));
    }
    match unsafe {
        device.map_memory(staging_memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
    } {
        Ok(ptr) => unsafe {
            std::ptr::copy_nonoverlapping(pixels.as_ptr(), ptr as *mut u8, pixels.len());
            device.unmap_memory(staging_memory);
        },
        Err(e) => {
            release_staging(device);
            return Err(composer_err("map shm staging", e));
        }
    }

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
            release_staging(device);
            return Err(composer_err("create shm image", e));
        }
    };
    let reqs = unsafe { device.get_image_memory_requirements(image) };
    let Some(mem_type) =
        ctx.find_memory_type(reqs.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
    else {
        unsafe { device.destroy_image(image, None) };
        release_staging(device);
        return goggles_core::error::err(ErrorKind::GpuInitFailed, "No shm image memory type");
    };
    let alloc = vk::MemoryAllocateInfo::default()
        .allocation_size(reqs.size)
        .memory_type_index(mem_type);
    let memory = match unsafe { device.allocate_memory(&alloc, None) } {
        Ok(m) => m,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            release_staging(device);
            return Err(composer_err("allocate shm image memory", e));
        }
    };
    if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
        unsafe {
            device.free_memory(memory, None);
            device.destroy_image(image, None);
        }
        release_staging(device);
        return Err(composer_err("bind shm image memory", e));
    }

    // One-shot copy through the shared command pool.
    let upload = one_shot_upload(ctx, staging, image, width, height);
    release_staging(device);
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
            return Err(composer_err("create shm view", e));
        }
    };

    Ok(FrameTexture::Uploaded {
        image,
        memory,
        view,
    })
}

fn one_shot_upload(
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
        .map_err(|e| composer_err("allocate upload cmd", e))?[0];

    let result = unsafe {
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device
            .begin_command_buffer(cmd, &begin)
            .map_err(|e| composer_err("begin upload cmd", e))
            .and_then(|()| {
                let to_dst = layout_barrier(
                    image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                );
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
                let to_read = layout_barrier(
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                );
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_read],
                );
                device
                    .end_command_buffer(cmd)
                    .map_err(|e| composer_err("end upload cmd", e))
            })
            .and_then(|()| {
                let fence_info = vk::FenceCreateInfo::default();
                let fence = device
                    .create_fence(&fence_info, None)
                    .map_err(|e| composer_err("create upload fence", e))?;
                let cmds = [cmd];
                let submit = vk::SubmitInfo::default().command_buffers(&cmds);
                let outcome = device
                    .queue_submit(ctx.graphics_queue, &[submit], fence)
                    .map_err(|e| composer_err("submit upload", e))
                    .and_then(|()| {
                        device
                            .wait_for_fences(&[fence], true, u64::MAX)
                            .map_err(|e| composer_err("wait upload fence", e))
                    });
                device.destroy_fence(fence, None);
                outcome
            })
    };

    unsafe { device.free_command_buffers(ctx.command_pool, &[cmd]) };
    result
}
