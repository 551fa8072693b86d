//! A single preset pass: pipeline, descriptor machinery and recording.

use ash::vk;
use rustc_hash::FxHashMap;
use tracing::debug;

use goggles_core::Result;

use crate::binder::{PassPushConstants, PassUbo, SemanticBinder};
use crate::gpu::{self, Context};
use crate::preset::{FilterMode, PassConfig, WrapMode};
use crate::shader::{CompiledShader, ShaderReflection};

/// Where a sampler binding gets its image from, resolved once per preset
/// load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingSource {
    Original,
    Source,
    OriginalHistory(usize),
    PassOutput(usize),
    PassFeedback(usize),
    PresetTexture(usize),
}

/// A descriptor slot paired with its resolved source.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedBinding {
    pub binding: u32,
    pub source: BindingSource,
    pub filter: FilterMode,
    pub wrap: WrapMode,
}

/// The image a binding resolves to on a given frame.
#[derive(Debug, Clone, Copy)]
pub struct BoundImage {
    pub view: vk::ImageView,
    pub filter: FilterMode,
    pub wrap: WrapMode,
}

/// All sampler objects the chain will ever need, keyed by
/// (filter, wrap, mipmap).
pub struct SamplerSet {
    samplers: FxHashMap<(FilterMode, WrapMode, bool), vk::Sampler>,
}

impl SamplerSet {
    pub fn new(ctx: &Context) -> Result<Self> {
        let mut samplers = FxHashMap::default();
        let wraps = [
            WrapMode::ClampToBorder,
            WrapMode::ClampToEdge,
            WrapMode::Repeat,
            WrapMode::MirroredRepeat,
        ];
        for wrap in wraps {
            for filter in [FilterMode::Nearest, FilterMode::Linear] {
                for mipmap in [false, true] {
                    let vk_filter = match filter {
                        FilterMode::Nearest => vk::Filter::NEAREST,
                        FilterMode::Linear => vk::Filter::LINEAR,
                    };
                    let address_mode = match wrap {
                        WrapMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
                        WrapMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
                        WrapMode::Repeat => vk::SamplerAddressMode::REPEAT,
                        WrapMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
                    };
                    let info = vk::SamplerCreateInfo::default()
                        .mag_filter(vk_filter)
                        .min_filter(vk_filter)
                        .mipmap_mode(if mipmap {
                            vk::SamplerMipmapMode::LINEAR
                        } else {
                            vk::SamplerMipmapMode::NEAREST
                        })
                        .address_mode_u(address_mode)
                        .address_mode_v(address_mode)
                        .address_mode_w(address_mode)
                        .max_lod(if mipmap { vk::LOD_CLAMP_NONE } else { 0.0 })
                        .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
                    let sampler = unsafe { ctx.device.create_sampler(&info, None) }
                        .map_err(|e| gpu::gpu_err("create sampler", e))?;
                    samplers.insert((filter, wrap, mipmap), sampler);
                }
            }
        }
        Ok(Self { samplers })
    }

    pub fn get(&self, filter: FilterMode, wrap: WrapMode, mipmap: bool) -> vk::Sampler {
        // The constructor fills the whole matrix.
        self.samplers[&(filter, wrap, mipmap)]
    }

    pub fn destroy(&mut self, ctx: &Context) {
        for (_, sampler) in self.samplers.drain() {
            unsafe { ctx.device.destroy_sampler(sampler, None) };
        }
    }
}

struct UboSlot {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: *mut std::ffi::c_void,
}

/// One compiled preset pass with its pipeline and per-sync-index
/// descriptor sets.
pub struct FilterPass {
    pub config: PassConfig,
    pub reflection: ShaderReflection,
    pub bindings: Vec<ResolvedBinding>,
    pub target_format: vk::Format,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    descriptor_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    ubo_slots: Vec<UboSlot>,
}

// The mapped UBO pointers are only touched from the recording thread.
unsafe impl Send for FilterPass {}

impl FilterPass {
    pub fn new(
        ctx: &Context,
        config: PassConfig,
        compiled: &CompiledShader,
        target_format: vk::Format,
        sync_count: u32,
        name: &str,
    ) -> Result<Self> {
        let reflection = compiled.reflection.clone();

        let mut layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = reflection
            .samplers
            .iter()
            .map(|s| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(s.binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            })
            .collect();
        if let Some(ubo) = reflection.ubo {
            layout_bindings.push(
                vk::DescriptorSetLayoutBinding::default()
                    .binding(ubo.binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(
                        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    ),
            );
        }

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&layout_bindings);
        let descriptor_layout =
            unsafe { ctx.device.create_descriptor_set_layout(&layout_info, None) }
                .map_err(|e| gpu::gpu_err("create descriptor set layout", e))?;

        let mut pool_sizes = vec![vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: (reflection.samplers.len() as u32).max(1) * sync_count,
        }];
        if reflection.ubo.is_some() {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: sync_count,
            });
        }
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(sync_count)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe { ctx.device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| gpu::gpu_err("create descriptor pool", e))?;

        let set_layouts = vec![descriptor_layout; sync_count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&set_layouts);
        let descriptor_sets = unsafe { ctx.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| gpu::gpu_err("allocate descriptor sets", e))?;

        let (pipeline_layout, pipeline) = build_pipeline(
            ctx,
            &compiled.vertex_spirv,
            &compiled.fragment_spirv,
            descriptor_layout,
            reflection.has_push_constants,
            target_format,
        )?;

        let mut ubo_slots = Vec::new();
        if let Some(ubo) = reflection.ubo {
            for i in 0..sync_count {
                let slot = create_ubo_slot(ctx, u64::from(ubo.size))?;
                write_ubo_descriptor(ctx, descriptor_sets[i as usize], ubo.binding, slot.buffer);
                ubo_slots.push(slot);
            }
        }

        debug!(
            "FilterPass '{name}' ready (push_constants={}, samplers={})",
            reflection.has_push_constants,
            reflection.samplers.len()
        );

        Ok(Self {
            config,
            reflection,
            bindings: Vec::new(),
            target_format,
            pipeline,
            pipeline_layout,
            descriptor_layout,
            descriptor_pool,
            descriptor_sets,
            ubo_slots,
        })
    }

    /// Records this pass: descriptor writes for the sync index, dynamic
    /// rendering into `target_view`, semantic push constants/UBO, one
    /// full-screen triangle.
    pub fn record(
        &self,
        ctx: &Context,
        cmd: vk::CommandBuffer,
        sync_index: u32,
        samplers: &SamplerSet,
        images: &[BoundImage],
        binder: &SemanticBinder,
        target_view: vk::ImageView,
        output_extent: vk::Extent2D,
    ) {
        let set = self.descriptor_sets[sync_index as usize];

        let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = self
            .bindings
            .iter()
            .zip(images)
            .map(|(_, image)| {
                [vk::DescriptorImageInfo {
                    sampler: samplers.get(image.filter, image.wrap, self.config.mipmap),
                    image_view: image.view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }]
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = self
            .bindings
            .iter()
            .zip(&image_infos)
            .map(|(resolved, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(resolved.binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(info)
            })
            .collect();
        unsafe { ctx.device.update_descriptor_sets(&writes, &[]) };

        if let Some(slot) = self.ubo_slots.get(sync_index as usize) {
            let ubo: PassUbo = binder.ubo();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytemuck::bytes_of(&ubo).as_ptr(),
                    slot.mapped as *mut u8,
                    std::mem::size_of::<PassUbo>(),
                );
            }
        }

        let clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            },
        };
        let attachment = vk::RenderingAttachmentInfo::default()
            .image_view(target_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(clear);
        let color_attachments = [attachment];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: output_extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);

        unsafe {
            ctx.device.cmd_begin_rendering(cmd, &rendering_info);
            ctx.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            ctx.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[set],
                &[],
            );

            if self.reflection.has_push_constants {
                let push: PassPushConstants = binder.push_constants();
                ctx.device.cmd_push_constants(
                    cmd,
                    self.pipeline_layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(&push),
                );
            }

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: output_extent.width as f32,
                height: output_extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            ctx.device.cmd_set_viewport(cmd, 0, &[viewport]);
            ctx.device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: output_extent,
                }],
            );

            ctx.device.cmd_draw(cmd, 3, 1, 0, 0);
            ctx.device.cmd_end_rendering(cmd);
        }
    }

    pub fn destroy(&mut self, ctx: &Context) {
        unsafe {
            for slot in self.ubo_slots.drain(..) {
                ctx.device.unmap_memory(slot.memory);
                ctx.device.destroy_buffer(slot.buffer, None);
                ctx.device.free_memory(slot.memory, None);
            }
            if self.pipeline != vk::Pipeline::null() {
                ctx.device.destroy_pipeline(self.pipeline, None);
                self.pipeline = vk::Pipeline::null();
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                ctx.device.destroy_pipeline_layout(self.pipeline_layout, None);
                self.pipeline_layout = vk::PipelineLayout::null();
            }
            if self.descriptor_pool != vk::DescriptorPool::null() {
                ctx.device.destroy_descriptor_pool(self.descriptor_pool, None);
                self.descriptor_pool = vk::DescriptorPool::null();
            }
            if self.descriptor_layout != vk::DescriptorSetLayout::null() {
                ctx.device
                    .destroy_descriptor_set_layout(self.descriptor_layout, None);
                self.descriptor_layout = vk::DescriptorSetLayout::null();
            }
        }
        self.descriptor_sets.clear();
    }
}

fn create_ubo_slot(ctx: &Context, size: u64) -> Result<UboSlot> {
    let info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe { ctx.device.create_buffer(&info, None) }
        .map_err(|e| gpu::gpu_err("create ubo buffer", e))?;

    let reqs = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };
    let mem_type = ctx
        .find_memory_type(
            reqs.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .ok_or_else(|| {
            unsafe { ctx.device.destroy_buffer(buffer, None) };
            goggles_core::Error::new(
                goggles_core::ErrorKind::GpuInitFailed,
                "No host-visible memory for UBO",
            )
        })?;

    let alloc = vk::MemoryAllocateInfo::default()
        .allocation_size(reqs.size)
        .memory_type_index(mem_type);
    let memory = match unsafe { ctx.device.allocate_memory(&alloc, None) } {
        Ok(m) => m,
        Err(e) => {
            unsafe { ctx.device.destroy_buffer(buffer, None) };
            return Err(gpu::gpu_err("allocate ubo memory", e));
        }
    };
    if let Err(e) = unsafe { ctx.device.bind_buffer_memory(buffer, memory, 0) } {
        unsafe {
            ctx.device.free_memory(memory, None);
            ctx.device.destroy_buffer(buffer, None);
        }
        return Err(gpu::gpu_err("bind ubo memory", e));
    }
    let mapped = match unsafe {
        ctx.device
            .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
    } {
        Ok(p) => p,
        Err(e) => {
            unsafe {
                ctx.device.free_memory(memory, None);
                ctx.device.destroy_buffer(buffer, None);
            }
            return Err(gpu::gpu_err("map ubo memory", e));
        }
    };

    Ok(UboSlot {
        buffer,
        memory,
        mapped,
    })
}

fn write_ubo_descriptor(
    ctx: &Context,
    set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
) {
    let buffer_info = [vk::DescriptorBufferInfo {
        buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    }];
    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .buffer_info(&buffer_info);
    unsafe { ctx.device.update_descriptor_sets(&[write], &[]) };
}

/// Dynamic-rendering pipeline for a full-screen triangle pass: no vertex
/// input, dynamic viewport/scissor, single color attachment.
pub fn build_pipeline(
    ctx: &Context,
    vertex_spirv: &[u32],
    fragment_spirv: &[u32],
    descriptor_layout: vk::DescriptorSetLayout,
    has_push_constants: bool,
    color_format: vk::Format,
) -> Result<(vk::PipelineLayout, vk::Pipeline)> {
    let vert_info = vk::ShaderModuleCreateInfo::default().code(vertex_spirv);
    let vert_module = unsafe { ctx.device.create_shader_module(&vert_info, None) }
        .map_err(|e| gpu::gpu_err("create vertex shader module", e))?;

    let frag_info = vk::ShaderModuleCreateInfo::default().code(fragment_spirv);
    let frag_module = match unsafe { ctx.device.create_shader_module(&frag_info, None) } {
        Ok(m) => m,
        Err(e) => {
            unsafe { ctx.device.destroy_shader_module(vert_module, None) };
            return Err(gpu::gpu_err("create fragment shader module", e));
        }
    };

    let set_layouts = [descriptor_layout];
    let push_range = [vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        offset: 0,
        size: std::mem::size_of::<PassPushConstants>() as u32,
    }];
    let mut layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
    if has_push_constants {
        layout_info = layout_info.push_constant_ranges(&push_range);
    }
    let pipeline_layout = match unsafe { ctx.device.create_pipeline_layout(&layout_info, None) } {
        Ok(l) => l,
        Err(e) => {
            unsafe {
                ctx.device.destroy_shader_module(frag_module, None);
                ctx.device.destroy_shader_module(vert_module, None);
            }
            return Err(gpu::gpu_err("create pipeline layout", e));
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module)
            .name(c"main"),
    ];

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let blend_attachment = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    let blend_attachments = [blend_attachment];
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats = [color_format];
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .push_next(&mut rendering_info)
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(pipeline_layout);

    let result = unsafe {
        ctx.device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
    };

    unsafe {
        ctx.device.destroy_shader_module(frag_module, None);
        ctx.device.destroy_shader_module(vert_module, None);
    }

    match result {
        Ok(pipelines) => Ok((pipeline_layout, pipelines[0])),
        Err((_, e)) => {
            unsafe { ctx.device.destroy_pipeline_layout(pipeline_layout, None) };
            Err(gpu::gpu_err("create graphics pipeline", e))
        }
    }
}
