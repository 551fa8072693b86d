//! Final blit pass: maps the chain output into the viewer window with a
//! selectable scale mode.

use ash::vk;

use goggles_core::Result;

use crate::gpu::{self, Context};
use crate::pass::SamplerSet;
use crate::preset::{FilterMode, WrapMode};
use crate::shader::ShaderService;

/// How the source is fitted into the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleMode {
    /// Fill the target, ignoring aspect.
    Stretch,
    /// Preserve aspect, letterbox/pillarbox.
    #[default]
    Fit,
    /// Preserve aspect, crop overflow.
    Fill,
    /// Largest whole multiple of the source that fits, centered.
    Integer,
}

/// Destination rectangle produced by the scale-mode math.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaledViewport {
    pub offset_x: i32,
    pub offset_y: i32,
    pub width: u32,
    pub height: u32,
}

/// Computes the destination viewport for a source of `src_w` x `src_h`
/// inside a target of `dst_w` x `dst_h`.
pub fn calculate_viewport(
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
    mode: ScaleMode,
) -> ScaledViewport {
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return ScaledViewport {
            offset_x: 0,
            offset_y: 0,
            width: dst_w,
            height: dst_h,
        };
    }

    match mode {
        ScaleMode::Stretch => ScaledViewport {
            offset_x: 0,
            offset_y: 0,
            width: dst_w,
            height: dst_h,
        },
        ScaleMode::Fit | ScaleMode::Fill => {
            let scale_x = dst_w as f64 / src_w as f64;
            let scale_y = dst_h as f64 / src_h as f64;
            let scale = if mode == ScaleMode::Fit {
                scale_x.min(scale_y)
            } else {
                scale_x.max(scale_y)
            };
            let width = (src_w as f64 * scale).round() as u32;
            let height = (src_h as f64 * scale).round() as u32;
            ScaledViewport {
                offset_x: (dst_w as i64 - i64::from(width)) as i32 / 2,
                offset_y: (dst_h as i64 - i64::from(height)) as i32 / 2,
                width,
                height,
            }
        }
        ScaleMode::Integer => {
            let factor = (dst_w / src_w).min(dst_h / src_h).max(1);
            let width = src_w * factor;
            let height = src_h * factor;
            ScaledViewport {
                offset_x: (dst_w as i64 - i64::from(width)) as i32 / 2,
                offset_y: (dst_h as i64 - i64::from(height)) as i32 / 2,
                width,
                height,
            }
        }
    }
}

const BLIT_VERTEX: &str = r#"
#version 450
layout(location = 0) out vec2 vTexCoord;
void main() {
    vTexCoord = vec2((gl_VertexIndex << 1) & 2, gl_VertexIndex & 2);
    gl_Position = vec4(vTexCoord * 2.0 - 1.0, 0.0, 1.0);
}
"#;

const BLIT_FRAGMENT: &str = r#"
#version 450
layout(set = 0, binding = 0) uniform sampler2D Source;
layout(location = 0) in vec2 vTexCoord;
layout(location = 0) out vec4 FragColor;
void main() {
    FragColor = texture(Source, vTexCoord);
}
"#;

/// Self-contained passthrough pass targeting the viewer's format.
pub struct OutputPass {
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    descriptor_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    pub target_format: vk::Format,
}

impl OutputPass {
    pub fn new(
        ctx: &Context,
        shader_service: &dyn ShaderService,
        target_format: vk::Format,
        sync_count: u32,
    ) -> Result<Self> {
        let compiled = shader_service.compile_pair("output-blit", BLIT_VERTEX, BLIT_FRAGMENT)?;

        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT);
        let bindings = [binding];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let descriptor_layout =
            unsafe { ctx.device.create_descriptor_set_layout(&layout_info, None) }
                .map_err(|e| gpu::gpu_err("create output descriptor layout", e))?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: sync_count,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(sync_count)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe { ctx.device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| gpu::gpu_err("create output descriptor pool", e))?;

        let set_layouts = vec![descriptor_layout; sync_count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&set_layouts);
        let descriptor_sets = unsafe { ctx.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| gpu::gpu_err("allocate output descriptor sets", e))?;

        let (pipeline_layout, pipeline) = crate::pass::build_pipeline(
            ctx,
            &compiled.vertex_spirv,
            &compiled.fragment_spirv,
            descriptor_layout,
            false,
            target_format,
        )?;

        Ok(Self {
            pipeline,
            pipeline_layout,
            descriptor_layout,
            descriptor_pool,
            descriptor_sets,
            target_format,
        })
    }

    /// Blits `source_view` into `target_view` with the requested scale
    /// mode; the area outside the scaled viewport is cleared black.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        ctx: &Context,
        cmd: vk::CommandBuffer,
        sync_index: u32,
        samplers: &SamplerSet,
        source_view: vk::ImageView,
        source_extent: vk::Extent2D,
        target_view: vk::ImageView,
        target_extent: vk::Extent2D,
        mode: ScaleMode,
    ) {
        let set = self.descriptor_sets[sync_index as usize];
        let image_info = [vk::DescriptorImageInfo {
            sampler: samplers.get(FilterMode::Linear, WrapMode::ClampToEdge, false),
            image_view: source_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info);
        unsafe { ctx.device.update_descriptor_sets(&[write], &[]) };

        let scaled = calculate_viewport(
            source_extent.width,
            source_extent.height,
            target_extent.width,
            target_extent.height,
            mode,
        );

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
                extent: target_extent,
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

            let viewport = vk::Viewport {
                x: scaled.offset_x as f32,
                y: scaled.offset_y as f32,
                width: scaled.width as f32,
                height: scaled.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            ctx.device.cmd_set_viewport(cmd, 0, &[viewport]);
            ctx.device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: target_extent,
                }],
            );

            ctx.device.cmd_draw(cmd, 3, 1, 0, 0);
            ctx.device.cmd_end_rendering(cmd);
        }
    }

    pub fn destroy(&mut self, ctx: &Context) {
        unsafe {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stretch_fills_target() {
        let v = calculate_viewport(256, 224, 1920, 1080, ScaleMode::Stretch);
        assert_eq!(
            v,
            ScaledViewport { offset_x: 0, offset_y: 0, width: 1920, height: 1080 }
        );
    }

    #[test]
    fn fit_letterboxes_wide_target() {
        // 4:3 source in a 16:9 target pillarboxes.
        let v = calculate_viewport(640, 480, 1920, 1080, ScaleMode::Fit);
        assert_eq!(v.height, 1080);
        assert_eq!(v.width, 1440);
        assert_eq!(v.offset_x, 240);
        assert_eq!(v.offset_y, 0);
    }

    #[test]
    fn fill_crops_instead() {
        let v = calculate_viewport(640, 480, 1920, 1080, ScaleMode::Fill);
        assert_eq!(v.width, 1920);
        assert_eq!(v.height, 1440);
        assert_eq!(v.offset_x, 0);
        assert_eq!(v.offset_y, -180);
    }

    #[test]
    fn integer_uses_largest_fitting_multiple() {
        let v = calculate_viewport(256, 224, 1920, 1080, ScaleMode::Integer);
        // 1920/256 = 7, 1080/224 = 4 -> factor 4.
        assert_eq!(v.width, 1024);
        assert_eq!(v.height, 896);
        assert_eq!(v.offset_x, (1920 - 1024) / 2);
        assert_eq!(v.offset_y, (1080 - 896) / 2);
    }

    #[test]
    fn integer_never_drops_below_one() {
        let v = calculate_viewport(2560, 1440, 1920, 1080, ScaleMode::Integer);
        assert_eq!(v.width, 2560);
        assert_eq!(v.height, 1440);
    }

    #[test]
    fn degenerate_sizes_fall_back_to_target() {
        let v = calculate_viewport(0, 0, 800, 600, ScaleMode::Fit);
        assert_eq!(v.width, 800);
        assert_eq!(v.height, 600);
    }
}
