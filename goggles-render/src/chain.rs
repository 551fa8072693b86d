//! The multi-pass filter chain: preset graph → pass pipeline sequence,
//! intermediate framebuffers, binding resolution, history and feedback
//! rings, frame recording.

use std::collections::VecDeque;
use std::path::Path;

use ash::vk;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use goggles_core::{Error, ErrorKind, Result};

use crate::binder::SemanticBinder;
use crate::framebuffer::{vk_format_for, Framebuffer};
use crate::gpu::Context;
use crate::lut::LutTexture;
use crate::output::{OutputPass, ScaleMode};
use crate::pass::{BindingSource, BoundImage, FilterPass, ResolvedBinding, SamplerSet};
use crate::preset::{PassConfig, PresetGraph, ScaleType};
use crate::shader::ShaderService;

/// A tweakable parameter row exposed to the host UI.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterValue {
    pub pass_index: usize,
    pub name: String,
    pub current: f32,
    pub default: f32,
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

/// Computes a pass's output extent from its scale config.
pub fn calculate_pass_output_size(
    config: &PassConfig,
    source_extent: vk::Extent2D,
    viewport_extent: vk::Extent2D,
) -> vk::Extent2D {
    let axis = |ty: ScaleType, scale: f32, source: u32, viewport: u32| -> u32 {
        let value = match ty {
            ScaleType::Source => (source as f32 * scale).round(),
            ScaleType::Viewport => (viewport as f32 * scale).round(),
            ScaleType::Absolute => scale.round(),
        };
        (value as u32).max(1)
    };
    vk::Extent2D {
        width: axis(
            config.scale_type_x,
            config.scale_x,
            source_extent.width,
            viewport_extent.width,
        ),
        height: axis(
            config.scale_type_y,
            config.scale_y,
            source_extent.height,
            viewport_extent.height,
        ),
    }
}

/// Parses `PrefixK` names with an all-digits suffix.
fn parse_indexed(name: &str, prefix: &str) -> Option<usize> {
    let suffix = name.strip_prefix(prefix)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Resolves a sampler name against the graph for the pass at `pass_index`.
pub fn resolve_binding_name(
    name: &str,
    pass_index: usize,
    aliases: &FxHashMap<String, usize>,
    texture_names: &[String],
) -> Option<BindingSource> {
    match name {
        "Original" => return Some(BindingSource::Original),
        "Source" => return Some(BindingSource::Source),
        _ => {}
    }
    if let Some(k) = parse_indexed(name, "OriginalHistory") {
        return Some(BindingSource::OriginalHistory(k));
    }
    if let Some(k) = parse_indexed(name, "PassOutput") {
        return (k < pass_index).then_some(BindingSource::PassOutput(k));
    }
    if let Some(k) = parse_indexed(name, "PassFeedback") {
        return Some(BindingSource::PassFeedback(k));
    }
    if let Some(&pass) = aliases.get(name) {
        return (pass < pass_index).then_some(BindingSource::PassOutput(pass));
    }
    if let Some(idx) = texture_names.iter().position(|t| t == name) {
        return Some(BindingSource::PresetTexture(idx));
    }
    None
}

/// Splits a single-file slang-style shader into its vertex and fragment
/// GLSL sources; lines outside any `#pragma stage` block are shared.
pub fn split_stages(source: &str) -> (String, String) {
    #[derive(PartialEq)]
    enum Stage {
        Shared,
        Vertex,
        Fragment,
    }
    let mut vertex = String::new();
    let mut fragment = String::new();
    let mut stage = Stage::Shared;

    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("#pragma stage vertex") {
            stage = Stage::Vertex;
            continue;
        }
        if trimmed.starts_with("#pragma stage fragment") {
            stage = Stage::Fragment;
            continue;
        }
        match stage {
            Stage::Shared => {
                vertex.push_str(line);
                vertex.push('\n');
                fragment.push_str(line);
                fragment.push('\n');
            }
            Stage::Vertex => {
                vertex.push_str(line);
                vertex.push('\n');
            }
            Stage::Fragment => {
                fragment.push_str(line);
                fragment.push('\n');
            }
        }
    }
    (vertex, fragment)
}

/// Parses a shader preset into a pass sequence and drives per-frame
/// recording. Owns every intermediate framebuffer, resolved binding and
/// compiled pipeline.
pub struct FilterChain {
    target_format: vk::Format,
    sync_count: u32,
    samplers: SamplerSet,
    output_pass: OutputPass,
    passes: Vec<FilterPass>,
    framebuffers: Vec<Option<Framebuffer>>,
    feedback: Vec<Option<Framebuffer>>,
    history: VecDeque<Framebuffer>,
    history_depth: usize,
    luts: Vec<LutTexture>,
    parameters: Vec<ParameterValue>,
    frame_count: u32,
    binder: SemanticBinder,
}

impl FilterChain {
    /// Creates a chain in passthrough mode (no preset loaded).
    pub fn new(
        ctx: &Context,
        shader_service: &dyn ShaderService,
        target_format: vk::Format,
        sync_count: u32,
    ) -> Result<Self> {
        let samplers = SamplerSet::new(ctx)?;
        let output_pass = OutputPass::new(ctx, shader_service, target_format, sync_count)?;
        debug!("FilterChain initialized (passthrough mode)");
        Ok(Self {
            target_format,
            sync_count,
            samplers,
            output_pass,
            passes: Vec::new(),
            framebuffers: Vec::new(),
            feedback: Vec::new(),
            history: VecDeque::new(),
            history_depth: 0,
            luts: Vec::new(),
            parameters: Vec::new(),
            frame_count: 0,
            binder: SemanticBinder::new(),
        })
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn parameters(&self) -> &[ParameterValue] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<f32> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.current)
    }

    pub fn set_parameter(&mut self, name: &str, value: f32) -> bool {
        match self.parameters.iter_mut().find(|p| p.name == name) {
            Some(p) => {
                p.current = value;
                true
            }
            None => false,
        }
    }

    /// Loads a preset from disk. On error the previous graph stays
    /// intact and keeps rendering.
    pub fn load_path(
        &mut self,
        ctx: &Context,
        shader_service: &dyn ShaderService,
        preset_path: &Path,
    ) -> Result<()> {
        let graph = PresetGraph::load(preset_path)?;
        self.load(ctx, shader_service, graph)
    }

    /// Consumes a parsed preset graph. Either fully succeeds, replacing
    /// the previous graph and resetting the frame counter, or returns an
    /// error leaving the previous graph untouched.
    pub fn load(
        &mut self,
        ctx: &Context,
        shader_service: &dyn ShaderService,
        graph: PresetGraph,
    ) -> Result<()> {
        let mut aliases: FxHashMap<String, usize> = FxHashMap::default();
        for (i, pass) in graph.passes.iter().enumerate() {
            if let Some(alias) = &pass.alias {
                aliases.insert(alias.clone(), i);
            }
        }
        let texture_names: Vec<String> = graph.textures.iter().map(|t| t.name.clone()).collect();

        let mut new_passes: Vec<FilterPass> = Vec::with_capacity(graph.passes.len());
        let mut new_parameters: Vec<ParameterValue> = Vec::new();
        let mut history_depth = 0usize;

        let build = (|| -> Result<()> {
            for (i, config) in graph.passes.iter().enumerate() {
                let is_final = i + 1 == graph.passes.len();
                let target_format = if is_final {
                    self.target_format
                } else {
                    vk_format_for(config.framebuffer_format, self.target_format)
                };

                let source = std::fs::read_to_string(&config.shader_path).map_err(|e| {
                    Error::new(
                        ErrorKind::ShaderLoadFailed,
                        format!("{}: {e}", config.shader_path.display()),
                    )
                })?;
                let (vertex_source, fragment_source) = split_stages(&source);
                let name = config
                    .shader_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("pass{i}"));

                let compiled =
                    shader_service.compile_pair(&name, &vertex_source, &fragment_source)?;

                let mut pass = FilterPass::new(
                    ctx,
                    config.clone(),
                    &compiled,
                    target_format,
                    self.sync_count,
                    &name,
                )?;

                // Resolve every named sampler once; unresolved names fall
                // back to the pass source.
                pass.bindings = pass
                    .reflection
                    .samplers
                    .iter()
                    .map(|sampler| {
                        let source = resolve_binding_name(
                            &sampler.name,
                            i,
                            &aliases,
                            &texture_names,
                        )
                        .unwrap_or_else(|| {
                            warn!(
                                "Pass {i}: unresolved sampler '{}', defaulting to Source",
                                sampler.name
                            );
                            BindingSource::Source
                        });
                        if let BindingSource::OriginalHistory(k) = source {
                            history_depth = history_depth.max(k);
                        }
                        ResolvedBinding {
                            binding: sampler.binding,
                            source,
                            filter: config.filter_mode,
                            wrap: config.wrap_mode,
                        }
                    })
                    .collect();

                for param in &pass.reflection.parameters {
                    if new_parameters.iter().any(|p| p.name == param.name) {
                        continue;
                    }
                    let current = graph
                        .parameters
                        .iter()
                        .find(|o| o.name == param.name)
                        .map(|o| o.value)
                        .unwrap_or(param.default);
                    new_parameters.push(ParameterValue {
                        pass_index: i,
                        name: param.name.clone(),
                        current,
                        default: param.default,
                        min: param.min,
                        max: param.max,
                        step: param.step,
                    });
                }

                new_passes.push(pass);
            }
            Ok(())
        })();

        if let Err(e) = build {
            for mut pass in new_passes {
                pass.destroy(ctx);
            }
            return Err(e);
        }

        let mut new_luts = Vec::with_capacity(graph.textures.len());
        for texture in &graph.textures {
            match LutTexture::load(ctx, texture) {
                Ok(lut) => new_luts.push(lut),
                Err(e) => {
                    for mut lut in new_luts {
                        lut.destroy(ctx);
                    }
                    for mut pass in new_passes {
                        pass.destroy(ctx);
                    }
                    return Err(e);
                }
            }
        }

        // Commit: tear down the old graph, install the new one.
        self.clear_graph(ctx);
        let pass_count = new_passes.len();
        self.framebuffers = (0..pass_count.saturating_sub(1)).map(|_| None).collect();
        self.feedback = (0..pass_count).map(|_| None).collect();
        self.passes = new_passes;
        self.luts = new_luts;
        self.parameters = new_parameters;
        self.history_depth = history_depth;
        self.frame_count = 0;
        self.binder = SemanticBinder::new();

        info!("FilterChain loaded preset ({pass_count} passes, history depth {history_depth})");
        Ok(())
    }

    /// Records the whole chain for one frame.
    ///
    /// `target_view` must already be in `COLOR_ATTACHMENT_OPTIMAL`; the
    /// imported original must be in `SHADER_READ_ONLY_OPTIMAL`.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        ctx: &Context,
        cmd: vk::CommandBuffer,
        original_view: vk::ImageView,
        original_extent: vk::Extent2D,
        original_image: vk::Image,
        original_format: vk::Format,
        target_view: vk::ImageView,
        viewport_extent: vk::Extent2D,
        sync_index: u32,
        scale_mode: ScaleMode,
    ) -> Result<()> {
        if self.passes.is_empty() {
            self.output_pass.record(
                ctx,
                cmd,
                sync_index,
                &self.samplers,
                original_view,
                original_extent,
                target_view,
                viewport_extent,
                scale_mode,
            );
            self.frame_count = self.frame_count.wrapping_add(1);
            return Ok(());
        }

        // Feedback ping-pong happens before any sizing so a feedback
        // binding observes last frame's output.
        for i in 0..self.passes.len().saturating_sub(1) {
            if self.passes[i].config.feedback {
                if let (Some(fb), Some(feedback)) =
                    (self.framebuffers[i].as_mut(), self.feedback[i].as_mut())
                {
                    std::mem::swap(fb, feedback);
                }
            }
        }

        // Output extents track the live source size; compute every frame.
        let mut extents = Vec::with_capacity(self.passes.len());
        let mut source_extent = original_extent;
        for (i, pass) in self.passes.iter().enumerate() {
            let is_final = i + 1 == self.passes.len();
            let extent = if is_final {
                viewport_extent
            } else {
                calculate_pass_output_size(&pass.config, source_extent, viewport_extent)
            };
            extents.push(extent);
            source_extent = extent;
        }

        for i in 0..self.passes.len().saturating_sub(1) {
            let format = self.passes[i].target_format;
            ensure_framebuffer(ctx, &mut self.framebuffers[i], format, extents[i])?;
            if self.passes[i].config.feedback {
                let created_or_resized =
                    ensure_framebuffer(ctx, &mut self.feedback[i], format, extents[i])?;
                if created_or_resized {
                    if let Some(feedback) = &self.feedback[i] {
                        clear_to_shader_read(ctx, cmd, feedback.image);
                    }
                }
            }
        }

        // Alias sizes cover the whole graph before any pass samples them.
        self.binder.clear_alias_sizes();
        let alias_sizes: Vec<(String, vk::Extent2D)> = self
            .passes
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.config.alias.clone().map(|a| (a, extents[i])))
            .collect();
        for (alias, extent) in alias_sizes {
            self.binder.set_alias_size(&alias, extent.width, extent.height);
        }
        self.binder
            .set_original_size(original_extent.width, original_extent.height);
        self.binder
            .set_final_viewport_size(viewport_extent.width, viewport_extent.height);
        self.binder.set_frame_count(self.frame_count);

        let mut source_view = original_view;
        let mut source_extent = original_extent;

        for i in 0..self.passes.len() {
            let is_final = i + 1 == self.passes.len();
            let output_extent = extents[i];

            self.binder
                .set_source_size(source_extent.width, source_extent.height);
            self.binder
                .set_output_size(output_extent.width, output_extent.height);

            let images = self.resolve_images(i, original_view, source_view);

            let (view, image) = if is_final {
                (target_view, vk::Image::null())
            } else {
                let fb = self.framebuffers[i].as_ref().ok_or_else(|| {
                    Error::new(ErrorKind::GpuInitFailed, "Missing pass framebuffer")
                })?;
                (fb.view, fb.image)
            };

            if !is_final {
                // The target may hold last frame's pixels in shader-read
                // layout; contents are cleared by the pass load op.
                transition_to_color_attachment(ctx, cmd, image);
            }

            self.passes[i].record(
                ctx,
                cmd,
                sync_index,
                &self.samplers,
                &images,
                &self.binder,
                view,
                output_extent,
            );

            if !is_final {
                transition_to_shader_read(ctx, cmd, image);
                source_view = view;
                source_extent = output_extent;
            }
        }

        if self.history_depth > 0 {
            self.push_history(ctx, cmd, original_image, original_extent, original_format)?;
        }

        self.frame_count = self.frame_count.wrapping_add(1);
        Ok(())
    }

    fn resolve_images(
        &self,
        pass_index: usize,
        original_view: vk::ImageView,
        source_view: vk::ImageView,
    ) -> SmallVec<[BoundImage; 8]> {
        let pass = &self.passes[pass_index];
        pass.bindings
            .iter()
            .map(|binding| {
                let view = match binding.source {
                    BindingSource::Original => original_view,
                    BindingSource::Source => source_view,
                    BindingSource::OriginalHistory(k) => {
                        if k == 0 {
                            original_view
                        } else {
                            // The ring primes with the current frame until
                            // k real frames exist.
                            self.history
                                .get(k - 1)
                                .map(|fb| fb.view)
                                .unwrap_or(original_view)
                        }
                    }
                    BindingSource::PassOutput(k) => self.framebuffers[k]
                        .as_ref()
                        .map(|fb| fb.view)
                        .unwrap_or(source_view),
                    BindingSource::PassFeedback(k) => self
                        .feedback
                        .get(k)
                        .and_then(|f| f.as_ref())
                        .map(|fb| fb.view)
                        .unwrap_or(source_view),
                    BindingSource::PresetTexture(t) => self.luts[t].view,
                };
                let (filter, wrap) = match binding.source {
                    BindingSource::PresetTexture(t) => {
                        (self.luts[t].filter, self.luts[t].wrap)
                    }
                    _ => (binding.filter, binding.wrap),
                };
                BoundImage { view, filter, wrap }
            })
            .collect()
    }

    /// Enqueues the current original into the history ring: index 0 is
    /// this frame, k is k frames old.
    fn push_history(
        &mut self,
        ctx: &Context,
        cmd: vk::CommandBuffer,
        original_image: vk::Image,
        original_extent: vk::Extent2D,
        original_format: vk::Format,
    ) -> Result<()> {
        let recycled = if self.history.len() >= self.history_depth {
            self.history.pop_back()
        } else {
            None
        };
        let mut slot = match recycled {
            Some(slot) => slot,
            None => Framebuffer::new(ctx, original_format, original_extent)?,
        };
        slot.ensure(ctx, original_format, original_extent)?;

        copy_image_for_history(ctx, cmd, original_image, slot.image, original_extent);

        self.history.push_front(slot);
        Ok(())
    }

    fn clear_graph(&mut self, ctx: &Context) {
        for mut pass in self.passes.drain(..) {
            pass.destroy(ctx);
        }
        for fb in self.framebuffers.drain(..).flatten() {
            let mut fb = fb;
            fb.destroy(ctx);
        }
        for fb in self.feedback.drain(..).flatten() {
            let mut fb = fb;
            fb.destroy(ctx);
        }
        for mut fb in self.history.drain(..) {
            fb.destroy(ctx);
        }
        for mut lut in self.luts.drain(..) {
            lut.destroy(ctx);
        }
        self.parameters.clear();
        self.history_depth = 0;
    }

    pub fn destroy(&mut self, ctx: &Context) {
        self.clear_graph(ctx);
        self.output_pass.destroy(ctx);
        self.samplers.destroy(ctx);
    }
}

fn ensure_framebuffer(
    ctx: &Context,
    slot: &mut Option<Framebuffer>,
    format: vk::Format,
    extent: vk::Extent2D,
) -> Result<bool> {
    match slot {
        Some(fb) => fb.ensure(ctx, format, extent),
        None => {
            *slot = Some(Framebuffer::new(ctx, format, extent)?);
            Ok(true)
        }
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn transition_to_color_attachment(ctx: &Context, cmd: vk::CommandBuffer, image: vk::Image) {
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_range());
    unsafe {
        ctx.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

fn transition_to_shader_read(ctx: &Context, cmd: vk::CommandBuffer, image: vk::Image) {
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ)
        .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_range());
    unsafe {
        ctx.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// New feedback buffers start black so a pass never samples undefined
/// memory on its first frame.
fn clear_to_shader_read(ctx: &Context, cmd: vk::CommandBuffer, image: vk::Image) {
    let to_dst = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_range());
    let clear = vk::ClearColorValue {
        float32: [0.0, 0.0, 0.0, 1.0],
    };
    let to_read = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ)
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_range());
    unsafe {
        ctx.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_dst],
        );
        ctx.device.cmd_clear_color_image(
            cmd,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear,
            &[color_range()],
        );
        ctx.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_read],
        );
    }
}

/// Copies the imported original into a history slot and leaves both in
/// shader-read layout.
fn copy_image_for_history(
    ctx: &Context,
    cmd: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    extent: vk::Extent2D,
) {
    let src_to_transfer = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_READ)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
        .old_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(src)
        .subresource_range(color_range());
    let dst_to_transfer = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(dst)
        .subresource_range(color_range());

    let region = vk::ImageCopy {
        src_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        src_offset: vk::Offset3D::default(),
        dst_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        dst_offset: vk::Offset3D::default(),
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    };

    let src_back = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_READ)
        .dst_access_mask(vk::AccessFlags::SHADER_READ)
        .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(src)
        .subresource_range(color_range());
    let dst_to_read = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ)
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(dst)
        .subresource_range(color_range());

    unsafe {
        ctx.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[src_to_transfer, dst_to_transfer],
        );
        ctx.device.cmd_copy_image(
            cmd,
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
        ctx.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[src_back, dst_to_read],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::{FilterMode, FramebufferFormat, WrapMode};

    fn pass_config(
        scale_type_x: ScaleType,
        scale_type_y: ScaleType,
        scale_x: f32,
        scale_y: f32,
    ) -> PassConfig {
        PassConfig {
            shader_path: "pass.slang".into(),
            scale_type_x,
            scale_type_y,
            scale_x,
            scale_y,
            filter_mode: FilterMode::Nearest,
            wrap_mode: WrapMode::ClampToBorder,
            framebuffer_format: FramebufferFormat::Unorm8,
            mipmap: false,
            alias: None,
            feedback: false,
        }
    }

    const SOURCE: vk::Extent2D = vk::Extent2D {
        width: 256,
        height: 224,
    };
    const VIEWPORT: vk::Extent2D = vk::Extent2D {
        width: 1920,
        height: 1080,
    };

    #[test]
    fn source_scale_multiplies_source_extent() {
        let config = pass_config(ScaleType::Source, ScaleType::Source, 2.0, 2.0);
        let size = calculate_pass_output_size(&config, SOURCE, VIEWPORT);
        assert_eq!(size.width, 512);
        assert_eq!(size.height, 448);
    }

    #[test]
    fn viewport_scale_multiplies_viewport_extent() {
        let config = pass_config(ScaleType::Viewport, ScaleType::Viewport, 0.5, 0.5);
        let size = calculate_pass_output_size(&config, SOURCE, VIEWPORT);
        assert_eq!(size.width, 960);
        assert_eq!(size.height, 540);
    }

    #[test]
    fn absolute_scale_is_pixel_dimensions() {
        let config = pass_config(ScaleType::Absolute, ScaleType::Absolute, 640.0, 480.0);
        let size = calculate_pass_output_size(&config, SOURCE, VIEWPORT);
        assert_eq!(size.width, 640);
        assert_eq!(size.height, 480);
    }

    #[test]
    fn mixed_axis_scale_types() {
        let config = pass_config(ScaleType::Source, ScaleType::Viewport, 4.0, 1.0);
        let size = calculate_pass_output_size(&config, SOURCE, VIEWPORT);
        assert_eq!(size.width, 1024);
        assert_eq!(size.height, 1080);
    }

    #[test]
    fn output_size_is_clamped_to_one() {
        let config = pass_config(ScaleType::Source, ScaleType::Source, 0.0, 0.0);
        let size = calculate_pass_output_size(&config, SOURCE, VIEWPORT);
        assert_eq!(size.width, 1);
        assert_eq!(size.height, 1);
    }

    #[test]
    fn fractional_scaling_rounds() {
        let config = pass_config(ScaleType::Source, ScaleType::Source, 1.5, 1.5);
        let size = calculate_pass_output_size(&config, SOURCE, VIEWPORT);
        assert_eq!(size.width, 384);
        assert_eq!(size.height, 336);
    }

    #[test]
    fn original_history_names_parse_strictly() {
        assert_eq!(parse_indexed("OriginalHistory0", "OriginalHistory"), Some(0));
        assert_eq!(parse_indexed("OriginalHistory3", "OriginalHistory"), Some(3));
        assert_eq!(parse_indexed("OriginalHistory99", "OriginalHistory"), Some(99));
        assert_eq!(parse_indexed("OriginalHistory", "OriginalHistory"), None);
        assert_eq!(parse_indexed("OriginalHistoryX", "OriginalHistory"), None);
        assert_eq!(parse_indexed("OriginalHistory-1", "OriginalHistory"), None);
        assert_eq!(parse_indexed("Original", "OriginalHistory"), None);
    }

    #[test]
    fn binding_resolution_covers_well_known_names() {
        let mut aliases = FxHashMap::default();
        aliases.insert("DerezedPass".to_string(), 0usize);
        let textures = vec!["SamplerLUT1".to_string()];

        let resolve = |name: &str, pass: usize| resolve_binding_name(name, pass, &aliases, &textures);

        assert_eq!(resolve("Original", 2), Some(BindingSource::Original));
        assert_eq!(resolve("Source", 2), Some(BindingSource::Source));
        assert_eq!(
            resolve("OriginalHistory3", 2),
            Some(BindingSource::OriginalHistory(3))
        );
        assert_eq!(resolve("PassOutput0", 2), Some(BindingSource::PassOutput(0)));
        assert_eq!(
            resolve("PassFeedback1", 2),
            Some(BindingSource::PassFeedback(1))
        );
        assert_eq!(resolve("DerezedPass", 2), Some(BindingSource::PassOutput(0)));
        assert_eq!(
            resolve("SamplerLUT1", 2),
            Some(BindingSource::PresetTexture(0))
        );
        assert_eq!(resolve("NoSuchThing", 2), None);
    }

    #[test]
    fn pass_output_must_reference_an_earlier_pass() {
        let aliases = FxHashMap::default();
        assert_eq!(resolve_binding_name("PassOutput1", 1, &aliases, &[]), None);
        assert_eq!(resolve_binding_name("PassOutput2", 1, &aliases, &[]), None);
        assert_eq!(
            resolve_binding_name("PassOutput0", 1, &aliases, &[]),
            Some(BindingSource::PassOutput(0))
        );
    }

    #[test]
    fn alias_of_later_pass_does_not_resolve() {
        let mut aliases = FxHashMap::default();
        aliases.insert("BloomPass".to_string(), 3usize);
        assert_eq!(resolve_binding_name("BloomPass", 2, &aliases, &[]), None);
        assert_eq!(
            resolve_binding_name("BloomPass", 4, &aliases, &[]),
            Some(BindingSource::PassOutput(3))
        );
    }

    #[test]
    fn stage_splitting_shares_common_lines() {
        let source = "#version 450\n#pragma stage vertex\nvoid main() { v(); }\n#pragma stage fragment\nvoid main() { f(); }\n";
        let (vs, fs) = split_stages(source);
        assert!(vs.starts_with("#version 450\n"));
        assert!(fs.starts_with("#version 450\n"));
        assert!(vs.contains("v();"));
        assert!(!vs.contains("f();"));
        assert!(fs.contains("f();"));
        assert!(!fs.contains("v();"));
    }
}
