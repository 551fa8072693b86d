//! The viewer's presentation backend: owns swapchain and per-frame sync,
//! imports external frames, drives the filter chain and coordinates
//! cross-process timeline signaling.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::{debug, error, info, warn};

use goggles_core::{ErrorKind, ExternalImageFrame, Result};

use crate::chain::FilterChain;
use crate::gpu::{
    self, import_dmabuf_image, import_timeline_semaphore, matching_swapchain_format, Context,
    ImportedImage, Swapchain, TimelineSemaphore,
};
use crate::output::ScaleMode;
use crate::shader::{ShaderService, ShadercService};

pub const MAX_FRAMES_IN_FLIGHT: u32 = 2;

const MAX_DEFERRED_DESTROYS: usize = 4;
const FRAME_READY_TIMEOUT_NS: u64 = 100_000_000;
const RELOAD_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Extra commands drawn on top of the chain output (overlay UI).
pub type UiCallback<'a> = &'a mut dyn FnMut(vk::CommandBuffer, vk::ImageView, vk::Extent2D);

struct FrameSync {
    in_flight: vk::Fence,
    image_available: vk::Semaphore,
    command_buffer: vk::CommandBuffer,
}

struct DeferredChain {
    chain: FilterChain,
    destroy_after_frame: u64,
}

struct PendingReload {
    ready: AtomicBool,
    in_progress: AtomicBool,
    slot: Mutex<Option<(FilterChain, Arc<dyn ShaderService>, Option<PathBuf>)>>,
}

pub struct PresentationBackend {
    ctx: Arc<Context>,
    shader_service: Arc<dyn ShaderService>,
    swapchain: Swapchain,
    frames: Vec<FrameSync>,
    render_finished: Vec<vk::Semaphore>,
    chain: FilterChain,
    scale_mode: ScaleMode,
    preset_path: Option<PathBuf>,
    source_format: vk::Format,
    imported: Option<ImportedImage>,
    frame_ready_sem: Option<TimelineSemaphore>,
    frame_consumed_sem: Option<TimelineSemaphore>,
    last_frame_number: u64,
    last_signaled_frame: u64,
    frame_count: u64,
    current_frame: u32,
    needs_resize: bool,
    window_size: (u32, u32),
    pending: Arc<PendingReload>,
    reload_worker: Option<std::thread::JoinHandle<()>>,
    deferred: Vec<DeferredChain>,
}

impl PresentationBackend {
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        width: u32,
        height: u32,
        enable_validation: bool,
    ) -> Result<Self> {
        let ctx = Arc::new(Context::new(display_handle, window_handle, enable_validation)?);
        let shader_service: Arc<dyn ShaderService> = Arc::new(ShadercService::new()?);

        let swapchain = Swapchain::new(&ctx, width, height, vk::Format::B8G8R8A8_SRGB)?;
        let chain = FilterChain::new(
            &ctx,
            shader_service.as_ref(),
            swapchain.format,
            MAX_FRAMES_IN_FLIGHT,
        )?;

        let frames = create_frame_sync(&ctx)?;
        let render_finished = create_render_finished(&ctx, swapchain.images.len())?;

        Ok(Self {
            ctx,
            shader_service,
            swapchain,
            frames,
            render_finished,
            chain,
            scale_mode: ScaleMode::default(),
            preset_path: None,
            source_format: vk::Format::UNDEFINED,
            imported: None,
            frame_ready_sem: None,
            frame_consumed_sem: None,
            last_frame_number: 0,
            last_signaled_frame: 0,
            frame_count: 0,
            current_frame: 0,
            needs_resize: false,
            window_size: (width, height),
            pending: Arc::new(PendingReload {
                ready: AtomicBool::new(false),
                in_progress: AtomicBool::new(false),
                slot: Mutex::new(None),
            }),
            reload_worker: None,
            deferred: Vec::new(),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn set_scale_mode(&mut self, mode: ScaleMode) {
        self.scale_mode = mode;
    }

    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut FilterChain {
        &mut self.chain
    }

    pub fn needs_resize(&self) -> bool {
        self.needs_resize
    }

    /// Loads a preset synchronously at startup; parse failures fall back
    /// to passthrough.
    pub fn load_shader_preset(&mut self, preset_path: &std::path::Path) {
        self.preset_path = Some(preset_path.to_path_buf());
        if let Err(e) = self
            .chain
            .load_path(&self.ctx, self.shader_service.as_ref(), preset_path)
        {
            warn!(
                "Failed to load shader preset '{}': {e} - falling back to passthrough",
                preset_path.display()
            );
        }
    }

    /// Non-blocking preset reload: compiles on a worker thread and
    /// publishes through an atomic flag picked up at frame top.
    pub fn reload_shader_preset(&mut self, preset_path: Option<PathBuf>) {
        if self.pending.ready.load(Ordering::Acquire) {
            warn!("Shader reload already pending, ignoring request");
            return;
        }
        if self.pending.in_progress.swap(true, Ordering::AcqRel) {
            warn!("Shader compilation in progress, ignoring request");
            return;
        }

        let ctx = Arc::clone(&self.ctx);
        let pending = Arc::clone(&self.pending);
        let target_format = self.swapchain.format;
        let path = preset_path.clone();

        self.reload_worker = Some(std::thread::spawn(move || {
            let result = (|| -> Result<(FilterChain, Arc<dyn ShaderService>)> {
                let service: Arc<dyn ShaderService> = Arc::new(ShadercService::new()?);
                let mut chain =
                    FilterChain::new(&ctx, service.as_ref(), target_format, MAX_FRAMES_IN_FLIGHT)?;
                if let Some(path) = &path {
                    if let Err(e) = chain.load_path(&ctx, service.as_ref(), path) {
                        chain.destroy(&ctx);
                        return Err(e);
                    }
                }
                Ok((chain, service))
            })();

            match result {
                Ok((chain, service)) => {
                    *pending.slot.lock() = Some((chain, service, path.clone()));
                    pending.ready.store(true, Ordering::Release);
                    info!(
                        "Shader preset compiled: {}",
                        path.as_ref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| "(passthrough)".into())
                    );
                }
                Err(e) => {
                    error!("Async shader load failed: {e}");
                    pending.in_progress.store(false, Ordering::Release);
                }
            }
        }));
    }

    fn check_pending_chain_swap(&mut self) {
        if !self.pending.ready.load(Ordering::Acquire) {
            return;
        }
        let Some((new_chain, new_service, path)) = self.pending.slot.lock().take() else {
            self.pending.ready.store(false, Ordering::Release);
            self.pending.in_progress.store(false, Ordering::Release);
            return;
        };

        let old_chain = std::mem::replace(&mut self.chain, new_chain);
        self.shader_service = new_service;
        self.preset_path = path;

        if self.deferred.len() < MAX_DEFERRED_DESTROYS {
            self.deferred.push(DeferredChain {
                chain: old_chain,
                destroy_after_frame: self.frame_count + u64::from(MAX_FRAMES_IN_FLIGHT) + 1,
            });
        } else {
            warn!("Deferred destroy queue full, destroying immediately");
            let _ = self.ctx.wait_idle();
            let mut old_chain = old_chain;
            old_chain.destroy(&self.ctx);
        }

        self.pending.ready.store(false, Ordering::Release);
        self.pending.in_progress.store(false, Ordering::Release);
        info!(
            "Shader chain swapped: {}",
            self.preset_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(passthrough)".into())
        );
    }

    fn cleanup_deferred_destroys(&mut self) {
        let frame_count = self.frame_count;
        let ctx = Arc::clone(&self.ctx);
        self.deferred.retain_mut(|entry| {
            if frame_count >= entry.destroy_after_frame {
                debug!("Destroying deferred filter chain");
                entry.chain.destroy(&ctx);
                false
            } else {
                true
            }
        });
    }

    /// Installs the cross-process timeline pair received over the capture
    /// socket. Both fds pass ownership to the driver.
    pub fn import_sync_semaphores(
        &mut self,
        frame_ready_fd: std::os::fd::OwnedFd,
        frame_consumed_fd: std::os::fd::OwnedFd,
    ) -> Result<()> {
        self.cleanup_sync_semaphores();

        let ready = import_timeline_semaphore(&self.ctx, frame_ready_fd)?;
        let consumed = match import_timeline_semaphore(&self.ctx, frame_consumed_fd) {
            Ok(sem) => sem,
            Err(e) => {
                let mut ready = ready;
                ready.destroy(&self.ctx);
                return Err(e);
            }
        };

        self.frame_ready_sem = Some(ready);
        self.frame_consumed_sem = Some(consumed);
        self.last_frame_number = 0;
        self.last_signaled_frame = 0;
        info!("Cross-process sync semaphores imported");
        Ok(())
    }

    fn cleanup_sync_semaphores(&mut self) {
        if self.frame_ready_sem.is_some() || self.frame_consumed_sem.is_some() {
            let _ = self.ctx.wait_idle();
        }
        if let Some(mut sem) = self.frame_ready_sem.take() {
            sem.destroy(&self.ctx);
        }
        if let Some(mut sem) = self.frame_consumed_sem.take() {
            sem.destroy(&self.ctx);
        }
        self.last_frame_number = 0;
        self.last_signaled_frame = 0;
    }

    /// Renders one captured frame. Returns false when the swapchain wants
    /// a resize before the next frame.
    pub fn render_frame(
        &mut self,
        frame: &ExternalImageFrame,
        ui: Option<UiCallback<'_>>,
    ) -> Result<bool> {
        self.frame_count += 1;
        self.check_pending_chain_swap();
        self.cleanup_deferred_destroys();

        self.last_frame_number = frame.frame_number;

        let source_format = vk::Format::from_raw(frame.image.format as i32);
        if self.source_format != source_format {
            self.recreate_swapchain_for_format(source_format)?;
            self.source_format = source_format;
        }

        // Imports never persist across frames: idle, drop, re-import.
        self.ctx.wait_idle()?;
        if let Some(mut old) = self.imported.take() {
            old.destroy(&self.ctx);
        }
        let imported = match import_dmabuf_image(&self.ctx, &frame.image) {
            Ok(imported) => imported,
            Err(e) => {
                warn!("Frame import failed, skipping: {e}");
                return Ok(!self.needs_resize);
            }
        };
        self.imported = Some(imported);

        let image_index = self.acquire_next_image()?;
        self.record_render_commands(image_index, ui)?;
        self.submit_and_present(image_index)
    }

    /// Clears the window (no capture connected).
    pub fn render_clear(&mut self, ui: Option<UiCallback<'_>>) -> Result<bool> {
        self.frame_count += 1;
        self.check_pending_chain_swap();
        self.cleanup_deferred_destroys();

        let image_index = self.acquire_next_image()?;
        self.record_clear_commands(image_index, ui)?;
        self.submit_and_present(image_index)
    }

    pub fn handle_resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.window_size = (width, height);
        self.recreate_swapchain(self.swapchain.format)?;
        self.needs_resize = false;
        Ok(())
    }

    fn recreate_swapchain(&mut self, preferred_format: vk::Format) -> Result<()> {
        self.ctx.wait_idle()?;

        for sem in self.render_finished.drain(..) {
            unsafe { self.ctx.device.destroy_semaphore(sem, None) };
        }
        self.swapchain.destroy(&self.ctx);
        self.swapchain = Swapchain::new(
            &self.ctx,
            self.window_size.0,
            self.window_size.1,
            preferred_format,
        )?;
        self.render_finished = create_render_finished(&self.ctx, self.swapchain.images.len())?;
        Ok(())
    }

    /// An SRGB↔UNORM mismatch between producer and swapchain would bend
    /// the transfer curve twice; rebuild both swapchain and chain in the
    /// matching family.
    fn recreate_swapchain_for_format(&mut self, source_format: vk::Format) -> Result<()> {
        let wanted = matching_swapchain_format(source_format);
        if self.swapchain.format == wanted {
            return Ok(());
        }
        info!(
            "Source format {source_format:?}: swapchain moves to {wanted:?}"
        );
        self.recreate_swapchain(wanted)?;

        let mut new_chain = FilterChain::new(
            &self.ctx,
            self.shader_service.as_ref(),
            self.swapchain.format,
            MAX_FRAMES_IN_FLIGHT,
        )?;
        if let Some(path) = self.preset_path.clone() {
            if let Err(e) =
                new_chain.load_path(&self.ctx, self.shader_service.as_ref(), &path)
            {
                warn!("Preset reload after format change failed: {e}");
            }
        }
        let mut old = std::mem::replace(&mut self.chain, new_chain);
        old.destroy(&self.ctx);
        Ok(())
    }

    fn acquire_next_image(&mut self) -> Result<u32> {
        let frame = &self.frames[self.current_frame as usize];

        unsafe {
            self.ctx
                .device
                .wait_for_fences(&[frame.in_flight], true, u64::MAX)
        }
        .map_err(|e| gpu::gpu_err("fence wait", e))?;

        let acquired = unsafe {
            self.ctx.swapchain_loader.acquire_next_image(
                self.swapchain.handle,
                u64::MAX,
                frame.image_available,
                vk::Fence::null(),
            )
        };
        let image_index = match acquired {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    self.needs_resize = true;
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.needs_resize = true;
                return goggles_core::error::err(
                    ErrorKind::GpuInitFailed,
                    "Swapchain out of date",
                );
            }
            Err(e) => return Err(gpu::gpu_err("acquire_next_image", e)),
        };

        unsafe { self.ctx.device.reset_fences(&[frame.in_flight]) }
            .map_err(|e| gpu::gpu_err("fence reset", e))?;
        Ok(image_index)
    }

    fn record_render_commands(
        &mut self,
        image_index: u32,
        mut ui: Option<UiCallback<'_>>,
    ) -> Result<()> {
        let cmd = self.frames[self.current_frame as usize].command_buffer;
        let device = &self.ctx.device;

        unsafe { device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()) }
            .map_err(|e| gpu::gpu_err("command buffer reset", e))?;
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin) }
            .map_err(|e| gpu::gpu_err("command buffer begin", e))?;

        let imported = self
            .imported
            .as_ref()
            .ok_or_else(|| goggles_core::Error::new(ErrorKind::GpuInitFailed, "No imported frame"))?;

        let src_barrier = image_barrier(
            imported.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::SHADER_READ,
        );
        let dst_barrier = image_barrier(
            self.swapchain.images[image_index as usize],
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        );
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::FRAGMENT_SHADER
                    | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[src_barrier, dst_barrier],
            );
        }

        let target_view = self.swapchain.views[image_index as usize];
        let imported_view = imported.view;
        let imported_extent = imported.extent;
        let imported_image = imported.image;
        let imported_format = imported.format;
        self.chain.record(
            &self.ctx,
            cmd,
            imported_view,
            imported_extent,
            imported_image,
            imported_format,
            target_view,
            self.swapchain.extent,
            self.current_frame,
            self.scale_mode,
        )?;

        if let Some(ui) = ui.as_deref_mut() {
            ui(cmd, target_view, self.swapchain.extent);
        }

        let present_barrier = image_barrier(
            self.swapchain.images[image_index as usize],
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags::empty(),
        );
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[present_barrier],
            );
            device
                .end_command_buffer(cmd)
                .map_err(|e| gpu::gpu_err("command buffer end", e))?;
        }
        Ok(())
    }

    fn record_clear_commands(
        &mut self,
        image_index: u32,
        mut ui: Option<UiCallback<'_>>,
    ) -> Result<()> {
        let cmd = self.frames[self.current_frame as usize].command_buffer;
        let device = &self.ctx.device;

        unsafe { device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()) }
            .map_err(|e| gpu::gpu_err("command buffer reset", e))?;
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin) }
            .map_err(|e| gpu::gpu_err("command buffer begin", e))?;

        let image = self.swapchain.images[image_index as usize];
        let to_attachment = image_barrier(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        );
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_attachment],
            );

            let clear = vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            };
            let attachment = vk::RenderingAttachmentInfo::default()
                .image_view(self.swapchain.views[image_index as usize])
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(clear);
            let color_attachments = [attachment];
            let rendering_info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: self.swapchain.extent,
                })
                .layer_count(1)
                .color_attachments(&color_attachments);
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_end_rendering(cmd);
        }

        if let Some(ui) = ui.as_deref_mut() {
            ui(cmd, self.swapchain.views[image_index as usize], self.swapchain.extent);
        }

        let present_barrier = image_barrier(
            image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags::empty(),
        );
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[present_barrier],
            );
            device
                .end_command_buffer(cmd)
                .map_err(|e| gpu::gpu_err("command buffer end", e))?;
        }
        Ok(())
    }

    fn submit_and_present(&mut self, image_index: u32) -> Result<bool> {
        let in_flight = self.frames[self.current_frame as usize].in_flight;
        let image_available = self.frames[self.current_frame as usize].image_available;
        let command_buffer = self.frames[self.current_frame as usize].command_buffer;
        let render_finished = self.render_finished[image_index as usize];

        // Cross-process: never sample a frame the producer has not
        // finished writing.
        if self.last_frame_number > 0 {
            let timed_out = match &self.frame_ready_sem {
                Some(ready) => {
                    !ready.wait(&self.ctx, self.last_frame_number, FRAME_READY_TIMEOUT_NS)?
                }
                None => false,
            };
            if timed_out {
                warn!("Timeout waiting for frame_ready semaphore, producer disconnected?");
                self.cleanup_sync_semaphores();
            }
        }

        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];

        let should_signal_timeline = self.frame_consumed_sem.is_some()
            && self.last_frame_number > self.last_signaled_frame;

        let mut submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers);

        let signal_both;
        let signal_one;
        let signal_values = [0u64, self.last_frame_number];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&signal_values);
        if should_signal_timeline {
            let consumed = self.frame_consumed_sem.as_ref().map(|s| s.semaphore);
            signal_both = [render_finished, consumed.unwrap_or_default()];
            submit = submit
                .push_next(&mut timeline_info)
                .signal_semaphores(&signal_both);
        } else {
            signal_one = [render_finished];
            submit = submit.signal_semaphores(&signal_one);
        }

        unsafe {
            self.ctx
                .device
                .queue_submit(self.ctx.graphics_queue, &[submit], in_flight)
        }
        .map_err(|e| gpu::gpu_err("queue submit", e))?;

        if should_signal_timeline {
            self.last_signaled_frame = self.last_frame_number;
        }

        let wait = [render_finished];
        let swapchains = [self.swapchain.handle];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);

        match unsafe {
            self.ctx
                .swapchain_loader
                .queue_present(self.ctx.graphics_queue, &present_info)
        } {
            Ok(suboptimal) => {
                if suboptimal {
                    self.needs_resize = true;
                }
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.needs_resize = true;
            }
            Err(e) => return Err(gpu::gpu_err("present", e)),
        }

        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(!self.needs_resize)
    }
}

impl Drop for PresentationBackend {
    fn drop(&mut self) {
        // Give an in-flight compile a bounded window; a straggler's
        // result is discarded.
        if let Some(worker) = self.reload_worker.take() {
            let deadline = Instant::now() + RELOAD_JOIN_TIMEOUT;
            while !worker.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                warn!("Shader compile worker still running at shutdown; discarding");
            }
        }
        if let Some((mut chain, _, _)) = self.pending.slot.lock().take() {
            chain.destroy(&self.ctx);
        }

        let _ = self.ctx.wait_idle();
        self.cleanup_sync_semaphores();
        if let Some(mut imported) = self.imported.take() {
            imported.destroy(&self.ctx);
        }
        for mut entry in self.deferred.drain(..) {
            entry.chain.destroy(&self.ctx);
        }
        self.chain.destroy(&self.ctx);

        unsafe {
            for sem in self.render_finished.drain(..) {
                self.ctx.device.destroy_semaphore(sem, None);
            }
            for frame in self.frames.drain(..) {
                self.ctx.device.destroy_fence(frame.in_flight, None);
                self.ctx.device.destroy_semaphore(frame.image_available, None);
            }
        }
        self.swapchain.destroy(&self.ctx);
    }
}

fn image_barrier(
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

fn create_frame_sync(ctx: &Context) -> Result<Vec<FrameSync>> {
    let alloc = vk::CommandBufferAllocateInfo::default()
        .command_pool(ctx.command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(MAX_FRAMES_IN_FLIGHT);
    let command_buffers = unsafe { ctx.device.allocate_command_buffers(&alloc) }
        .map_err(|e| gpu::gpu_err("allocate command buffers", e))?;

    let mut frames = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT as usize);
    for cmd in command_buffers {
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let in_flight = unsafe { ctx.device.create_fence(&fence_info, None) }
            .map_err(|e| gpu::gpu_err("create fence", e))?;
        let sem_info = vk::SemaphoreCreateInfo::default();
        let image_available = unsafe { ctx.device.create_semaphore(&sem_info, None) }
            .map_err(|e| gpu::gpu_err("create semaphore", e))?;
        frames.push(FrameSync {
            in_flight,
            image_available,
            command_buffer: cmd,
        });
    }
    Ok(frames)
}

fn create_render_finished(ctx: &Context, count: usize) -> Result<Vec<vk::Semaphore>> {
    let mut semaphores = Vec::with_capacity(count);
    for _ in 0..count {
        let info = vk::SemaphoreCreateInfo::default();
        let sem = unsafe { ctx.device.create_semaphore(&info, None) }
            .map_err(|e| gpu::gpu_err("create render-finished semaphore", e))?;
        semaphores.push(sem);
    }
    Ok(semaphores)
}
