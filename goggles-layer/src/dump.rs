//! Debug frame dumper: copies selected presented frames into host-visible
//! buffers on the GPU timeline and writes them to disk on a drain pass.
//!
//! Everything here is best-effort. The dumper lives inside someone else's
//! process; a failed dump must never take the application down with it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, warn};

use goggles_core::spsc;
use goggles_wire::protocol::TextureDesc;

use crate::ppm::{self, DumpDescription};
use crate::LayerDeviceData;

const JOB_QUEUE_CAPACITY: usize = 64;
const DEFAULT_DUMP_DIR: &str = "/tmp/goggles_dump";

/// An inclusive frame-number range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpRange {
    pub begin: u64,
    pub end: u64,
}

/// Parses `"3,5,8-13"` style range sets: comma-separated single numbers or
/// inclusive ranges, sorted and merged. Zero is not a valid frame number;
/// malformed items are skipped.
pub fn parse_frame_ranges(spec: &str) -> Vec<DumpRange> {
    let mut ranges = Vec::new();
    for item in spec.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (begin, end) = match item.split_once('-') {
            Some((a, b)) => {
                let Ok(begin) = a.trim().parse::<u64>() else {
                    continue;
                };
                let Ok(end) = b.trim().parse::<u64>() else {
                    continue;
                };
                (begin, end)
            }
            None => match item.parse::<u64>() {
                Ok(v) => (v, v),
                Err(_) => continue,
            },
        };
        if begin == 0 || end == 0 {
            continue;
        }
        let (begin, end) = if end < begin { (end, begin) } else { (begin, end) };
        ranges.push(DumpRange { begin, end });
    }

    ranges.sort_by_key(|r| r.begin);
    let mut merged: Vec<DumpRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match merged.last_mut() {
            Some(last) if r.begin <= last.end + 1 => last.end = last.end.max(r.end),
            _ => merged.push(r),
        }
    }
    merged
}

/// Binary search over merged, sorted ranges.
pub fn ranges_contain(ranges: &[DumpRange], frame_number: u64) -> bool {
    let mut lo = 0usize;
    let mut hi = ranges.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if frame_number < ranges[mid].begin {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    if lo == 0 {
        return false;
    }
    let r = ranges[lo - 1];
    frame_number >= r.begin && frame_number <= r.end
}

fn supported_dump_format(format: u32) -> Option<bool> {
    // Returns is_bgra for the 8-bit UNORM/SRGB set, None otherwise.
    match vk::Format::from_raw(format as i32) {
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => Some(true),
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => Some(false),
        _ => None,
    }
}

/// One pending GPU→CPU copy.
struct DumpJob {
    device: ash::Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    frame_number: u64,
    width: u32,
    height: u32,
    format: u32,
    src: TextureDesc,
    is_bgra: bool,
    memory_is_coherent: bool,
}

impl DumpJob {
    fn release(self) {
        release_resources(
            &self.device,
            self.fence,
            self.pool,
            self.cmd,
            self.buffer,
            self.memory,
        );
    }
}

fn release_resources(
    device: &ash::Device,
    fence: vk::Fence,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
) {
    unsafe {
        if fence != vk::Fence::null() {
            device.destroy_fence(fence, None);
        }
        if cmd != vk::CommandBuffer::null() && pool != vk::CommandPool::null() {
            device.free_command_buffers(pool, &[cmd]);
        }
        if pool != vk::CommandPool::null() {
            device.destroy_command_pool(pool, None);
        }
        if buffer != vk::Buffer::null() {
            device.destroy_buffer(buffer, None);
        }
        if memory != vk::DeviceMemory::null() {
            device.free_memory(memory, None);
        }
    }
}

/// A timeline wait attached to an export-path dump submit.
#[derive(Debug, Clone, Copy)]
pub struct TimelineWait {
    pub semaphore: vk::Semaphore,
    pub value: u64,
}

/// Schedules and drains debug frame dumps, configured from environment
/// variables at construction.
pub struct FrameDumper {
    enabled: bool,
    dump_dir: PathBuf,
    process_name: String,
    ranges: Vec<DumpRange>,
    jobs_tx: spsc::SpscSender<DumpJob>,
    jobs_rx: Mutex<spsc::SpscReceiver<DumpJob>>,
    submit_lock: Mutex<()>,
    dropped_overflow: AtomicU64,
}

impl FrameDumper {
    pub fn from_env() -> Self {
        let dump_dir = match std::env::var("GOGGLES_DUMP_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from(DEFAULT_DUMP_DIR),
        };

        if let Ok(mode) = std::env::var("GOGGLES_DUMP_FRAME_MODE") {
            if !mode.is_empty() && !mode.eq_ignore_ascii_case("ppm") {
                warn!("GOGGLES_DUMP_FRAME_MODE='{mode}' is unsupported, using ppm");
            }
        }

        let ranges = std::env::var("GOGGLES_DUMP_FRAME_RANGE")
            .ok()
            .filter(|spec| !spec.is_empty())
            .map(|spec| parse_frame_ranges(&spec))
            .unwrap_or_default();

        let enabled = !ranges.is_empty();
        if enabled {
            debug!("Frame dump enabled: {} range(s) into {dump_dir:?}", ranges.len());
        }

        let (jobs_tx, jobs_rx) = spsc::channel(JOB_QUEUE_CAPACITY);
        Self {
            enabled,
            dump_dir,
            process_name: ppm::process_name(),
            ranges,
            jobs_tx,
            jobs_rx: Mutex::new(jobs_rx),
            submit_lock: Mutex::new(()),
            dropped_overflow: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn should_dump_frame(&self, frame_number: u64) -> bool {
        self.enabled && ranges_contain(&self.ranges, frame_number)
    }

    /// Frames skipped because the job queue was full.
    pub fn dropped_overflow(&self) -> u64 {
        self.dropped_overflow.load(Ordering::Relaxed)
    }

    /// Schedules a copy of a presented swapchain image, honoring the
    /// present submit's binary wait semaphores.
    #[allow(clippy::too_many_arguments)]
    pub fn try_schedule_present_dump(
        &self,
        dev: &LayerDeviceData,
        image: vk::Image,
        width: u32,
        height: u32,
        format: u32,
        frame_number: u64,
        src: TextureDesc,
        wait_semaphores: &[vk::Semaphore],
    ) -> bool {
        if !self.should_dump_frame(frame_number) || image == vk::Image::null() {
            return false;
        }
        let Some(is_bgra) = supported_dump_format(format) else {
            return false;
        };
        self.schedule(
            dev,
            image,
            width,
            height,
            format,
            frame_number,
            src,
            is_bgra,
            CopyKind::Present,
            wait_semaphores,
            None,
        )
    }

    /// Schedules a copy of an exportable-view image gated on a timeline
    /// value (the producer's frame-ready signal for this frame).
    #[allow(clippy::too_many_arguments)]
    pub fn try_schedule_export_dump(
        &self,
        dev: &LayerDeviceData,
        image: vk::Image,
        width: u32,
        height: u32,
        format: u32,
        frame_number: u64,
        src: TextureDesc,
        wait: TimelineWait,
    ) -> bool {
        if !self.should_dump_frame(frame_number) || image == vk::Image::null() {
            return false;
        }
        let Some(is_bgra) = supported_dump_format(format) else {
            return false;
        };
        self.schedule(
            dev,
            image,
            width,
            height,
            format,
            frame_number,
            src,
            is_bgra,
            CopyKind::Export,
            &[],
            Some(wait),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule(
        &self,
        dev: &LayerDeviceData,
        image: vk::Image,
        width: u32,
        height: u32,
        format: u32,
        frame_number: u64,
        src: TextureDesc,
        is_bgra: bool,
        kind: CopyKind,
        wait_semaphores: &[vk::Semaphore],
        timeline_wait: Option<TimelineWait>,
    ) -> bool {
        let size = u64::from(width) * u64::from(height) * 4;
        if size == 0 {
            return false;
        }
        let device = &dev.device;

        let Some((buffer, memory, coherent)) = create_staging(dev, size) else {
            return false;
        };
        let Some((pool, cmd)) = create_transient_commands(dev) else {
            release_resources(device, vk::Fence::null(), vk::CommandPool::null(),
                vk::CommandBuffer::null(), buffer, memory);
            return false;
        };
        let fence_info = vk::FenceCreateInfo::default();
        let Ok(fence) = (unsafe { device.create_fence(&fence_info, None) }) else {
            release_resources(device, vk::Fence::null(), pool, cmd, buffer, memory);
            return false;
        };

        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let record_ok = unsafe {
            device.begin_command_buffer(cmd, &begin).is_ok() && {
                match kind {
                    CopyKind::Present => {
                        record_present_copy(device, cmd, image, width, height, buffer)
                    }
                    CopyKind::Export => {
                        record_export_copy(device, cmd, image, width, height, buffer)
                    }
                }
                device.end_command_buffer(cmd).is_ok()
            }
        };
        if !record_ok {
            release_resources(device, fence, pool, cmd, buffer, memory);
            return false;
        }

        let job = DumpJob {
            device: device.clone(),
            buffer,
            memory,
            pool,
            cmd,
            fence,
            frame_number,
            width,
            height,
            format,
            src,
            is_bgra,
            memory_is_coherent: coherent,
        };

        let wait_stages = vec![vk::PipelineStageFlags::TRANSFER; wait_semaphores.len().max(1)];
        let timeline_values = [timeline_wait.map(|w| w.value).unwrap_or(0)];
        let timeline_sems = [timeline_wait.map(|w| w.semaphore).unwrap_or_default()];
        let cmds = [cmd];

        let mut submit = vk::SubmitInfo::default().command_buffers(&cmds);
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().wait_semaphore_values(&timeline_values);
        if timeline_wait.is_some() {
            submit = submit
                .push_next(&mut timeline_info)
                .wait_semaphores(&timeline_sems)
                .wait_dst_stage_mask(&wait_stages[..1]);
        } else if !wait_semaphores.is_empty() {
            submit = submit
                .wait_semaphores(wait_semaphores)
                .wait_dst_stage_mask(&wait_stages);
        }

        // The submit and the enqueue decision stay under one lock: once
        // the GPU owns the job's resources they must reach the queue, so
        // capacity is checked first. A full queue skips the frame without
        // submitting; a failed submit leaves nothing in flight.
        {
            let _guard = self.submit_lock.lock();
            if self.jobs_tx.len() >= self.jobs_tx.capacity() {
                self.dropped_overflow.fetch_add(1, Ordering::Relaxed);
            } else if unsafe {
                device
                    .queue_submit(dev.graphics_queue, &[submit], job.fence)
                    .is_ok()
            } {
                return match self.jobs_tx.try_push(job) {
                    Ok(()) => true,
                    Err(job) => {
                        // The GPU owns the job now; wait the copy out
                        // before releasing anything.
                        warn!("dump job queue rejected a submitted job");
                        self.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                        let _ = unsafe {
                            job.device.wait_for_fences(&[job.fence], true, u64::MAX)
                        };
                        job.release();
                        false
                    }
                };
            }
        }
        job.release();
        false
    }

    /// Pops pending jobs in order, waits for each copy, writes the files
    /// and releases the per-job GPU objects.
    pub fn drain(&self) {
        let rx = self.jobs_rx.lock();
        while let Some(job) = rx.try_pop() {
            self.drain_job(job);
        }
    }

    fn drain_job(&self, job: DumpJob) {
        unsafe {
            let _ = job.device.wait_for_fences(&[job.fence], true, u64::MAX);
        }

        if std::fs::create_dir_all(&self.dump_dir).is_err() {
            warn!("Failed to create dump directory {:?}", self.dump_dir);
            job.release();
            return;
        }

        let base = format!("{}_{}", self.process_name, job.frame_number);
        let ppm_path = self.dump_dir.join(format!("{base}.ppm"));
        let desc_path = self.dump_dir.join(format!("{base}.ppm.desc"));

        let desc = DumpDescription {
            process_name: &self.process_name,
            pid: std::process::id(),
            frame_number: job.frame_number,
            width: job.width,
            height: job.height,
            format: job.format,
            stride: job.src.stride,
            offset: job.src.offset,
            modifier: job.src.modifier,
        };

        let size = u64::from(job.width) * u64::from(job.height) * 4;
        let mapped = unsafe {
            job.device
                .map_memory(job.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        };
        match mapped {
            Ok(ptr) => {
                if !job.memory_is_coherent {
                    let range = vk::MappedMemoryRange::default()
                        .memory(job.memory)
                        .offset(0)
                        .size(vk::WHOLE_SIZE);
                    let _ = unsafe { job.device.invalidate_mapped_memory_ranges(&[range]) };
                }
                let pixels =
                    unsafe { std::slice::from_raw_parts(ptr as *const u8, size as usize) };
                if let Err(e) = ppm::write_ppm(&ppm_path, pixels, job.width, job.height, job.is_bgra)
                {
                    warn!("Failed to write {ppm_path:?}: {e}");
                }
                if let Err(e) = ppm::write_desc(&desc_path, &desc) {
                    warn!("Failed to write {desc_path:?}: {e}");
                }
                unsafe { job.device.unmap_memory(job.memory) };
            }
            Err(_) => {
                // Still leave the sidecar behind as a breadcrumb.
                let _ = ppm::write_desc(&desc_path, &desc);
            }
        }

        job.release();
    }
}

enum CopyKind {
    Present,
    Export,
}

fn create_staging(dev: &LayerDeviceData, size: u64) -> Option<(vk::Buffer, vk::DeviceMemory, bool)> {
    let device = &dev.device;
    let buf_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(vk::BufferUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe { device.create_buffer(&buf_info, None) }.ok()?;

    let reqs = unsafe { device.get_buffer_memory_requirements(buffer) };
    let Some((mem_type, coherent)) = find_host_memory_type(&dev.memory_props, reqs.memory_type_bits)
    else {
        unsafe { device.destroy_buffer(buffer, None) };
        return None;
    };

    let alloc = vk::MemoryAllocateInfo::default()
        .allocation_size(reqs.size)
        .memory_type_index(mem_type);
    let memory = match unsafe { device.allocate_memory(&alloc, None) } {
        Ok(m) => m,
        Err(_) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return None;
        }
    };

    if unsafe { device.bind_buffer_memory(buffer, memory, 0) }.is_err() {
        unsafe {
            device.free_memory(memory, None);
            device.destroy_buffer(buffer, None);
        }
        return None;
    }

    Some((buffer, memory, coherent))
}

/// Host-visible, preferring coherent. Returns (index, is_coherent).
fn find_host_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
) -> Option<(u32, bool)> {
    let mut fallback = None;
    for i in 0..props.memory_type_count {
        if type_bits & (1 << i) == 0 {
            continue;
        }
        let flags = props.memory_types[i as usize].property_flags;
        if !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            continue;
        }
        let coherent = flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        if coherent {
            return Some((i, true));
        }
        if fallback.is_none() {
            fallback = Some((i, false));
        }
    }
    fallback
}

fn create_transient_commands(
    dev: &LayerDeviceData,
) -> Option<(vk::CommandPool, vk::CommandBuffer)> {
    let device = &dev.device;
    let pool_info = vk::CommandPoolCreateInfo::default()
        .flags(
            vk::CommandPoolCreateFlags::TRANSIENT
                | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
        .queue_family_index(dev.graphics_queue_family);
    let pool = unsafe { device.create_command_pool(&pool_info, None) }.ok()?;

    let alloc = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    match unsafe { device.allocate_command_buffers(&alloc) } {
        Ok(cmds) => Some((pool, cmds[0])),
        Err(_) => {
            unsafe { device.destroy_command_pool(pool, None) };
            None
        }
    }
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn copy_region(width: u32, height: u32) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
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
    }
}

/// Present path: the image sits in PRESENT_SRC and must end up there again.
unsafe fn record_present_copy(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    buffer: vk::Buffer,
) {
    let to_transfer = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
        .old_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range());
    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        vk::PipelineStageFlags::TRANSFER,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[to_transfer],
    );

    device.cmd_copy_image_to_buffer(
        cmd,
        image,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        buffer,
        &[copy_region(width, height)],
    );

    let to_present = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_READ)
        .dst_access_mask(vk::AccessFlags::empty())
        .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range());
    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[to_present],
    );
}

/// Export path: virtual swapchain images live in GENERAL; one copy, no
/// transitions.
unsafe fn record_export_copy(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    buffer: vk::Buffer,
) {
    device.cmd_copy_image_to_buffer(
        cmd,
        image,
        vk::ImageLayout::GENERAL,
        buffer,
        &[copy_region(width, height)],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_singles_and_ranges() {
        let ranges = parse_frame_ranges("3,5,8-13");
        assert_eq!(
            ranges,
            vec![
                DumpRange { begin: 3, end: 3 },
                DumpRange { begin: 5, end: 5 },
                DumpRange { begin: 8, end: 13 },
            ]
        );
    }

    #[test]
    fn sorts_and_merges_overlaps() {
        let ranges = parse_frame_ranges("10-20, 1, 15-25, 2, 21");
        assert_eq!(
            ranges,
            vec![
                DumpRange { begin: 1, end: 2 },
                DumpRange { begin: 10, end: 25 },
            ]
        );
    }

    #[test]
    fn adjacent_ranges_coalesce() {
        let ranges = parse_frame_ranges("1-3,4-6");
        assert_eq!(ranges, vec![DumpRange { begin: 1, end: 6 }]);
    }

    #[test]
    fn reversed_bounds_are_swapped() {
        let ranges = parse_frame_ranges("13-8");
        assert_eq!(ranges, vec![DumpRange { begin: 8, end: 13 }]);
    }

    #[test]
    fn zero_and_garbage_items_are_skipped() {
        assert!(parse_frame_ranges("0").is_empty());
        assert!(parse_frame_ranges("0-5").is_empty());
        assert!(parse_frame_ranges("abc,,-,x-y").is_empty());
        let ranges = parse_frame_ranges("abc,7");
        assert_eq!(ranges, vec![DumpRange { begin: 7, end: 7 }]);
    }

    #[test]
    fn membership_scenario_frames_1_to_11() {
        // GOGGLES_DUMP_FRAME_RANGE=3,5,8-10 over frames 1..=11 must select
        // exactly {3, 5, 8, 9, 10}.
        let ranges = parse_frame_ranges("3,5,8-10");
        let selected: Vec<u64> = (1..=11).filter(|&f| ranges_contain(&ranges, f)).collect();
        assert_eq!(selected, vec![3, 5, 8, 9, 10]);
    }

    #[test]
    fn membership_on_empty_ranges() {
        assert!(!ranges_contain(&[], 1));
    }

    #[test]
    fn format_support_table() {
        const B8G8R8A8_UNORM: u32 = 44;
        const B8G8R8A8_SRGB: u32 = 50;
        const R8G8B8A8_UNORM: u32 = 37;
        const R8G8B8A8_SRGB: u32 = 43;
        const R16G16B16A16_SFLOAT: u32 = 97;
        assert_eq!(supported_dump_format(B8G8R8A8_UNORM), Some(true));
        assert_eq!(supported_dump_format(B8G8R8A8_SRGB), Some(true));
        assert_eq!(supported_dump_format(R8G8B8A8_UNORM), Some(false));
        assert_eq!(supported_dump_format(R8G8B8A8_SRGB), Some(false));
        assert_eq!(supported_dump_format(R16G16B16A16_SFLOAT), None);
    }

    #[test]
    fn env_config_round_trip() {
        std::env::set_var("GOGGLES_DUMP_FRAME_RANGE", "2-4");
        std::env::set_var("GOGGLES_DUMP_DIR", "/tmp/goggles-dump-test");
        let dumper = FrameDumper::from_env();
        assert!(dumper.enabled());
        assert!(dumper.should_dump_frame(3));
        assert!(!dumper.should_dump_frame(5));
        assert_eq!(dumper.dropped_overflow(), 0);
        std::env::remove_var("GOGGLES_DUMP_FRAME_RANGE");
        std::env::remove_var("GOGGLES_DUMP_DIR");

        let disabled = FrameDumper::from_env();
        assert!(!disabled.enabled());
        assert!(!disabled.should_dump_frame(3));
    }
}
