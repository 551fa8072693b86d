//! Virtual WSI: a synthetic surface plus an exportable swapchain whose
//! images are plain linear dma-buf-backed Vulkan images.
//!
//! The hooked application believes it is presenting to a window; in
//! reality every "swapchain image" is exportable GPU memory the viewer
//! imports on its side.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use goggles_core::env::parse_env_u32;

use crate::LayerDeviceData;

const MIN_IMAGE_COUNT: u32 = 2;
const MAX_IMAGE_COUNT: u32 = 3;
const DEFAULT_WIDTH: u32 = 1920;
const DEFAULT_HEIGHT: u32 = 1080;

struct VirtualSurface {
    width: u32,
    height: u32,
}

struct VirtualSwapchain {
    device: ash::Device,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    memory: Vec<vk::DeviceMemory>,
    exported: Vec<OwnedFd>,
    strides: Vec<u32>,
    current_index: u32,
    last_acquire: Instant,
}

impl VirtualSwapchain {
    fn release_resources(&mut self) {
        // Exported fds first, then memory, then images; the reverse of
        // creation order.
        self.exported.clear();
        unsafe {
            for mem in self.memory.drain(..) {
                self.device.free_memory(mem, None);
            }
            for img in self.images.drain(..) {
                self.device.destroy_image(img, None);
            }
        }
    }
}

impl Drop for VirtualSwapchain {
    fn drop(&mut self) {
        self.release_resources();
    }
}

/// Data the layer's present hook needs to announce a frame to the viewer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwapchainFrameData {
    pub valid: bool,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub stride: u32,
    pub dmabuf_fd: i32,
}

struct State {
    surfaces: FxHashMap<u64, VirtualSurface>,
    swapchains: FxHashMap<u64, VirtualSwapchain>,
    next_handle: u64,
}

/// Replaces the application's presentation path with virtual objects.
///
/// Owned by the per-process layer context; handles it mints are opaque
/// non-dispatchable values that never reach the driver.
pub struct WsiVirtualizer {
    enabled: bool,
    fps_limit: u32,
    state: Mutex<State>,
}

impl WsiVirtualizer {
    pub fn new() -> Self {
        let enabled = crate::should_use_wsi_proxy();
        if enabled {
            debug!("WSI proxy mode enabled");
        }
        Self {
            enabled,
            fps_limit: parse_env_u32("GOGGLES_FPS_LIMIT", 0, 1000).unwrap_or(60),
            state: Mutex::new(State {
                surfaces: FxHashMap::default(),
                swapchains: FxHashMap::default(),
                next_handle: 1,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn create_surface(&self) -> vk::SurfaceKHR {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;

        let surface = VirtualSurface {
            width: parse_env_u32("GOGGLES_WIDTH", 1, 16384).unwrap_or(DEFAULT_WIDTH),
            height: parse_env_u32("GOGGLES_HEIGHT", 1, 16384).unwrap_or(DEFAULT_HEIGHT),
        };
        debug!(
            "Virtual surface created: {handle:#x} ({}x{})",
            surface.width, surface.height
        );
        state.surfaces.insert(handle, surface);
        vk::SurfaceKHR::from_raw(handle)
    }

    pub fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        self.state.lock().surfaces.remove(&surface.as_raw());
    }

    pub fn is_virtual_surface(&self, surface: vk::SurfaceKHR) -> bool {
        self.state.lock().surfaces.contains_key(&surface.as_raw())
    }

    pub fn surface_capabilities(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Option<vk::SurfaceCapabilitiesKHR> {
        let state = self.state.lock();
        let vs = state.surfaces.get(&surface.as_raw())?;
        let extent = vk::Extent2D {
            width: vs.width,
            height: vs.height,
        };
        Some(
            vk::SurfaceCapabilitiesKHR::default()
                .min_image_count(MIN_IMAGE_COUNT)
                .max_image_count(MAX_IMAGE_COUNT)
                .current_extent(extent)
                .min_image_extent(extent)
                .max_image_extent(extent)
                .max_image_array_layers(1)
                .supported_transforms(vk::SurfaceTransformFlagsKHR::IDENTITY)
                .current_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
                .supported_composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .supported_usage_flags(
                    vk::ImageUsageFlags::COLOR_ATTACHMENT
                        | vk::ImageUsageFlags::TRANSFER_SRC
                        | vk::ImageUsageFlags::TRANSFER_DST,
                ),
        )
    }

    pub fn surface_formats(&self) -> Vec<vk::SurfaceFormatKHR> {
        vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ]
    }

    pub fn surface_present_modes(&self) -> Vec<vk::PresentModeKHR> {
        vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE]
    }

    /// Reports support for graphics-capable queue families only.
    pub fn surface_support(
        &self,
        queue_family: u32,
        queue_family_props: &[vk::QueueFamilyProperties],
    ) -> bool {
        queue_family_props
            .get(queue_family as usize)
            .map(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .unwrap_or(false)
    }

    /// Creates an exportable virtual swapchain.
    ///
    /// The requested image count is clamped to `[2, 3]`. Any per-image
    /// failure aborts and releases everything created so far.
    pub fn create_swapchain(
        &self,
        dev: &LayerDeviceData,
        info: &vk::SwapchainCreateInfoKHR,
    ) -> Result<vk::SwapchainKHR, vk::Result> {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;

        let image_count = info.min_image_count.clamp(MIN_IMAGE_COUNT, MAX_IMAGE_COUNT);

        let mut swap = VirtualSwapchain {
            device: dev.device.clone(),
            format: info.image_format,
            extent: info.image_extent,
            images: Vec::new(),
            memory: Vec::new(),
            exported: Vec::new(),
            strides: Vec::new(),
            current_index: 0,
            last_acquire: Instant::now(),
        };

        if let Err(e) = create_exportable_images(&mut swap, dev, image_count) {
            // VirtualSwapchain::drop releases partial resources.
            return Err(e);
        }

        debug!(
            "Virtual swapchain created: {handle:#x} ({}x{}, {image_count} images)",
            swap.extent.width, swap.extent.height
        );
        state.swapchains.insert(handle, swap);
        Ok(vk::SwapchainKHR::from_raw(handle))
    }

    pub fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.state.lock().swapchains.remove(&swapchain.as_raw());
    }

    pub fn is_virtual_swapchain(&self, swapchain: vk::SwapchainKHR) -> bool {
        self.state
            .lock()
            .swapchains
            .contains_key(&swapchain.as_raw())
    }

    pub fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Option<Vec<vk::Image>> {
        let state = self.state.lock();
        state
            .swapchains
            .get(&swapchain.as_raw())
            .map(|s| s.images.clone())
    }

    /// Round-robin acquire with optional FPS pacing.
    ///
    /// When the app handed us a semaphore or fence it expects them
    /// signaled, so an empty batch is submitted for that purpose.
    pub fn acquire_next_image(
        &self,
        dev: &LayerDeviceData,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<u32, vk::Result> {
        if self.fps_limit > 0 {
            let last_acquire = {
                let state = self.state.lock();
                state
                    .swapchains
                    .get(&swapchain.as_raw())
                    .ok_or(vk::Result::ERROR_OUT_OF_DATE_KHR)?
                    .last_acquire
            };
            let frame_duration = Duration::from_nanos(1_000_000_000 / u64::from(self.fps_limit));
            let next_frame = last_acquire + frame_duration;
            let now = Instant::now();
            if now < next_frame {
                std::thread::sleep(next_frame - now);
            }
        }

        let index = {
            let mut state = self.state.lock();
            let swap = state
                .swapchains
                .get_mut(&swapchain.as_raw())
                .ok_or(vk::Result::ERROR_OUT_OF_DATE_KHR)?;
            let index = swap.current_index;
            swap.current_index = (index + 1) % swap.images.len() as u32;
            swap.last_acquire = Instant::now();
            index
        };

        if semaphore != vk::Semaphore::null() || fence != vk::Fence::null() {
            let semaphores = [semaphore];
            let mut submit = vk::SubmitInfo::default();
            if semaphore != vk::Semaphore::null() {
                submit = submit.signal_semaphores(&semaphores);
            }
            let result = unsafe {
                dev.device
                    .queue_submit(dev.graphics_queue, &[submit], fence)
            };
            if let Err(e) = result {
                warn!("acquire signal submit failed: {e:?}");
            }
        }

        Ok(index)
    }

    /// Frame description for the present hook to forward to the viewer.
    /// The returned fd stays owned by the swapchain; callers duplicate it
    /// for the wire.
    pub fn frame_data(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    ) -> SwapchainFrameData {
        let state = self.state.lock();
        let Some(swap) = state.swapchains.get(&swapchain.as_raw()) else {
            return SwapchainFrameData::default();
        };
        let idx = image_index as usize;
        if idx >= swap.exported.len() || idx >= swap.strides.len() {
            return SwapchainFrameData::default();
        }
        SwapchainFrameData {
            valid: true,
            width: swap.extent.width,
            height: swap.extent.height,
            format: swap.format.as_raw() as u32,
            stride: swap.strides[idx],
            dmabuf_fd: swap.exported[idx].as_raw_fd(),
        }
    }
}

impl Default for WsiVirtualizer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_memory_type(props: &vk::PhysicalDeviceMemoryProperties, type_bits: u32) -> Option<u32> {
    let device_local = (0..props.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0
            && props.memory_types[i as usize]
                .property_flags
                .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
    });
    device_local.or_else(|| (0..props.memory_type_count).find(|&i| type_bits & (1 << i) != 0))
}

fn create_exportable_images(
    swap: &mut VirtualSwapchain,
    dev: &LayerDeviceData,
    image_count: u32,
) -> Result<(), vk::Result> {
    let device = &dev.device;

    for i in 0..image_count {
        let mut ext_mem = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

        let img_info = vk::ImageCreateInfo::default()
            .push_next(&mut ext_mem)
            .image_type(vk::ImageType::TYPE_2D)
            .format(swap.format)
            .extent(vk::Extent3D {
                width: swap.extent.width,
                height: swap.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&img_info, None) }?;
        swap.images.push(image);

        let mem_reqs = unsafe { device.get_image_memory_requirements(image) };
        let mem_type = find_memory_type(&dev.memory_props, mem_reqs.memory_type_bits)
            .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;

        let mut export_info = vk::ExportMemoryAllocateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let alloc_info = vk::MemoryAllocateInfo::default()
            .push_next(&mut export_info)
            .allocation_size(mem_reqs.size)
            .memory_type_index(mem_type);

        let memory = unsafe { device.allocate_memory(&alloc_info, None) }?;
        swap.memory.push(memory);

        unsafe { device.bind_image_memory(image, memory, 0) }?;

        let subres = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };
        let layout = unsafe { device.get_image_subresource_layout(image, subres) };
        swap.strides.push(layout.row_pitch as u32);

        let fd_info = vk::MemoryGetFdInfoKHR::default()
            .memory(memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let fd = unsafe { dev.external_memory_fd.get_memory_fd(&fd_info) }?;
        swap.exported
            .push(unsafe { OwnedFd::from_raw_fd(fd) });

        debug!("Virtual swapchain image {i}: fd={fd}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_count_clamps_to_protocol_range() {
        assert_eq!(1u32.clamp(MIN_IMAGE_COUNT, MAX_IMAGE_COUNT), 2);
        assert_eq!(2u32.clamp(MIN_IMAGE_COUNT, MAX_IMAGE_COUNT), 2);
        assert_eq!(3u32.clamp(MIN_IMAGE_COUNT, MAX_IMAGE_COUNT), 3);
        assert_eq!(8u32.clamp(MIN_IMAGE_COUNT, MAX_IMAGE_COUNT), 3);
    }

    #[test]
    fn round_robin_visits_every_image() {
        // 2N acquires over N images must touch each index at least once.
        for n in 2..=3u32 {
            let mut current = 0u32;
            let mut seen = vec![false; n as usize];
            for _ in 0..(2 * n) {
                seen[current as usize] = true;
                current = (current + 1) % n;
            }
            assert!(seen.iter().all(|&s| s), "missed an image with n={n}");
        }
    }

    #[test]
    fn surface_support_requires_graphics_queue() {
        let virtualizer = WsiVirtualizer {
            enabled: true,
            fps_limit: 0,
            state: Mutex::new(State {
                surfaces: FxHashMap::default(),
                swapchains: FxHashMap::default(),
                next_handle: 1,
            }),
        };
        let graphics = vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
            ..Default::default()
        };
        let transfer_only = vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::TRANSFER,
            ..Default::default()
        };
        let families = [graphics, transfer_only];
        assert!(virtualizer.surface_support(0, &families));
        assert!(!virtualizer.surface_support(1, &families));
        assert!(!virtualizer.surface_support(7, &families));
    }

    #[test]
    fn virtual_surfaces_have_unique_handles_and_env_extent() {
        std::env::remove_var("GOGGLES_WIDTH");
        std::env::remove_var("GOGGLES_HEIGHT");
        let virtualizer = WsiVirtualizer {
            enabled: true,
            fps_limit: 0,
            state: Mutex::new(State {
                surfaces: FxHashMap::default(),
                swapchains: FxHashMap::default(),
                next_handle: 1,
            }),
        };
        let a = virtualizer.create_surface();
        let b = virtualizer.create_surface();
        assert_ne!(a, b);
        assert!(virtualizer.is_virtual_surface(a));

        let caps = virtualizer.surface_capabilities(a).unwrap();
        assert_eq!(caps.min_image_count, 2);
        assert_eq!(caps.max_image_count, 3);
        assert_eq!(caps.current_extent.width, DEFAULT_WIDTH);
        assert_eq!(caps.current_extent.height, DEFAULT_HEIGHT);

        virtualizer.destroy_surface(a);
        assert!(!virtualizer.is_virtual_surface(a));
        assert!(virtualizer.surface_capabilities(a).is_none());
    }

    #[test]
    fn preferred_format_is_bgra_srgb() {
        let virtualizer = WsiVirtualizer {
            enabled: true,
            fps_limit: 0,
            state: Mutex::new(State {
                surfaces: FxHashMap::default(),
                swapchains: FxHashMap::default(),
                next_handle: 1,
            }),
        };
        let formats = virtualizer.surface_formats();
        assert_eq!(formats[0].format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(formats[1].format, vk::Format::B8G8R8A8_UNORM);
        let modes = virtualizer.surface_present_modes();
        assert_eq!(modes, vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE]);
    }
}
