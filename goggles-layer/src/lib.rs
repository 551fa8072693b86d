//! Producer-side core of the Goggles capture layer.
//!
//! The layer sits inside the intercepted application's Vulkan loader
//! chain. Two pieces live here: the WSI virtualizer, which replaces the
//! app's presentation surface with an exportable virtual swapchain, and
//! the frame dumper, a debug sink that copies selected frames to disk.
//!
//! Nothing in this crate owns an instance or device; the hooked
//! application does. The layer holds cloned ash handles in a
//! [`LayerDeviceData`] record registered per device.

pub mod dump;
mod ppm;
pub mod virtual_swapchain;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

pub use dump::FrameDumper;
pub use virtual_swapchain::{SwapchainFrameData, WsiVirtualizer};

/// Per-device handles the layer captured at `vkCreateDevice` time.
pub struct LayerDeviceData {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub external_memory_fd: ash::khr::external_memory_fd::Device,
}

/// Per-process registry keyed by raw device handle.
///
/// The virtualizer and dumper are owned here rather than in module-level
/// statics; the registry is created at layer load and torn down at layer
/// unload, so nothing outlives the loader chain.
#[derive(Default)]
pub struct LayerRegistry {
    devices: Mutex<FxHashMap<u64, std::sync::Arc<LayerDeviceData>>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_device(&self, data: LayerDeviceData) {
        let key = data.device.handle().as_raw();
        self.devices.lock().insert(key, std::sync::Arc::new(data));
    }

    pub fn unregister_device(&self, device: vk::Device) {
        self.devices.lock().remove(&device.as_raw());
    }

    pub fn device_data(&self, device: vk::Device) -> Option<std::sync::Arc<LayerDeviceData>> {
        self.devices.lock().get(&device.as_raw()).cloned()
    }
}

/// True when both `GOGGLES_WSI_PROXY` and `GOGGLES_CAPTURE` are enabled.
pub fn should_use_wsi_proxy() -> bool {
    goggles_core::env::env_flag("GOGGLES_WSI_PROXY") && goggles_core::env::env_flag("GOGGLES_CAPTURE")
}
