//! Instance/device bring-up for the viewer and for headless users (the
//! embedded compositor renders without any window surface).

use std::ffi::CStr;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::{debug, info, warn};

use goggles_core::{ErrorKind, Result};

use super::gpu_err;

const BASE_DEVICE_EXTENSIONS: [&CStr; 4] = [
    ash::ext::image_drm_format_modifier::NAME,
    ash::khr::external_memory_fd::NAME,
    ash::ext::external_memory_dma_buf::NAME,
    ash::khr::external_semaphore_fd::NAME,
];

/// Everything device-level the renderer shares: one graphics queue, one
/// command pool, the extension loaders, and the memory property table.
///
/// `surface` is null for headless contexts; the swapchain loader is then
/// merely constructed, never called.
pub struct Context {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub command_pool: vk::CommandPool,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
    pub surface_loader: ash::khr::surface::Instance,
    pub swapchain_loader: ash::khr::swapchain::Device,
    pub external_memory_fd: ash::khr::external_memory_fd::Device,
    pub external_semaphore_fd: ash::khr::external_semaphore_fd::Device,
    pub surface: vk::SurfaceKHR,
}

impl Context {
    /// Brings up a device able to present to the given window and import
    /// dma-buf images with explicit modifiers.
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        enable_validation: bool,
    ) -> Result<Self> {
        Self::build(Some((display_handle, window_handle)), enable_validation)
    }

    /// Brings up a device with no presentation surface, for offscreen
    /// composition and export.
    pub fn headless(enable_validation: bool) -> Result<Self> {
        Self::build(None, enable_validation)
    }

    fn build(
        window: Option<(RawDisplayHandle, RawWindowHandle)>,
        enable_validation: bool,
    ) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            goggles_core::Error::new(ErrorKind::GpuInitFailed, format!("Vulkan loader: {e}"))
        })?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"goggles")
            .application_version(1)
            .engine_name(c"goggles")
            .api_version(vk::API_VERSION_1_3);

        let mut instance_extensions: Vec<*const std::ffi::c_char> = Vec::new();
        if let Some((display_handle, _)) = &window {
            instance_extensions.push(ash::khr::surface::NAME.as_ptr());
            match display_handle {
                RawDisplayHandle::Wayland(_) => {
                    instance_extensions.push(ash::khr::wayland_surface::NAME.as_ptr());
                }
                RawDisplayHandle::Xlib(_) => {
                    instance_extensions.push(ash::khr::xlib_surface::NAME.as_ptr());
                }
                RawDisplayHandle::Xcb(_) => {
                    instance_extensions.push(ash::khr::xcb_surface::NAME.as_ptr());
                }
                _ => {
                    return goggles_core::error::err(
                        ErrorKind::GpuInitFailed,
                        "Unsupported display system for viewer window",
                    )
                }
            }
        }

        let validation_layer = c"VK_LAYER_KHRONOS_validation";
        let mut layers: Vec<*const std::ffi::c_char> = Vec::new();
        if enable_validation {
            let available = unsafe { entry.enumerate_instance_layer_properties() }
                .map_err(|e| gpu_err("enumerate_instance_layer_properties", e))?;
            let have_validation = available.iter().any(|layer| {
                layer
                    .layer_name_as_c_str()
                    .is_ok_and(|name| name == validation_layer)
            });
            if have_validation {
                layers.push(validation_layer.as_ptr());
            } else {
                warn!("Validation requested but VK_LAYER_KHRONOS_validation not present");
            }
        }

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&instance_extensions)
            .enabled_layer_names(&layers);

        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(|e| gpu_err("create_instance", e))?;

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = match &window {
            Some((display_handle, window_handle)) => {
                super::create_surface(&entry, &instance, *display_handle, *window_handle)?
            }
            None => vk::SurfaceKHR::null(),
        };

        let mut device_extensions: Vec<&CStr> = BASE_DEVICE_EXTENSIONS.to_vec();
        if window.is_some() {
            device_extensions.push(ash::khr::swapchain::NAME);
        }

        let (physical_device, graphics_queue_family) =
            select_physical_device(&instance, &surface_loader, surface, &device_extensions)?;

        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        info!(
            "Using GPU: {}",
            props
                .device_name_as_c_str()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "<unknown>".into())
        );

        let queue_priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities);
        let queue_infos = [queue_info];

        let extension_ptrs: Vec<*const std::ffi::c_char> =
            device_extensions.iter().map(|e| e.as_ptr()).collect();

        let mut features12 =
            vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);

        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut features12)
            .push_next(&mut features13);

        let device = unsafe { instance.create_device(physical_device, &device_info, None) }
            .map_err(|e| gpu_err("create_device", e))?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(graphics_queue_family);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| gpu_err("create_command_pool", e))?;

        let memory_props =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);
        let external_memory_fd = ash::khr::external_memory_fd::Device::new(&instance, &device);
        let external_semaphore_fd =
            ash::khr::external_semaphore_fd::Device::new(&instance, &device);

        debug!("Vulkan context ready (queue family {graphics_queue_family})");
        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            graphics_queue,
            graphics_queue_family,
            command_pool,
            memory_props,
            surface_loader,
            swapchain_loader,
            external_memory_fd,
            external_semaphore_fd,
            surface,
        })
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(|e| gpu_err("device_wait_idle", e))
    }

    pub fn find_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..self.memory_props.memory_type_count).find(|&i| {
            type_bits & (1 << i) != 0
                && self.memory_props.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    required_extensions: &[&CStr],
) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(|e| gpu_err("enumerate_physical_devices", e))?;

    for device in devices {
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
            .map_err(|e| gpu_err("enumerate_device_extension_properties", e))?;
        let has_all = required_extensions.iter().all(|wanted| {
            extensions.iter().any(|ext| {
                ext.extension_name_as_c_str()
                    .is_ok_and(|name| name == *wanted)
            })
        });
        if !has_all {
            continue;
        }

        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let family = families.iter().enumerate().find_map(|(index, props)| {
            let index = index as u32;
            let graphics = props.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let present = if surface == vk::SurfaceKHR::null() {
                true
            } else {
                unsafe {
                    surface_loader.get_physical_device_surface_support(device, index, surface)
                }
                .unwrap_or(false)
            };
            (graphics && present).then_some(index)
        });
        if let Some(family) = family {
            return Ok((device, family));
        }
    }

    goggles_core::error::err(
        ErrorKind::GpuInitFailed,
        "No Vulkan device with graphics support and dma-buf import",
    )
}
