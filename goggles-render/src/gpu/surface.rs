//! Surface creation from raw window handles (wayland / xlib / xcb).

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use goggles_core::{ErrorKind, Result};

use super::gpu_err;

pub fn create_surface(
    entry: &ash::Entry,
    instance: &ash::Instance,
    display_handle: RawDisplayHandle,
    window_handle: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    match (display_handle, window_handle) {
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let info = vk::WaylandSurfaceCreateInfoKHR::default()
                .display(display.display.as_ptr())
                .surface(window.surface.as_ptr());
            let loader = ash::khr::wayland_surface::Instance::new(entry, instance);
            unsafe { loader.create_wayland_surface(&info, None) }
                .map_err(|e| gpu_err("create_wayland_surface", e))
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let dpy = display
                .display
                .map(|d| d.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let info = vk::XlibSurfaceCreateInfoKHR::default()
                .dpy(dpy as *mut vk::Display)
                .window(window.window);
            let loader = ash::khr::xlib_surface::Instance::new(entry, instance);
            unsafe { loader.create_xlib_surface(&info, None) }
                .map_err(|e| gpu_err("create_xlib_surface", e))
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let connection = display
                .connection
                .map(|c| c.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let info = vk::XcbSurfaceCreateInfoKHR::default()
                .connection(connection)
                .window(window.window.get());
            let loader = ash::khr::xcb_surface::Instance::new(entry, instance);
            unsafe { loader.create_xcb_surface(&info, None) }
                .map_err(|e| gpu_err("create_xcb_surface", e))
        }
        _ => goggles_core::error::err(
            ErrorKind::GpuInitFailed,
            "Window and display handle kinds do not match",
        ),
    }
}
