//! Minimal ash wrapper the rest of the crate renders through: device
//! bring-up, swapchain ownership, external-memory import/export and
//! timeline semaphores.

mod context;
mod external;
mod surface;
mod swapchain;

pub use context::Context;
pub use external::{
    import_dmabuf_image, import_timeline_semaphore, ImportedImage, TimelineSemaphore,
};
pub use surface::create_surface;
pub use swapchain::{is_srgb_format, matching_swapchain_format, Swapchain};

use ash::vk;
use goggles_core::{Error, ErrorKind};

pub(crate) fn gpu_err(context: &str, result: vk::Result) -> Error {
    let kind = if result == vk::Result::ERROR_DEVICE_LOST {
        ErrorKind::GpuDeviceLost
    } else {
        ErrorKind::GpuInitFailed
    };
    Error::new(kind, format!("{context}: {result:?}"))
}
