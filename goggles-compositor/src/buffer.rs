//! Guest buffer plumbing: wl_shm pools and linux-dmabuf imports.
//!
//! Both paths end in a [`BufferBacking`] the composer can turn into a
//! sampled texture: shm gives CPU pixels, dmabuf gives an fd plus layout.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use wayland_protocols::wp::linux_dmabuf::zv1::server::{
    zwp_linux_buffer_params_v1, zwp_linux_dmabuf_v1,
};
use wayland_server::protocol::{wl_buffer, wl_shm, wl_shm_pool};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};

use crate::state::ServerState;

/// DRM fourcc codes the composer accepts from dmabuf clients.
const DRM_FORMAT_ARGB8888: u32 = 0x34325241;
const DRM_FORMAT_XRGB8888: u32 = 0x34325258;
const DRM_FORMAT_MOD_LINEAR: u64 = 0;
const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

pub(crate) fn create_globals(dh: &DisplayHandle) {
    dh.create_global::<ServerState, wl_shm::WlShm, ()>(1, ());
    dh.create_global::<ServerState, zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()>(3, ());
}

/// A mapped shm pool. The mapping lives until every buffer created from
/// the pool is gone.
pub(crate) struct ShmPool {
    ptr: *mut libc::c_void,
    len: usize,
}

unsafe impl Send for ShmPool {}
unsafe impl Sync for ShmPool {}

impl ShmPool {
    fn map(fd: &OwnedFd, size: usize) -> Option<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        Some(Self { ptr, len: size })
    }

    /// Copies `height` rows of `width`x4 pixels out of the pool.
    pub fn read_pixels(
        &self,
        offset: usize,
        width: u32,
        height: u32,
        stride: u32,
    ) -> Option<Vec<u8>> {
        let stride = stride as usize;
        let row_bytes = width as usize * 4;
        let end = offset + stride * height as usize;
        if end > self.len || row_bytes > stride {
            return None;
        }
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for y in 0..height as usize {
            let row = unsafe {
                std::slice::from_raw_parts(
                    (self.ptr as *const u8).add(offset + y * stride),
                    row_bytes,
                )
            };
            pixels.extend_from_slice(row);
        }
        Some(pixels)
    }
}

impl Drop for ShmPool {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

/// What a committed wl_buffer is backed by.
pub(crate) enum BufferBacking {
    Shm {
        pool: Arc<ShmPool>,
        offset: usize,
        width: u32,
        height: u32,
        stride: u32,
        /// True for xrgb/argb byte order (BGRA in memory).
        is_bgra: bool,
    },
    Dmabuf {
        fd: OwnedFd,
        width: u32,
        height: u32,
        stride: u32,
        offset: u32,
        modifier: u64,
        fourcc: u32,
    },
}

impl BufferBacking {
    pub fn size(&self) -> (u32, u32) {
        match self {
            BufferBacking::Shm { width, height, .. } => (*width, *height),
            BufferBacking::Dmabuf { width, height, .. } => (*width, *height),
        }
    }
}

/// Resource data for a wl_buffer.
pub(crate) struct BufferData {
    pub backing: BufferBacking,
}

/// Resource data for a wl_shm_pool.
pub(crate) struct ShmPoolData {
    pool: Mutex<Option<Arc<ShmPool>>>,
}

/// Accumulating plane list of a zwp_linux_buffer_params_v1.
#[derive(Default)]
pub(crate) struct ParamsData {
    plane0: Mutex<Option<(OwnedFd, u32, u32, u64)>>,
}

/// Looks up the backing of a committed buffer.
pub(crate) fn buffer_backing(buffer: &wl_buffer::WlBuffer) -> Option<&BufferData> {
    buffer.data::<BufferData>()
}

// ---------------------------------------------------------------------
// wl_shm
// ---------------------------------------------------------------------

impl GlobalDispatch<wl_shm::WlShm, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_shm::WlShm>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let shm = data_init.init(resource, ());
        shm.format(wl_shm::Format::Argb8888);
        shm.format(wl_shm::Format::Xrgb8888);
    }
}

impl Dispatch<wl_shm::WlShm, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_shm::WlShm,
        request: wl_shm::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_shm::Request::CreatePool { id, fd, size } = request {
            let pool = ShmPool::map(&fd, size.max(0) as usize).map(Arc::new);
            if pool.is_none() {
                warn!("Failed to map shm pool of {size} bytes");
            }
            data_init.init(
                id,
                ShmPoolData {
                    pool: Mutex::new(pool),
                },
            );
        }
    }
}

impl Dispatch<wl_shm_pool::WlShmPool, ShmPoolData> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        resource: &wl_shm_pool::WlShmPool,
        request: wl_shm_pool::Request,
        data: &ShmPoolData,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_shm_pool::Request::CreateBuffer {
                id,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let Some(pool) = data.pool.lock().clone() else {
                    resource.post_error(
                        wl_shm::Error::InvalidFd as u32,
                        "shm pool is not mapped",
                    );
                    return;
                };
                let is_bgra = matches!(
                    format.into_result(),
                    Ok(wl_shm::Format::Argb8888) | Ok(wl_shm::Format::Xrgb8888)
                );
                data_init.init(
                    id,
                    BufferData {
                        backing: BufferBacking::Shm {
                            pool,
                            offset: offset.max(0) as usize,
                            width: width.max(0) as u32,
                            height: height.max(0) as u32,
                            stride: stride.max(0) as u32,
                            is_bgra,
                        },
                    },
                );
            }
            wl_shm_pool::Request::Resize { .. } => {
                // The mapping keeps its original size; growth is only
                // needed for buffers larger than the first allocation,
                // which the hosted-game workloads do not do.
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, BufferData> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_buffer::WlBuffer,
        _request: wl_buffer::Request,
        _data: &BufferData,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

// ---------------------------------------------------------------------
// zwp_linux_dmabuf_v1
// ---------------------------------------------------------------------

impl GlobalDispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let dmabuf = data_init.init(resource, ());
        for fourcc in [DRM_FORMAT_ARGB8888, DRM_FORMAT_XRGB8888] {
            dmabuf.format(fourcc);
            if dmabuf.version() >= 3 {
                for modifier in [DRM_FORMAT_MOD_LINEAR, DRM_FORMAT_MOD_INVALID] {
                    dmabuf.modifier(
                        fourcc,
                        (modifier >> 32) as u32,
                        (modifier & 0xffff_ffff) as u32,
                    );
                }
            }
        }
    }
}

impl Dispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
        request: zwp_linux_dmabuf_v1::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        if let zwp_linux_dmabuf_v1::Request::CreateParams { params_id } = request {
            data_init.init(params_id, ParamsData::default());
        }
    }
}

impl Dispatch<zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1, ParamsData> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        resource: &zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1,
        request: zwp_linux_buffer_params_v1::Request,
        data: &ParamsData,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            zwp_linux_buffer_params_v1::Request::Add {
                fd,
                plane_idx,
                offset,
                stride,
                modifier_hi,
                modifier_lo,
            } => {
                if plane_idx != 0 {
                    debug!("Ignoring dmabuf plane {plane_idx} (single-plane composition)");
                    return;
                }
                let modifier = (u64::from(modifier_hi) << 32) | u64::from(modifier_lo);
                *data.plane0.lock() = Some((fd, offset, stride, modifier));
            }
            zwp_linux_buffer_params_v1::Request::CreateImmed {
                buffer_id,
                width,
                height,
                format,
                ..
            } => {
                let Some((fd, offset, stride, modifier)) = data.plane0.lock().take() else {
                    resource.post_error(
                        zwp_linux_buffer_params_v1::Error::Incomplete as u32,
                        "missing plane 0",
                    );
                    return;
                };
                data_init.init(
                    buffer_id,
                    BufferData {
                        backing: BufferBacking::Dmabuf {
                            fd,
                            width: width.max(0) as u32,
                            height: height.max(0) as u32,
                            stride,
                            offset,
                            modifier,
                            fourcc: format,
                        },
                    },
                );
            }
            zwp_linux_buffer_params_v1::Request::Create { .. } => {
                // The immediate-import path is what Xwayland and mesa use
                // against this compositor; reject the async form.
                resource.failed();
            }
            _ => {}
        }
    }
}

/// Converts a DRM fourcc into the Vulkan format the composer imports.
pub(crate) fn fourcc_to_vk_format(fourcc: u32) -> Option<ash::vk::Format> {
    match fourcc {
        DRM_FORMAT_ARGB8888 | DRM_FORMAT_XRGB8888 => Some(ash::vk::Format::B8G8R8A8_UNORM),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_mapping() {
        assert_eq!(
            fourcc_to_vk_format(DRM_FORMAT_ARGB8888),
            Some(ash::vk::Format::B8G8R8A8_UNORM)
        );
        assert_eq!(
            fourcc_to_vk_format(DRM_FORMAT_XRGB8888),
            Some(ash::vk::Format::B8G8R8A8_UNORM)
        );
        assert_eq!(fourcc_to_vk_format(0x3231564e), None); // NV12
    }
}
