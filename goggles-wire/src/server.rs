//! Viewer-side capture server: accepts one producer, assembles the latest
//! frame, and drives resolution negotiation.

use std::os::fd::{AsFd, OwnedFd};

use goggles_core::{Error, ErrorKind, ExternalHandleKind, ExternalImage, ExternalImageFrame};
use tracing::{error, info, warn};

use crate::protocol::{CaptureMessage, ControlFlags, TextureDesc};
use crate::socket::{self, RecvOutcome};

/// Viewer end of the capture protocol.
///
/// Owns the listening socket and at most one accepted client. All methods
/// are non-blocking apart from the initial control handshake on accept.
pub struct CaptureServer {
    listener: OwnedFd,
    client: Option<OwnedFd>,
    recv_buf: Vec<u8>,
    frame: ExternalImageFrame,
    last_texture: TextureDesc,
    ready_fd: Option<OwnedFd>,
    consumed_fd: Option<OwnedFd>,
    semaphores_updated: bool,
}

impl CaptureServer {
    /// Binds the abstract capture socket and starts listening.
    pub fn bind() -> goggles_core::Result<Self> {
        let listener = socket::bind_listener().map_err(|e| {
            let message = if e.raw_os_error() == Some(libc::EADDRINUSE) {
                "Capture socket already in use (another instance running?)".to_string()
            } else {
                format!("Failed to bind capture socket: {e}")
            };
            Error::new(ErrorKind::CaptureInitFailed, message)
        })?;

        info!("Capture socket listening");
        Ok(Self {
            listener,
            client: None,
            recv_buf: Vec::new(),
            frame: ExternalImageFrame::default(),
            last_texture: TextureDesc::default(),
            ready_fd: None,
            consumed_fd: None,
            semaphores_updated: false,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub fn has_frame(&self) -> bool {
        self.frame.image.is_importable()
    }

    /// Polls the socket once. Returns true when a new frame arrived.
    ///
    /// When this returns false, no caller-visible state has changed.
    pub fn poll(&mut self) -> bool {
        if self.client.is_none() {
            self.accept_client();
        }
        if self.client.is_some() {
            return self.receive();
        }
        false
    }

    /// Returns the current frame if it is newer than `after`, duplicating
    /// the image handle; the caller owns the duplicate.
    pub fn latest(&self, after: u64) -> Option<ExternalImageFrame> {
        if !self.has_frame() || self.frame.frame_number <= after {
            return None;
        }
        self.frame.dup()
    }

    /// Takes the most recently received timeline semaphore pair
    /// (frame-ready, frame-consumed), handing ownership to the caller.
    /// Returns `None` until a new `semaphore_init` has been seen.
    pub fn take_semaphores(&mut self) -> Option<(OwnedFd, OwnedFd)> {
        if !self.semaphores_updated {
            return None;
        }
        self.semaphores_updated = false;
        match (self.ready_fd.take(), self.consumed_fd.take()) {
            (Some(ready), Some(consumed)) => Some((ready, consumed)),
            _ => None,
        }
    }

    /// Asks the producer to switch to `width` x `height`. Best effort: the
    /// producer may ignore it and the server does not wait.
    pub fn request_resolution(&mut self, width: u32, height: u32) {
        let Some(client) = &self.client else {
            return;
        };
        let msg = CaptureMessage::Control {
            flags: ControlFlags::CAPTURING | ControlFlags::RESOLUTION_REQUEST,
            requested_width: width,
            requested_height: height,
        };
        if let Err(e) = socket::send_with_fds(client.as_fd(), &msg.encode(), &[]) {
            warn!("Failed to send resolution request: {e}");
        }
    }

    fn accept_client(&mut self) {
        let accepted = match socket::accept(self.listener.as_fd()) {
            Ok(Some(fd)) => fd,
            Ok(None) => return,
            Err(e) => {
                error!("Accept failed: {e}");
                return;
            }
        };

        if self.client.is_some() {
            warn!("Rejecting new capture client: already connected");
            return; // accepted fd dropped, closing the connection
        }

        let msg = CaptureMessage::Control {
            flags: ControlFlags::CAPTURING,
            requested_width: 0,
            requested_height: 0,
        };
        if let Err(e) = socket::send_all_blocking(accepted.as_fd(), &msg.encode()) {
            error!("Failed to send initial control: {e}");
            return;
        }

        info!("Capture client connected");
        self.client = Some(accepted);
    }

    fn disconnect_client(&mut self) {
        self.client = None;
        self.cleanup_frame();
    }

    fn cleanup_frame(&mut self) {
        self.frame = ExternalImageFrame::default();
        self.last_texture = TextureDesc::default();
        self.recv_buf.clear();
        self.ready_fd = None;
        self.consumed_fd = None;
        self.semaphores_updated = false;
    }

    fn receive(&mut self) -> bool {
        let Some(client) = &self.client else {
            return false;
        };

        let mut buf = [0u8; 256];
        let (data_len, mut fds) = match socket::recv_with_fds(client.as_fd(), &mut buf) {
            RecvOutcome::Data { data_len, fds } => (data_len, fds),
            RecvOutcome::WouldBlock => return false,
            RecvOutcome::Closed => {
                info!("Capture client disconnected");
                self.disconnect_client();
                return false;
            }
            RecvOutcome::Error(e) => {
                error!("Capture receive failed: {e}");
                self.disconnect_client();
                return false;
            }
        };

        self.recv_buf.extend_from_slice(&buf[..data_len]);

        let mut got_frame = false;
        let mut fd_iter = fds.drain(..);

        while self.recv_buf.len() >= 4 {
            let kind = u32::from_le_bytes(self.recv_buf[..4].try_into().unwrap());
            let Some(size) = CaptureMessage::size_for_kind(kind) else {
                error!("Unknown capture message kind {kind}, disconnecting client");
                drop(fd_iter); // releases any unconsumed fds
                self.disconnect_client();
                return false;
            };
            if self.recv_buf.len() < size {
                break;
            }

            let wanted = CaptureMessage::fd_count_for_kind(kind);
            let mut msg_fds = Vec::with_capacity(wanted);
            for _ in 0..wanted {
                match fd_iter.next() {
                    Some(fd) => msg_fds.push(fd),
                    None => break,
                }
            }

            if let Some(msg) = CaptureMessage::decode(kind, &self.recv_buf[..size]) {
                if self.apply(msg, msg_fds) {
                    got_frame = true;
                }
            }
            self.recv_buf.drain(..size);
        }

        // Leftover fds belong to no message; close them.
        drop(fd_iter);
        got_frame
    }

    fn apply(&mut self, msg: CaptureMessage, mut fds: Vec<OwnedFd>) -> bool {
        match msg {
            CaptureMessage::ClientHello { version, exe_name } => {
                if version != crate::protocol::PROTOCOL_VERSION {
                    warn!("Capture client speaks protocol version {version}, expected 1");
                }
                info!("Capture client: {exe_name}");
                false
            }
            CaptureMessage::Control { .. } => false, // producers never send control
            CaptureMessage::TextureDesc(desc) => {
                let Some(fd) = fds.pop() else {
                    warn!("texture_desc received but no fd available");
                    return false;
                };
                self.install_image(desc, fd);
                self.frame.image.is_importable()
            }
            CaptureMessage::SemaphoreInit { initial_value, .. } => {
                if fds.len() < 2 {
                    warn!("semaphore_init: need 2 fds, have {}", fds.len());
                    return false;
                }
                let (Some(consumed), Some(ready)) = (fds.pop(), fds.pop()) else {
                    return false;
                };
                // The producer changed sync regime; the current image
                // handle belongs to the old one.
                self.frame.image.handle = None;
                self.ready_fd = Some(ready);
                self.consumed_fd = Some(consumed);
                self.semaphores_updated = true;
                info!("Received sync semaphores (initial value {initial_value})");
                false
            }
            CaptureMessage::FrameMetadata { desc, frame_number } => {
                if let Some(fd) = fds.pop() {
                    self.install_image(desc, fd);
                } else {
                    self.copy_desc(desc);
                }
                self.frame.frame_number = frame_number;
                self.frame.image.is_importable()
            }
        }
    }

    fn install_image(&mut self, desc: TextureDesc, fd: OwnedFd) {
        let changed = desc != self.last_texture;
        self.copy_desc(desc);
        self.frame.image.handle = Some(fd);
        if changed {
            info!(
                "Capture texture: {}x{}, format={}, modifier=0x{:x}",
                desc.width, desc.height, desc.format, desc.modifier
            );
        }
    }

    fn copy_desc(&mut self, desc: TextureDesc) {
        self.frame.image.width = desc.width;
        self.frame.image.height = desc.height;
        self.frame.image.stride = desc.stride;
        self.frame.image.offset = desc.offset;
        self.frame.image.format = desc.format;
        self.frame.image.modifier = desc.modifier;
        self.frame.image.handle_kind = ExternalHandleKind::DmaBuf;
        self.last_texture = desc;
    }
}
