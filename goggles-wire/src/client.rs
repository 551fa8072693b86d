//! Producer end of the capture protocol, used by the Vulkan layer and by
//! integration tests.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use tracing::debug;

use crate::protocol::{
    CaptureMessage, ControlFlags, TextureDesc, CONTROL_SIZE, KIND_CONTROL, PROTOCOL_VERSION,
};
use crate::socket::{self, RecvOutcome};

/// Connected producer endpoint.
pub struct CaptureClient {
    sock: OwnedFd,
    capturing: bool,
    requested_resolution: Option<(u32, u32)>,
}

impl CaptureClient {
    /// Connects to the viewer's capture socket and announces ourselves.
    pub fn connect(exe_name: &str) -> io::Result<Self> {
        let sock = socket::connect()?;
        let hello = CaptureMessage::ClientHello {
            version: PROTOCOL_VERSION,
            exe_name: exe_name.to_string(),
        };
        socket::send_all_blocking(sock.as_fd(), &hello.encode())?;
        debug!("Capture client connected as '{exe_name}'");
        Ok(Self {
            sock,
            capturing: false,
            requested_resolution: None,
        })
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Resolution most recently requested by the viewer, if any.
    pub fn requested_resolution(&self) -> Option<(u32, u32)> {
        self.requested_resolution
    }

    /// Drains pending control messages from the viewer.
    pub fn poll_control(&mut self) {
        loop {
            let mut buf = [0u8; CONTROL_SIZE];
            match socket::recv_with_fds(self.sock.as_fd(), &mut buf) {
                RecvOutcome::Data { data_len, .. } if data_len >= CONTROL_SIZE => {
                    if let Some(CaptureMessage::Control {
                        flags,
                        requested_width,
                        requested_height,
                    }) = CaptureMessage::decode(KIND_CONTROL, &buf)
                    {
                        self.capturing = flags.contains(ControlFlags::CAPTURING);
                        if flags.contains(ControlFlags::RESOLUTION_REQUEST) {
                            self.requested_resolution =
                                Some((requested_width, requested_height));
                        }
                    }
                }
                RecvOutcome::Data { .. } => continue,
                RecvOutcome::WouldBlock
                | RecvOutcome::Closed
                | RecvOutcome::Error(_) => return,
            }
        }
    }

    /// Announces a frame with no cross-process sync (legacy path).
    pub fn send_texture(&self, desc: TextureDesc, dmabuf: BorrowedFd<'_>) -> io::Result<()> {
        let msg = CaptureMessage::TextureDesc(desc);
        self.send_message(&msg.encode(), &[dmabuf.as_raw_fd()])
    }

    /// Announces frame `frame_number` backed by `dmabuf`.
    pub fn send_frame(
        &self,
        desc: TextureDesc,
        frame_number: u64,
        dmabuf: BorrowedFd<'_>,
    ) -> io::Result<()> {
        let msg = CaptureMessage::FrameMetadata { desc, frame_number };
        self.send_message(&msg.encode(), &[dmabuf.as_raw_fd()])
    }

    /// Hands the viewer the (frame-ready, frame-consumed) timeline pair.
    pub fn send_semaphores(
        &self,
        initial_value: u64,
        ready: BorrowedFd<'_>,
        consumed: BorrowedFd<'_>,
    ) -> io::Result<()> {
        let msg = CaptureMessage::SemaphoreInit {
            version: PROTOCOL_VERSION,
            initial_value,
        };
        self.send_message(&msg.encode(), &[ready.as_raw_fd(), consumed.as_raw_fd()])
    }

    fn send_message(&self, bytes: &[u8], fds: &[RawFd]) -> io::Result<()> {
        let sent = socket::send_with_fds(self.sock.as_fd(), bytes, fds)?;
        if sent != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short capture message write",
            ));
        }
        Ok(())
    }
}
