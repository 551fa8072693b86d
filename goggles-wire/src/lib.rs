//! Capture IPC between an intercepted application and the viewer.
//!
//! The producer (a Vulkan layer inside the captured app) connects to an
//! abstract-namespace Unix socket owned by the viewer and streams
//! fixed-size messages; GPU buffer handles and timeline semaphore handles
//! ride along as `SCM_RIGHTS` ancillary data. The protocol is modelled on
//! obs-vkcapture's.

pub mod client;
pub mod protocol;
pub mod server;
mod socket;

pub use client::CaptureClient;
pub use protocol::{
    CaptureMessage, ControlFlags, TextureDesc, CAPTURE_SOCKET_NAME, PROTOCOL_VERSION,
};
pub use server::CaptureServer;
