//! Viewer-side rendering for Goggles.
//!
//! Frames arrive as externally-owned GPU images (dma-buf fds plus layout
//! metadata). They are imported, routed through a RetroArch-style
//! multi-pass filter chain described by a preset file, and presented to
//! the viewer window, optionally synchronized with the producer through
//! imported timeline semaphores.

pub mod backend;
pub mod binder;
pub mod chain;
pub mod framebuffer;
pub mod gpu;
pub mod lut;
pub mod output;
pub mod pass;
pub mod preset;
pub mod shader;

pub use backend::{PresentationBackend, MAX_FRAMES_IN_FLIGHT};
pub use chain::{FilterChain, ParameterValue};
pub use output::ScaleMode;
pub use preset::{FilterMode, PresetGraph, ScaleType, WrapMode};
pub use shader::{ShaderService, ShadercService};
