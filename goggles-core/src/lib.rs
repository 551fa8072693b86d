//! Shared foundation for the Goggles workspace.
//!
//! Everything here is intentionally free of GPU and window-system
//! dependencies so that the wire protocol, the producer layer and the
//! viewer can all build on the same small vocabulary: tagged errors,
//! externally-owned image handles, and bounded single-producer
//! single-consumer rings.

pub mod codec;
pub mod env;
pub mod error;
pub mod image;
pub mod spsc;

pub use error::{Error, ErrorKind, Result};
pub use image::{ExternalHandleKind, ExternalImage, ExternalImageFrame};
pub use spsc::SpscRing;
