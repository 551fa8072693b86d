//! Descriptions of GPU images whose backing memory lives in another
//! process or another subsystem.

use std::os::fd::{AsRawFd, OwnedFd};

/// How an [`ExternalImage`] handle is to be interpreted by an importer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExternalHandleKind {
    #[default]
    DmaBuf,
    OpaqueFd,
}

/// A GPU image owned elsewhere, described well enough to import.
///
/// The handle is exclusively owned: receiving an `ExternalImage` transfers
/// ownership of the descriptor, and any fan-out goes through [`dup`].
///
/// [`dup`]: ExternalImage::dup
#[derive(Debug, Default)]
pub struct ExternalImage {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub offset: u32,
    /// Numeric `VkFormat` value as carried on the wire.
    pub format: u32,
    /// DRM format modifier describing tiling/compression layout.
    pub modifier: u64,
    pub handle: Option<OwnedFd>,
    pub handle_kind: ExternalHandleKind,
}

impl ExternalImage {
    /// A valid handle is the definition of importability.
    pub fn is_importable(&self) -> bool {
        self.handle.is_some()
    }

    pub fn raw_fd(&self) -> Option<i32> {
        self.handle.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Duplicates this description with an independently owned handle.
    ///
    /// Returns `None` when there is no handle or the kernel refuses the
    /// duplication (fd table exhaustion); callers treat that as "no frame".
    pub fn dup(&self) -> Option<ExternalImage> {
        let handle = self.handle.as_ref()?.try_clone().ok()?;
        Some(ExternalImage {
            width: self.width,
            height: self.height,
            stride: self.stride,
            offset: self.offset,
            format: self.format,
            modifier: self.modifier,
            handle: Some(handle),
            handle_kind: self.handle_kind,
        })
    }
}

/// An external image stamped with its position in the producer's frame
/// sequence. Frame numbers start at 1 and only ever move forward.
#[derive(Debug, Default)]
pub struct ExternalImageFrame {
    pub image: ExternalImage,
    pub frame_number: u64,
}

impl ExternalImageFrame {
    pub fn dup(&self) -> Option<ExternalImageFrame> {
        Some(ExternalImageFrame {
            image: self.image.dup()?,
            frame_number: self.frame_number,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::fd::{AsRawFd, OwnedFd};

    fn image_with_fd() -> ExternalImage {
        let file = File::open("/dev/null").unwrap();
        ExternalImage {
            width: 640,
            height: 480,
            stride: 640 * 4,
            offset: 0,
            format: 44, // VK_FORMAT_B8G8R8A8_UNORM
            modifier: 0,
            handle: Some(OwnedFd::from(file)),
            handle_kind: ExternalHandleKind::DmaBuf,
        }
    }

    #[test]
    fn importable_iff_handle_present() {
        let mut img = image_with_fd();
        assert!(img.is_importable());
        img.handle = None;
        assert!(!img.is_importable());
    }

    #[test]
    fn dup_yields_independent_descriptor() {
        let img = image_with_fd();
        let copy = img.dup().unwrap();
        assert_ne!(
            img.handle.as_ref().unwrap().as_raw_fd(),
            copy.handle.as_ref().unwrap().as_raw_fd()
        );
        assert_eq!(copy.width, 640);
        assert_eq!(copy.format, 44);
        // Dropping the copy must not invalidate the original.
        drop(copy);
        assert!(img.is_importable());
    }

    #[test]
    fn dup_without_handle_is_none() {
        let img = ExternalImage::default();
        assert!(img.dup().is_none());
    }
}
