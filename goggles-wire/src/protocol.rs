//! Wire format of the capture protocol.
//!
//! Every message is a fixed-size little-endian record beginning with a
//! 4-byte kind tag. There is no length prefix; the receiver derives the
//! size from the tag. Sizes are part of the protocol and locked by tests.

use bitflags::bitflags;
use goggles_core::codec::{BinaryReader, BinaryWriter};

/// Abstract-namespace socket name (a leading NUL is prepended on bind).
pub const CAPTURE_SOCKET_NAME: &str = "goggles/vkcapture";

pub const PROTOCOL_VERSION: u32 = 1;

/// Width of the null-padded executable name field in `ClientHello`.
pub const EXE_NAME_LEN: usize = 64;

pub const KIND_CLIENT_HELLO: u32 = 1;
pub const KIND_TEXTURE_DESC: u32 = 2;
pub const KIND_CONTROL: u32 = 3;
pub const KIND_SEMAPHORE_INIT: u32 = 4;
pub const KIND_FRAME_METADATA: u32 = 5;

pub const CLIENT_HELLO_SIZE: usize = 72;
pub const TEXTURE_DESC_SIZE: usize = 32;
pub const CONTROL_SIZE: usize = 16;
pub const SEMAPHORE_INIT_SIZE: usize = 16;
pub const FRAME_METADATA_SIZE: usize = 40;

bitflags! {
    /// Flags in a viewer → producer control message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u32 {
        const CAPTURING = 1;
        const RESOLUTION_REQUEST = 2;
    }
}

/// Geometry and layout of a shared texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub offset: u32,
    pub format: u32,
    pub modifier: u64,
}

/// A parsed protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureMessage {
    ClientHello {
        version: u32,
        exe_name: String,
    },
    /// Legacy frame announcement (no cross-process sync). One dma-buf fd.
    TextureDesc(TextureDesc),
    Control {
        flags: ControlFlags,
        requested_width: u32,
        requested_height: u32,
    },
    /// Two timeline semaphore fds: frame-ready then frame-consumed.
    SemaphoreInit {
        version: u32,
        initial_value: u64,
    },
    /// Frame announcement with a strictly increasing frame number. One fd.
    FrameMetadata {
        desc: TextureDesc,
        frame_number: u64,
    },
}

impl CaptureMessage {
    pub fn kind(&self) -> u32 {
        match self {
            CaptureMessage::ClientHello { .. } => KIND_CLIENT_HELLO,
            CaptureMessage::TextureDesc(_) => KIND_TEXTURE_DESC,
            CaptureMessage::Control { .. } => KIND_CONTROL,
            CaptureMessage::SemaphoreInit { .. } => KIND_SEMAPHORE_INIT,
            CaptureMessage::FrameMetadata { .. } => KIND_FRAME_METADATA,
        }
    }

    /// Number of ancillary fds that must accompany a message of `kind`.
    pub fn fd_count_for_kind(kind: u32) -> usize {
        match kind {
            KIND_TEXTURE_DESC | KIND_FRAME_METADATA => 1,
            KIND_SEMAPHORE_INIT => 2,
            _ => 0,
        }
    }

    /// Wire size for `kind`, or `None` for an unknown tag.
    pub fn size_for_kind(kind: u32) -> Option<usize> {
        match kind {
            KIND_CLIENT_HELLO => Some(CLIENT_HELLO_SIZE),
            KIND_TEXTURE_DESC => Some(TEXTURE_DESC_SIZE),
            KIND_CONTROL => Some(CONTROL_SIZE),
            KIND_SEMAPHORE_INIT => Some(SEMAPHORE_INIT_SIZE),
            KIND_FRAME_METADATA => Some(FRAME_METADATA_SIZE),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = BinaryWriter::new();
        w.write_u32(self.kind());
        match self {
            CaptureMessage::ClientHello { version, exe_name } => {
                w.write_u32(*version);
                w.write_fixed_str(exe_name, EXE_NAME_LEN);
            }
            CaptureMessage::TextureDesc(desc) => {
                encode_texture_desc(&mut w, desc);
            }
            CaptureMessage::Control {
                flags,
                requested_width,
                requested_height,
            } => {
                w.write_u32(flags.bits());
                w.write_u32(*requested_width);
                w.write_u32(*requested_height);
            }
            CaptureMessage::SemaphoreInit {
                version,
                initial_value,
            } => {
                w.write_u32(*version);
                w.write_u64(*initial_value);
            }
            CaptureMessage::FrameMetadata { desc, frame_number } => {
                encode_texture_desc(&mut w, desc);
                w.write_u64(*frame_number);
            }
        }
        debug_assert_eq!(
            w.buffer.len(),
            Self::size_for_kind(self.kind()).unwrap(),
            "wire size drifted from the protocol constant"
        );
        w.buffer
    }

    /// Decodes one message of `kind` from `payload` (tag included).
    ///
    /// `payload` must be exactly the wire size for the kind; the framing
    /// layer guarantees that before calling.
    pub fn decode(kind: u32, payload: &[u8]) -> Option<CaptureMessage> {
        let mut r = BinaryReader::new(payload);
        let tag = r.read_u32()?;
        if tag != kind {
            return None;
        }
        match kind {
            KIND_CLIENT_HELLO => Some(CaptureMessage::ClientHello {
                version: r.read_u32()?,
                exe_name: r.read_fixed_str(EXE_NAME_LEN)?,
            }),
            KIND_TEXTURE_DESC => Some(CaptureMessage::TextureDesc(decode_texture_desc(&mut r)?)),
            KIND_CONTROL => Some(CaptureMessage::Control {
                flags: ControlFlags::from_bits_truncate(r.read_u32()?),
                requested_width: r.read_u32()?,
                requested_height: r.read_u32()?,
            }),
            KIND_SEMAPHORE_INIT => Some(CaptureMessage::SemaphoreInit {
                version: r.read_u32()?,
                initial_value: r.read_u64()?,
            }),
            KIND_FRAME_METADATA => Some(CaptureMessage::FrameMetadata {
                desc: decode_texture_desc(&mut r)?,
                frame_number: r.read_u64()?,
            }),
            _ => None,
        }
    }
}

fn encode_texture_desc(w: &mut BinaryWriter, desc: &TextureDesc) {
    w.write_u32(desc.width);
    w.write_u32(desc.height);
    w.write_u32(desc.stride);
    w.write_u32(desc.offset);
    w.write_u32(desc.format);
    w.write_u64(desc.modifier);
}

fn decode_texture_desc(r: &mut BinaryReader) -> Option<TextureDesc> {
    Some(TextureDesc {
        width: r.read_u32()?,
        height: r.read_u32()?,
        stride: r.read_u32()?,
        offset: r.read_u32()?,
        format: r.read_u32()?,
        modifier: r.read_u64()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_match_the_wire() {
        assert_eq!(KIND_CLIENT_HELLO, 1);
        assert_eq!(KIND_TEXTURE_DESC, 2);
        assert_eq!(KIND_CONTROL, 3);
        assert_eq!(KIND_SEMAPHORE_INIT, 4);
        assert_eq!(KIND_FRAME_METADATA, 5);
    }

    #[test]
    fn encoded_sizes_match_the_wire() {
        let hello = CaptureMessage::ClientHello {
            version: PROTOCOL_VERSION,
            exe_name: "vkcube".into(),
        };
        assert_eq!(hello.encode().len(), 72);

        let tex = CaptureMessage::TextureDesc(TextureDesc::default());
        assert_eq!(tex.encode().len(), 32);

        let ctrl = CaptureMessage::Control {
            flags: ControlFlags::CAPTURING,
            requested_width: 0,
            requested_height: 0,
        };
        assert_eq!(ctrl.encode().len(), 16);

        let sem = CaptureMessage::SemaphoreInit {
            version: PROTOCOL_VERSION,
            initial_value: 0,
        };
        assert_eq!(sem.encode().len(), 16);

        let meta = CaptureMessage::FrameMetadata {
            desc: TextureDesc::default(),
            frame_number: 1,
        };
        assert_eq!(meta.encode().len(), 40);
    }

    #[test]
    fn fd_counts_per_kind() {
        assert_eq!(CaptureMessage::fd_count_for_kind(KIND_CLIENT_HELLO), 0);
        assert_eq!(CaptureMessage::fd_count_for_kind(KIND_TEXTURE_DESC), 1);
        assert_eq!(CaptureMessage::fd_count_for_kind(KIND_CONTROL), 0);
        assert_eq!(CaptureMessage::fd_count_for_kind(KIND_SEMAPHORE_INIT), 2);
        assert_eq!(CaptureMessage::fd_count_for_kind(KIND_FRAME_METADATA), 1);
    }

    #[test]
    fn texture_desc_round_trips() {
        let msg = CaptureMessage::TextureDesc(TextureDesc {
            width: 1920,
            height: 1080,
            stride: 7680,
            offset: 0,
            format: 50, // VK_FORMAT_B8G8R8A8_SRGB
            modifier: 0x0100_0000_0000_0002,
        });
        let bytes = msg.encode();
        let decoded = CaptureMessage::decode(KIND_TEXTURE_DESC, &bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn frame_metadata_round_trips() {
        let msg = CaptureMessage::FrameMetadata {
            desc: TextureDesc {
                width: 640,
                height: 480,
                stride: 2560,
                offset: 64,
                format: 44,
                modifier: 0,
            },
            frame_number: 42,
        };
        let bytes = msg.encode();
        assert_eq!(CaptureMessage::decode(KIND_FRAME_METADATA, &bytes), Some(msg));
    }

    #[test]
    fn hello_exe_name_is_null_padded() {
        let msg = CaptureMessage::ClientHello {
            version: 1,
            exe_name: "vkcube".into(),
        };
        let bytes = msg.encode();
        assert_eq!(&bytes[8..14], b"vkcube");
        assert!(bytes[14..72].iter().all(|&b| b == 0));
        match CaptureMessage::decode(KIND_CLIENT_HELLO, &bytes).unwrap() {
            CaptureMessage::ClientHello { version, exe_name } => {
                assert_eq!(version, 1);
                assert_eq!(exe_name, "vkcube");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_has_no_size() {
        assert_eq!(CaptureMessage::size_for_kind(0), None);
        assert_eq!(CaptureMessage::size_for_kind(6), None);
        assert_eq!(CaptureMessage::size_for_kind(u32::MAX), None);
    }

    #[test]
    fn control_flags_bits() {
        assert_eq!(ControlFlags::CAPTURING.bits(), 1);
        assert_eq!(ControlFlags::RESOLUTION_REQUEST.bits(), 2);
    }
}
