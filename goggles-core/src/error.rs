//! Tagged error values shared by every Goggles crate.

use thiserror::Error;

/// Classifies an error for severity mapping and propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ParseError,
    InvalidConfig,
    InvalidData,
    FileNotFound,
    FileReadFailed,
    FileWriteFailed,
    CaptureInitFailed,
    CaptureFrameFailed,
    GpuInitFailed,
    GpuDeviceLost,
    ShaderCompileFailed,
    ShaderLoadFailed,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::ParseError => "parse_error",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::InvalidData => "invalid_data",
            ErrorKind::FileNotFound => "file_not_found",
            ErrorKind::FileReadFailed => "file_read_failed",
            ErrorKind::FileWriteFailed => "file_write_failed",
            ErrorKind::CaptureInitFailed => "capture_init_failed",
            ErrorKind::CaptureFrameFailed => "capture_frame_failed",
            ErrorKind::GpuInitFailed => "gpu_init_failed",
            ErrorKind::GpuDeviceLost => "gpu_device_lost",
            ErrorKind::ShaderCompileFailed => "shader_compile_failed",
            ErrorKind::ShaderLoadFailed => "shader_load_failed",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{}: {message}", kind.name())]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand used at most error sites.
pub fn err<T>(kind: ErrorKind, message: impl Into<String>) -> Result<T> {
    Err(Error::new(kind, message))
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        let kind = match io.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::FileReadFailed,
            _ => ErrorKind::InvalidData,
        };
        Error::new(kind, io.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(ErrorKind::ParseError.name(), "parse_error");
        assert_eq!(ErrorKind::GpuDeviceLost.name(), "gpu_device_lost");
        assert_eq!(ErrorKind::CaptureInitFailed.name(), "capture_init_failed");
    }

    #[test]
    fn display_includes_kind_and_message() {
        let e = Error::new(ErrorKind::FileNotFound, "missing preset");
        assert_eq!(e.to_string(), "file_not_found: missing preset");
    }

    #[test]
    fn io_not_found_maps_to_file_not_found() {
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        let e: Error = io.into();
        assert_eq!(e.kind, ErrorKind::FileNotFound);
    }
}
