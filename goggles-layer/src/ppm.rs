//! Raw PPM output plus the sidecar description file.

use std::io::{BufWriter, Write};
use std::path::Path;

/// Writes `pixels` (tightly packed 4-byte RGBA or BGRA) as binary P6.
pub fn write_ppm(
    path: &Path,
    pixels: &[u8],
    width: u32,
    height: u32,
    is_bgra: bool,
) -> std::io::Result<()> {
    let file = std::fs::File::create(path)?;
    let mut out = BufWriter::new(file);
    write!(out, "P6\n{width} {height}\n255\n")?;

    let row_bytes = width as usize * 4;
    for y in 0..height as usize {
        let row = &pixels[y * row_bytes..(y + 1) * row_bytes];
        for px in row.chunks_exact(4) {
            let rgb = if is_bgra {
                [px[2], px[1], px[0]]
            } else {
                [px[0], px[1], px[2]]
            };
            out.write_all(&rgb)?;
        }
    }
    out.flush()
}

/// Key=value sidecar describing where a dump came from.
pub struct DumpDescription<'a> {
    pub process_name: &'a str,
    pub pid: u32,
    pub frame_number: u64,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub stride: u32,
    pub offset: u32,
    pub modifier: u64,
}

pub fn write_desc(path: &Path, desc: &DumpDescription) -> std::io::Result<()> {
    let mut out = String::new();
    use std::fmt::Write as _;
    let _ = writeln!(out, "process_name={}", desc.process_name);
    let _ = writeln!(out, "pid={}", desc.pid);
    let _ = writeln!(out, "frame_number={}", desc.frame_number);
    let _ = writeln!(out, "width={}", desc.width);
    let _ = writeln!(out, "height={}", desc.height);
    let _ = writeln!(out, "format={}", desc.format);
    let _ = writeln!(out, "stride={}", desc.stride);
    let _ = writeln!(out, "offset={}", desc.offset);
    let _ = writeln!(out, "modifier={}", desc.modifier);
    std::fs::write(path, out)
}

/// Keeps only `[A-Za-z0-9._-]`; anything else becomes `_`.
pub fn sanitize_filename_component(input: &str) -> String {
    let out: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "process".to_string()
    } else {
        out
    }
}

/// The captured process's name, from `/proc/self/comm`.
pub fn process_name() -> String {
    match std::fs::read_to_string("/proc/self/comm") {
        Ok(comm) => sanitize_filename_component(comm.trim_end()),
        Err(_) => "process".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("goggles-ppm-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn ppm_header_and_bgra_swap() {
        // 2x1: blue-ish then red-ish in BGRA byte order.
        let pixels = [255u8, 0, 0, 255, 0, 0, 255, 255];
        let path = temp_path("bgra.ppm");
        write_ppm(&path, &pixels, 2, 1, true).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"P6\n2 1\n255\n"));
        let body = &bytes[b"P6\n2 1\n255\n".len()..];
        assert_eq!(body, &[0, 0, 255, 255, 0, 0]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rgba_passes_through() {
        let pixels = [1u8, 2, 3, 255];
        let path = temp_path("rgba.ppm");
        write_ppm(&path, &pixels, 1, 1, false).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[b"P6\n1 1\n255\n".len()..], &[1, 2, 3]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn desc_contains_every_key() {
        let path = temp_path("frame.ppm.desc");
        write_desc(
            &path,
            &DumpDescription {
                process_name: "vkcube",
                pid: 1234,
                frame_number: 9,
                width: 640,
                height: 480,
                format: 44,
                stride: 2560,
                offset: 0,
                modifier: 72057594037927938,
            },
        )
        .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        for line in [
            "process_name=vkcube",
            "pid=1234",
            "frame_number=9",
            "width=640",
            "height=480",
            "format=44",
            "stride=2560",
            "offset=0",
            "modifier=72057594037927938",
        ] {
            assert!(text.contains(line), "missing {line}: {text}");
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_filename_component("my/game"), "my_game");
        assert_eq!(sanitize_filename_component("steam app.x86_64"), "steam_app.x86_64");
        assert_eq!(sanitize_filename_component(""), "process");
    }
}
