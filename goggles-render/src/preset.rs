//! RetroArch `.slangp` preset parsing.
//!
//! The format is a flat key=value file: a `shaders` count, per-pass keys
//! suffixed with the pass index, a `textures` list with per-texture
//! attribute keys, and bare float keys acting as parameter overrides.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use tracing::info;

use goggles_core::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleType {
    #[default]
    Source,
    Viewport,
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WrapMode {
    #[default]
    ClampToBorder,
    ClampToEdge,
    Repeat,
    MirroredRepeat,
}

/// Intermediate framebuffer pixel format of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramebufferFormat {
    #[default]
    Unorm8,
    Srgb8,
    Float16,
}

#[derive(Debug, Clone)]
pub struct PassConfig {
    pub shader_path: PathBuf,
    pub scale_type_x: ScaleType,
    pub scale_type_y: ScaleType,
    pub scale_x: f32,
    pub scale_y: f32,
    pub filter_mode: FilterMode,
    pub wrap_mode: WrapMode,
    pub framebuffer_format: FramebufferFormat,
    pub mipmap: bool,
    pub alias: Option<String>,
    pub feedback: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            shader_path: PathBuf::new(),
            scale_type_x: ScaleType::Source,
            scale_type_y: ScaleType::Source,
            scale_x: 1.0,
            scale_y: 1.0,
            filter_mode: FilterMode::Nearest,
            wrap_mode: WrapMode::ClampToBorder,
            framebuffer_format: FramebufferFormat::Unorm8,
            mipmap: false,
            alias: None,
            feedback: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextureConfig {
    pub name: String,
    pub path: PathBuf,
    pub filter_mode: FilterMode,
    pub wrap_mode: WrapMode,
    pub mipmap: bool,
    /// Linear textures are stored without an sRGB transfer curve.
    pub linear: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterOverride {
    pub name: String,
    pub value: f32,
}

/// A parsed preset: the pass sequence plus auxiliary textures and
/// parameter overrides.
#[derive(Debug, Clone, Default)]
pub struct PresetGraph {
    pub passes: Vec<PassConfig>,
    pub textures: Vec<TextureConfig>,
    pub parameters: Vec<ParameterOverride>,
}

impl PresetGraph {
    pub fn load(preset_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(preset_path).map_err(|e| {
            Error::new(
                ErrorKind::FileNotFound,
                format!("Failed to open preset {}: {e}", preset_path.display()),
            )
        })?;
        let base = preset_path.parent().unwrap_or(Path::new("."));
        let graph = Self::parse(&content, base)?;
        info!(
            "Loaded preset {} ({} passes, {} textures, {} parameter overrides)",
            preset_path.display(),
            graph.passes.len(),
            graph.textures.len(),
            graph.parameters.len()
        );
        Ok(graph)
    }

    /// Parses preset text; relative shader/texture paths resolve against
    /// `base_path`.
    pub fn parse(content: &str, base_path: &Path) -> Result<Self> {
        let values = parse_key_values(content);

        let shaders_value = values.get("shaders").ok_or_else(|| {
            Error::new(ErrorKind::ParseError, "Preset missing 'shaders' count")
        })?;
        let shader_count: usize = shaders_value.parse().map_err(|_| {
            Error::new(
                ErrorKind::ParseError,
                format!("Invalid 'shaders' count: {shaders_value}"),
            )
        })?;

        let mut graph = PresetGraph::default();

        for i in 0..shader_count {
            let mut pass = PassConfig::default();

            let shader_key = format!("shader{i}");
            let shader = values.get(shader_key.as_str()).ok_or_else(|| {
                Error::new(
                    ErrorKind::ParseError,
                    format!("Missing shader path for pass {i}"),
                )
            })?;
            pass.shader_path = base_path.join(shader);

            if let Some(v) = values.get(format!("scale_type{i}").as_str()) {
                let ty = parse_scale_type(v);
                pass.scale_type_x = ty;
                pass.scale_type_y = ty;
            }
            if let Some(v) = values.get(format!("scale_type_x{i}").as_str()) {
                pass.scale_type_x = parse_scale_type(v);
            }
            if let Some(v) = values.get(format!("scale_type_y{i}").as_str()) {
                pass.scale_type_y = parse_scale_type(v);
            }

            if let Some(v) = values.get(format!("scale{i}").as_str()) {
                let s = parse_f32(v, 1.0);
                pass.scale_x = s;
                pass.scale_y = s;
            }
            if let Some(v) = values.get(format!("scale_x{i}").as_str()) {
                pass.scale_x = parse_f32(v, 1.0);
            }
            if let Some(v) = values.get(format!("scale_y{i}").as_str()) {
                pass.scale_y = parse_f32(v, 1.0);
            }

            if let Some(v) = values.get(format!("filter_linear{i}").as_str()) {
                pass.filter_mode = if parse_bool(v) {
                    FilterMode::Linear
                } else {
                    FilterMode::Nearest
                };
            }

            let is_float = values
                .get(format!("float_framebuffer{i}").as_str())
                .map(|v| parse_bool(v))
                .unwrap_or(false);
            let is_srgb = values
                .get(format!("srgb_framebuffer{i}").as_str())
                .map(|v| parse_bool(v))
                .unwrap_or(false);
            pass.framebuffer_format = if is_float {
                FramebufferFormat::Float16
            } else if is_srgb {
                FramebufferFormat::Srgb8
            } else {
                FramebufferFormat::Unorm8
            };

            if let Some(v) = values.get(format!("alias{i}").as_str()) {
                pass.alias = Some(v.to_string());
            }
            if let Some(v) = values.get(format!("mipmap_input{i}").as_str()) {
                pass.mipmap = parse_bool(v);
            }
            if let Some(v) = values.get(format!("wrap_mode{i}").as_str()) {
                pass.wrap_mode = parse_wrap_mode(v);
            }
            if let Some(v) = values.get(format!("feedback{i}").as_str()) {
                pass.feedback = parse_bool(v);
            }

            graph.passes.push(pass);
        }

        // Alias names identify pass outputs across the graph; a duplicate
        // would make binding resolution ambiguous.
        for (i, pass) in graph.passes.iter().enumerate() {
            if let Some(alias) = &pass.alias {
                let clash = graph.passes[..i]
                    .iter()
                    .any(|p| p.alias.as_deref() == Some(alias.as_str()));
                if clash {
                    return goggles_core::error::err(
                        ErrorKind::ParseError,
                        format!("Duplicate pass alias '{alias}'"),
                    );
                }
            }
        }

        parse_textures(&values, base_path, &mut graph.textures);
        parse_parameters(&values, &mut graph.parameters);

        Ok(graph)
    }
}

fn parse_key_values(content: &str) -> FxHashMap<String, String> {
    let mut values = FxHashMap::default();
    for line in content.lines() {
        let trimmed = trim_value(line);
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        values.insert(trim_value(key).to_string(), trim_value(value).to_string());
    }
    values
}

/// Strips whitespace and surrounding quotes.
fn trim_value(s: &str) -> &str {
    s.trim_matches(|c: char| c.is_whitespace() || c == '"')
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

fn parse_f32(value: &str, default: f32) -> f32 {
    value.parse().unwrap_or(default)
}

fn parse_scale_type(value: &str) -> ScaleType {
    match value.to_ascii_lowercase().as_str() {
        "viewport" => ScaleType::Viewport,
        "absolute" => ScaleType::Absolute,
        _ => ScaleType::Source,
    }
}

fn parse_wrap_mode(value: &str) -> WrapMode {
    match value.to_ascii_lowercase().as_str() {
        "clamp_to_edge" => WrapMode::ClampToEdge,
        "repeat" => WrapMode::Repeat,
        "mirrored_repeat" => WrapMode::MirroredRepeat,
        _ => WrapMode::ClampToBorder,
    }
}

fn parse_textures(
    values: &FxHashMap<String, String>,
    base_path: &Path,
    textures: &mut Vec<TextureConfig>,
) {
    let Some(list) = values.get("textures") else {
        return;
    };

    for name in list.split(';') {
        let name = trim_value(name);
        if name.is_empty() {
            continue;
        }

        let mut tex = TextureConfig {
            name: name.to_string(),
            path: PathBuf::new(),
            filter_mode: FilterMode::Nearest,
            wrap_mode: WrapMode::ClampToBorder,
            mipmap: false,
            linear: false,
        };

        if let Some(path) = values.get(name) {
            tex.path = base_path.join(path);
        }
        if let Some(v) = values.get(format!("{name}_linear").as_str()) {
            let linear = parse_bool(v);
            tex.linear = linear;
            tex.filter_mode = if linear {
                FilterMode::Linear
            } else {
                FilterMode::Nearest
            };
        }
        if let Some(v) = values.get(format!("{name}_mipmap").as_str()) {
            tex.mipmap = parse_bool(v);
        }
        if let Some(v) = values.get(format!("{name}_wrap_mode").as_str()) {
            tex.wrap_mode = parse_wrap_mode(v);
        }

        textures.push(tex);
    }
}

fn parse_parameters(values: &FxHashMap<String, String>, parameters: &mut Vec<ParameterOverride>) {
    for (key, value) in values {
        if key.starts_with("shader")
            || key.starts_with("scale")
            || key.starts_with("filter")
            || key.starts_with("float")
            || key.starts_with("srgb")
            || key.starts_with("alias")
            || key.starts_with("mipmap")
            || key.starts_with("wrap_mode")
            || key.starts_with("feedback")
            || key == "shaders"
            || key == "textures"
            || key.contains("_linear")
            || key.contains("_mipmap")
            || key.contains("_wrap_mode")
        {
            continue;
        }
        if let Ok(value) = value.parse::<f32>() {
            parameters.push(ParameterOverride {
                name: key.clone(),
                value,
            });
        }
    }
    // HashMap iteration order is arbitrary; presets care about names, not
    // positions, but deterministic output makes tests and diffs sane.
    parameters.sort_by(|a, b| a.name.cmp(&b.name));
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRT_PRESET: &str = r#"
shaders = 2

shader0 = shaders/crt-pass.slang
scale_type0 = source
scale0 = 2.0
filter_linear0 = false
srgb_framebuffer0 = true
alias0 = DerezedPass
wrap_mode0 = clamp_to_edge

shader1 = shaders/final.slang
scale_type1 = viewport
scale1 = 1.0
filter_linear1 = true

textures = "SamplerLUT1;SamplerLUT2"
SamplerLUT1 = luts/lut1.png
SamplerLUT1_linear = true
SamplerLUT2 = luts/lut2.png
SamplerLUT2_wrap_mode = repeat

gamma = 2.4
sharpness = 0.5
"#;

    #[test]
    fn parses_pass_sequence() {
        let graph = PresetGraph::parse(CRT_PRESET, Path::new("/presets")).unwrap();
        assert_eq!(graph.passes.len(), 2);

        let p0 = &graph.passes[0];
        assert_eq!(p0.shader_path, Path::new("/presets/shaders/crt-pass.slang"));
        assert_eq!(p0.scale_type_x, ScaleType::Source);
        assert_eq!(p0.scale_x, 2.0);
        assert_eq!(p0.filter_mode, FilterMode::Nearest);
        assert_eq!(p0.framebuffer_format, FramebufferFormat::Srgb8);
        assert_eq!(p0.alias.as_deref(), Some("DerezedPass"));
        assert_eq!(p0.wrap_mode, WrapMode::ClampToEdge);

        let p1 = &graph.passes[1];
        assert_eq!(p1.scale_type_x, ScaleType::Viewport);
        assert_eq!(p1.filter_mode, FilterMode::Linear);
        assert_eq!(p1.framebuffer_format, FramebufferFormat::Unorm8);
    }

    #[test]
    fn parses_textures_with_attributes() {
        let graph = PresetGraph::parse(CRT_PRESET, Path::new("/presets")).unwrap();
        assert_eq!(graph.textures.len(), 2);

        let lut1 = &graph.textures[0];
        assert_eq!(lut1.name, "SamplerLUT1");
        assert_eq!(lut1.path, Path::new("/presets/luts/lut1.png"));
        assert!(lut1.linear);
        assert_eq!(lut1.filter_mode, FilterMode::Linear);

        let lut2 = &graph.textures[1];
        assert_eq!(lut2.wrap_mode, WrapMode::Repeat);
        assert!(!lut2.linear);
    }

    #[test]
    fn parses_parameter_overrides() {
        let graph = PresetGraph::parse(CRT_PRESET, Path::new("/presets")).unwrap();
        assert_eq!(
            graph.parameters,
            vec![
                ParameterOverride { name: "gamma".into(), value: 2.4 },
                ParameterOverride { name: "sharpness".into(), value: 0.5 },
            ]
        );
    }

    #[test]
    fn missing_shaders_count_is_a_parse_error() {
        let err = PresetGraph::parse("shader0 = a.slang\n", Path::new(".")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }

    #[test]
    fn missing_pass_shader_is_a_parse_error() {
        let err = PresetGraph::parse("shaders = 2\nshader0 = a.slang\n", Path::new("."))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
        assert!(err.message.contains("pass 1"));
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let preset = "shaders = 2\nshader0 = a.slang\nalias0 = P\nshader1 = b.slang\nalias1 = P\n";
        let err = PresetGraph::parse(preset, Path::new(".")).unwrap_err();
        assert!(err.message.contains("alias"));
    }

    #[test]
    fn separate_axis_scale_types() {
        let preset = "shaders = 1\nshader0 = a.slang\nscale_type_x0 = source\nscale_type_y0 = viewport\nscale_x0 = 4.0\nscale_y0 = 1.0\n";
        let graph = PresetGraph::parse(preset, Path::new(".")).unwrap();
        let p = &graph.passes[0];
        assert_eq!(p.scale_type_x, ScaleType::Source);
        assert_eq!(p.scale_type_y, ScaleType::Viewport);
        assert_eq!(p.scale_x, 4.0);
        assert_eq!(p.scale_y, 1.0);
    }

    #[test]
    fn float_framebuffer_wins_over_srgb() {
        let preset = "shaders = 1\nshader0 = a.slang\nfloat_framebuffer0 = true\nsrgb_framebuffer0 = true\n";
        let graph = PresetGraph::parse(preset, Path::new(".")).unwrap();
        assert_eq!(graph.passes[0].framebuffer_format, FramebufferFormat::Float16);
    }

    #[test]
    fn comments_quotes_and_blank_lines_are_ignored() {
        let preset = "# a comment\n\nshaders = \"1\"\nshader0 = \"a.slang\"\n";
        let graph = PresetGraph::parse(preset, Path::new("/p")).unwrap();
        assert_eq!(graph.passes[0].shader_path, Path::new("/p/a.slang"));
    }

    #[test]
    fn feedback_flag_is_parsed() {
        let preset = "shaders = 1\nshader0 = a.slang\nfeedback0 = true\n";
        let graph = PresetGraph::parse(preset, Path::new(".")).unwrap();
        assert!(graph.passes[0].feedback);
    }
}
