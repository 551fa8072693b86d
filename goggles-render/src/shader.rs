//! Compiled-shader service.
//!
//! The chain never sees shader source handling beyond this seam: it asks
//! the service for a compiled vertex/fragment pair and gets SPIR-V words
//! plus reflection (UBO layout, push constants, named sampler bindings).
//! The bundled implementation drives shaderc; a front-end with include
//! resolution and on-disk caching can slot in behind the same trait.

use goggles_core::{Error, ErrorKind, Result};

/// A named combined-image-sampler binding in the fragment stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerBinding {
    pub binding: u32,
    pub name: String,
}

/// Uniform buffer block layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UboLayout {
    pub binding: u32,
    pub size: u32,
}

/// A tweakable runtime parameter declared by a shader.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderParameter {
    pub name: String,
    pub default: f32,
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

/// What the chain needs to know about a compiled pass.
#[derive(Debug, Clone, Default)]
pub struct ShaderReflection {
    pub has_push_constants: bool,
    pub ubo: Option<UboLayout>,
    pub samplers: Vec<SamplerBinding>,
    pub parameters: Vec<ShaderParameter>,
}

/// A compiled vertex/fragment pair.
#[derive(Debug, Clone, Default)]
pub struct CompiledShader {
    pub vertex_spirv: Vec<u32>,
    pub fragment_spirv: Vec<u32>,
    pub reflection: ShaderReflection,
}

/// Source-to-SPIR-V seam consumed by the filter chain.
pub trait ShaderService: Send + Sync {
    /// Compiles a GLSL vertex/fragment pair named `name` for diagnostics.
    fn compile_pair(
        &self,
        name: &str,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<CompiledShader>;
}

/// shaderc-backed implementation.
pub struct ShadercService {
    compiler: shaderc::Compiler,
}

// shaderc::Compiler is internally synchronized for compile calls.
unsafe impl Send for ShadercService {}
unsafe impl Sync for ShadercService {}

impl ShadercService {
    pub fn new() -> Result<Self> {
        let compiler = shaderc::Compiler::new().ok_or_else(|| {
            Error::new(
                ErrorKind::ShaderCompileFailed,
                "shaderc unavailable: failed to initialize compiler",
            )
        })?;
        Ok(Self { compiler })
    }

    fn compile_stage(&self, name: &str, source: &str, kind: shaderc::ShaderKind) -> Result<Vec<u32>> {
        let artifact = self
            .compiler
            .compile_into_spirv(source, kind, name, "main", None)
            .map_err(|e| {
                Error::new(
                    ErrorKind::ShaderCompileFailed,
                    format!("{name}: {e}"),
                )
            })?;
        Ok(artifact.as_binary().to_vec())
    }
}

impl ShaderService for ShadercService {
    fn compile_pair(
        &self,
        name: &str,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<CompiledShader> {
        let vertex_spirv =
            self.compile_stage(name, vertex_source, shaderc::ShaderKind::Vertex)?;
        let fragment_spirv =
            self.compile_stage(name, fragment_source, shaderc::ShaderKind::Fragment)?;

        let mut reflection = reflect_sources(vertex_source, fragment_source);
        // Binding 0 defaults to the pass source when a shader declares no
        // samplers at all; keeps hand-written blit shaders trivial.
        if reflection.samplers.is_empty() {
            reflection.samplers.push(SamplerBinding {
                binding: 0,
                name: "Source".to_string(),
            });
        }

        Ok(CompiledShader {
            vertex_spirv,
            fragment_spirv,
            reflection,
        })
    }
}

/// Derives reflection from the RetroArch GLSL binding contract.
///
/// Pass shaders declare `layout(set = 0, binding = N) uniform sampler2D
/// Name;`, an optional `layout(push_constant)` block and an optional
/// std140 UBO at binding 0. Scanning the sources for those three shapes
/// is exact for this dialect; arbitrary GLSL is out of scope here.
pub fn reflect_sources(vertex_source: &str, fragment_source: &str) -> ShaderReflection {
    let mut reflection = ShaderReflection::default();

    for source in [vertex_source, fragment_source] {
        if source.contains("push_constant") {
            reflection.has_push_constants = true;
        }
    }

    for line in vertex_source.lines().chain(fragment_source.lines()) {
        let line = line.trim();
        if let Some((binding, name)) = parse_sampler_decl(line) {
            if !reflection.samplers.iter().any(|s| s.name == name) {
                reflection.samplers.push(SamplerBinding { binding, name });
            }
            continue;
        }
        if let Some(param) = parse_parameter_pragma(line) {
            if !reflection.parameters.iter().any(|p| p.name == param.name) {
                reflection.parameters.push(param);
            }
            continue;
        }
        if reflection.ubo.is_none() {
            if let Some(binding) = parse_ubo_decl(line) {
                // The RetroArch UBO carries the MVP matrix.
                reflection.ubo = Some(UboLayout { binding, size: 64 });
            }
        }
    }

    reflection.samplers.sort_by_key(|s| s.binding);
    reflection
}

/// Parses `#pragma parameter NAME "description" DEFAULT MIN MAX STEP`.
fn parse_parameter_pragma(line: &str) -> Option<ShaderParameter> {
    let rest = line.strip_prefix("#pragma parameter")?.trim();
    let (name, rest) = rest.split_once(char::is_whitespace)?;

    // The quoted description may contain spaces; skip it wholesale.
    let rest = rest.trim_start();
    let rest = if let Some(after_quote) = rest.strip_prefix('"') {
        after_quote.split_once('"')?.1
    } else {
        rest.split_once(char::is_whitespace)?.1
    };

    let mut numbers = rest.split_whitespace().map(|v| v.parse::<f32>());
    let default = numbers.next()?.ok()?;
    let min = numbers.next().and_then(|v| v.ok()).unwrap_or(default);
    let max = numbers.next().and_then(|v| v.ok()).unwrap_or(default);
    let step = numbers.next().and_then(|v| v.ok()).unwrap_or(0.0);

    Some(ShaderParameter {
        name: name.to_string(),
        default,
        min,
        max,
        step,
    })
}

/// Parses `layout(set = 0, binding = N) uniform sampler2D Name;`.
fn parse_sampler_decl(line: &str) -> Option<(u32, String)> {
    if !line.starts_with("layout") || !line.contains("sampler2D") {
        return None;
    }
    let binding = parse_layout_field(line, "binding")?;
    let after = line.split("sampler2D").nth(1)?;
    let name = after.trim().trim_end_matches(';').trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((binding, name.to_string()))
}

/// Parses `layout(std140, set = 0, binding = N) uniform UBO {`.
fn parse_ubo_decl(line: &str) -> Option<u32> {
    if !line.starts_with("layout")
        || !line.contains("uniform")
        || line.contains("sampler")
        || line.contains("push_constant")
    {
        return None;
    }
    // Block declarations end with `{` on this or a following line; plain
    // uniforms (unsupported in Vulkan GLSL anyway) are filtered by the
    // brace check.
    if !line.contains('{') && !line.ends_with("UBO") {
        return None;
    }
    parse_layout_field(line, "binding")
}

fn parse_layout_field(line: &str, field: &str) -> Option<u32> {
    let start = line.find(field)? + field.len();
    let rest = line[start..].trim_start().strip_prefix('=')?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAGMENT: &str = r#"
#version 450
layout(push_constant) uniform Push {
    vec4 SourceSize;
    vec4 OutputSize;
    vec4 OriginalSize;
    uint FrameCount;
} params;
layout(set = 0, binding = 2) uniform sampler2D Source;
layout(set = 0, binding = 3) uniform sampler2D OriginalHistory3;
layout(location = 0) in vec2 vTexCoord;
layout(location = 0) out vec4 FragColor;
void main() { FragColor = texture(Source, vTexCoord); }
"#;

    const VERTEX: &str = r#"
#version 450
layout(std140, set = 0, binding = 0) uniform UBO {
    mat4 MVP;
} global;
layout(location = 0) out vec2 vTexCoord;
void main() { gl_Position = vec4(0.0); vTexCoord = vec2(0.0); }
"#;

    #[test]
    fn reflects_samplers_with_bindings() {
        let r = reflect_sources(VERTEX, FRAGMENT);
        assert_eq!(
            r.samplers,
            vec![
                SamplerBinding { binding: 2, name: "Source".into() },
                SamplerBinding { binding: 3, name: "OriginalHistory3".into() },
            ]
        );
    }

    #[test]
    fn reflects_push_constants_and_ubo() {
        let r = reflect_sources(VERTEX, FRAGMENT);
        assert!(r.has_push_constants);
        assert_eq!(r.ubo, Some(UboLayout { binding: 0, size: 64 }));
    }

    #[test]
    fn plain_blit_reflects_nothing() {
        let vs = "#version 450\nvoid main() {}\n";
        let fs = "#version 450\nlayout(location=0) out vec4 c;\nvoid main() { c = vec4(1.0); }\n";
        let r = reflect_sources(vs, fs);
        assert!(!r.has_push_constants);
        assert!(r.ubo.is_none());
        assert!(r.samplers.is_empty());
    }

    #[test]
    fn parses_parameter_pragmas() {
        let fs = r#"
#pragma parameter SCANLINE_WEIGHT "Scanline weight" 7.0 0.0 15.0 0.5
#pragma parameter MASK "Mask" 1.0
void main() {}
"#;
        let r = reflect_sources("", fs);
        assert_eq!(
            r.parameters[0],
            ShaderParameter {
                name: "SCANLINE_WEIGHT".into(),
                default: 7.0,
                min: 0.0,
                max: 15.0,
                step: 0.5,
            }
        );
        assert_eq!(r.parameters[1].name, "MASK");
        assert_eq!(r.parameters[1].default, 1.0);
        assert_eq!(r.parameters[1].min, 1.0);
        assert_eq!(r.parameters[1].max, 1.0);
    }

    #[test]
    fn sampler_names_must_be_identifiers() {
        let fs = "layout(set = 0, binding = 1) uniform sampler2D weird name;";
        assert_eq!(parse_sampler_decl(fs), None);
        let ok = "layout(set = 0, binding = 1) uniform sampler2D PassFeedback0;";
        assert_eq!(parse_sampler_decl(ok), Some((1, "PassFeedback0".into())));
    }
}
