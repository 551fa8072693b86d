//! Semantic uniform values for RetroArch-style passes.

use bytemuck::{Pod, Zeroable};
use rustc_hash::FxHashMap;

/// `[width, height, 1/width, 1/height]`, the layout shaders expect for
/// every *Size uniform.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SizeVec4 {
    pub width: f32,
    pub height: f32,
    pub inv_width: f32,
    pub inv_height: f32,
}

impl Default for SizeVec4 {
    fn default() -> Self {
        Self {
            width: 1.0,
            height: 1.0,
            inv_width: 1.0,
            inv_height: 1.0,
        }
    }
}

impl SizeVec4 {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width as f32,
            height: height as f32,
            inv_width: 1.0 / width as f32,
            inv_height: 1.0 / height as f32,
        }
    }
}

/// Column-major identity MVP.
pub const IDENTITY_MVP: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Uniform buffer contents (MVP at offset 0).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PassUbo {
    pub mvp: [f32; 16],
}

impl Default for PassUbo {
    fn default() -> Self {
        Self { mvp: IDENTITY_MVP }
    }
}

/// Push constant block shared by every pass pipeline.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct PassPushConstants {
    pub source_size: SizeVec4,
    pub output_size: SizeVec4,
    pub original_size: SizeVec4,
    pub frame_count: u32,
    pub padding: [u32; 3],
}

/// Stores the per-pass semantic values and serves the push-constant and
/// UBO blocks built from them.
#[derive(Debug, Default)]
pub struct SemanticBinder {
    mvp: Option<[f32; 16]>,
    source_size: SizeVec4,
    output_size: SizeVec4,
    original_size: SizeVec4,
    final_viewport_size: SizeVec4,
    frame_count: u32,
    alias_sizes: FxHashMap<String, SizeVec4>,
}

impl SemanticBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_source_size(&mut self, width: u32, height: u32) {
        self.source_size = SizeVec4::new(width, height);
    }

    pub fn set_output_size(&mut self, width: u32, height: u32) {
        self.output_size = SizeVec4::new(width, height);
    }

    pub fn set_original_size(&mut self, width: u32, height: u32) {
        self.original_size = SizeVec4::new(width, height);
    }

    pub fn set_final_viewport_size(&mut self, width: u32, height: u32) {
        self.final_viewport_size = SizeVec4::new(width, height);
    }

    pub fn set_frame_count(&mut self, count: u32) {
        self.frame_count = count;
    }

    pub fn set_mvp(&mut self, mvp: [f32; 16]) {
        self.mvp = Some(mvp);
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn source_size(&self) -> SizeVec4 {
        self.source_size
    }

    pub fn final_viewport_size(&self) -> SizeVec4 {
        self.final_viewport_size
    }

    pub fn set_alias_size(&mut self, alias: &str, width: u32, height: u32) {
        self.alias_sizes
            .insert(alias.to_string(), SizeVec4::new(width, height));
    }

    pub fn alias_size(&self, alias: &str) -> Option<SizeVec4> {
        self.alias_sizes.get(alias).copied()
    }

    pub fn clear_alias_sizes(&mut self) {
        self.alias_sizes.clear();
    }

    pub fn ubo(&self) -> PassUbo {
        PassUbo {
            mvp: self.mvp.unwrap_or(IDENTITY_MVP),
        }
    }

    pub fn push_constants(&self) -> PassPushConstants {
        PassPushConstants {
            source_size: self.source_size,
            output_size: self.output_size,
            original_size: self.original_size,
            frame_count: self.frame_count,
            padding: [0; 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_vec4_carries_reciprocals() {
        let size = SizeVec4::new(1920, 1080);
        assert_eq!(size.width, 1920.0);
        assert_eq!(size.height, 1080.0);
        assert!((size.inv_width - 1.0 / 1920.0).abs() < f32::EPSILON);
        assert!((size.inv_height - 1.0 / 1080.0).abs() < f32::EPSILON);
    }

    #[test]
    fn push_constant_block_is_52_bytes_padded_to_64() {
        // Three vec4s plus FrameCount plus 12 bytes of padding.
        assert_eq!(std::mem::size_of::<PassPushConstants>(), 64);
        assert_eq!(std::mem::size_of::<PassUbo>(), 64);
    }

    #[test]
    fn push_constants_reflect_current_state() {
        let mut binder = SemanticBinder::new();
        binder.set_source_size(256, 224);
        binder.set_output_size(512, 448);
        binder.set_original_size(256, 224);
        binder.set_frame_count(17);

        let push = binder.push_constants();
        assert_eq!(push.source_size, SizeVec4::new(256, 224));
        assert_eq!(push.output_size, SizeVec4::new(512, 448));
        assert_eq!(push.original_size, SizeVec4::new(256, 224));
        assert_eq!(push.frame_count, 17);
        assert_eq!(push.padding, [0; 3]);
    }

    #[test]
    fn ubo_defaults_to_identity_until_overridden() {
        let mut binder = SemanticBinder::new();
        assert_eq!(binder.ubo().mvp, IDENTITY_MVP);

        let mut flipped = IDENTITY_MVP;
        flipped[5] = -1.0;
        binder.set_mvp(flipped);
        assert_eq!(binder.ubo().mvp, flipped);
    }

    #[test]
    fn alias_sizes_store_and_clear() {
        let mut binder = SemanticBinder::new();
        binder.set_alias_size("DerezedPass", 320, 240);
        let size = binder.alias_size("DerezedPass").unwrap();
        assert_eq!(size.width, 320.0);
        assert_eq!(size.height, 240.0);
        assert!(binder.alias_size("Missing").is_none());

        binder.clear_alias_sizes();
        assert!(binder.alias_size("DerezedPass").is_none());
    }
}
